//! XStateNet core: a statechart runtime (hierarchical and parallel states,
//! guarded transitions, delayed transitions, invoked services, history)
//! coordinated by a central event-bus orchestrator, with opt-in resilience
//! layers: circuit breaker, bounded backpressure channels, timeout
//! protection, and a dead-letter queue.
//!
//! The flow: parse a relaxed-JSON chart into a [`chart::MachineChart`], bind
//! named behavior through a [`registry::Registry`], wrap both in a
//! [`machine::Machine`], and register it with an
//! [`orchestrator::EventBusOrchestrator`]. Actions communicate with other
//! machines only through deferred sends on the
//! [`context::OrchestratedContext`]; the orchestrator delivers them after
//! the producing transition commits.

pub mod chart;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod group;
pub mod interpreter;
pub mod machine;
pub mod orchestrator;
pub mod registry;
pub mod resilience;
pub mod types;

pub use chart::MachineChart;
pub use config::{
    BackpressureMode, CircuitBreakerConfig, MachineConfig, OrchestratorConfig, TimeoutConfig,
};
pub use context::OrchestratedContext;
pub use error::{ChartError, Error, Result};
pub use events::{EventResult, OrchestratorEvent};
pub use group::{ChannelGroupToken, GlobalOrchestratorManager};
pub use machine::{EventSink, Machine, MachineHandle, MachineStatus};
pub use orchestrator::{EventBusOrchestrator, MachineMetrics, RemoteRouter};
pub use registry::{ActionScope, Registry, ServiceArgs};
pub use types::{DeferredSend, Event, SendTarget, StepResult};
