//! Observable orchestrator events and the result type every send resolves
//! to. Consumers subscribe through a broadcast channel; lagging subscribers
//! lose old events rather than applying backpressure to dispatch.

use serde::{Deserialize, Serialize};

/// Lifecycle and dispatch notifications published by the orchestrator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum OrchestratorEvent {
    MachineRegistered {
        machine_id: String,
    },
    MachineUnregistered {
        machine_id: String,
    },
    MachineEventProcessed {
        machine_id: String,
        event_name: String,
        old_configuration: Vec<String>,
        new_configuration: Vec<String>,
        duration_ms: u64,
    },
    MachineEventFailed {
        machine_id: String,
        event_name: String,
        error_kind: String,
        error: String,
    },
    /// The channel pool grew or shrank.
    PoolResized {
        channels: usize,
    },
    /// An event was diverted to the dead-letter queue.
    DeadLettered {
        machine_id: String,
        event_name: String,
        reason: String,
    },
}

/// What a send ultimately resolves to. Implementation-level failures are
/// folded into `error_kind`/`error`; callers never see a raw panic or an
/// internal error type.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventResult {
    pub success: bool,
    pub machine_id: String,
    pub event_name: String,
    pub new_configuration: Vec<String>,
    pub error_kind: Option<String>,
    pub error: Option<String>,
}

impl EventResult {
    pub fn ok(
        machine_id: impl Into<String>,
        event_name: impl Into<String>,
        new_configuration: Vec<String>,
    ) -> Self {
        Self {
            success: true,
            machine_id: machine_id.into(),
            event_name: event_name.into(),
            new_configuration,
            error_kind: None,
            error: None,
        }
    }

    pub fn failed(
        machine_id: impl Into<String>,
        event_name: impl Into<String>,
        kind: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            machine_id: machine_id.into(),
            event_name: event_name.into(),
            new_configuration: Vec::new(),
            error_kind: Some(kind.into()),
            error: Some(error.into()),
        }
    }
}
