//! Inter-process message bus for XStateNet machines: line-framed JSON over
//! a named duplex pipe endpoint. The server routes `SendEvent` frames by
//! machine id, fans out to subscribers, and answers correlated sends; the
//! client supports both fire-and-forget and request/reply. `bridge` wires a
//! connection into a local orchestrator.

pub mod protocol;

#[cfg(unix)]
pub mod bridge;
#[cfg(unix)]
pub mod client;
#[cfg(unix)]
pub mod server;

pub use protocol::{
    EventPayload, PipeMessage, RegisterPayload, ResponsePayload, SubscribePayload,
    UnregisterPayload, DEFAULT_PIPE_NAME,
};

#[cfg(unix)]
pub use bridge::{attach, BusBridge};
#[cfg(unix)]
pub use client::{BusSender, MessageBusClient};
#[cfg(unix)]
pub use server::MessageBusServer;
