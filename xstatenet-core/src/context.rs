//! Per-event orchestration scratchpad. Actions queue cross-machine sends
//! here; the orchestrator drains the queue only after the producing
//! transition commits. That deferral is what makes inter-machine
//! communication deadlock-free: no action ever runs another machine's
//! handler on its own stack.

use crate::types::{DeferredSend, Event, SendTarget};
use parking_lot::Mutex;
use serde_json::Value;
use std::time::Instant;

pub struct OrchestratedContext {
    machine_id: String,
    /// Atomic-leaf paths at the moment the event began.
    configuration: Vec<String>,
    deferred: Mutex<Vec<DeferredSend>>,
}

impl OrchestratedContext {
    pub fn new(machine_id: impl Into<String>, configuration: Vec<String>) -> Self {
        Self {
            machine_id: machine_id.into(),
            configuration,
            deferred: Mutex::new(Vec::new()),
        }
    }

    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    /// Read-only view of the configuration the event started from.
    pub fn configuration(&self) -> &[String] {
        &self.configuration
    }

    /// Queue an event for another machine, delivered after this transition
    /// commits. Order between queued sends is preserved.
    pub fn request_send(&self, target: impl Into<String>, event: impl Into<String>, payload: Value) {
        self.push(SendTarget::Machine(target.into()), event, payload);
    }

    /// Queue an event for the producing machine itself.
    pub fn request_self_send(&self, event: impl Into<String>, payload: Value) {
        self.push(SendTarget::Current, event, payload);
    }

    /// Queue an event for every registered machine except the producer.
    pub fn request_broadcast(&self, event: impl Into<String>, payload: Value) {
        self.push(SendTarget::Broadcast, event, payload);
    }

    fn push(&self, target: SendTarget, event: impl Into<String>, payload: Value) {
        self.deferred.lock().push(DeferredSend {
            source: self.machine_id.clone(),
            target,
            event: Event::new(event, payload),
            enqueued_at: Instant::now(),
        });
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.lock().len()
    }

    /// Drain the queued sends in the order they were requested.
    pub fn take_deferred(&self) -> Vec<DeferredSend> {
        std::mem::take(&mut *self.deferred.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn preserves_send_order() {
        let ctx = OrchestratedContext::new("a", vec!["x".into()]);
        ctx.request_send("b", "E1", json!(1));
        ctx.request_self_send("E2", json!(2));
        ctx.request_broadcast("E3", json!(3));

        let sends = ctx.take_deferred();
        assert_eq!(sends.len(), 3);
        assert_eq!(sends[0].event.name, "E1");
        assert_eq!(sends[0].target, SendTarget::Machine("b".into()));
        assert_eq!(sends[1].target, SendTarget::Current);
        assert_eq!(sends[2].target, SendTarget::Broadcast);
        assert!(ctx.take_deferred().is_empty());
    }
}
