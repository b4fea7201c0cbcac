use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Instant;

// ─── Scalar aliases ───────────────────────────────────────────

/// Index into the chart's state arena.
pub type StateId = u32;

/// Mutable per-machine user data. Owned exclusively by the machine's
/// consumer task; never shared across machines.
pub type ContextMap = serde_json::Map<String, Value>;

// ─── State tree ───────────────────────────────────────────────

/// Node classification, mirroring the statechart JSON `type` field.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StateKind {
    Atomic,
    Compound,
    Parallel,
    Final,
    History,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HistoryKind {
    Shallow,
    Deep,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransitionKind {
    /// Exit the source (and everything below the transition domain), then
    /// re-enter the target. A self-target re-enters the source.
    External,
    /// Run transition actions only; the source is neither exited nor
    /// re-entered. Targetless transitions are always internal.
    Internal,
}

/// One guarded edge out of a state. Bound at build time: `target` is an
/// arena index, never a path.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Transition {
    pub source: StateId,
    pub target: Option<StateId>,
    /// Guard names, all of which must pass, evaluated in order.
    pub guards: Vec<String>,
    /// Action names run in order between exit and entry.
    pub actions: Vec<String>,
    pub kind: TransitionKind,
}

/// A delayed transition block: `after: { <millis>: ... }`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AfterEntry {
    pub delay_ms: u64,
    pub transitions: Vec<Transition>,
}

/// An invoked service bound to the lifetime of its state.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct InvokeDef {
    /// Unique within the chart; synthesized from `src` when absent.
    pub id: String,
    /// Service name looked up in the registry.
    pub src: String,
    /// Activities are invocations with no completion transition; they only
    /// end by cancellation on state exit.
    pub activity: bool,
}

/// Immutable statechart node. Parent/child links are arena indices, so the
/// tree carries no ownership cycles.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StateNode {
    pub id: StateId,
    /// Local name within the parent's `states` map.
    pub key: String,
    /// Dot-separated path from the root; empty for the root itself.
    pub path: String,
    pub kind: StateKind,
    pub history: Option<HistoryKind>,
    pub parent: Option<StateId>,
    /// Document order.
    pub children: Vec<StateId>,
    pub initial: Option<StateId>,
    /// Default target for a history node with no recorded configuration.
    pub history_default: Option<StateId>,
    pub entry: Vec<String>,
    pub exit: Vec<String>,
    /// Event name → candidate transitions in source order.
    pub on: BTreeMap<String, Vec<Transition>>,
    pub after: Vec<AfterEntry>,
    /// Eventless transitions, re-evaluated after every commit.
    pub always: Vec<Transition>,
    pub invoke: Vec<InvokeDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl StateNode {
    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, StateKind::Atomic | StateKind::Final)
    }
}

// ─── Events ───────────────────────────────────────────────────

/// Event name reserved for the initial entry step.
pub const START_EVENT: &str = "xstate.init";

/// Synthetic event raised by the timeout protector.
pub const STATE_TIMEOUT_EVENT: &str = "STATE_TIMEOUT";

/// An event as seen by guards and actions.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub name: String,
    #[serde(default)]
    pub payload: Value,
}

impl Event {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self::new(name, Value::Null)
    }

    /// `done.state.<path>` raised when a compound or parallel state completes.
    pub fn done_state(path: &str) -> Self {
        Self::named(format!("done.state.{path}"))
    }

    /// `done.invoke.<id>` carrying the service result.
    pub fn done_invoke(id: &str, result: Value) -> Self {
        Self::new(format!("done.invoke.{id}"), result)
    }

    /// `error.invoke.<id>` carrying the failure message.
    pub fn error_invoke(id: &str, message: String) -> Self {
        Self::new(
            format!("error.invoke.{id}"),
            serde_json::json!({ "message": message }),
        )
    }

    pub fn is_error(&self) -> bool {
        self.name.starts_with("error.")
    }
}

// ─── Deferred sends ───────────────────────────────────────────

/// Destination of a deferred send.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SendTarget {
    Machine(String),
    /// Resolved to the producing machine at drain time.
    Current,
    /// Fanned out to every registered machine except the producer.
    Broadcast,
}

/// An inter-machine event request queued by an action and dispatched by the
/// orchestrator only after the producing transition commits.
#[derive(Clone, Debug)]
pub struct DeferredSend {
    pub source: String,
    pub target: SendTarget,
    pub event: Event,
    pub enqueued_at: Instant,
}

// ─── Step results ─────────────────────────────────────────────

/// A recorded action failure. Non-fatal unless the machine runs in strict
/// mode; subsequent actions in the same transition still execute.
#[derive(Clone, Debug)]
pub struct ActionFailure {
    pub action: String,
    pub message: String,
    pub timed_out: bool,
}

/// Outcome of one event handled by the interpreter.
#[derive(Clone, Debug, Default)]
pub struct StepResult {
    /// Atomic-state paths before the event.
    pub old_configuration: Vec<String>,
    /// Atomic-state paths after the event.
    pub new_configuration: Vec<String>,
    /// Transitions taken across all microsteps.
    pub transitions_taken: usize,
    pub failures: Vec<ActionFailure>,
    /// Guards that threw; each was treated as `false`.
    pub guard_failures: Vec<ActionFailure>,
    /// The event matched nothing and was discarded.
    pub discarded: bool,
    /// A discarded `error.*` event with no handler anywhere up the tree.
    pub unhandled_error: bool,
    /// The machine reached a top-level final state.
    pub done: bool,
}

impl StepResult {
    pub fn discarded(configuration: Vec<String>) -> Self {
        Self {
            old_configuration: configuration.clone(),
            new_configuration: configuration,
            discarded: true,
            ..Default::default()
        }
    }
}
