//! Chart compilation: relaxed-JSON source → immutable `MachineChart`.
//!
//! The arena is built in document order (a node's `StateId` is its pre-order
//! position), so id comparison doubles as document-order comparison.

mod builder;
mod parser;

use crate::error::ChartError;
use crate::registry::Registry;
use crate::types::*;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

pub use parser::parse_relaxed;

/// The compiled, immutable statechart model.
#[derive(Clone, Debug, PartialEq)]
pub struct MachineChart {
    pub id: String,
    /// SHA-256 of the canonical serialization; the chart's version key.
    pub version: [u8; 32],
    pub root: StateId,
    pub states: Vec<StateNode>,
    pub initial_context: ContextMap,
    pub action_names: BTreeSet<String>,
    pub guard_names: BTreeSet<String>,
    pub service_names: BTreeSet<String>,
    pub delays_ms: BTreeSet<u64>,
}

impl MachineChart {
    /// Parse and bind a chart from relaxed-JSON source.
    pub fn parse(src: &str) -> Result<Self, ChartError> {
        let doc = parser::parse_relaxed(src)?;
        let built = builder::build(&doc)?;
        let mut chart = Self {
            id: built.id,
            version: [0; 32],
            root: built.root,
            states: built.states,
            initial_context: built.initial_context,
            action_names: built.action_names,
            guard_names: built.guard_names,
            service_names: built.service_names,
            delays_ms: built.delays_ms,
        };
        chart.version = chart.compute_version();
        Ok(chart)
    }

    /// Parse and additionally check every referenced action/guard/service
    /// name against the registry. Missing entries fail here, not at
    /// execution time.
    pub fn parse_with_registry(src: &str, registry: &Registry) -> Result<Self, ChartError> {
        let chart = Self::parse(src)?;
        registry.validate_chart(&chart)?;
        Ok(chart)
    }

    fn compute_version(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.to_json().to_string().as_bytes());
        hasher.finalize().into()
    }

    // ── Tree navigation ──

    pub fn node(&self, id: StateId) -> &StateNode {
        &self.states[id as usize]
    }

    pub fn parent_of(&self, id: StateId) -> Option<StateId> {
        self.states[id as usize].parent
    }

    /// Ancestors from closest to the root, excluding `id` itself.
    pub fn ancestors(&self, id: StateId) -> Vec<StateId> {
        let mut out = Vec::new();
        let mut cursor = self.parent_of(id);
        while let Some(p) = cursor {
            out.push(p);
            cursor = self.parent_of(p);
        }
        out
    }

    /// Strict descendant check.
    pub fn is_descendant(&self, node: StateId, ancestor: StateId) -> bool {
        let mut cursor = self.parent_of(node);
        while let Some(p) = cursor {
            if p == ancestor {
                return true;
            }
            cursor = self.parent_of(p);
        }
        false
    }

    pub fn depth(&self, id: StateId) -> usize {
        self.ancestors(id).len()
    }

    /// Lowest state that is a proper ancestor of both `a` and `b`. For a
    /// self-transition this is the parent, which is what makes an external
    /// self-transition exit and re-enter its source.
    pub fn lcca(&self, a: StateId, b: StateId) -> StateId {
        let set_b: BTreeSet<StateId> = self.ancestors(b).into_iter().collect();
        for p in self.ancestors(a) {
            if set_b.contains(&p) {
                return p;
            }
        }
        self.root
    }

    /// Resolve an absolute dotted path from the root. The empty string is
    /// the root itself.
    pub fn resolve_path(&self, path: &str) -> Option<StateId> {
        let mut current = self.root;
        if path.is_empty() {
            return Some(current);
        }
        for seg in path.split('.') {
            current = self
                .node(current)
                .children
                .iter()
                .copied()
                .find(|&c| self.node(c).key == seg)?;
        }
        Some(current)
    }

    // ── Canonical serialization ──

    /// Reserialize the bound chart. Parsing the output reproduces an
    /// identical arena; the output is also the version-hash input.
    pub fn to_json(&self) -> Value {
        let mut doc = self.node_json(self.root);
        let obj = doc.as_object_mut().unwrap_or_else(|| unreachable!());
        obj.insert("id".into(), Value::String(self.id.clone()));
        if !self.initial_context.is_empty() {
            obj.insert("context".into(), Value::Object(self.initial_context.clone()));
        }
        // Root key order: id first, then the node body.
        let mut ordered = Map::new();
        ordered.insert("id".into(), obj.remove("id").unwrap_or(Value::Null));
        if let Some(ctx) = obj.remove("context") {
            ordered.insert("context".into(), ctx);
        }
        for (k, v) in obj.iter() {
            ordered.insert(k.clone(), v.clone());
        }
        Value::Object(ordered)
    }

    fn node_json(&self, id: StateId) -> Value {
        let node = self.node(id);
        let mut obj = Map::new();

        obj.insert("type".into(), json!(kind_str(node.kind)));
        if let Some(h) = node.history {
            obj.insert(
                "history".into(),
                json!(match h {
                    HistoryKind::Shallow => "shallow",
                    HistoryKind::Deep => "deep",
                }),
            );
            if let Some(target) = node.history_default {
                obj.insert("target".into(), json!(self.abs_path(target)));
            }
        }
        if node.kind == StateKind::Compound {
            if let Some(initial) = node.initial {
                obj.insert("initial".into(), json!(self.node(initial).key));
            }
        }
        if !node.entry.is_empty() {
            obj.insert("entry".into(), json!(node.entry));
        }
        if !node.exit.is_empty() {
            obj.insert("exit".into(), json!(node.exit));
        }
        if !node.on.is_empty() {
            let mut on = Map::new();
            for (event, transitions) in &node.on {
                on.insert(event.clone(), self.transitions_json(transitions));
            }
            obj.insert("on".into(), Value::Object(on));
        }
        if !node.after.is_empty() {
            let mut after = Map::new();
            for entry in &node.after {
                after.insert(
                    entry.delay_ms.to_string(),
                    self.transitions_json(&entry.transitions),
                );
            }
            obj.insert("after".into(), Value::Object(after));
        }
        if !node.always.is_empty() {
            obj.insert("always".into(), self.transitions_json(&node.always));
        }
        let invokes: Vec<Value> = node
            .invoke
            .iter()
            .filter(|i| !i.activity)
            .map(|i| json!({ "src": i.src, "id": i.id }))
            .collect();
        if !invokes.is_empty() {
            obj.insert("invoke".into(), Value::Array(invokes));
        }
        let activities: Vec<Value> = node
            .invoke
            .iter()
            .filter(|i| i.activity)
            .map(|i| json!(i.src))
            .collect();
        if !activities.is_empty() {
            obj.insert("activities".into(), Value::Array(activities));
        }
        if let Some(meta) = &node.meta {
            obj.insert("meta".into(), meta.clone());
        }
        if !node.children.is_empty() {
            let mut states = Map::new();
            for &child in &node.children {
                states.insert(self.node(child).key.clone(), self.node_json(child));
            }
            obj.insert("states".into(), Value::Object(states));
        }

        Value::Object(obj)
    }

    fn transitions_json(&self, transitions: &[Transition]) -> Value {
        let list: Vec<Value> = transitions.iter().map(|t| self.transition_json(t)).collect();
        Value::Array(list)
    }

    fn transition_json(&self, t: &Transition) -> Value {
        let mut obj = Map::new();
        if let Some(target) = t.target {
            obj.insert("target".into(), json!(self.abs_path(target)));
        }
        if !t.guards.is_empty() {
            obj.insert("guard".into(), json!(t.guards));
        }
        if !t.actions.is_empty() {
            obj.insert("actions".into(), json!(t.actions));
        }
        if t.kind == TransitionKind::Internal && t.target.is_some() {
            obj.insert("internal".into(), json!(true));
        }
        Value::Object(obj)
    }

    /// Absolute path with a leading dot, as accepted by the target resolver.
    fn abs_path(&self, id: StateId) -> String {
        format!(".{}", self.node(id).path)
    }
}

fn kind_str(kind: StateKind) -> &'static str {
    match kind {
        StateKind::Atomic => "atomic",
        StateKind::Compound => "compound",
        StateKind::Parallel => "parallel",
        StateKind::Final => "final",
        StateKind::History => "history",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRAFFIC: &str = r#"{
        id: 'traffic',
        initial: 'green',
        context: { cycles: 0 },
        states: {
            green:  { entry: 'onGreen', on: { NEXT: 'yellow' }, after: { 5000: 'yellow' } },
            yellow: { on: { NEXT: { target: 'red', actions: ['warn'] } } },
            red:    {
                initial: 'walk',
                states: {
                    walk:  { on: { COUNTDOWN: 'wait' } },
                    wait:  { on: { COUNTDOWN: 'stop' } },
                    stop:  { type: 'final' },
                    hist:  { type: 'history', history: 'shallow' }
                },
                on: { NEXT: 'green' }
            }
        }
    }"#;

    #[test]
    fn binds_paths_and_kinds() {
        let chart = MachineChart::parse(TRAFFIC).unwrap();
        let red = chart.resolve_path("red").unwrap();
        assert_eq!(chart.node(red).kind, StateKind::Compound);
        let walk = chart.resolve_path("red.walk").unwrap();
        assert_eq!(chart.node(walk).path, "red.walk");
        assert!(chart.is_descendant(walk, red));
        assert_eq!(chart.node(red).initial, Some(walk));

        let green = chart.resolve_path("green").unwrap();
        let yellow = chart.resolve_path("yellow").unwrap();
        assert_eq!(chart.node(green).on["NEXT"][0].target, Some(yellow));
        assert_eq!(chart.node(green).after[0].delay_ms, 5000);
    }

    #[test]
    fn collects_name_tables() {
        let chart = MachineChart::parse(TRAFFIC).unwrap();
        assert!(chart.action_names.contains("onGreen"));
        assert!(chart.action_names.contains("warn"));
        assert!(chart.delays_ms.contains(&5000));
    }

    #[test]
    fn roundtrip_is_identity() {
        let chart = MachineChart::parse(TRAFFIC).unwrap();
        let reparsed = MachineChart::parse(&chart.to_json().to_string()).unwrap();
        assert_eq!(chart.states, reparsed.states);
        assert_eq!(chart.version, reparsed.version);
        assert_eq!(chart.initial_context, reparsed.initial_context);
    }

    #[test]
    fn version_is_stable_across_formatting() {
        let a = MachineChart::parse("{ id: 'm', initial: 'x', states: { x: {} } }").unwrap();
        let b =
            MachineChart::parse("{\n  id: \"m\",\n  initial: \"x\",\n  states: { x: {}, },\n}")
                .unwrap();
        assert_eq!(a.version, b.version);
    }

    #[test]
    fn unresolvable_target_fails_at_bind() {
        let err = MachineChart::parse("{ id: 'm', initial: 'a', states: { a: { on: { GO: 'nowhere' } } } }")
            .unwrap_err();
        assert!(err.reason.contains("cannot resolve"), "{}", err.reason);
    }

    #[test]
    fn unknown_kind_fails() {
        let err = MachineChart::parse("{ id: 'm', states: { a: { type: 'quantum' } } }").unwrap_err();
        assert!(err.reason.contains("unknown node kind"), "{}", err.reason);
    }

    #[test]
    fn internal_transition_requires_descendant_target() {
        let err = MachineChart::parse(
            "{ id: 'm', initial: 'a', states: { a: { on: { GO: { target: 'b', internal: true } } }, b: {} } }",
        )
        .unwrap_err();
        assert!(err.reason.contains("not a descendant"), "{}", err.reason);
    }

    #[test]
    fn lcca_meets_at_nearest_compound() {
        let chart = MachineChart::parse(TRAFFIC).unwrap();
        let walk = chart.resolve_path("red.walk").unwrap();
        let wait = chart.resolve_path("red.wait").unwrap();
        let red = chart.resolve_path("red").unwrap();
        assert_eq!(chart.lcca(walk, wait), red);
        let green = chart.resolve_path("green").unwrap();
        assert_eq!(chart.lcca(walk, green), chart.root);
    }

    #[test]
    fn empty_chart_parses() {
        let chart = MachineChart::parse("{ id: 'empty' }").unwrap();
        assert_eq!(chart.node(chart.root).kind, StateKind::Atomic);
        assert!(chart.node(chart.root).children.is_empty());
    }

    #[test]
    fn invoke_lowers_completion_transitions() {
        let chart = MachineChart::parse(
            r#"{ id: 'm', initial: 'loading', states: {
                loading: {
                    invoke: { src: 'fetchUser', id: 'fetch', onDone: 'ready', onError: 'failed' }
                },
                ready: {}, failed: {}
            } }"#,
        )
        .unwrap();
        let loading = chart.resolve_path("loading").unwrap();
        assert!(chart.node(loading).on.contains_key("done.invoke.fetch"));
        assert!(chart.node(loading).on.contains_key("error.invoke.fetch"));
        assert!(chart.service_names.contains("fetchUser"));
    }

    #[test]
    fn activities_lower_to_cancellable_invokes() {
        let chart = MachineChart::parse(
            "{ id: 'm', initial: 'a', states: { a: { activities: ['beeping'] }, b: {} } }",
        )
        .unwrap();
        let a = chart.resolve_path("a").unwrap();
        let node = chart.node(a);
        assert_eq!(node.invoke.len(), 1);
        assert!(node.invoke[0].activity);
        assert_eq!(node.invoke[0].src, "beeping");
    }
}
