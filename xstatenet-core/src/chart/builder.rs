//! Lowers a parsed chart document into the bound state arena: creates nodes,
//! resolves dot-separated target paths, lowers `invoke`/`activities` blocks,
//! and collects the referenced action/guard/service/delay name tables.

use crate::error::ChartError;
use crate::types::*;
use serde_json::Value;
use std::collections::BTreeSet;

pub(crate) struct BuiltChart {
    pub id: String,
    pub root: StateId,
    pub states: Vec<StateNode>,
    pub initial_context: ContextMap,
    pub action_names: BTreeSet<String>,
    pub guard_names: BTreeSet<String>,
    pub service_names: BTreeSet<String>,
    pub delays_ms: BTreeSet<u64>,
}

/// Raw per-node material deferred to the binding pass, which needs the full
/// tree for path resolution.
#[derive(Default)]
struct RawNode {
    on: Option<Value>,
    after: Option<Value>,
    always: Option<Value>,
    invoke: Option<Value>,
    activities: Option<Value>,
    initial_key: Option<String>,
    history_target: Option<String>,
}

pub(crate) fn build(doc: &Value) -> Result<BuiltChart, ChartError> {
    let obj = doc
        .as_object()
        .ok_or_else(|| ChartError::bind("chart root must be an object"))?;
    let id = match obj.get("id") {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(_) => return Err(ChartError::bind("chart 'id' must be a non-empty string")),
        None => return Err(ChartError::bind("chart is missing 'id'")),
    };

    let initial_context = match obj.get("context") {
        None => ContextMap::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(_) => return Err(ChartError::bind("chart 'context' must be an object")),
    };

    let mut b = Builder {
        states: Vec::new(),
        raw: Vec::new(),
        action_names: BTreeSet::new(),
        guard_names: BTreeSet::new(),
        service_names: BTreeSet::new(),
        delays_ms: BTreeSet::new(),
    };

    let root = b.create_node(&id, String::new(), None, doc)?;
    b.resolve_initials()?;
    b.bind_all()?;
    b.validate()?;

    Ok(BuiltChart {
        id,
        root,
        states: b.states,
        initial_context,
        action_names: b.action_names,
        guard_names: b.guard_names,
        service_names: b.service_names,
        delays_ms: b.delays_ms,
    })
}

struct Builder {
    states: Vec<StateNode>,
    raw: Vec<RawNode>,
    action_names: BTreeSet<String>,
    guard_names: BTreeSet<String>,
    service_names: BTreeSet<String>,
    delays_ms: BTreeSet<u64>,
}

impl Builder {
    // ── Pass 1: structure ──

    fn create_node(
        &mut self,
        key: &str,
        path: String,
        parent: Option<StateId>,
        def: &Value,
    ) -> Result<StateId, ChartError> {
        let obj = def
            .as_object()
            .ok_or_else(|| ChartError::bind(format!("state '{path}' must be an object")))?;

        let child_defs = match obj.get("states") {
            None => None,
            Some(Value::Object(map)) => Some(map),
            Some(_) => {
                return Err(ChartError::bind(format!(
                    "state '{path}': 'states' must be an object"
                )))
            }
        };
        let has_children = child_defs.map(|m| !m.is_empty()).unwrap_or(false);

        let kind = match obj.get("type") {
            None => {
                if has_children {
                    StateKind::Compound
                } else {
                    StateKind::Atomic
                }
            }
            Some(Value::String(s)) => match s.as_str() {
                "atomic" => StateKind::Atomic,
                "compound" => StateKind::Compound,
                "parallel" => StateKind::Parallel,
                "final" => StateKind::Final,
                "history" => StateKind::History,
                other => {
                    return Err(ChartError::bind(format!(
                        "state '{path}': unknown node kind '{other}'"
                    )))
                }
            },
            Some(_) => {
                return Err(ChartError::bind(format!(
                    "state '{path}': 'type' must be a string"
                )))
            }
        };

        let history = match (kind, obj.get("history")) {
            (StateKind::History, None) => Some(HistoryKind::Shallow),
            (StateKind::History, Some(Value::String(s))) => match s.as_str() {
                "shallow" => Some(HistoryKind::Shallow),
                "deep" => Some(HistoryKind::Deep),
                other => {
                    return Err(ChartError::bind(format!(
                        "state '{path}': unknown history kind '{other}'"
                    )))
                }
            },
            (StateKind::History, Some(_)) => {
                return Err(ChartError::bind(format!(
                    "state '{path}': 'history' must be a string"
                )))
            }
            (_, Some(_)) => {
                return Err(ChartError::bind(format!(
                    "state '{path}': 'history' is only valid on history nodes"
                )))
            }
            (_, None) => None,
        };

        if kind == StateKind::History && has_children {
            return Err(ChartError::bind(format!(
                "history state '{path}' cannot have children"
            )));
        }
        if kind == StateKind::Final && has_children {
            return Err(ChartError::bind(format!(
                "final state '{path}' cannot have children"
            )));
        }

        let entry = string_list(obj.get("entry"), &path, "entry")?;
        let exit = string_list(obj.get("exit"), &path, "exit")?;
        self.action_names.extend(entry.iter().cloned());
        self.action_names.extend(exit.iter().cloned());

        let id = self.states.len() as StateId;
        self.states.push(StateNode {
            id,
            key: key.to_string(),
            path: path.clone(),
            kind,
            history,
            parent,
            children: Vec::new(),
            initial: None,
            history_default: None,
            entry,
            exit,
            on: Default::default(),
            after: Vec::new(),
            always: Vec::new(),
            invoke: Vec::new(),
            meta: obj.get("meta").cloned(),
        });
        self.raw.push(RawNode {
            on: obj.get("on").cloned(),
            after: obj.get("after").cloned(),
            always: obj.get("always").cloned(),
            invoke: obj.get("invoke").cloned(),
            activities: obj.get("activities").cloned(),
            initial_key: match obj.get("initial") {
                None => None,
                Some(Value::String(s)) => Some(s.clone()),
                Some(_) => {
                    return Err(ChartError::bind(format!(
                        "state '{path}': 'initial' must be a string"
                    )))
                }
            },
            history_target: match obj.get("target") {
                Some(Value::String(s)) if kind == StateKind::History => Some(s.clone()),
                _ => None,
            },
        });

        if let Some(children) = child_defs {
            for (child_key, child_def) in children {
                let child_path = if path.is_empty() {
                    child_key.clone()
                } else {
                    format!("{path}.{child_key}")
                };
                let child_id = self.create_node(child_key, child_path, Some(id), child_def)?;
                self.states[id as usize].children.push(child_id);
            }
        }

        Ok(id)
    }

    /// Resolve each compound state's `initial` key, defaulting to its first
    /// non-history child.
    fn resolve_initials(&mut self) -> Result<(), ChartError> {
        for idx in 0..self.states.len() {
            let node = &self.states[idx];
            if node.kind != StateKind::Compound {
                if self.raw[idx].initial_key.is_some() {
                    return Err(ChartError::bind(format!(
                        "state '{}': 'initial' is only valid on compound states",
                        node.path
                    )));
                }
                continue;
            }
            let initial = match &self.raw[idx].initial_key {
                Some(key) => {
                    let found = node
                        .children
                        .iter()
                        .copied()
                        .find(|&c| self.states[c as usize].key == *key);
                    found.ok_or_else(|| {
                        ChartError::bind(format!(
                            "state '{}': initial child '{key}' does not exist",
                            node.path
                        ))
                    })?
                }
                None => node
                    .children
                    .iter()
                    .copied()
                    .find(|&c| self.states[c as usize].kind != StateKind::History)
                    .ok_or_else(|| {
                        ChartError::bind(format!(
                            "compound state '{}' has no enterable children",
                            node.path
                        ))
                    })?,
            };
            self.states[idx].initial = Some(initial);
        }
        Ok(())
    }

    // ── Pass 2: binding ──

    fn bind_all(&mut self) -> Result<(), ChartError> {
        for idx in 0..self.states.len() {
            let raw = std::mem::take(&mut self.raw[idx]);
            let source = idx as StateId;

            if let Some(on) = &raw.on {
                let map = on.as_object().ok_or_else(|| {
                    self.bind_err(source, "'on' must be an object keyed by event name")
                })?;
                for (event, spec) in map {
                    let transitions = self.bind_transition_list(source, spec)?;
                    self.states[idx].on.insert(event.clone(), transitions);
                }
            }

            if let Some(after) = &raw.after {
                let map = after.as_object().ok_or_else(|| {
                    self.bind_err(source, "'after' must be an object keyed by delay millis")
                })?;
                for (delay, spec) in map {
                    let delay_ms: u64 = delay.parse().map_err(|_| {
                        self.bind_err(source, format!("invalid 'after' delay '{delay}'"))
                    })?;
                    let transitions = self.bind_transition_list(source, spec)?;
                    self.delays_ms.insert(delay_ms);
                    self.states[idx].after.push(AfterEntry {
                        delay_ms,
                        transitions,
                    });
                }
            }

            if let Some(always) = &raw.always {
                self.states[idx].always = self.bind_transition_list(source, always)?;
            }

            if let Some(invoke) = &raw.invoke {
                let defs: Vec<&Value> = match invoke {
                    Value::Array(items) => items.iter().collect(),
                    single => vec![single],
                };
                for def in defs {
                    self.bind_invoke(source, def)?;
                }
            }

            if let Some(activities) = &raw.activities {
                for src in string_list(Some(activities), &self.states[idx].path, "activities")? {
                    self.service_names.insert(src.clone());
                    let id_str = src.clone();
                    self.push_invoke(source, id_str, src, true)?;
                }
            }

            if let Some(target) = &raw.history_target {
                let resolved = self.resolve_target(source, target)?;
                self.states[idx].history_default = Some(resolved);
            }
        }
        Ok(())
    }

    fn bind_invoke(&mut self, source: StateId, def: &Value) -> Result<(), ChartError> {
        let obj = def
            .as_object()
            .ok_or_else(|| self.bind_err(source, "'invoke' must be an object"))?;
        let src = match obj.get("src") {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            _ => return Err(self.bind_err(source, "'invoke' requires a 'src' string")),
        };
        let invoke_id = match obj.get("id") {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            None => src.clone(),
            _ => return Err(self.bind_err(source, "'invoke.id' must be a non-empty string")),
        };
        self.service_names.insert(src.clone());

        if let Some(on_done) = obj.get("onDone") {
            let transitions = self.bind_transition_list(source, on_done)?;
            self.states[source as usize]
                .on
                .insert(format!("done.invoke.{invoke_id}"), transitions);
        }
        if let Some(on_error) = obj.get("onError") {
            let transitions = self.bind_transition_list(source, on_error)?;
            self.states[source as usize]
                .on
                .insert(format!("error.invoke.{invoke_id}"), transitions);
        }

        self.push_invoke(source, invoke_id, src, false)
    }

    fn push_invoke(
        &mut self,
        source: StateId,
        id: String,
        src: String,
        activity: bool,
    ) -> Result<(), ChartError> {
        let duplicate = self
            .states
            .iter()
            .flat_map(|s| s.invoke.iter())
            .any(|i| i.id == id);
        if duplicate {
            return Err(self.bind_err(source, format!("duplicate invoke id '{id}'")));
        }
        self.states[source as usize].invoke.push(InvokeDef {
            id,
            src,
            activity,
        });
        Ok(())
    }

    fn bind_transition_list(
        &mut self,
        source: StateId,
        spec: &Value,
    ) -> Result<Vec<Transition>, ChartError> {
        let specs: Vec<&Value> = match spec {
            Value::Array(items) => items.iter().collect(),
            single => vec![single],
        };
        let mut out = Vec::with_capacity(specs.len());
        for s in specs {
            out.push(self.bind_transition(source, s)?);
        }
        Ok(out)
    }

    fn bind_transition(&mut self, source: StateId, spec: &Value) -> Result<Transition, ChartError> {
        let (target_path, guards, actions, internal_flag) = match spec {
            Value::String(target) => (Some(target.clone()), Vec::new(), Vec::new(), None),
            Value::Object(obj) => {
                let target = match obj.get("target") {
                    None | Some(Value::Null) => None,
                    Some(Value::String(s)) => Some(s.clone()),
                    Some(_) => {
                        return Err(
                            self.bind_err(source, "transition 'target' must be a string or null")
                        )
                    }
                };
                let guard_field = obj.get("guard").or_else(|| obj.get("cond"));
                let guards =
                    string_list(guard_field, &self.states[source as usize].path, "guard")?;
                let actions = string_list(
                    obj.get("actions"),
                    &self.states[source as usize].path,
                    "actions",
                )?;
                let internal = match obj.get("internal") {
                    None => None,
                    Some(Value::Bool(b)) => Some(*b),
                    Some(_) => {
                        return Err(self.bind_err(source, "transition 'internal' must be a bool"))
                    }
                };
                (target, guards, actions, internal)
            }
            _ => {
                return Err(self.bind_err(
                    source,
                    "a transition must be a target path or a transition object",
                ))
            }
        };

        self.guard_names.extend(guards.iter().cloned());
        self.action_names.extend(actions.iter().cloned());

        let target = match &target_path {
            None => None,
            Some(p) => Some(self.resolve_target(source, p)?),
        };

        let kind = match (internal_flag, target) {
            (_, None) => TransitionKind::Internal,
            (Some(true), Some(t)) => {
                if t != source && !self.is_descendant(t, source) {
                    return Err(self.bind_err(
                        source,
                        format!(
                            "internal transition target '{}' is not a descendant",
                            self.states[t as usize].path
                        ),
                    ));
                }
                TransitionKind::Internal
            }
            (_, Some(_)) => TransitionKind::External,
        };

        Ok(Transition {
            source,
            target,
            guards,
            actions,
            kind,
        })
    }

    /// Dot-separated path resolution. A leading dot is absolute from the
    /// root. Otherwise the first segment is matched against the source state
    /// itself, its children, then each ancestor's children walking outward;
    /// the closest match wins.
    fn resolve_target(&self, source: StateId, path: &str) -> Result<StateId, ChartError> {
        if path.is_empty() {
            return Err(self.bind_err(source, "empty transition target"));
        }

        let (base, rest): (StateId, &str) = if let Some(abs) = path.strip_prefix('.') {
            let root = self.root_of(source);
            (root, abs)
        } else {
            let mut segments = path.splitn(2, '.');
            let first = segments.next().unwrap_or_default();
            let rest = segments.next().unwrap_or_default();
            let base = self.resolve_first_segment(source, first).ok_or_else(|| {
                self.bind_err(
                    source,
                    format!("cannot resolve transition target '{path}' (segment '{first}')"),
                )
            })?;
            (base, rest)
        };

        let mut current = base;
        if !rest.is_empty() {
            for seg in rest.split('.') {
                current = self.child_by_key(current, seg).ok_or_else(|| {
                    self.bind_err(
                        source,
                        format!("cannot resolve transition target '{path}' (segment '{seg}')"),
                    )
                })?;
            }
        }
        Ok(current)
    }

    fn resolve_first_segment(&self, source: StateId, seg: &str) -> Option<StateId> {
        if self.states[source as usize].key == seg {
            return Some(source);
        }
        if let Some(child) = self.child_by_key(source, seg) {
            return Some(child);
        }
        let mut cursor = self.states[source as usize].parent;
        while let Some(ancestor) = cursor {
            if let Some(child) = self.child_by_key(ancestor, seg) {
                return Some(child);
            }
            if self.states[ancestor as usize].key == seg {
                return Some(ancestor);
            }
            cursor = self.states[ancestor as usize].parent;
        }
        None
    }

    fn child_by_key(&self, parent: StateId, key: &str) -> Option<StateId> {
        self.states[parent as usize]
            .children
            .iter()
            .copied()
            .find(|&c| self.states[c as usize].key == key)
    }

    fn root_of(&self, mut id: StateId) -> StateId {
        while let Some(parent) = self.states[id as usize].parent {
            id = parent;
        }
        id
    }

    fn is_descendant(&self, node: StateId, ancestor: StateId) -> bool {
        let mut cursor = self.states[node as usize].parent;
        while let Some(p) = cursor {
            if p == ancestor {
                return true;
            }
            cursor = self.states[p as usize].parent;
        }
        false
    }

    // ── Structural validation ──

    fn validate(&self) -> Result<(), ChartError> {
        for node in &self.states {
            match node.kind {
                StateKind::History => {
                    let parent = node.parent.ok_or_else(|| {
                        ChartError::bind("history node cannot be the chart root")
                    })?;
                    if self.states[parent as usize].kind != StateKind::Compound {
                        return Err(ChartError::bind(format!(
                            "history state '{}' must be the child of a compound state",
                            node.path
                        )));
                    }
                }
                StateKind::Parallel => {
                    let regions = node
                        .children
                        .iter()
                        .filter(|&&c| self.states[c as usize].kind != StateKind::History)
                        .count();
                    if regions < 2 {
                        return Err(ChartError::bind(format!(
                            "parallel state '{}' needs at least two regions",
                            node.path
                        )));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn bind_err(&self, source: StateId, reason: impl Into<String>) -> ChartError {
        let path = &self.states[source as usize].path;
        let at = if path.is_empty() { "<root>" } else { path };
        ChartError::bind(format!("state '{at}': {}", reason.into()))
    }
}

/// Accepts a single string or a list of strings.
fn string_list(value: Option<&Value>, path: &str, field: &str) -> Result<Vec<String>, ChartError> {
    match value {
        None => Ok(Vec::new()),
        Some(Value::String(s)) => Ok(vec![s.clone()]),
        Some(Value::Array(items)) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::String(s) => out.push(s.clone()),
                    _ => {
                        return Err(ChartError::bind(format!(
                            "state '{path}': '{field}' entries must be strings"
                        )))
                    }
                }
            }
            Ok(out)
        }
        Some(_) => Err(ChartError::bind(format!(
            "state '{path}': '{field}' must be a string or list of strings"
        ))),
    }
}
