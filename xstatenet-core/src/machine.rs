//! A registered machine instance: chart + registry + mutable runtime state,
//! driven one event at a time by its owning consumer task. Timers and
//! invocations re-enter through the bound `EventSink` rather than calling
//! back into the machine, so the single-consumer discipline holds.

use crate::chart::MachineChart;
use crate::config::MachineConfig;
use crate::context::OrchestratedContext;
use crate::error::{Error, Result};
use crate::interpreter::{self, HistoryStore, Trigger};
use crate::registry::{ActionScope, Registry, ServiceArgs};
use crate::types::*;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Event name used for exit actions during `stop`.
const STOP_EVENT: &str = "xstate.stop";

/// Where timers and invocation completions are injected. The orchestrator
/// binds a sink that re-enqueues onto the machine's own channel; standalone
/// machines can bind a plain mpsc sender.
#[derive(Clone)]
pub struct EventSink {
    inner: Arc<dyn Fn(Event) + Send + Sync>,
}

impl EventSink {
    pub fn new(f: impl Fn(Event) + Send + Sync + 'static) -> Self {
        Self { inner: Arc::new(f) }
    }

    pub fn from_channel(tx: tokio::sync::mpsc::UnboundedSender<Event>) -> Self {
        Self::new(move |event| {
            let _ = tx.send(event);
        })
    }

    pub fn send(&self, event: Event) {
        (self.inner)(event);
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EventSink")
    }
}

/// Anything the orchestrator can host: a plain `Machine` or a resilience
/// decorator around one.
#[async_trait]
pub trait MachineHandle: Send {
    fn machine_id(&self) -> &str;
    fn set_machine_id(&mut self, id: String);
    fn bind_sink(&mut self, sink: EventSink);
    fn configuration(&self) -> Vec<String>;
    async fn start(&mut self, ctx: &OrchestratedContext) -> Result<StepResult>;
    async fn handle_event(&mut self, event: &Event, ctx: &OrchestratedContext) -> Result<StepResult>;
    async fn stop(&mut self, ctx: &OrchestratedContext) -> Result<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MachineStatus {
    Idle,
    Running,
    /// Reached a top-level final state.
    Done,
    Stopped,
    /// Gave up after an eventless-transition loop; only `stop` is useful now.
    Errored,
}

struct TimerRecord {
    state: StateId,
    after_index: usize,
    handle: JoinHandle<()>,
}

struct InvocationRecord {
    state: StateId,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

pub struct Machine {
    id: String,
    chart: Arc<MachineChart>,
    registry: Arc<Registry>,
    config: MachineConfig,
    context: ContextMap,
    active: BTreeSet<StateId>,
    history: HistoryStore,
    timers: HashMap<u64, TimerRecord>,
    timer_seq: u64,
    invocations: HashMap<String, InvocationRecord>,
    sink: Option<EventSink>,
    cancel: CancellationToken,
    status: MachineStatus,
    /// Per-action budgets installed by the timeout protector.
    action_timeouts: HashMap<String, Duration>,
    default_action_timeout: Option<Duration>,
}

impl Machine {
    pub fn new(id: impl Into<String>, chart: Arc<MachineChart>, registry: Arc<Registry>) -> Self {
        Self::with_config(id, chart, registry, MachineConfig::default())
    }

    pub fn with_config(
        id: impl Into<String>,
        chart: Arc<MachineChart>,
        registry: Arc<Registry>,
        config: MachineConfig,
    ) -> Self {
        let context = chart.initial_context.clone();
        Self {
            id: id.into(),
            chart,
            registry,
            config,
            context,
            active: BTreeSet::new(),
            history: HistoryStore::new(),
            timers: HashMap::new(),
            timer_seq: 0,
            invocations: HashMap::new(),
            sink: None,
            cancel: CancellationToken::new(),
            status: MachineStatus::Idle,
            action_timeouts: HashMap::new(),
            default_action_timeout: None,
        }
    }

    pub fn status(&self) -> MachineStatus {
        self.status
    }

    pub fn chart(&self) -> &MachineChart {
        &self.chart
    }

    pub fn context(&self) -> &ContextMap {
        &self.context
    }

    pub fn set_action_timeouts(
        &mut self,
        per_action: HashMap<String, Duration>,
        default: Option<Duration>,
    ) {
        self.action_timeouts = per_action;
        self.default_action_timeout = default;
    }

    fn sink(&self) -> Option<EventSink> {
        self.sink.clone()
    }

    // ── Selection ──

    fn select(&self, trigger: Trigger<'_>, event: &Event, result: &mut StepResult) -> Vec<Transition> {
        let context = &self.context;
        let registry = &self.registry;
        let machine_id = &self.id;
        let mut recorded: Vec<ActionFailure> = Vec::new();
        let mut guard_eval = |name: &str| match registry.lookup_guard(name) {
            Some(guard) => match guard.as_ref()(context, event) {
                Ok(pass) => pass,
                Err(message) => {
                    tracing::warn!(machine = %machine_id, guard = %name, %message, "guard failed, treating as false");
                    recorded.push(ActionFailure {
                        action: name.to_string(),
                        message,
                        timed_out: false,
                    });
                    false
                }
            },
            None => {
                tracing::warn!(machine = %machine_id, guard = %name, "guard not registered, treating as false");
                recorded.push(ActionFailure {
                    action: name.to_string(),
                    message: "not registered".to_string(),
                    timed_out: false,
                });
                false
            }
        };
        let picked = interpreter::select_transitions(&self.chart, &self.active, trigger, &mut guard_eval);
        result.guard_failures.extend(recorded);
        picked
    }

    // ── Actions ──

    async fn run_actions(
        &mut self,
        names: &[String],
        event: &Event,
        octx: &OrchestratedContext,
        result: &mut StepResult,
    ) -> Result<()> {
        let registry = self.registry.clone();
        for name in names {
            if self.cancel.is_cancelled() {
                return Err(Error::Internal("event handling cancelled".into()));
            }
            let Some(action) = registry.lookup_action(name) else {
                result.failures.push(ActionFailure {
                    action: name.clone(),
                    message: "not registered".into(),
                    timed_out: false,
                });
                continue;
            };
            let budget = self
                .action_timeouts
                .get(name)
                .copied()
                .or(self.default_action_timeout);
            let action_token = self.cancel.child_token();
            let scope = ActionScope {
                machine_id: &self.id,
                context: &mut self.context,
                event,
                orchestration: octx,
                cancel: &action_token,
            };
            let outcome = match budget {
                Some(limit) => match tokio::time::timeout(limit, action.as_ref()(scope)).await {
                    Ok(r) => r,
                    Err(_) => {
                        action_token.cancel();
                        tracing::warn!(machine = %self.id, action = %name, "action exceeded its budget");
                        result.failures.push(ActionFailure {
                            action: name.clone(),
                            message: format!("exceeded {limit:?} budget"),
                            timed_out: true,
                        });
                        continue;
                    }
                },
                None => action.as_ref()(scope).await,
            };
            if let Err(message) = outcome {
                tracing::warn!(machine = %self.id, action = %name, %message, "action failed");
                if self.config.strict_actions {
                    return Err(Error::ActionFailure {
                        action: name.clone(),
                        message,
                    });
                }
                result.failures.push(ActionFailure {
                    action: name.clone(),
                    message,
                    timed_out: false,
                });
            }
        }
        Ok(())
    }

    // ── Timers and invocations ──

    fn schedule_after(&mut self, state: StateId) {
        let chart = self.chart.clone();
        let node = chart.node(state);
        if node.after.is_empty() {
            return;
        }
        let Some(sink) = self.sink() else {
            tracing::debug!(machine = %self.id, state = %node.path, "no sink bound, after() timers inert");
            return;
        };
        for (index, entry) in node.after.iter().enumerate() {
            self.timer_seq += 1;
            let timer_id = self.timer_seq;
            let delay = Duration::from_millis(entry.delay_ms);
            let name = format!("after({})#{}", entry.delay_ms, node.path);
            let sink = sink.clone();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                sink.send(Event::new(name, json!({ "timerId": timer_id })));
            });
            self.timers.insert(
                timer_id,
                TimerRecord {
                    state,
                    after_index: index,
                    handle,
                },
            );
        }
    }

    fn cancel_timers_for(&mut self, state: StateId) {
        self.timers.retain(|_, record| {
            if record.state == state {
                record.handle.abort();
                false
            } else {
                true
            }
        });
    }

    fn start_invocations(&mut self, state: StateId, event: &Event, result: &mut StepResult) {
        let chart = self.chart.clone();
        for inv in &chart.node(state).invoke {
            let Some(service) = self.registry.lookup_service(&inv.src) else {
                result.failures.push(ActionFailure {
                    action: inv.src.clone(),
                    message: "service not registered".into(),
                    timed_out: false,
                });
                continue;
            };
            let token = CancellationToken::new();
            let input = json!({
                "context": Value::Object(self.context.clone()),
                "event": event,
            });
            let fut = service.as_ref()(ServiceArgs {
                machine_id: self.id.clone(),
                invoke_id: inv.id.clone(),
                input,
                cancel: token.clone(),
            });
            let sink = self.sink();
            let invoke_id = inv.id.clone();
            let machine_id = self.id.clone();
            let activity = inv.activity;
            let watch = token.clone();
            let handle = tokio::spawn(async move {
                tokio::select! {
                    _ = watch.cancelled() => {
                        tracing::debug!(machine = %machine_id, invoke = %invoke_id, "invocation cancelled");
                    }
                    outcome = fut => {
                        let Some(sink) = sink else { return };
                        match outcome {
                            Ok(value) if !activity => sink.send(Event::done_invoke(&invoke_id, value)),
                            Ok(_) => {}
                            Err(message) => sink.send(Event::error_invoke(&invoke_id, message)),
                        }
                    }
                }
            });
            self.invocations.insert(
                inv.id.clone(),
                InvocationRecord {
                    state,
                    token,
                    handle: Some(handle),
                },
            );
        }
    }

    fn cancel_invocations_for(&mut self, state: StateId) {
        let grace = self.config.invoke_grace;
        let cancelled: Vec<String> = self
            .invocations
            .iter()
            .filter(|(_, r)| r.state == state)
            .map(|(id, _)| id.clone())
            .collect();
        for id in cancelled {
            if let Some(mut record) = self.invocations.remove(&id) {
                record.token.cancel();
                if let Some(handle) = record.handle.take() {
                    // Cooperative first; hard abort after the grace period.
                    tokio::spawn(async move {
                        tokio::time::sleep(grace).await;
                        handle.abort();
                    });
                }
            }
        }
    }

    // ── Step execution ──

    async fn enter_states(
        &mut self,
        entry_list: &[StateId],
        event: &Event,
        octx: &OrchestratedContext,
        result: &mut StepResult,
        raised: &mut VecDeque<Event>,
    ) -> Result<()> {
        let chart = self.chart.clone();
        for &state in entry_list {
            self.active.insert(state);
            let entry_actions = chart.node(state).entry.clone();
            self.run_actions(&entry_actions, event, octx, result).await?;
            self.schedule_after(state);
            self.start_invocations(state, event, result);

            if chart.node(state).kind == StateKind::Final {
                self.on_final_entered(state, raised, result);
            }
        }
        Ok(())
    }

    fn on_final_entered(
        &mut self,
        state: StateId,
        raised: &mut VecDeque<Event>,
        result: &mut StepResult,
    ) {
        let chart = self.chart.clone();
        let Some(parent) = chart.parent_of(state) else {
            result.done = true;
            return;
        };
        if parent == chart.root {
            result.done = true;
            self.status = MachineStatus::Done;
            return;
        }
        if chart.node(parent).kind == StateKind::Compound {
            raised.push_back(Event::done_state(&chart.node(parent).path));
        }
        if let Some(grandparent) = chart.parent_of(parent) {
            if chart.node(grandparent).kind == StateKind::Parallel
                && interpreter::is_in_final_state(&chart, &self.active, grandparent)
            {
                raised.push_back(Event::done_state(&chart.node(grandparent).path));
            }
        }
    }

    async fn execute_step(
        &mut self,
        event: &Event,
        transitions: Vec<Transition>,
        octx: &OrchestratedContext,
        result: &mut StepResult,
        raised: &mut VecDeque<Event>,
    ) -> Result<()> {
        let chart = self.chart.clone();

        let exit_list = interpreter::compute_exit_list(&chart, &self.active, &transitions);
        interpreter::record_history(&chart, &self.active, &exit_list, &mut self.history);
        for &state in &exit_list {
            let exit_actions = chart.node(state).exit.clone();
            self.run_actions(&exit_actions, event, octx, result).await?;
            self.cancel_timers_for(state);
            self.cancel_invocations_for(state);
            self.active.remove(&state);
        }

        for t in &transitions {
            let actions = t.actions.clone();
            self.run_actions(&actions, event, octx, result).await?;
        }

        let entry_list = interpreter::compute_entry_list(&chart, &transitions, &self.history);
        self.enter_states(&entry_list, event, octx, result, raised).await?;

        result.transitions_taken += transitions.len();
        Ok(())
    }

    /// Run eventless transitions and internally raised events to quiescence.
    async fn run_microsteps(
        &mut self,
        event: &Event,
        octx: &OrchestratedContext,
        result: &mut StepResult,
        raised: &mut VecDeque<Event>,
    ) -> Result<()> {
        let mut iterations: u32 = 0;
        loop {
            iterations += 1;
            if iterations > self.config.always_cap {
                self.status = MachineStatus::Errored;
                return Err(Error::InfiniteTransitionLoop {
                    machine_id: self.id.clone(),
                    cap: self.config.always_cap,
                });
            }

            let always = self.select(Trigger::Always, event, result);
            if !always.is_empty() {
                self.execute_step(event, always, octx, result, raised).await?;
                continue;
            }

            let Some(internal) = raised.pop_front() else {
                break;
            };
            let picked = self.select(Trigger::Named(&internal.name), &internal, result);
            if !picked.is_empty() {
                self.execute_step(&internal, picked, octx, result, raised).await?;
            }
        }
        Ok(())
    }

    /// Timer events carry their arming id; a timer whose record is gone
    /// (state exited, or already consumed) is silently dropped.
    fn take_timer_transitions(&mut self, event: &Event) -> Option<Vec<Transition>> {
        let timer_id = event.payload.get("timerId")?.as_u64()?;
        let record = self.timers.remove(&timer_id)?;
        if !self.active.contains(&record.state) {
            return None;
        }
        let entry = self.chart.node(record.state).after.get(record.after_index)?.clone();
        let picked: Vec<Transition> = {
            let context = &self.context;
            let registry = &self.registry;
            entry
                .transitions
                .iter()
                .find(|t| {
                    t.guards.iter().all(|g| match registry.lookup_guard(g) {
                        Some(guard) => guard.as_ref()(context, event).unwrap_or(false),
                        None => false,
                    })
                })
                .cloned()
                .into_iter()
                .collect()
        };
        if picked.is_empty() {
            return None;
        }
        Some(picked)
    }
}

#[async_trait]
impl MachineHandle for Machine {
    fn machine_id(&self) -> &str {
        &self.id
    }

    fn set_machine_id(&mut self, id: String) {
        self.id = id;
    }

    fn bind_sink(&mut self, sink: EventSink) {
        self.sink = Some(sink);
    }

    fn configuration(&self) -> Vec<String> {
        interpreter::configuration_paths(&self.chart, &self.active)
    }

    async fn start(&mut self, octx: &OrchestratedContext) -> Result<StepResult> {
        if self.status != MachineStatus::Idle {
            return Ok(StepResult::discarded(self.configuration()));
        }
        self.status = MachineStatus::Running;
        let mut result = StepResult::default();
        let mut raised = VecDeque::new();
        let event = Event::named(START_EVENT);

        let entry_list = interpreter::initial_entry_list(&self.chart, &self.history);
        self.enter_states(&entry_list, &event, octx, &mut result, &mut raised)
            .await?;
        self.run_microsteps(&event, octx, &mut result, &mut raised).await?;

        result.new_configuration = self.configuration();
        if result.done {
            self.status = MachineStatus::Done;
        }
        tracing::info!(machine = %self.id, configuration = ?result.new_configuration, "machine started");
        Ok(result)
    }

    async fn handle_event(&mut self, event: &Event, octx: &OrchestratedContext) -> Result<StepResult> {
        match self.status {
            MachineStatus::Idle => {
                return Err(Error::MachineNotRunning {
                    machine_id: self.id.clone(),
                })
            }
            MachineStatus::Running => {}
            MachineStatus::Done | MachineStatus::Stopped | MachineStatus::Errored => {
                return Ok(StepResult::discarded(self.configuration()))
            }
        }

        let mut result = StepResult {
            old_configuration: self.configuration(),
            ..Default::default()
        };
        let mut raised = VecDeque::new();

        let transitions = if event.name.starts_with("after(") {
            self.take_timer_transitions(event)
        } else {
            let picked = self.select(Trigger::Named(&event.name), event, &mut result);
            if picked.is_empty() {
                None
            } else {
                Some(picked)
            }
        };

        let Some(transitions) = transitions else {
            let mut discarded = StepResult::discarded(self.configuration());
            discarded.guard_failures = result.guard_failures;
            discarded.unhandled_error = event.is_error();
            if discarded.unhandled_error {
                tracing::warn!(machine = %self.id, event = %event.name, "error event had no handler");
            } else {
                tracing::debug!(machine = %self.id, event = %event.name, "event discarded");
            }
            return Ok(discarded);
        };

        self.execute_step(event, transitions, octx, &mut result, &mut raised)
            .await?;
        self.run_microsteps(event, octx, &mut result, &mut raised).await?;

        result.new_configuration = self.configuration();
        if result.done {
            self.status = MachineStatus::Done;
        }
        Ok(result)
    }

    async fn stop(&mut self, octx: &OrchestratedContext) -> Result<()> {
        if self.status == MachineStatus::Idle || self.status == MachineStatus::Stopped {
            self.status = MachineStatus::Stopped;
            return Ok(());
        }
        let chart = self.chart.clone();
        let event = Event::named(STOP_EVENT);
        let mut result = StepResult::default();

        let mut exit_list: Vec<StateId> = self.active.iter().copied().collect();
        exit_list.sort_unstable_by(|a, b| b.cmp(a));
        for state in exit_list {
            let exit_actions = chart.node(state).exit.clone();
            self.run_actions(&exit_actions, &event, octx, &mut result).await?;
            self.cancel_timers_for(state);
            self.cancel_invocations_for(state);
            self.active.remove(&state);
        }
        self.cancel.cancel();
        self.status = MachineStatus::Stopped;
        tracing::info!(machine = %self.id, "machine stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    fn arc_chart(src: &str) -> Arc<MachineChart> {
        Arc::new(MachineChart::parse(src).unwrap())
    }

    fn octx(id: &str) -> OrchestratedContext {
        OrchestratedContext::new(id, Vec::new())
    }

    const TOGGLE: &str =
        "{ id: 'toggle', initial: 'off', states: { off: { on: { TOGGLE: 'on' } }, on: { on: { TOGGLE: 'off' } } } }";

    #[tokio::test]
    async fn toggle_flips_between_states() {
        let mut machine = Machine::new("t1", arc_chart(TOGGLE), Arc::new(Registry::new()));
        let ctx = octx("t1");
        machine.start(&ctx).await.unwrap();
        assert_eq!(machine.configuration(), vec!["off"]);

        let step = machine
            .handle_event(&Event::named("TOGGLE"), &ctx)
            .await
            .unwrap();
        assert_eq!(step.new_configuration, vec!["on"]);

        let step = machine
            .handle_event(&Event::named("TOGGLE"), &ctx)
            .await
            .unwrap();
        assert_eq!(step.new_configuration, vec!["off"]);
    }

    #[tokio::test]
    async fn unknown_event_is_discarded_not_an_error() {
        let mut machine = Machine::new("t2", arc_chart(TOGGLE), Arc::new(Registry::new()));
        let ctx = octx("t2");
        machine.start(&ctx).await.unwrap();
        let step = machine
            .handle_event(&Event::named("NOPE"), &ctx)
            .await
            .unwrap();
        assert!(step.discarded);
        assert_eq!(machine.configuration(), vec!["off"]);
    }

    #[tokio::test]
    async fn guarded_transition_selects_by_context() {
        let chart = arc_chart(
            r#"{ id: 'g', initial: 'idle', context: { ready: false }, states: {
                idle: { on: { GO: [ { guard: 'isReady', target: 'run' }, { target: 'wait' } ] } },
                run: {}, wait: {}
            } }"#,
        );
        let mut registry = Registry::new();
        registry.add_guard("isReady", |ctx, _| {
            Ok(ctx.get("ready").and_then(Value::as_bool).unwrap_or(false))
        });
        let registry = Arc::new(registry);

        let mut machine = Machine::new("g1", chart.clone(), registry.clone());
        let ctx = octx("g1");
        machine.start(&ctx).await.unwrap();
        let step = machine.handle_event(&Event::named("GO"), &ctx).await.unwrap();
        assert_eq!(step.new_configuration, vec!["wait"]);

        let mut machine = Machine::new("g2", chart, registry);
        machine.start(&ctx).await.unwrap();
        machine.context.insert("ready".into(), Value::Bool(true));
        let step = machine.handle_event(&Event::named("GO"), &ctx).await.unwrap();
        assert_eq!(step.new_configuration, vec!["run"]);
    }

    #[tokio::test]
    async fn entry_and_exit_actions_balance_over_start_stop() {
        let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let mut registry = Registry::new();
        for name in ["enterA", "enterB", "exitA", "exitB"] {
            let log = log.clone();
            registry.add_sync_action(name, move |_, _, _| {
                log.lock().push(name.to_string());
                Ok(())
            });
        }
        let chart = arc_chart(
            r#"{ id: 'b', initial: 'a', states: {
                a: { entry: 'enterA', exit: 'exitA', initial: 'b',
                     states: { b: { entry: 'enterB', exit: 'exitB' } } }
            } }"#,
        );
        let mut machine = Machine::new("b1", chart, Arc::new(registry));
        let ctx = octx("b1");
        machine.start(&ctx).await.unwrap();
        machine.stop(&ctx).await.unwrap();

        // Entry outer-to-inner, exit inner-to-outer.
        assert_eq!(
            log.lock().as_slice(),
            ["enterA", "enterB", "exitB", "exitA"]
        );
    }

    #[tokio::test]
    async fn transition_actions_run_between_exit_and_entry() {
        let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let mut registry = Registry::new();
        for name in ["exitA", "doMove", "enterB"] {
            let log = log.clone();
            registry.add_sync_action(name, move |_, _, _| {
                log.lock().push(name.to_string());
                Ok(())
            });
        }
        let chart = arc_chart(
            r#"{ id: 'm', initial: 'a', states: {
                a: { exit: 'exitA', on: { GO: { target: 'b', actions: 'doMove' } } },
                b: { entry: 'enterB' }
            } }"#,
        );
        let mut machine = Machine::new("m1", chart, Arc::new(registry));
        let ctx = octx("m1");
        machine.start(&ctx).await.unwrap();
        machine.handle_event(&Event::named("GO"), &ctx).await.unwrap();
        assert_eq!(log.lock().as_slice(), ["exitA", "doMove", "enterB"]);
    }

    #[tokio::test]
    async fn action_failure_is_recorded_and_later_actions_still_run() {
        let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let mut registry = Registry::new();
        registry.add_sync_action("boom", |_, _, _| Err("kaput".into()));
        {
            let log = log.clone();
            registry.add_sync_action("after", move |_, _, _| {
                log.lock().push("after".into());
                Ok(())
            });
        }
        let chart = arc_chart(
            r#"{ id: 'm', initial: 'a', states: {
                a: { on: { GO: { target: 'b', actions: ['boom', 'after'] } } }, b: {}
            } }"#,
        );
        let mut machine = Machine::new("m1", chart, Arc::new(registry));
        let ctx = octx("m1");
        machine.start(&ctx).await.unwrap();
        let step = machine.handle_event(&Event::named("GO"), &ctx).await.unwrap();
        assert_eq!(step.failures.len(), 1);
        assert_eq!(step.failures[0].action, "boom");
        assert_eq!(log.lock().as_slice(), ["after"]);
        assert_eq!(step.new_configuration, vec!["b"]);
    }

    #[tokio::test]
    async fn strict_mode_reraises_action_failures() {
        let mut registry = Registry::new();
        registry.add_sync_action("boom", |_, _, _| Err("kaput".into()));
        let chart = arc_chart(
            "{ id: 'm', initial: 'a', states: { a: { on: { GO: { target: 'b', actions: 'boom' } } }, b: {} } }",
        );
        let mut machine = Machine::with_config(
            "m1",
            chart,
            Arc::new(registry),
            MachineConfig {
                strict_actions: true,
                ..Default::default()
            },
        );
        let ctx = octx("m1");
        machine.start(&ctx).await.unwrap();
        let err = machine.handle_event(&Event::named("GO"), &ctx).await.unwrap_err();
        assert!(matches!(err, Error::ActionFailure { .. }));
    }

    #[tokio::test]
    async fn parallel_completion_raises_done_state() {
        let chart = arc_chart(
            r#"{ id: 'p', initial: 'work', states: {
                work: {
                    type: 'parallel',
                    states: {
                        r1: { initial: 'w', states: { w: { on: { DONE_1: 'f' } }, f: { type: 'final' } } },
                        r2: { initial: 'w', states: { w: { on: { DONE_2: 'f' } }, f: { type: 'final' } } }
                    },
                    on: { 'done.state.work': 'finished' }
                },
                finished: {}
            } }"#,
        );
        let mut machine = Machine::new("p1", chart, Arc::new(Registry::new()));
        let ctx = octx("p1");
        machine.start(&ctx).await.unwrap();
        assert_eq!(machine.configuration(), vec!["work.r1.w", "work.r2.w"]);

        let step = machine.handle_event(&Event::named("DONE_1"), &ctx).await.unwrap();
        assert_eq!(step.new_configuration, vec!["work.r1.f", "work.r2.w"]);

        let step = machine.handle_event(&Event::named("DONE_2"), &ctx).await.unwrap();
        assert_eq!(step.new_configuration, vec!["finished"]);
    }

    #[tokio::test]
    async fn always_transitions_chain_after_commit() {
        let chart = arc_chart(
            r#"{ id: 'm', initial: 'a', states: {
                a: { on: { GO: 'b' } },
                b: { always: [ { guard: 'skip', target: 'c' } ] },
                c: {}
            } }"#,
        );
        let mut registry = Registry::new();
        registry.add_guard("skip", |_, _| Ok(true));
        let mut machine = Machine::new("m1", chart, Arc::new(registry));
        let ctx = octx("m1");
        machine.start(&ctx).await.unwrap();
        let step = machine.handle_event(&Event::named("GO"), &ctx).await.unwrap();
        assert_eq!(step.new_configuration, vec!["c"]);
        assert_eq!(step.transitions_taken, 2);
    }

    #[tokio::test]
    async fn eventless_cycle_trips_the_iteration_cap() {
        let chart = arc_chart(
            r#"{ id: 'm', initial: 'a', states: {
                a: { always: 'b' },
                b: { always: 'a' }
            } }"#,
        );
        let mut machine = Machine::new("m1", chart, Arc::new(Registry::new()));
        let ctx = octx("m1");
        let err = machine.start(&ctx).await.unwrap_err();
        assert!(matches!(err, Error::InfiniteTransitionLoop { .. }));
        assert_eq!(machine.status(), MachineStatus::Errored);
    }

    #[tokio::test]
    async fn after_timer_fires_once_and_is_injected_via_sink() {
        let chart = arc_chart(
            r#"{ id: 'm', initial: 'red', states: {
                red: { after: { 20: 'green' } },
                green: {}
            } }"#,
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut machine = Machine::new("m1", chart, Arc::new(Registry::new()));
        machine.bind_sink(EventSink::from_channel(tx));
        let ctx = octx("m1");
        machine.start(&ctx).await.unwrap();

        let fired = rx.recv().await.expect("timer event");
        assert!(fired.name.starts_with("after(20)#red"));
        let step = machine.handle_event(&fired, &ctx).await.unwrap();
        assert_eq!(step.new_configuration, vec!["green"]);

        // Only one fire was scheduled.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn timer_does_not_act_after_state_exit() {
        let chart = arc_chart(
            r#"{ id: 'm', initial: 'red', states: {
                red: { after: { 30: 'green' }, on: { JUMP: 'blue' } },
                green: {}, blue: {}
            } }"#,
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut machine = Machine::new("m1", chart, Arc::new(Registry::new()));
        machine.bind_sink(EventSink::from_channel(tx));
        let ctx = octx("m1");
        machine.start(&ctx).await.unwrap();

        machine.handle_event(&Event::named("JUMP"), &ctx).await.unwrap();
        assert_eq!(machine.configuration(), vec!["blue"]);

        // Even if a fire raced the exit, its record is gone and it must not act.
        tokio::time::sleep(Duration::from_millis(50)).await;
        if let Ok(stale) = rx.try_recv() {
            let step = machine.handle_event(&stale, &ctx).await.unwrap();
            assert!(step.discarded);
        }
        assert_eq!(machine.configuration(), vec!["blue"]);
    }

    #[tokio::test]
    async fn invocation_completion_raises_done_invoke() {
        let chart = arc_chart(
            r#"{ id: 'm', initial: 'loading', states: {
                loading: { invoke: { src: 'fetch', id: 'fetch', onDone: 'ready' } },
                ready: {}
            } }"#,
        );
        let mut registry = Registry::new();
        registry.add_service("fetch", |_args| {
            Box::pin(async { Ok(json!({ "user": "ada" })) })
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut machine = Machine::new("m1", chart, Arc::new(registry));
        machine.bind_sink(EventSink::from_channel(tx));
        let ctx = octx("m1");
        machine.start(&ctx).await.unwrap();

        let done = rx.recv().await.expect("done event");
        assert_eq!(done.name, "done.invoke.fetch");
        assert_eq!(done.payload["user"], "ada");
        let step = machine.handle_event(&done, &ctx).await.unwrap();
        assert_eq!(step.new_configuration, vec!["ready"]);
    }

    #[tokio::test]
    async fn invocation_is_cancelled_on_state_exit() {
        let chart = arc_chart(
            r#"{ id: 'm', initial: 'loading', states: {
                loading: { invoke: { src: 'slow', id: 'slow', onDone: 'ready' }, on: { ABORT: 'idle' } },
                ready: {}, idle: {}
            } }"#,
        );
        let mut registry = Registry::new();
        registry.add_service("slow", |args| {
            Box::pin(async move {
                tokio::select! {
                    _ = args.cancel.cancelled() => Err("cancelled".into()),
                    _ = tokio::time::sleep(Duration::from_secs(60)) => Ok(Value::Null),
                }
            })
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut machine = Machine::new("m1", chart, Arc::new(registry));
        machine.bind_sink(EventSink::from_channel(tx));
        let ctx = octx("m1");
        machine.start(&ctx).await.unwrap();

        machine.handle_event(&Event::named("ABORT"), &ctx).await.unwrap();
        assert_eq!(machine.configuration(), vec!["idle"]);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err(), "cancelled invocation must stay silent");
    }

    #[tokio::test]
    async fn unhandled_error_event_is_flagged() {
        let mut machine = Machine::new("m1", arc_chart(TOGGLE), Arc::new(Registry::new()));
        let ctx = octx("m1");
        machine.start(&ctx).await.unwrap();
        let step = machine
            .handle_event(&Event::named("error.invoke.ghost"), &ctx)
            .await
            .unwrap();
        assert!(step.discarded);
        assert!(step.unhandled_error);
    }

    #[tokio::test]
    async fn top_level_final_marks_machine_done() {
        let chart = arc_chart(
            "{ id: 'm', initial: 'a', states: { a: { on: { END: 'fin' } }, fin: { type: 'final' } } }",
        );
        let mut machine = Machine::new("m1", chart, Arc::new(Registry::new()));
        let ctx = octx("m1");
        machine.start(&ctx).await.unwrap();
        let step = machine.handle_event(&Event::named("END"), &ctx).await.unwrap();
        assert!(step.done);
        assert_eq!(machine.status(), MachineStatus::Done);

        let step = machine.handle_event(&Event::named("END"), &ctx).await.unwrap();
        assert!(step.discarded);
    }
}
