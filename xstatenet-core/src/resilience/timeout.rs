//! Timeout protection for a machine: a budget for each event handling, a
//! wall-clock budget per state, and per-action budgets installed into the
//! wrapped machine. Expired handlings go to the dead-letter queue and leave
//! the machine flagged indeterminate; expired states raise a synthetic
//! `STATE_TIMEOUT` event through the sink so the chart can route recovery.

use crate::config::TimeoutConfig;
use crate::context::OrchestratedContext;
use crate::error::{Error, Result};
use crate::machine::{EventSink, Machine, MachineHandle};
use crate::resilience::dlq::DeadLetterQueue;
use crate::types::{Event, StepResult, STATE_TIMEOUT_EVENT};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Rolling per-operation duration windows and the timeout each window
/// currently recommends.
pub struct AdaptiveTimeoutStats {
    multiplier: f64,
    min: Duration,
    max: Duration,
    window_size: usize,
    windows: Mutex<HashMap<String, VecDeque<Duration>>>,
}

#[derive(Clone, Copy, Debug)]
pub struct OperationStats {
    pub samples: usize,
    pub p95: Duration,
    pub recommended: Duration,
}

impl AdaptiveTimeoutStats {
    pub fn new(config: &TimeoutConfig) -> Self {
        Self {
            multiplier: config.adaptive_multiplier,
            min: config.min_timeout,
            max: config.max_timeout,
            window_size: config.window_size.max(1),
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn record(&self, operation: &str, duration: Duration) {
        let mut windows = self.windows.lock();
        let window = windows.entry(operation.to_string()).or_default();
        if window.len() >= self.window_size {
            window.pop_front();
        }
        window.push_back(duration);
    }

    /// `max(min, multiplier × p95)`, clamped to `max`. `None` until at
    /// least one sample exists.
    pub fn recommended(&self, operation: &str) -> Option<Duration> {
        self.stats(operation).map(|s| s.recommended)
    }

    pub fn stats(&self, operation: &str) -> Option<OperationStats> {
        let windows = self.windows.lock();
        let window = windows.get(operation)?;
        if window.is_empty() {
            return None;
        }
        let mut sorted: Vec<Duration> = window.iter().copied().collect();
        sorted.sort_unstable();
        let index = ((sorted.len() as f64 * 0.95).ceil() as usize).saturating_sub(1);
        let p95 = sorted[index.min(sorted.len() - 1)];
        let scaled = p95.mul_f64(self.multiplier);
        let recommended = scaled.max(self.min).min(self.max);
        Some(OperationStats {
            samples: sorted.len(),
            p95,
            recommended,
        })
    }
}

pub struct TimeoutProtectedMachine {
    inner: Box<dyn MachineHandle>,
    config: TimeoutConfig,
    stats: Arc<AdaptiveTimeoutStats>,
    dlq: Arc<DeadLetterQueue>,
    sink: Option<EventSink>,
    state_timer: Option<JoinHandle<()>>,
    indeterminate: bool,
}

impl TimeoutProtectedMachine {
    /// Wrap a concrete machine; its per-action budgets come from the config.
    pub fn new(mut machine: Machine, config: TimeoutConfig, dlq: Arc<DeadLetterQueue>) -> Self {
        machine.set_action_timeouts(config.action_timeouts.clone(), None);
        Self::wrap(Box::new(machine), config, dlq)
    }

    pub fn wrap(inner: Box<dyn MachineHandle>, config: TimeoutConfig, dlq: Arc<DeadLetterQueue>) -> Self {
        let stats = Arc::new(AdaptiveTimeoutStats::new(&config));
        Self {
            inner,
            config,
            stats,
            dlq,
            sink: None,
            state_timer: None,
            indeterminate: false,
        }
    }

    pub fn stats(&self) -> &AdaptiveTimeoutStats {
        &self.stats
    }

    /// True after a transition budget expired mid-handling; the inner
    /// machine may have committed only part of a step.
    pub fn is_indeterminate(&self) -> bool {
        self.indeterminate
    }

    fn transition_budget(&self, event_name: &str) -> Option<Duration> {
        let base = self.config.transition_timeout?;
        if !self.config.enable_adaptive {
            return Some(base);
        }
        Some(
            self.stats
                .recommended(&format!("event:{event_name}"))
                .unwrap_or(base),
        )
    }

    /// Pick the tightest state budget among the active leaves and arm one
    /// timer for it. Re-armed after every handled event, disarmed on stop.
    fn rearm_state_timer(&mut self) {
        if let Some(timer) = self.state_timer.take() {
            timer.abort();
        }
        let Some(sink) = self.sink.clone() else { return };

        let mut tightest: Option<(String, Duration)> = None;
        for path in self.inner.configuration() {
            let budget = self.config.state_timeouts.get(&path).copied().or_else(|| {
                self.config
                    .apply_default_state_timeout
                    .then_some(self.config.default_state_timeout)
            });
            if let Some(budget) = budget {
                let tighter = tightest
                    .as_ref()
                    .map(|(_, current)| budget < *current)
                    .unwrap_or(true);
                if tighter {
                    tightest = Some((path, budget));
                }
            }
        }
        let Some((state, budget)) = tightest else { return };

        let machine_id = self.inner.machine_id().to_string();
        let dlq = self.dlq.clone();
        self.state_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(budget).await;
            dlq.push(
                machine_id.clone(),
                STATE_TIMEOUT_EVENT,
                json!({ "state": state }),
                "StateTimeout",
                format!("state '{state}' exceeded {budget:?}"),
            );
            sink.send(Event::new(STATE_TIMEOUT_EVENT, json!({ "state": state })));
        }));
    }
}

#[async_trait]
impl MachineHandle for TimeoutProtectedMachine {
    fn machine_id(&self) -> &str {
        self.inner.machine_id()
    }

    fn set_machine_id(&mut self, id: String) {
        self.inner.set_machine_id(id);
    }

    fn bind_sink(&mut self, sink: EventSink) {
        self.sink = Some(sink.clone());
        self.inner.bind_sink(sink);
    }

    fn configuration(&self) -> Vec<String> {
        self.inner.configuration()
    }

    async fn start(&mut self, ctx: &OrchestratedContext) -> Result<StepResult> {
        let result = self.inner.start(ctx).await?;
        self.rearm_state_timer();
        Ok(result)
    }

    async fn handle_event(&mut self, event: &Event, ctx: &OrchestratedContext) -> Result<StepResult> {
        let started = Instant::now();
        let outcome = match self.transition_budget(&event.name) {
            None => self.inner.handle_event(event, ctx).await,
            Some(budget) => {
                match tokio::time::timeout(budget, self.inner.handle_event(event, ctx)).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        self.indeterminate = true;
                        self.dlq.push(
                            self.inner.machine_id(),
                            &event.name,
                            event.payload.clone(),
                            "TransitionTimeout",
                            format!("handling exceeded {budget:?}"),
                        );
                        return Err(Error::TransitionTimeout {
                            machine_id: self.inner.machine_id().to_string(),
                            event: event.name.clone(),
                        });
                    }
                }
            }
        };
        if outcome.is_ok() {
            self.stats
                .record(&format!("event:{}", event.name), started.elapsed());
            self.rearm_state_timer();
        }
        outcome
    }

    async fn stop(&mut self, ctx: &OrchestratedContext) -> Result<()> {
        if let Some(timer) = self.state_timer.take() {
            timer.abort();
        }
        self.inner.stop(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chart::MachineChart;
    use crate::registry::Registry;
    use tokio::sync::mpsc;

    fn config() -> TimeoutConfig {
        TimeoutConfig::default()
    }

    #[test]
    fn p95_recommendation_scales_and_clamps() {
        let cfg = TimeoutConfig {
            adaptive_multiplier: 1.5,
            min_timeout: Duration::from_millis(10),
            max_timeout: Duration::from_secs(1),
            window_size: 200,
            ..config()
        };
        let stats = AdaptiveTimeoutStats::new(&cfg);
        for ms in 1..=100u64 {
            stats.record("op", Duration::from_millis(ms));
        }
        let s = stats.stats("op").unwrap();
        assert_eq!(s.samples, 100);
        assert_eq!(s.p95, Duration::from_millis(95));
        assert!(
            s.recommended >= Duration::from_millis(142) && s.recommended <= Duration::from_millis(143),
            "recommended = {:?}",
            s.recommended
        );

        // Tiny observations clamp up to the minimum.
        stats.record("fast", Duration::from_micros(5));
        assert_eq!(
            stats.recommended("fast").unwrap(),
            Duration::from_millis(10)
        );
    }

    #[test]
    fn window_is_bounded() {
        let cfg = TimeoutConfig {
            window_size: 3,
            ..config()
        };
        let stats = AdaptiveTimeoutStats::new(&cfg);
        for ms in [1u64, 2, 3, 400] {
            stats.record("op", Duration::from_millis(ms));
        }
        // The first sample fell out of the window.
        assert_eq!(stats.stats("op").unwrap().samples, 3);
        assert_eq!(stats.stats("op").unwrap().p95, Duration::from_millis(400));
    }

    fn slow_machine() -> Machine {
        let chart = Arc::new(
            MachineChart::parse(
                "{ id: 'm', initial: 'a', states: { a: { on: { GO: { target: 'b', actions: 'slow' } } }, b: {} } }",
            )
            .unwrap(),
        );
        let mut registry = Registry::new();
        registry.add_action("slow", |_scope| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(())
            })
        });
        Machine::new("slow-1", chart, Arc::new(registry))
    }

    #[tokio::test]
    async fn transition_timeout_dead_letters_and_errors() {
        let dlq = Arc::new(DeadLetterQueue::new(16));
        let cfg = TimeoutConfig {
            transition_timeout: Some(Duration::from_millis(30)),
            enable_adaptive: false,
            ..config()
        };
        let mut wrapped = TimeoutProtectedMachine::new(slow_machine(), cfg, dlq.clone());
        let ctx = OrchestratedContext::new("slow-1", Vec::new());
        wrapped.start(&ctx).await.unwrap();

        let err = wrapped
            .handle_event(&Event::named("GO"), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TransitionTimeout { .. }));
        assert!(wrapped.is_indeterminate());
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq.list()[0].error_kind, "TransitionTimeout");
    }

    #[tokio::test]
    async fn per_action_budget_records_timed_out_failure() {
        let dlq = Arc::new(DeadLetterQueue::new(16));
        let cfg = TimeoutConfig {
            action_timeouts: HashMap::from([("slow".to_string(), Duration::from_millis(20))]),
            ..config()
        };
        let mut wrapped = TimeoutProtectedMachine::new(slow_machine(), cfg, dlq);
        let ctx = OrchestratedContext::new("slow-1", Vec::new());
        wrapped.start(&ctx).await.unwrap();

        let step = wrapped.handle_event(&Event::named("GO"), &ctx).await.unwrap();
        assert_eq!(step.failures.len(), 1);
        assert!(step.failures[0].timed_out);
        // The transition itself still committed.
        assert_eq!(step.new_configuration, vec!["b"]);
    }

    #[tokio::test]
    async fn state_timeout_raises_synthetic_event() {
        let chart = Arc::new(
            MachineChart::parse(
                r#"{ id: 'm', initial: 'slow', states: {
                    slow: { on: { STATE_TIMEOUT: 'recovered' } },
                    recovered: {}
                } }"#,
            )
            .unwrap(),
        );
        let machine = Machine::new("m1", chart, Arc::new(Registry::new()));
        let dlq = Arc::new(DeadLetterQueue::new(16));
        let cfg = TimeoutConfig {
            state_timeouts: HashMap::from([("slow".to_string(), Duration::from_millis(25))]),
            ..config()
        };
        let mut wrapped = TimeoutProtectedMachine::new(machine, cfg, dlq.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        wrapped.bind_sink(EventSink::from_channel(tx));
        let ctx = OrchestratedContext::new("m1", Vec::new());
        wrapped.start(&ctx).await.unwrap();

        let timeout_event = rx.recv().await.expect("state timeout event");
        assert_eq!(timeout_event.name, STATE_TIMEOUT_EVENT);
        assert_eq!(dlq.len(), 1);

        let step = wrapped.handle_event(&timeout_event, &ctx).await.unwrap();
        assert_eq!(step.new_configuration, vec!["recovered"]);
    }
}
