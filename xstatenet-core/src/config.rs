use std::collections::HashMap;
use std::time::Duration;

/// How a producer behaves when an event channel is at capacity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BackpressureMode {
    /// Suspend the producer until capacity frees.
    #[default]
    Wait,
    /// Fail the enqueue immediately with `ChannelFull`.
    FailFast,
}

/// Tuning knobs for the event bus orchestrator.
#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Initial event-channel count.
    pub pool_size: usize,
    /// Upper bound the pool may grow to.
    pub max_pool_size: usize,
    /// Per-channel queue depth.
    pub channel_capacity: usize,
    /// Multiplicative pool expansion factor.
    pub growth_factor: f64,
    /// Utilization ratio above which the pool grows.
    pub grow_threshold: f64,
    /// Utilization ratio below which the pool shrinks.
    pub shrink_threshold: f64,
    /// Collect per-machine counts and durations.
    pub enable_metrics: bool,
    /// Producer behavior on a full channel.
    pub backpressure: BackpressureMode,
    /// Sampling interval for the pool monitor.
    pub monitor_interval: Duration,
    /// Entries retained by the dead-letter queue.
    pub dlq_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            pool_size: 16,
            max_pool_size: 512,
            channel_capacity: 10_000,
            growth_factor: 2.0,
            grow_threshold: 0.75,
            shrink_threshold: 0.25,
            enable_metrics: false,
            backpressure: BackpressureMode::Wait,
            monitor_interval: Duration::from_millis(500),
            dlq_capacity: 10_000,
        }
    }
}

/// Circuit breaker thresholds and windows.
#[derive(Clone, Debug)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures required to open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a probe is considered.
    pub open_duration: Duration,
    /// Settle window after `open_duration` before the probe is admitted.
    pub half_open_test_delay: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(30),
            half_open_test_delay: Duration::from_millis(100),
        }
    }
}

/// Timeout protection for a wrapped machine.
#[derive(Clone, Debug)]
pub struct TimeoutConfig {
    /// Applied to states listed in `state_timeouts` without an explicit value,
    /// and to every state when `apply_default_state_timeout` is set.
    pub default_state_timeout: Duration,
    /// Arm the default state timer for every state, not just configured ones.
    pub apply_default_state_timeout: bool,
    /// Per-state wall-clock budgets, keyed by state path.
    pub state_timeouts: HashMap<String, Duration>,
    /// Budget for one full event handling (guards + actions + entry).
    pub transition_timeout: Option<Duration>,
    /// Per-named-action budgets.
    pub action_timeouts: HashMap<String, Duration>,
    /// Derive effective timeouts from observed durations.
    pub enable_adaptive: bool,
    /// Safety margin over the observed p95.
    pub adaptive_multiplier: f64,
    /// Clamp for adaptive recommendations.
    pub min_timeout: Duration,
    pub max_timeout: Duration,
    /// Samples retained per operation window.
    pub window_size: usize,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default_state_timeout: Duration::from_secs(30),
            apply_default_state_timeout: false,
            state_timeouts: HashMap::new(),
            transition_timeout: None,
            action_timeouts: HashMap::new(),
            enable_adaptive: true,
            adaptive_multiplier: 1.5,
            min_timeout: Duration::from_millis(10),
            max_timeout: Duration::from_secs(120),
            window_size: 100,
        }
    }
}

/// Per-machine execution options.
#[derive(Clone, Debug)]
pub struct MachineConfig {
    /// Re-raise action errors instead of recording and continuing.
    pub strict_actions: bool,
    /// Grace period granted to an invocation after cooperative cancellation.
    pub invoke_grace: Duration,
    /// Iteration cap for eventless transition chains.
    pub always_cap: u32,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            strict_actions: false,
            invoke_grace: Duration::from_secs(5),
            always_cap: 1024,
        }
    }
}
