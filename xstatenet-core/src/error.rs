use thiserror::Error;

/// Error raised while reading or binding a statechart definition.
///
/// `offset`/`line`/`column` point into the source text for lexical errors;
/// bind-time errors (unresolvable target, unknown handler name) carry the
/// offending state path in `reason` and a zero position.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("chart error at {line}:{column}: {reason}")]
pub struct ChartError {
    pub offset: usize,
    pub line: u32,
    pub column: u32,
    pub reason: String,
}

impl ChartError {
    pub fn at(offset: usize, line: u32, column: u32, reason: impl Into<String>) -> Self {
        Self {
            offset,
            line,
            column,
            reason: reason.into(),
        }
    }

    /// Bind-time error with no meaningful source position.
    pub fn bind(reason: impl Into<String>) -> Self {
        Self::at(0, 0, 0, reason)
    }
}

/// The error taxonomy for the whole runtime. Transient per-event failures
/// (guards, actions) are recorded on the step result instead and never
/// surface through this type; everything here is a terminal outcome for the
/// operation that produced it.
#[derive(Clone, Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Chart(#[from] ChartError),

    #[error("machine not found: {machine_id}")]
    MachineNotFound { machine_id: String },

    #[error("machine {machine_id} is not running")]
    MachineNotRunning { machine_id: String },

    #[error("guard '{guard}' failed: {message}")]
    GuardFailure { guard: String, message: String },

    #[error("action '{action}' failed: {message}")]
    ActionFailure { action: String, message: String },

    #[error("machine {machine_id} exceeded {cap} eventless transition iterations")]
    InfiniteTransitionLoop { machine_id: String, cap: u32 },

    #[error("machine {machine_id} exceeded the state timeout in '{state}'")]
    StateTimeout { machine_id: String, state: String },

    #[error("machine {machine_id} exceeded the transition timeout handling '{event}'")]
    TransitionTimeout { machine_id: String, event: String },

    #[error("action '{action}' exceeded its time budget")]
    ActionTimeout { action: String },

    #[error("circuit breaker is open")]
    CircuitOpen,

    #[error("channel at capacity ({capacity})")]
    ChannelFull { capacity: usize },

    #[error("channel closed")]
    ChannelClosed,

    #[error("invalid channel configuration: {reason}")]
    InvalidChannelConfig { reason: String },

    #[error("invocation '{id}' cancelled")]
    InvocationCancelled { id: String },

    #[error("channel group {group_id} ('{name}') already released")]
    GroupReleased { group_id: u64, name: String },

    #[error("orchestrator is shutting down")]
    ShuttingDown,

    #[error("{0}")]
    Internal(String),
}

impl Error {
    /// Stable tag for the observability stream and wire responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Chart(_) => "ParseError",
            Error::MachineNotFound { .. } => "MachineNotFound",
            Error::MachineNotRunning { .. } => "MachineNotRunning",
            Error::GuardFailure { .. } => "GuardFailure",
            Error::ActionFailure { .. } => "ActionFailure",
            Error::InfiniteTransitionLoop { .. } => "InfiniteTransitionLoop",
            Error::StateTimeout { .. } => "StateTimeout",
            Error::TransitionTimeout { .. } => "TransitionTimeout",
            Error::ActionTimeout { .. } => "ActionTimeout",
            Error::CircuitOpen => "CircuitOpen",
            Error::ChannelFull { .. } => "ChannelFull",
            Error::ChannelClosed => "ChannelClosed",
            Error::InvalidChannelConfig { .. } => "InvalidChannelConfig",
            Error::InvocationCancelled { .. } => "InvocationCancelled",
            Error::GroupReleased { .. } => "GroupReleased",
            Error::ShuttingDown => "ShuttingDown",
            Error::Internal(_) => "Internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
