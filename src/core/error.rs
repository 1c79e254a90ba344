use thiserror::Error;

#[derive(Error, Debug)]
pub enum TallyError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid metric identity: {0}")]
    InvalidIdentity(String),

    #[error("Invalid trace: {0}")]
    InvalidTrace(String),

    #[error("Aggregation mismatch for {fqn}: {kind} cannot accept {value}")]
    AggregationMismatch {
        fqn: String,
        kind: &'static str,
        value: &'static str,
    },

    #[error("A flush cycle is already in progress")]
    FlushInProgress,

    #[error("Flush #{serial} timed out after {timeout_ms}ms with {pending} shard(s) still flushing")]
    FlushTimeout {
        serial: u64,
        pending: usize,
        timeout_ms: u64,
    },

    #[error("Accumulator is not started")]
    NotStarted,

    #[error("Failed to spawn shard worker: {0}")]
    WorkerSpawn(std::io::Error),

    #[error("Flush listener failed: {0}")]
    Listener(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Result type alias for accumulator operations
pub type Result<T> = std::result::Result<T, TallyError>;

impl TallyError {
    /// Creates a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Creates a new identity error
    pub fn identity<S: Into<String>>(msg: S) -> Self {
        Self::InvalidIdentity(msg.into())
    }

    /// Creates a new listener error
    pub fn listener<S: Into<String>>(msg: S) -> Self {
        Self::Listener(msg.into())
    }

    /// Returns true if the caller may retry the operation later
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::FlushInProgress | Self::NotStarted | Self::Listener(_))
    }

    /// Returns the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Config(_) | Self::InvalidIdentity(_) | Self::Yaml(_) => "config",
            Self::InvalidTrace(_) | Self::AggregationMismatch { .. } => "aggregation",
            Self::FlushInProgress | Self::NotStarted => "state",
            Self::FlushTimeout { .. } => "liveness",
            Self::WorkerSpawn(_) | Self::Io(_) => "io",
            Self::Listener(_) => "listener",
        }
    }
}
