use thiserror::Error;

/// Errors produced by the gateway.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("no free port in range after {0} attempts")]
    PortExhausted(u32),

    #[error("bind error: {0}")]
    Bind(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("invalid one-time code")]
    InvalidCode,

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("listener error: {0}")]
    Listener(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("session is stopped")]
    Stopped,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Outcome shared between concurrent `start` callers.
    #[error("{0}")]
    Shared(std::sync::Arc<GateError>),

    #[error("{0}")]
    Other(String),
}

pub type GateResult<T> = Result<T, GateError>;
