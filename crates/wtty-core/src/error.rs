use thiserror::Error;

/// Errors produced by the wtty gateway.
#[derive(Debug, Error)]
pub enum WttyError {
    #[error("config error: {0}")]
    Config(String),

    #[error("template error: {0}")]
    Template(String),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("failed to listen at `{addr}`: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("serve loop failed: {0}")]
    Serve(#[source] std::io::Error),

    #[error("session error: {0}")]
    Session(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type WttyResult<T> = Result<T, WttyError>;
