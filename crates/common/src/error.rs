use thiserror::Error;

#[derive(Debug, Error)]
pub enum CidrwatchError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid IPv4 address: {0}")]
    Addr(String),

    #[error("invalid CIDR: {0}")]
    Cidr(String),

    #[error("invalid detection recipe: {0}")]
    Recipe(String),

    #[error("invalid regular expression '{pattern}': {message}")]
    Regex { pattern: String, message: String },

    #[error("malformed log line: {0}")]
    LogLine(String),

    #[error("invalid log format template: {0}")]
    LogFormat(String),

    #[error("jail state error: {0}")]
    Jail(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type CidrwatchResult<T> = Result<T, CidrwatchError>;
