use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgrecError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("timetable parse error: {0}")]
    Parse(String),

    #[error("invalid program: {0}")]
    InvalidProgram(String),

    #[error("unknown timezone '{0}'")]
    UnknownTimezone(String),

    #[error("invalid group timestamp '{0}': expected YYYY-MM-DD_HHMMSS")]
    InvalidGroupTimestamp(String),

    #[error("object not found: {0}")]
    ObjectNotFound(String),

    #[error("object store error on '{key}': {message}")]
    Store { key: String, message: String },

    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timetable fetch failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl AgrecError {
    pub fn store(key: impl Into<String>, message: impl Into<String>) -> Self {
        AgrecError::Store {
            key: key.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AgrecError>;
