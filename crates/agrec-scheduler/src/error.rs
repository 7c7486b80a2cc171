use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("failed to start thread '{name}': {source}")]
    ThreadSpawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("worker '{worker}' failed: {message}")]
    WorkerFailed { worker: String, message: String },

    #[error("worker '{0}' panicked")]
    WorkerPanicked(String),

    #[error("worker '{0}' stopped unexpectedly")]
    WorkerStopped(String),

    #[error("signal handling failed: {0}")]
    Signal(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
