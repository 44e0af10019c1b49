use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::ids::TaskId;

/// Errors raised synchronously by scheduler operations.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("scheduler not configured: {0}")]
    NotConfigured(String),

    #[error("invalid {field} interval: must be strictly positive")]
    InvalidInterval { field: &'static str },

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("scheduler has been shut down")]
    ShutDown,

    #[error("{component} did not stop within {timeout:?}")]
    ShutdownTimeout {
        component: &'static str,
        timeout: Duration,
    },

    #[error("worker pool error: {0}")]
    Pool(String),

    #[error("async loop unavailable: {0}")]
    LoopUnavailable(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config I/O error: {0}")]
    ConfigIo(#[from] std::io::Error),
}

/// Failure of a single execution, carried inside its completion event.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ExecutionError {
    #[error("task failed: {0}")]
    Failed(String),

    #[error("task panicked: {0}")]
    Panicked(String),

    #[error("task rejected: {0}")]
    Rejected(String),
}

impl ExecutionError {
    /// Render a caught panic payload.
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        ExecutionError::Panicked(message)
    }
}
