// Engine Errors
// Error types shared by the scheduler, background runner and configuration

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the task execution engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// A task's pre-flight check rejected it; the stage was not dispatched
    #[error("Validation failed: {0}")]
    Validation(String),

    /// One or more tasks of a stage exited with a nonzero status
    #[error("{job} failed, please check log: {} for details", log.display())]
    StageFailed {
        job: String,
        log: PathBuf,
        /// Error lines extracted from the failed tasks' logs, if any
        summary: Option<String>,
    },

    /// Engine misuse or a resource the engine itself manages could not be set up
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl EngineError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Path of the consolidated job log, for stage failures
    pub fn job_log(&self) -> Option<&PathBuf> {
        match self {
            Self::StageFailed { log, .. } => Some(log),
            _ => None,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_failed_message_points_at_log() {
        let err = EngineError::StageFailed {
            job: "markdup".to_string(),
            log: PathBuf::from("log/markdup.log"),
            summary: None,
        };

        assert_eq!(
            err.to_string(),
            "markdup failed, please check log: log/markdup.log for details"
        );
        assert_eq!(err.job_log(), Some(&PathBuf::from("log/markdup.log")));
    }

    #[test]
    fn test_job_log_only_for_stage_failures() {
        assert!(EngineError::internal("boom").job_log().is_none());
    }
}
