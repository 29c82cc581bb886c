// Broker Errors
// Failures of the slot broker, its wire protocol and its clients

use crate::error::EngineError;

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    /// A message of the wrong shape; fatal to the broker
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Broker is not reachable at {}: {source}", path.display())]
    Unavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("No slot granted to client {id} within {waited:?}")]
    Timeout { id: i32, waited: Duration },

    #[error("Host file line {line}: {message}")]
    HostFile { line: usize, message: String },

    #[error("Unknown client {0}")]
    UnknownClient(i32),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type BrokerResult<T> = Result<T, BrokerError>;

impl From<BrokerError> for EngineError {
    fn from(err: BrokerError) -> Self {
        EngineError::Internal(format!("slot broker: {}", err))
    }
}
