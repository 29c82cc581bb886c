// Broker Protocol
// Socket naming and the datagram formats exchanged with the broker

use crate::broker::error::{BrokerError, BrokerResult};

use std::fmt;
use std::path::{Path, PathBuf};

/// Identifies a requester; a process id unless the caller picks one
pub type ClientId = i32;

/// Size of a request or release datagram
pub const MESSAGE_SIZE: usize = 4;

/// Upper bound on a grant datagram
pub const MAX_REPLY_SIZE: usize = 1024;

/// Where a broker queue and its clients' response channels live.
///
/// The shared request channel is `<dir>/stage-slots-<uid>-<queue>.sock`;
/// each client receives its grant on `<dir>/stage-slots-<uid>-<queue>.<id>.sock`.
/// The uid keeps users sharing a directory apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    dir: PathBuf,
    queue: String,
    uid: u32,
}

impl BrokerEndpoint {
    pub fn new(dir: &Path, queue: &str) -> Self {
        Self {
            dir: dir.to_path_buf(),
            queue: queue.to_string(),
            uid: nix::unistd::getuid().as_raw(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    fn stem(&self) -> String {
        format!("stage-slots-{}-{}", self.uid, self.queue)
    }

    /// Shared channel the broker receives requests and releases on
    pub fn request_path(&self) -> PathBuf {
        self.dir.join(format!("{}.sock", self.stem()))
    }

    /// Private channel a client receives its grant on
    pub fn reply_path(&self, id: ClientId) -> PathBuf {
        self.dir.join(format!("{}.{}.sock", self.stem(), id))
    }
}

pub fn encode_id(id: ClientId) -> [u8; MESSAGE_SIZE] {
    id.to_le_bytes()
}

/// Parse a request or release datagram
pub fn decode_id(datagram: &[u8]) -> BrokerResult<ClientId> {
    let bytes: [u8; MESSAGE_SIZE] = datagram.try_into().map_err(|_| {
        BrokerError::Protocol(format!(
            "expected a {}-byte message, got {} bytes",
            MESSAGE_SIZE,
            datagram.len()
        ))
    })?;
    let id = ClientId::from_le_bytes(bytes);
    if id < 0 {
        return Err(BrokerError::Protocol(format!("negative client id {}", id)));
    }
    Ok(id)
}

/// A slot on `host` held by client `id`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub host: String,
    pub id: ClientId,
}

impl Grant {
    pub fn new(host: impl Into<String>, id: ClientId) -> Self {
        Self {
            host: host.into(),
            id,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }

    /// Parse a grant datagram: `"<host> <id>"`
    pub fn decode(datagram: &[u8]) -> BrokerResult<Self> {
        let text = std::str::from_utf8(datagram)
            .map_err(|e| BrokerError::Protocol(format!("grant is not UTF-8: {}", e)))?;
        let (host, id) = text
            .trim_end()
            .rsplit_once(' ')
            .ok_or_else(|| BrokerError::Protocol(format!("malformed grant '{}'", text)))?;
        let id = id
            .parse()
            .map_err(|_| BrokerError::Protocol(format!("malformed grant id in '{}'", text)))?;
        if host.is_empty() {
            return Err(BrokerError::Protocol(format!("grant without host '{}'", text)));
        }
        Ok(Self::new(host, id))
    }
}

impl fmt::Display for Grant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.host, self.id)
    }
}
