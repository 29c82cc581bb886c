// Broker Client
// Acquire and release one host slot from a running broker

use crate::broker::error::{BrokerError, BrokerResult};
use crate::broker::protocol::{encode_id, BrokerEndpoint, ClientId, Grant, MAX_REPLY_SIZE};
use crate::config::BrokerConfig;

use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::net::UnixDatagram;

static NEXT_SEQUENCE: AtomicU32 = AtomicU32::new(0);

/// Marks in-process ids; Linux pids stay below 2^22 and never carry it
const IN_PROCESS_ID_BIT: u32 = 1 << 30;

/// A client id unique among the live requesters of this process.
///
/// Mixes the process id with a per-process counter so concurrent tasks in one
/// process never share a response channel. Ids wrap after 256 outstanding
/// requesters. They never collide with the plain process ids that
/// [`BrokerClient::acquire`] uses, so both kinds of client can share a queue.
pub fn unique_client_id() -> ClientId {
    let seq = NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed) & 0xff;
    (IN_PROCESS_ID_BIT | ((std::process::id() & 0x003f_ffff) << 8) | seq) as ClientId
}

/// Talks to the broker serving one queue
#[derive(Debug, Clone)]
pub struct BrokerClient {
    endpoint: BrokerEndpoint,
    timeout: Option<Duration>,
}

impl BrokerClient {
    pub fn new(endpoint: BrokerEndpoint) -> Self {
        Self {
            endpoint,
            timeout: None,
        }
    }

    pub fn from_config(config: &BrokerConfig) -> Self {
        Self::new(config.endpoint()).with_timeout(config.acquire_timeout())
    }

    /// Give up waiting for a grant after `timeout` (`None` waits forever)
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &BrokerEndpoint {
        &self.endpoint
    }

    /// Acquire a slot under this process's id
    pub async fn acquire(&self) -> BrokerResult<Grant> {
        self.acquire_as(std::process::id() as ClientId).await
    }

    /// Acquire a slot for `id`, waiting until the broker grants one.
    ///
    /// The response channel is bound before the request goes out, so the
    /// grant cannot be missed. On timeout the request is withdrawn and the
    /// channel removed.
    pub async fn acquire_as(&self, id: ClientId) -> BrokerResult<Grant> {
        let reply_path = self.endpoint.reply_path(id);
        remove_channel(&reply_path);
        let socket = UnixDatagram::bind(&reply_path)?;

        if let Err(e) = self.send(id).await {
            remove_channel(&reply_path);
            return Err(e);
        }
        tracing::debug!(client = id, queue = self.endpoint.queue(), "requested a slot");

        let mut buf = [0u8; MAX_REPLY_SIZE];
        let received = match self.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, socket.recv(&mut buf)).await {
                Ok(received) => received,
                Err(_) => {
                    // A second message withdraws the request, or releases a
                    // grant that raced the timeout
                    if let Err(e) = self.send(id).await {
                        tracing::warn!(client = id, error = %e, "cannot withdraw slot request");
                    }
                    remove_channel(&reply_path);
                    return Err(BrokerError::Timeout {
                        id,
                        waited: timeout,
                    });
                }
            },
            None => socket.recv(&mut buf).await,
        };

        let len = match received {
            Ok(len) => len,
            Err(e) => {
                remove_channel(&reply_path);
                return Err(BrokerError::Io(e));
            }
        };
        let grant = Grant::decode(&buf[..len])?;
        tracing::debug!(client = id, host = %grant.host, "slot granted");
        Ok(grant)
    }

    /// Release the slot held by `id`; does not wait for the broker
    pub async fn release(&self, id: ClientId) -> BrokerResult<()> {
        self.send(id).await?;
        tracing::debug!(client = id, "freed slot");
        Ok(())
    }

    async fn send(&self, id: ClientId) -> BrokerResult<()> {
        let path = self.endpoint.request_path();
        let unavailable = |source: io::Error| BrokerError::Unavailable {
            path: path.clone(),
            source,
        };
        let socket = UnixDatagram::unbound().map_err(unavailable)?;
        socket
            .send_to(&encode_id(id), &path)
            .await
            .map_err(unavailable)?;
        Ok(())
    }
}

fn remove_channel(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::debug!(socket = %path.display(), error = %e, "cannot remove response channel");
        }
    }
}
