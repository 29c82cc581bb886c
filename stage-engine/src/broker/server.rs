// Broker Server
// Single-writer receive loop that owns the slot table

use crate::broker::error::{BrokerError, BrokerResult};
use crate::broker::protocol::{decode_id, BrokerEndpoint, ClientId, Grant};
use crate::broker::table::{SlotSnapshot, SlotTable, Transition};

use std::fs;
use std::future::Future;
use std::io;
use std::path::Path;
use tokio::net::UnixDatagram;
use tokio::sync::watch;

/// Receive buffer; anything longer than a message is a protocol error anyway
const RECV_BUFFER: usize = 64;

/// The slot broker.
///
/// Owns the [`SlotTable`] and is its only writer: every request and release
/// arrives as a datagram on the shared channel and is applied in arrival
/// order. Grants go out on the requester's private channel. A grant that
/// cannot be delivered means the requester is gone, so its slot is released
/// on the spot and passed on to the next waiter.
pub struct Broker {
    endpoint: BrokerEndpoint,
    table: SlotTable,
    socket: UnixDatagram,
    snapshots: watch::Sender<SlotSnapshot>,
}

impl Broker {
    /// Bind the shared channel of `endpoint`.
    ///
    /// A leftover socket file from a dead broker is replaced; a live broker on
    /// the same queue is an error.
    pub fn bind(endpoint: BrokerEndpoint, table: SlotTable) -> BrokerResult<Self> {
        fs::create_dir_all(endpoint.dir())?;
        let path = endpoint.request_path();

        if path.exists() {
            if broker_is_live(&path) {
                return Err(BrokerError::Io(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("a broker is already serving {}", path.display()),
                )));
            }
            tracing::warn!(socket = %path.display(), "removing stale broker socket");
            fs::remove_file(&path)?;
        }

        let socket = UnixDatagram::bind(&path)?;
        let (snapshots, _) = watch::channel(table.snapshot());

        for host in table.hosts() {
            tracing::info!(host = %host.name, slots = host.capacity, "added host");
        }
        tracing::info!(queue = endpoint.queue(), socket = %path.display(), "broker listening");

        Ok(Self {
            endpoint,
            table,
            socket,
            snapshots,
        })
    }

    pub fn endpoint(&self) -> &BrokerEndpoint {
        &self.endpoint
    }

    /// Observe the slot table; a new snapshot is published after every message
    pub fn subscribe(&self) -> watch::Receiver<SlotSnapshot> {
        self.snapshots.subscribe()
    }

    /// Serve until `shutdown` resolves or a malformed message arrives.
    ///
    /// Either way the shared channel and every known client channel are
    /// removed before returning. A protocol error is returned as such; the
    /// table is not recovered.
    pub async fn run<F>(mut self, shutdown: F) -> BrokerResult<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut buf = [0u8; RECV_BUFFER];

        let result = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!(queue = self.endpoint.queue(), "broker shutting down");
                    break Ok(());
                }
                received = self.socket.recv(&mut buf) => {
                    let len = match received {
                        Ok(len) => len,
                        Err(e) => break Err(BrokerError::Io(e)),
                    };
                    if let Err(e) = self.dispatch(&buf[..len]).await {
                        tracing::error!(error = %e, "unrecognized message, stopping broker");
                        break Err(e);
                    }
                    debug_assert_eq!(self.table.verify(), Ok(()));
                    self.snapshots.send_replace(self.table.snapshot());
                }
            }
        };

        self.cleanup();
        result
    }

    async fn dispatch(&mut self, datagram: &[u8]) -> BrokerResult<()> {
        let client = decode_id(datagram)?;

        match self.table.handle(client)? {
            Transition::Granted { client, host } => {
                tracing::info!(client, host = %host, "allocated a slot");
                self.deliver(client, host).await
            }
            Transition::Queued { client } => {
                tracing::info!(client, "no slots available, request queued");
                Ok(())
            }
            Transition::HandedOff { from, to, host } => {
                tracing::info!(client = from, "client finished");
                tracing::debug!(host = %host, to, "re-allocating freed slot");
                self.remove_reply_channel(from);
                self.deliver(to, host).await
            }
            Transition::Freed { client, host } => {
                tracing::info!(client, host = %host, "client finished, slot freed");
                self.remove_reply_channel(client);
                Ok(())
            }
            Transition::Withdrawn { client } => {
                tracing::info!(client, "pending request withdrawn");
                self.remove_reply_channel(client);
                Ok(())
            }
        }
    }

    /// Send a grant, releasing on behalf of requesters that are gone
    async fn deliver(&mut self, mut client: ClientId, mut host: String) -> BrokerResult<()> {
        loop {
            let grant = Grant::new(host, client);
            let reply = self.endpoint.reply_path(client);

            let Err(e) = self.socket.send_to(&grant.encode(), &reply).await else {
                tracing::debug!(client, host = %grant.host, "grant delivered");
                return Ok(());
            };

            tracing::warn!(
                client,
                host = %grant.host,
                error = %e,
                "requester is gone, releasing its slot"
            );
            self.remove_reply_channel(client);
            match self.table.release(client)? {
                Transition::HandedOff { to, host: next_host, .. } => {
                    client = to;
                    host = next_host;
                }
                _ => return Ok(()),
            }
        }
    }

    fn remove_reply_channel(&self, client: ClientId) {
        let path = self.endpoint.reply_path(client);
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::debug!(socket = %path.display(), error = %e, "cannot remove client channel");
            }
        }
    }

    fn cleanup(&self) {
        let path = self.endpoint.request_path();
        if let Err(e) = fs::remove_file(&path) {
            tracing::warn!(socket = %path.display(), error = %e, "cannot remove broker socket");
        }
        tracing::debug!(queue = self.endpoint.queue(), "removed broker queue");

        for client in self.table.clients() {
            self.remove_reply_channel(client);
            tracing::debug!(client, "removed client queue");
        }
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("endpoint", &self.endpoint)
            .field("table", &self.table)
            .finish()
    }
}

fn broker_is_live(path: &Path) -> bool {
    std::os::unix::net::UnixDatagram::unbound()
        .and_then(|socket| socket.connect(path))
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::protocol::{encode_id, MAX_REPLY_SIZE};

    use std::time::Duration;
    use tokio::sync::oneshot;

    fn hosts(list: &[(&str, usize)]) -> SlotTable {
        SlotTable::new(list.iter().map(|(h, c)| (h.to_string(), *c)).collect()).unwrap()
    }

    async fn send(endpoint: &BrokerEndpoint, id: ClientId) {
        let socket = UnixDatagram::unbound().unwrap();
        socket
            .send_to(&encode_id(id), endpoint.request_path())
            .await
            .unwrap();
    }

    fn reply_socket(endpoint: &BrokerEndpoint, id: ClientId) -> UnixDatagram {
        UnixDatagram::bind(endpoint.reply_path(id)).unwrap()
    }

    async fn recv_grant(socket: &UnixDatagram) -> Grant {
        let mut buf = [0u8; MAX_REPLY_SIZE];
        let len = tokio::time::timeout(Duration::from_secs(5), socket.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        Grant::decode(&buf[..len]).unwrap()
    }

    async fn wait_for<F>(rx: &mut watch::Receiver<SlotSnapshot>, pred: F) -> SlotSnapshot
    where
        F: Fn(&SlotSnapshot) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if pred(&rx.borrow_and_update()) {
                    return rx.borrow().clone();
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_grant_release_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = BrokerEndpoint::new(dir.path(), "unit");
        let broker = Broker::bind(endpoint.clone(), hosts(&[("node1", 1)])).unwrap();
        let mut snapshots = broker.subscribe();
        let (stop, stopped) = oneshot::channel::<()>();
        let server = tokio::spawn(broker.run(async {
            let _ = stopped.await;
        }));

        let reply = reply_socket(&endpoint, 7);
        send(&endpoint, 7).await;
        assert_eq!(recv_grant(&reply).await, Grant::new("node1", 7));

        send(&endpoint, 7).await;
        let snapshot = wait_for(&mut snapshots, |s| s.usage("node1") == Some(0)).await;
        assert!(snapshot.assignments.is_empty());
        assert!(!endpoint.reply_path(7).exists());

        stop.send(()).unwrap();
        server.await.unwrap().unwrap();
        assert!(!endpoint.request_path().exists());
    }

    #[tokio::test]
    async fn test_malformed_message_stops_broker() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = BrokerEndpoint::new(dir.path(), "bad");
        let broker = Broker::bind(endpoint.clone(), hosts(&[("node1", 1)])).unwrap();
        let server = tokio::spawn(broker.run(std::future::pending()));

        let socket = UnixDatagram::unbound().unwrap();
        socket
            .send_to(b"garbage!", endpoint.request_path())
            .await
            .unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(BrokerError::Protocol(_))));
        assert!(!endpoint.request_path().exists());
    }

    #[tokio::test]
    async fn test_dead_waiter_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = BrokerEndpoint::new(dir.path(), "liveness");
        let broker = Broker::bind(endpoint.clone(), hosts(&[("node1", 1)])).unwrap();
        let mut snapshots = broker.subscribe();
        let server = tokio::spawn(broker.run(std::future::pending()));

        let holder = reply_socket(&endpoint, 1);
        send(&endpoint, 1).await;
        recv_grant(&holder).await;

        // Client 2 queues and then vanishes without withdrawing
        let dead = reply_socket(&endpoint, 2);
        send(&endpoint, 2).await;
        wait_for(&mut snapshots, |s| s.pending == vec![2]).await;
        drop(dead);

        let alive = reply_socket(&endpoint, 3);
        send(&endpoint, 3).await;
        wait_for(&mut snapshots, |s| s.pending == vec![2, 3]).await;

        send(&endpoint, 1).await;
        assert_eq!(recv_grant(&alive).await, Grant::new("node1", 3));

        let snapshot = wait_for(&mut snapshots, |s| s.host_of(3).is_some()).await;
        assert_eq!(snapshot.usage("node1"), Some(1));
        assert!(snapshot.host_of(2).is_none());
        assert!(snapshot.pending.is_empty());

        server.abort();
    }

    #[tokio::test]
    async fn test_second_live_broker_refused() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = BrokerEndpoint::new(dir.path(), "dup");
        let _first = Broker::bind(endpoint.clone(), hosts(&[("a", 1)])).unwrap();

        let err = Broker::bind(endpoint, hosts(&[("a", 1)])).unwrap_err();
        assert!(matches!(err, BrokerError::Io(ref e) if e.kind() == io::ErrorKind::AddrInUse));
    }

    #[tokio::test]
    async fn test_stale_socket_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = BrokerEndpoint::new(dir.path(), "stale");
        {
            let _old = std::os::unix::net::UnixDatagram::bind(endpoint.request_path()).unwrap();
        }
        assert!(endpoint.request_path().exists());

        Broker::bind(endpoint, hosts(&[("a", 1)])).unwrap();
    }
}
