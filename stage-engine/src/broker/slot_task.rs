// Slot Task
// Wraps a task so it runs over ssh on a host slot reserved from the broker

use crate::broker::client::{unique_client_id, BrokerClient};
use crate::broker::protocol::{ClientId, Grant};
use crate::error::{EngineError, EngineResult};
use crate::execution::task::{Resources, Task};
use crate::runners::quote;

use std::path::Path;

/// Runs the inner task's command on a host granted by the broker.
///
/// `setup` blocks on the broker until a slot is free, so a waiting task
/// occupies its pool worker. The slot is released in `teardown`, whatever
/// the command's status.
pub struct SlotTask<T> {
    inner: T,
    client: BrokerClient,
    id: ClientId,
    grant: Option<Grant>,
    command: String,
}

impl<T: Task> SlotTask<T> {
    pub fn new(inner: T, client: BrokerClient) -> Self {
        Self {
            inner,
            client,
            id: unique_client_id(),
            grant: None,
            command: String::new(),
        }
    }

    /// Slot currently held, if any
    pub fn grant(&self) -> Option<&Grant> {
        self.grant.as_ref()
    }

    pub fn client_id(&self) -> ClientId {
        self.id
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }
}

#[async_trait::async_trait]
impl<T: Task> Task for SlotTask<T> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn check(&self) -> EngineResult<()> {
        self.inner.check()?;
        which::which("ssh").map_err(|e| {
            EngineError::validation(format!("'{}' needs ssh on PATH: {}", self.name(), e))
        })?;
        Ok(())
    }

    async fn setup(&mut self) -> EngineResult<()> {
        self.inner.setup().await?;

        let grant = self.client.acquire_as(self.id).await?;
        self.command = format!("ssh -q {} {}", grant.host, quote(self.inner.command()));
        tracing::debug!(task = self.name(), host = %grant.host, "running on reserved slot");
        self.grant = Some(grant);
        Ok(())
    }

    fn command(&self) -> &str {
        &self.command
    }

    async fn teardown(&mut self) {
        if let Some(grant) = self.grant.take() {
            if let Err(e) = self.client.release(grant.id).await {
                tracing::warn!(host = %grant.host, client = grant.id, error = %e, "cannot release slot");
            }
        }
        self.inner.teardown().await;
    }

    fn resources(&self) -> Resources {
        self.inner.resources()
    }

    fn set_log_path(&mut self, path: &Path) {
        self.inner.set_log_path(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::protocol::BrokerEndpoint;
    use crate::broker::server::Broker;
    use crate::broker::table::SlotTable;
    use crate::execution::task::ShellTask;

    #[tokio::test]
    async fn test_setup_reserves_and_teardown_releases() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = BrokerEndpoint::new(dir.path(), "slot-task");
        let table = SlotTable::new(vec![("node9".to_string(), 1)]).unwrap();
        let broker = Broker::bind(endpoint.clone(), table).unwrap();
        let mut snapshots = broker.subscribe();
        let server = tokio::spawn(broker.run(std::future::pending()));

        let mut task = SlotTask::new(
            ShellTask::new("echo 'hi there'"),
            BrokerClient::new(endpoint),
        );
        task.setup().await.unwrap();

        assert_eq!(task.command(), "ssh -q node9 'echo '\\''hi there'\\'''");
        assert_eq!(task.grant().map(|g| g.host.as_str()), Some("node9"));
        let id = task.client_id();
        snapshots
            .wait_for(|s| s.host_of(id) == Some("node9"))
            .await
            .unwrap();

        task.teardown().await;

        assert!(task.grant().is_none());
        snapshots
            .wait_for(|s| s.usage("node9") == Some(0))
            .await
            .unwrap();
        server.abort();
    }

    #[tokio::test]
    async fn test_setup_fails_without_broker() {
        let dir = tempfile::tempdir().unwrap();
        let mut task = SlotTask::new(
            ShellTask::new("true"),
            BrokerClient::new(BrokerEndpoint::new(dir.path(), "absent")),
        );

        let err = task.setup().await.unwrap_err();

        assert!(matches!(err, EngineError::Internal(_)));
        assert!(task.grant().is_none());
        task.teardown().await;
    }
}
