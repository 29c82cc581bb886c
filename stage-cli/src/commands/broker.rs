use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::eyre::WrapErr;
use color_eyre::Result;

use stage_engine::{Broker, BrokerConfig, EngineConfig, SlotTable};

/// Broker queue selection shared by the broker and its clients
#[derive(Args, Debug, Clone, Default)]
pub struct QueueArgs {
    /// Queue name; brokers on different queues are independent
    #[arg(long, short = 'q', value_name = "NAME")]
    pub queue: Option<String>,

    /// Directory holding the broker sockets
    #[arg(long, value_name = "DIR")]
    pub socket_dir: Option<PathBuf>,

    /// Engine configuration file (its broker section is used)
    #[arg(long, short = 'c', value_name = "FILE")]
    pub config: Option<PathBuf>,
}

impl QueueArgs {
    /// Broker settings from the config file, overridden by flags
    pub fn broker_config(&self) -> Result<BrokerConfig> {
        let mut broker = match &self.config {
            Some(path) => EngineConfig::from_file(path)?.broker,
            None => BrokerConfig::default(),
        };
        if let Some(queue) = &self.queue {
            broker.queue = queue.clone();
        }
        if let Some(dir) = &self.socket_dir {
            broker.socket_dir = dir.clone();
        }
        Ok(broker)
    }
}

/// Serve host slots from a host file until interrupted
#[derive(Args, Debug)]
pub struct BrokerArgs {
    /// Host file: one '<host> <slots>' per line
    #[arg(long = "hosts", short = 'H', value_name = "FILE")]
    pub host_file: PathBuf,

    #[command(flatten)]
    pub queue: QueueArgs,
}

pub async fn execute(args: BrokerArgs) -> Result<()> {
    let config = args.queue.broker_config()?;

    let table = SlotTable::from_host_file(&args.host_file)
        .wrap_err_with(|| format!("Cannot load host file {}", args.host_file.display()))?;
    let endpoint = config.endpoint();

    output::status("Serving", &format!("queue '{}'", endpoint.queue()));
    output::info(&format!("Socket: {}", endpoint.request_path().display()));

    let broker = Broker::bind(endpoint, table)?;
    broker.run(shutdown_signal()).await?;

    output::success("Broker stopped");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM
pub async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "cannot listen for SIGTERM, only SIGINT stops");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
    tracing::info!("Caught interrupt");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.yaml");
        std::fs::write(&path, "broker:\n  queue: fromfile\n  acquire_timeout_secs: 9\n").unwrap();

        let args = QueueArgs {
            queue: None,
            socket_dir: Some(dir.path().to_path_buf()),
            config: Some(path.clone()),
        };
        let config = args.broker_config().unwrap();
        assert_eq!(config.queue, "fromfile");
        assert_eq!(config.socket_dir, dir.path());
        assert_eq!(config.acquire_timeout_secs, Some(9));

        let args = QueueArgs {
            queue: Some("fromflag".to_string()),
            ..args
        };
        assert_eq!(args.broker_config().unwrap().queue, "fromflag");
    }

    #[test]
    fn test_defaults_without_config() {
        let config = QueueArgs::default().broker_config().unwrap();
        assert_eq!(config.queue, "default");
    }
}
