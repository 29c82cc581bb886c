use crate::commands::broker::QueueArgs;

use std::time::Duration;

use clap::Args;
use color_eyre::Result;

use stage_engine::{BrokerClient, ClientId};

/// Reserve one host slot and print "<host> <id>"
#[derive(Args, Debug)]
pub struct AcquireArgs {
    /// Give up after this many seconds
    #[arg(long, short = 't', value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Request under this id instead of the process id
    #[arg(long, value_name = "ID")]
    pub id: Option<ClientId>,

    #[command(flatten)]
    pub queue: QueueArgs,
}

/// Release the slot held under an id
#[derive(Args, Debug)]
pub struct ReleaseArgs {
    /// Id printed by `acquire`
    pub id: ClientId,

    #[command(flatten)]
    pub queue: QueueArgs,
}

pub async fn acquire(args: AcquireArgs) -> Result<()> {
    let config = args.queue.broker_config()?;
    let timeout = args
        .timeout
        .map(Duration::from_secs)
        .or_else(|| config.acquire_timeout());
    let client = BrokerClient::from_config(&config).with_timeout(timeout);

    let grant = match args.id {
        Some(id) => client.acquire_as(id).await?,
        None => client.acquire().await?,
    };
    println!("{}", grant);
    Ok(())
}

pub async fn release(args: ReleaseArgs) -> Result<()> {
    let config = args.queue.broker_config()?;
    BrokerClient::from_config(&config).release(args.id).await?;
    Ok(())
}
