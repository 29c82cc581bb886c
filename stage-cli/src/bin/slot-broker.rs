use clap::{ArgAction, Parser};
use color_eyre::Result;

use stage_cli::commands::broker::{self, BrokerArgs};
use stage_cli::logging;

/// Standalone host slot broker; stops on SIGINT or SIGTERM
#[derive(Parser, Debug)]
#[command(name = "slot-broker", version, about)]
struct Cli {
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    #[command(flatten)]
    args: BrokerArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    logging::init(cli.verbose);

    broker::execute(cli.args).await
}
