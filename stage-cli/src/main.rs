use clap::{ArgAction, Parser, Subcommand};
use color_eyre::Result;

use stage_cli::commands::{broker, run, slot};
use stage_cli::logging;

/// Staged shell job runner with a host slot broker
#[derive(Parser, Debug)]
#[command(name = "stagerun", version, about)]
struct Cli {
    /// More log output (-v debug, -vv trace); RUST_LOG takes precedence
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Run(run::RunArgs),
    Broker(broker::BrokerArgs),
    Acquire(slot::AcquireArgs),
    Release(slot::ReleaseArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    logging::init(cli.verbose);

    match cli.command {
        Command::Run(args) => run::execute(args).await,
        Command::Broker(args) => broker::execute(args).await,
        Command::Acquire(args) => slot::acquire(args).await,
        Command::Release(args) => slot::release(args).await,
    }
}
