mod descramble_file;
mod run;

use anyhow::Result;
use clap::{Parser, Subcommand};

use descrambler_core::config::LoggingConfig;
use descrambler_core::logging;

/// Conditional-access descrambler: card-server clients and transport stream
/// descrambling.
#[derive(Parser, Debug)]
#[command(name = "descrambler", version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect the configured clients and run until interrupted
    Run(run::Run),
    /// Descramble a transport stream file with a fixed key pair
    DescrambleFile(descramble_file::DescrambleFile),
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    match args.command {
        Commands::Run(cmd) => cmd.execute().await,
        Commands::DescrambleFile(cmd) => {
            logging::init_logging(&LoggingConfig::default())?;
            cmd.execute().await
        }
    }
}
