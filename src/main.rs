mod cli;
mod commands;

use std::process::ExitCode;

use clap::Parser;
use cli::{Cli, CrdAction, Commands};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Version => commands::version::run().map(|_| 0),
        Commands::Crd { action } => match action {
            CrdAction::Generate => commands::crd::generate().map(|_| 0),
            CrdAction::Install => commands::crd::install().await.map(|_| 0),
        },
        Commands::Serve { config } => Ok(commands::serve::run(config).await),
    };

    match result {
        Ok(code) => ExitCode::from(code as u8),
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(1)
        }
    }
}
