//! `mailkey` - keeps an Outlook OAuth2 token fresh and reads mail with it.
//!
//! Reads a single credential record, refreshes the access token when it is
//! stale, writes the result back and uses it for Graph, IMAP and POP3.

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

mod cli;
mod commands;

use std::process::ExitCode;

use clap::Parser;
use mailkey_oauth::RecordFormat;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr so command output stays pipeable.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mailkey=info,mailkey_oauth=info,mailkey_fetch=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let format = RecordFormat::from(cli.format);
    let path = cli.token_file.as_path();
    info!(path = %path.display(), ?format, "Starting mailkey");

    match cli.command {
        Commands::Check => commands::check(path, format, cli.json),
        Commands::Whoami => {
            let broker = commands::broker(path, format)?;
            commands::whoami(&broker, cli.json).await
        }
        Commands::Refresh => {
            let broker = commands::broker(path, format)?;
            commands::refresh(&broker, cli.json).await
        }
        Commands::Fetch { source, count } => {
            let broker = commands::broker(path, format)?;
            let source = commands::source(source)?;
            commands::fetch(&broker, &source, count, cli.json).await
        }
        Commands::All { count } => {
            let broker = commands::broker(path, format)?;
            commands::all(&broker, count, cli.json).await
        }
    }
}
