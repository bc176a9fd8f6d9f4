//! Command-line surface.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use mailkey_oauth::RecordFormat;

/// Default credential file, relative to the working directory.
pub const DEFAULT_TOKEN_FILE: &str = "outlook_token.txt";

#[derive(Debug, Parser)]
#[command(
    name = "mailkey",
    version,
    about = "Keep an Outlook OAuth2 token fresh and read mail with it"
)]
pub struct Cli {
    /// Credential record file
    #[arg(long, global = true, env = "MAILKEY_TOKEN_FILE", default_value = DEFAULT_TOKEN_FILE)]
    pub token_file: PathBuf,

    /// Encoding used when the record is written back
    #[arg(long, global = true, value_enum, default_value_t = FormatArg::Native)]
    pub format: FormatArg,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Load and validate the credential record without touching the network
    Check,

    /// Verify the token against the identity endpoint
    Whoami,

    /// Refresh the access token now and store it
    Refresh,

    /// Read the newest messages over one protocol
    Fetch {
        /// Protocol to use
        #[arg(value_enum)]
        source: SourceArg,

        /// Number of messages
        #[arg(long, short = 'n', default_value_t = 5)]
        count: usize,
    },

    /// Verify the token, then read from every protocol in turn
    All {
        /// Number of messages per protocol
        #[arg(long, short = 'n', default_value_t = 3)]
        count: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FormatArg {
    /// Versioned JSON line
    Native,
    /// `---`-delimited positional line
    Legacy,
}

impl From<FormatArg> for RecordFormat {
    fn from(format: FormatArg) -> Self {
        match format {
            FormatArg::Native => Self::Native,
            FormatArg::Legacy => Self::Legacy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SourceArg {
    /// Microsoft Graph REST API
    Graph,
    /// IMAP with XOAUTH2
    Imap,
    /// POP3 with XOAUTH2
    Pop3,
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["mailkey", "check"]).unwrap();
        assert_eq!(cli.format, FormatArg::Native);
        assert!(!cli.json);
        assert!(matches!(cli.command, Commands::Check));
    }

    #[test]
    fn test_fetch_arguments() {
        let cli = Cli::try_parse_from([
            "mailkey",
            "fetch",
            "imap",
            "--count",
            "2",
            "--token-file",
            "/tmp/tok.txt",
            "--format",
            "legacy",
        ])
        .unwrap();

        assert_eq!(cli.token_file, PathBuf::from("/tmp/tok.txt"));
        assert_eq!(RecordFormat::from(cli.format), RecordFormat::Legacy);
        match cli.command {
            Commands::Fetch { source, count } => {
                assert_eq!(source, SourceArg::Imap);
                assert_eq!(count, 2);
            }
            other => panic!("expected fetch, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_source_rejected() {
        assert!(Cli::try_parse_from(["mailkey", "fetch", "smtp"]).is_err());
    }
}
