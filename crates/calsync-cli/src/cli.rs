//! `calsync` argument parsing.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// calsync - keeps a local, cached view of your calendars
#[derive(Debug, Parser)]
#[command(name = "calsync")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file (default: ~/.config/calsync/config.toml)
    #[arg(long, short, env = "CALSYNC_CONFIG")]
    pub config: Option<PathBuf>,

    /// Debug logging on stderr
    #[arg(long, short = 'v')]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the sync daemon in the foreground until Ctrl-C or SIGTERM
    Run,

    /// Print upcoming events as JSON
    Events {
        /// Number of days to look ahead
        #[arg(long, default_value_t = 1)]
        days: u32,

        /// Only this account (default: all accounts)
        #[arg(long)]
        account: Option<String>,
    },

    /// Verify every account's connection
    Check,

    /// Sync every account once and print cache and scheduler statistics
    Stats,

    /// Inspect the config file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Print the effective config, defaults filled in
    Dump,

    /// Check accounts, OAuth settings and secret references
    Validate,

    /// Print where the config and credentials files live
    Path,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_events_with_options() {
        let cli = Cli::try_parse_from(["calsync", "-v", "events", "--days", "3", "--account", "work"])
            .unwrap();
        assert!(cli.debug);
        match cli.command {
            Command::Events { days, account } => {
                assert_eq!(days, 3);
                assert_eq!(account.as_deref(), Some("work"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn events_defaults_to_one_day() {
        let cli = Cli::try_parse_from(["calsync", "events"]).unwrap();
        assert!(matches!(cli.command, Command::Events { days: 1, account: None }));
    }

    #[test]
    fn subcommand_is_required() {
        assert!(Cli::try_parse_from(["calsync"]).is_err());
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
