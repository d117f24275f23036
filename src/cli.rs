//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use transfer_core::TransferStatus;

/// Concurrent, resumable downloads from the command line.
///
/// Transfers are persisted, so an interrupted `get` or `run` picks up where
/// it stopped the next time the engine runs.
#[derive(Parser, Debug)]
#[command(name = "transfer-manager")]
#[command(author, version, about)]
pub struct Cli {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file (default: $XDG_CONFIG_HOME/transfer-manager/config.toml)
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Database file, overriding the config
    #[arg(long, value_name = "PATH", global = true)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Top-level commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Download one or more URLs and wait until they finish
    Get(GetArgs),
    /// Process persisted queued transfers until nothing is left
    Run(RunArgs),
    /// List transfers, newest first
    List(ListArgs),
    /// Pause a transfer
    Pause(IdArg),
    /// Resume a paused transfer
    Resume(IdArg),
    /// Cancel a transfer, keeping the partial file
    Cancel(IdArg),
    /// Retry a failed transfer immediately
    Retry(IdArg),
    /// Delete a transfer record and its partial file
    Remove(IdArg),
    /// Delete every transfer record
    Clear,
}

/// Arguments for `get`.
#[derive(Args, Debug)]
pub struct GetArgs {
    /// URLs to download
    #[arg(required = true, value_name = "URL")]
    pub urls: Vec<String>,

    /// Destination directory, overriding the config
    #[arg(short, long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Maximum concurrent downloads (1-100)
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub concurrency: Option<u8>,

    /// File name to save as (single URL only)
    #[arg(short = 'n', long)]
    pub name: Option<String>,
}

/// Arguments for `run`.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Maximum concurrent downloads (1-100)
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub concurrency: Option<u8>,
}

/// Arguments for `list`.
#[derive(Args, Debug)]
pub struct ListArgs {
    /// Only show transfers in this state (repeatable)
    #[arg(short, long, value_parser = parse_status)]
    pub status: Vec<TransferStatus>,
}

/// A single transfer id.
#[derive(Args, Debug)]
pub struct IdArg {
    /// Transfer id as shown by `list`
    pub id: String,
}

fn parse_status(value: &str) -> Result<TransferStatus, String> {
    value.to_ascii_lowercase().parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_get_parses_urls_and_flags() {
        let cli = Cli::try_parse_from([
            "transfer-manager",
            "get",
            "https://example.com/a",
            "https://example.com/b",
            "-c",
            "5",
            "-o",
            "/tmp/out",
        ])
        .unwrap();
        let Command::Get(args) = cli.command else {
            panic!("expected get");
        };
        assert_eq!(args.urls.len(), 2);
        assert_eq!(args.concurrency, Some(5));
        assert_eq!(args.output_dir, Some(PathBuf::from("/tmp/out")));
        assert!(args.name.is_none());
    }

    #[test]
    fn test_cli_get_requires_a_url() {
        let err = Cli::try_parse_from(["transfer-manager", "get"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn test_cli_verbose_flag_is_global() {
        let cli = Cli::try_parse_from(["transfer-manager", "list", "-vv"]).unwrap();
        assert_eq!(cli.verbose, 2);

        let cli = Cli::try_parse_from(["transfer-manager", "-q", "list"]).unwrap();
        assert!(cli.quiet);
    }

    #[test]
    fn test_cli_concurrency_zero_rejected() {
        let err = Cli::try_parse_from(["transfer-manager", "run", "-c", "0"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn test_cli_concurrency_over_max_rejected() {
        let err = Cli::try_parse_from(["transfer-manager", "get", "https://e.x/a", "-c", "101"])
            .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn test_cli_list_status_filter() {
        let cli = Cli::try_parse_from([
            "transfer-manager",
            "list",
            "--status",
            "Failed",
            "-s",
            "paused",
        ])
        .unwrap();
        let Command::List(args) = cli.command else {
            panic!("expected list");
        };
        assert_eq!(
            args.status,
            vec![TransferStatus::Failed, TransferStatus::Paused]
        );
    }

    #[test]
    fn test_cli_list_rejects_unknown_status() {
        let err = Cli::try_parse_from(["transfer-manager", "list", "--status", "downloading"])
            .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn test_cli_id_commands() {
        for command in ["pause", "resume", "cancel", "retry", "remove"] {
            let cli = Cli::try_parse_from(["transfer-manager", command, "abc"]).unwrap();
            assert!(!matches!(cli.command, Command::Clear));
        }
    }

    #[test]
    fn test_cli_global_paths() {
        let cli = Cli::try_parse_from([
            "transfer-manager",
            "clear",
            "--db",
            "/tmp/t.db",
            "--config",
            "/tmp/c.toml",
        ])
        .unwrap();
        assert_eq!(cli.db, Some(PathBuf::from("/tmp/t.db")));
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.toml")));
    }

    #[test]
    fn test_cli_help_flag_shows_usage() {
        let err = Cli::try_parse_from(["transfer-manager", "--help"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }
}
