//! Command-line surface of the `svrn` binary.

use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

#[derive(Debug, Clone, Default, Parser)]
#[command(name = "svrn", version, disable_version_flag = true, about = "svrn peer-to-peer node agent")]
pub struct Cli {
    /// Print version and exit
    #[arg(short = 'v', long = "version", action = ArgAction::Version)]
    pub version: Option<bool>,

    /// Comma-separated roles: consumer, provider, relay, seed
    #[arg(long, value_name = "CSV")]
    pub roles: Option<String>,

    /// Comma-separated services: blob, crdt
    #[arg(long, value_name = "CSV")]
    pub services: Option<String>,

    /// Path to a YAML config file
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Bootstrap community URI, e.g. svrn://node-a,node-b
    #[arg(long, value_name = "URI")]
    pub community: Option<String>,

    /// Router mode: auto | external:<host>:<port>
    #[arg(long, value_name = "MODE")]
    pub router: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Print version and exit
    Version,
}

pub fn version_line() -> String {
    format!("svrn {}", env!("CARGO_PKG_VERSION"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_parse() {
        let cli = Cli::try_parse_from([
            "svrn",
            "--roles",
            "provider,relay",
            "--services",
            "blob,crdt",
            "--router",
            "external:localhost:7656",
        ])
        .unwrap();
        assert_eq!(cli.roles.as_deref(), Some("provider,relay"));
        assert_eq!(cli.services.as_deref(), Some("blob,crdt"));
        assert_eq!(cli.router.as_deref(), Some("external:localhost:7656"));
        assert!(cli.config.is_none());
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_version_flags_short_circuit() {
        for flag in ["-v", "--version"] {
            let err = Cli::try_parse_from(["svrn", flag]).unwrap_err();
            assert_eq!(err.kind(), clap::error::ErrorKind::DisplayVersion);
        }
    }

    #[test]
    fn test_version_subcommand() {
        let cli = Cli::try_parse_from(["svrn", "version"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Version)));
        assert!(version_line().starts_with("svrn "));
    }

    #[test]
    fn test_unknown_flag_rejected() {
        assert!(Cli::try_parse_from(["svrn", "--dht"]).is_err());
    }
}
