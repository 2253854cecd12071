use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "sgguard")]
#[command(about = "Security group compliance auditor - reports open and policy-violating groups to Slack")]
#[command(version)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "sgguard.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one compliance check and exit
    Check {
        /// Log findings without posting to Slack
        #[arg(long)]
        dry_run: bool,
    },
    /// Run the scheduler and Slack event listener
    Server {
        /// Log findings without posting to Slack
        #[arg(long)]
        dry_run: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_defaults() {
        let cli = Cli::try_parse_from(["sgguard", "check"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("sgguard.toml"));
        assert!(matches!(cli.command, Commands::Check { dry_run: false }));
    }

    #[test]
    fn server_with_config_and_dry_run() {
        let cli =
            Cli::try_parse_from(["sgguard", "--config", "/etc/sgguard.toml", "server", "--dry-run"])
                .unwrap();
        assert_eq!(cli.config, PathBuf::from("/etc/sgguard.toml"));
        assert!(matches!(cli.command, Commands::Server { dry_run: true }));
    }

    #[test]
    fn missing_subcommand_is_an_error() {
        assert!(Cli::try_parse_from(["sgguard"]).is_err());
    }
}
