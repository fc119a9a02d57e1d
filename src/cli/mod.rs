// src/cli/mod.rs — CLI definition (clap derive)

pub mod admin;
pub mod serve;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "chathub", about = "Multi-provider LLM chat server", version)]
pub struct Cli {
    /// Config file path (defaults to $CHATHUB_HOME/config.toml)
    #[arg(long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP server (default)
    Serve(ServeArgs),
    /// Delete expired login sessions and exit
    CleanupSessions,
    /// Print the model catalog with prices
    Models {
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

#[derive(clap::Args, Debug, Clone, Default)]
pub struct ServeArgs {
    /// Bind address
    #[arg(long)]
    pub host: Option<String>,
    /// Listen port
    #[arg(short, long)]
    pub port: Option<u16>,
    /// Storage backend: sqlite or file
    #[arg(long)]
    pub storage: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_subcommand_defaults_to_none() {
        let cli = Cli::try_parse_from(["chathub"]).unwrap();
        assert!(cli.command.is_none());
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_serve_overrides() {
        let cli = Cli::try_parse_from([
            "chathub", "serve", "--port", "8080", "--storage", "file", "--config", "/tmp/c.toml",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Serve(args)) => {
                assert_eq!(args.port, Some(8080));
                assert_eq!(args.storage.as_deref(), Some("file"));
                assert!(args.host.is_none());
            }
            _ => panic!("expected serve"),
        }
        assert_eq!(cli.config.as_deref(), Some("/tmp/c.toml"));
    }

    #[test]
    fn test_cleanup_subcommand() {
        let cli = Cli::try_parse_from(["chathub", "cleanup-sessions"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::CleanupSessions)));
    }
}
