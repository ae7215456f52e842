#![cfg_attr(not(test), forbid(unsafe_code))]

//! Command-line entry point for the `ChatRelay` server.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use shared::config::server::Config;

/// Main CLI structure for the `ChatRelay` server
#[derive(Debug, Parser)]
#[command(name = "chatrelay")]
#[command(about = "WebSocket chat relay for hosted LLM completions", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start the relay server
    Serve {
        /// The port number to bind the server to (e.g., 8080)
        #[arg(long, short)]
        port: u16,

        /// Path to a yaml, json, or toml configuration file
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// Inspect the resolved configuration
    Config {
        /// Print the configuration as YAML
        #[arg(long)]
        print: bool,

        /// Path to a yaml, json, or toml configuration file
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
}

async fn handle_serve_command(port: u16, config: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = Config::load_config(config, Some(port)).context("loading configuration")?;
    server::server::run(resolved).await?;
    Ok(())
}

fn handle_config_command(print: bool, config: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = Config::load_config(config, None).context("loading configuration")?;
    if print {
        print!("{}", serde_yml::to_string(&resolved)?);
    } else {
        println!("configuration is valid");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    match Cli::parse().command {
        Commands::Serve { port, config } => handle_serve_command(port, config).await,
        Commands::Config { print, config } => handle_config_command(print, config),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_serve_with_port_and_config() {
        let cli = Cli::try_parse_from(["chatrelay", "serve", "--port", "8080", "-c", "relay.yaml"])
            .unwrap();
        match cli.command {
            Commands::Serve { port, config } => {
                assert_eq!(port, 8080);
                assert_eq!(config, Some(PathBuf::from("relay.yaml")));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn serve_requires_a_port() {
        assert!(Cli::try_parse_from(["chatrelay", "serve"]).is_err());
    }

    #[test]
    fn parses_config_print() {
        let cli = Cli::try_parse_from(["chatrelay", "config", "--print"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Config {
                print: true,
                config: None
            }
        ));
    }
}
