//! CLI module for dbgate.
//!
//! Subcommands:
//! - `mcp`: Run the MCP server (stdio transport)
//! - `check`: Boot the gateway, verify every backend and shut down
//! - `backends`: Print the configured backends

mod backends;
mod check;
mod mcp;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::Config;

/// dbgate - Multi-backend query gateway
#[derive(Parser)]
#[command(name = "dbgate")]
#[command(about = "Query gateway - MCP server routing tool calls to graph and SQL databases")]
#[command(version)]
pub struct App {
    /// Run in verbose mode
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file layered over the user and project files
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the MCP server (stdio transport for local use)
    Mcp,

    /// Connect to every backend, run a health check and exit
    Check,

    /// Print the configured backends
    Backends {
        /// Print as JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

impl App {
    /// Run the CLI application.
    pub async fn run(self) -> color_eyre::Result<()> {
        match self.command {
            Command::Mcp => self.run_mcp().await,
            Command::Check => self.run_check().await,
            Command::Backends { json } => self.run_backends(json),
        }
    }

    fn load_config(&self) -> color_eyre::Result<Config> {
        Ok(Config::load(self.config.as_deref())?)
    }
}
