use std::path::PathBuf;

use clap::{Parser, Subcommand};
use testforge_queue::DEFAULT_PRIORITY;

/// Command-line arguments for testforge
#[derive(Debug, Parser)]
#[command(name = "testforge")]
#[command(about = "Generate and manage API test projects", long_about = None)]
pub struct Cli {
    #[arg(long, global = true, help = "Config file to use instead of ~/.testforge/config.toml")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, help = "Workspaces root directory (overrides config)")]
    pub root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Subcommands
#[derive(Debug, Subcommand)]
pub enum Commands {
    #[command(about = "Create a project and generate its test workspace")]
    Create {
        #[arg(help = "Project name, also used as the workspace directory")]
        name: String,

        #[arg(long, help = "Base URL of the API under test (overrides config)")]
        base_url: Option<String>,

        #[arg(long, default_value_t = DEFAULT_PRIORITY, help = "Queue priority, higher runs first")]
        priority: i32,
    },

    #[command(about = "Delete a project and its workspace")]
    Delete {
        #[arg(help = "Project name")]
        name: String,
    },

    #[command(about = "List projects")]
    List {
        #[arg(long, help = "Print projects as JSON")]
        json: bool,
    },

    #[command(about = "Clean up projects stuck in pending")]
    Sweep,

    #[command(about = "Show workspaces and project counts by status")]
    Status,
}
