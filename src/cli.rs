//! Command-line definition.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;

/// Sync Git repositories with air-gapped servers over SSH using bundles
#[derive(Parser, Debug)]
#[command(name = "gitsync")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the config file (default: ./.gitsync.toml)
    #[arg(long, global = true, env = "GITSYNC_CONFIG")]
    pub config: Option<PathBuf>,

    /// Show progress logs (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// When to use colors
    #[arg(long, global = true, value_enum, default_value_t = ColorChoice::Auto)]
    pub color: ColorChoice,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ColorChoice {
    Auto,
    Always,
    Never,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create .gitsync.toml for this repository
    Init(InitArgs),

    /// Send local commits to the server
    Push,

    /// Bring the server's commits into the local branch
    Pull {
        /// Push the merged branch to origin afterwards
        #[arg(short, long)]
        push: bool,
    },

    /// Download a full bundle of the server repository
    Backup,

    /// Compare local and server state
    Status {
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },

    /// Show what the next push would send
    Diff,

    /// List bundles kept in the bundle directory
    History {
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },

    /// Push automatically whenever files change
    Watch,

    /// Check git, config, and server connectivity
    Doctor,

    /// Print the effective configuration
    Config,

    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args, Debug, Clone, Default)]
pub struct InitArgs {
    /// Project name (default: directory name)
    #[arg(long)]
    pub name: Option<String>,

    /// Server host or IP
    #[arg(long)]
    pub host: Option<String>,

    /// SSH user
    #[arg(long)]
    pub user: Option<String>,

    /// SSH port
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory on the server that holds the project
    #[arg(long)]
    pub remote_path: Option<String>,

    /// Private key to try before the ~/.ssh defaults
    #[arg(long)]
    pub ssh_key: Option<String>,

    /// Branch to sync
    #[arg(long)]
    pub branch: Option<String>,

    /// Never prompt; use flags and defaults
    #[arg(long)]
    pub no_input: bool,

    /// Overwrite an existing config file
    #[arg(long)]
    pub force: bool,
}
