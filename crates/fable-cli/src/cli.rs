use clap::{Parser, Subcommand};
use fable_core::{OutputFormat, TaskKind};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "fable", version)]
#[command(about = "Fable: batch asset generation over priority-tiered backends")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate every asset in a task list
    Run {
        /// Kind of asset to generate
        #[arg(long, value_enum)]
        kind: TaskKind,

        /// Task list: TOML with [[tasks]] entries, or a JSON array
        #[arg(long)]
        tasks: PathBuf,

        /// Config file (defaults to .fable/config.toml)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override the main worker pool size
        #[arg(long)]
        workers: Option<usize>,

        /// Regenerate assets that already exist
        #[arg(long)]
        overwrite: bool,

        /// Never borrow idle lower-tier backends while the current tier is busy
        #[arg(long)]
        strict_tiers: bool,

        /// Project directory (defaults to CWD)
        #[arg(long)]
        cd: Option<String>,
    },

    /// Show the priority tiers configured for a task kind
    Tiers {
        /// Kind to show; all configured kinds when omitted
        #[arg(long, value_enum)]
        kind: Option<TaskKind>,

        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long)]
        cd: Option<String>,
    },

    /// Show/validate configuration
    Config {
        #[command(subcommand)]
        cmd: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show {
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long)]
        cd: Option<String>,
    },
    /// Validate configuration file
    Validate {
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long)]
        cd: Option<String>,
    },
}
