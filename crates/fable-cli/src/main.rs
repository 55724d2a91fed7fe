use anyhow::Result;
use clap::Parser;

mod cli;
mod config_cmds;
mod http_generator;
mod project;
mod run_cmd;
mod store;
mod task_list;
mod tiers_cmd;

use cli::{Cli, Commands, ConfigCommands};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing (output to stderr, initialize only once)
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
        .ok();

    let cli = Cli::parse();
    let output_format = cli.format.clone();

    match cli.command {
        Commands::Run {
            kind,
            tasks,
            config,
            workers,
            overwrite,
            strict_tiers,
            cd,
        } => {
            let exit_code = run_cmd::handle_run(
                run_cmd::RunArgs {
                    kind,
                    tasks,
                    config,
                    workers,
                    overwrite,
                    strict_tiers,
                    cd,
                },
                output_format,
            )
            .await?;
            std::process::exit(exit_code);
        }
        Commands::Tiers { kind, config, cd } => {
            tiers_cmd::handle_tiers(kind, config, cd, output_format)?;
        }
        Commands::Config { cmd } => match cmd {
            ConfigCommands::Show { config, cd } => {
                config_cmds::handle_config_show(config, cd, output_format)?;
            }
            ConfigCommands::Validate { config, cd } => {
                config_cmds::handle_config_validate(config, cd)?;
            }
        },
    }

    Ok(())
}
