use anyhow::Result;
use fable_config::validate_config;
use fable_core::OutputFormat;
use std::path::PathBuf;

use crate::project::{determine_project_root, load_config};

pub(crate) fn handle_config_show(
    config: Option<PathBuf>,
    cd: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let project_root = determine_project_root(cd.as_deref())?;
    let config = load_config(&project_root, config.as_deref())?;

    match format {
        OutputFormat::Json => {
            let json_str = serde_json::to_string_pretty(&config)?;
            println!("{}", json_str);
        }
        OutputFormat::Text => {
            let toml_str = toml::to_string_pretty(&config)?;
            print!("{}", toml_str);
        }
    }
    Ok(())
}

pub(crate) fn handle_config_validate(config: Option<PathBuf>, cd: Option<String>) -> Result<()> {
    let project_root = determine_project_root(cd.as_deref())?;
    let config = load_config(&project_root, config.as_deref())?;

    validate_config(&config)?;

    let kinds: Vec<String> = config
        .configured_kinds()
        .iter()
        .map(ToString::to_string)
        .collect();
    eprintln!(
        "Configuration is valid ({} backend(s); kinds: {})",
        config.backends.len(),
        if kinds.is_empty() {
            "none".to_string()
        } else {
            kinds.join(", ")
        }
    );
    Ok(())
}
