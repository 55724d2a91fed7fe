use anyhow::Result;
use fable_config::ForgeConfig;
use fable_core::{BackendCandidate, OutputFormat, TaskKind};
use fable_scheduler::ordered_priorities;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;

use crate::project::{determine_project_root, load_config};

#[derive(Debug, Serialize)]
struct TierView {
    priority: i64,
    backends: Vec<BackendView>,
}

#[derive(Debug, Serialize)]
struct BackendView {
    name: String,
    weight: f64,
    /// `None` when the backend has no `[backends]` entry; such backends are
    /// never scheduled.
    max_concurrent: Option<u32>,
}

#[derive(Debug, Serialize)]
struct KindView {
    kind: TaskKind,
    tiers: Vec<TierView>,
}

/// Handle `fable tiers`.
pub(crate) fn handle_tiers(
    kind: Option<TaskKind>,
    config: Option<PathBuf>,
    cd: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let project_root = determine_project_root(cd.as_deref())?;
    let config = load_config(&project_root, config.as_deref())?;

    let kinds = match kind {
        Some(kind) => vec![kind],
        None => config.configured_kinds(),
    };
    let views: Vec<KindView> = kinds.into_iter().map(|k| kind_view(&config, k)).collect();

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&views)?);
        }
        OutputFormat::Text => {
            if views.is_empty() {
                eprintln!("No [[models.*]] entries configured.");
            }
            for view in &views {
                print_kind_text(view);
            }
        }
    }
    Ok(())
}

fn kind_view(config: &ForgeConfig, kind: TaskKind) -> KindView {
    let candidates = config.candidates(kind);
    let limits: HashMap<String, u32> = config.capacity_limits().into_iter().collect();

    let tiers = ordered_priorities(&candidates)
        .into_iter()
        .map(|priority| TierView {
            priority,
            backends: candidates
                .iter()
                .filter(|c| c.priority == priority)
                .map(|c: &BackendCandidate| BackendView {
                    name: c.name.clone(),
                    weight: c.weight,
                    max_concurrent: limits.get(&c.name).copied(),
                })
                .collect(),
        })
        .collect();

    KindView { kind, tiers }
}

fn print_kind_text(view: &KindView) {
    println!("{}:", view.kind);
    if view.tiers.is_empty() {
        println!("  (no usable backends)");
    }
    for tier in &view.tiers {
        println!("  priority {}:", tier.priority);
        for backend in &tier.backends {
            match backend.max_concurrent {
                Some(max) => println!(
                    "    {} (weight {}, max {})",
                    backend.name, backend.weight, max
                ),
                None => println!(
                    "    {} (weight {}, not configured)",
                    backend.name, backend.weight
                ),
            }
        }
    }
    println!();
}
