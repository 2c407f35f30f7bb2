// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! Reconcile command - apply promotions left pending by interrupted runs

use colored::Colorize;
use miette::Result;
use std::path::PathBuf;

use super::{load_pipeline, open_store, report};
use crate::config::Settings;
use crate::state::promotion;

/// Run the reconcile command
pub async fn run(pipeline_path: PathBuf, _verbose: bool) -> Result<()> {
    let settings = Settings::load().map_err(report)?;
    let pipeline = load_pipeline(&pipeline_path)?;
    let store = open_store(&settings, &pipeline_path, &pipeline)?;

    let result = promotion::reconcile(store.as_ref()).await.map_err(report)?;

    if result.is_empty() {
        println!("  {} Nothing to reconcile", "✓".green());
        return Ok(());
    }

    println!(
        "  {} Applied promotions from {} run(s)",
        "✓".green(),
        result.runs_applied.len()
    );
    for environment in &result.environments_advanced {
        println!("    {} advanced {}", "→".blue(), environment);
    }

    Ok(())
}
