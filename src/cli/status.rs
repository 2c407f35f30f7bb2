// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! Status command - show environments and their known-good commits

use colored::Colorize;
use miette::Result;
use std::path::PathBuf;

use super::{load_pipeline, open_store, report};
use crate::config::Settings;
use crate::rollback::current_deployment;
use crate::state::StateStore;
use crate::utils::{print_header, print_section, short_sha};

/// Run the status command
pub async fn run(pipeline_path: PathBuf, verbose: bool) -> Result<()> {
    let settings = Settings::load().map_err(report)?;
    let pipeline = load_pipeline(&pipeline_path)?;
    let store = open_store(&settings, &pipeline_path, &pipeline)?;

    let known_good = store.all_known_good().await.map_err(report)?;
    let runs = store.list_runs().await.map_err(report)?;

    print_header(&format!("Pipeline {}", pipeline.name));

    print_section("Environments");
    if pipeline.environments.is_empty() {
        println!("  {}", "No environments configured".dimmed());
    }
    for env in &pipeline.environments {
        let gate = if env.requires_gate {
            format!(" {}", "[gated]".yellow())
        } else {
            String::new()
        };
        println!(
            "  {} ← {}{}",
            env.name.bold(),
            env.promotion_branch.cyan(),
            gate
        );

        match known_good.get(&env.name) {
            Some(record) => {
                println!(
                    "    known-good: {} (run {}, {})",
                    short_sha(&record.commit).green(),
                    short_sha(&record.run_id),
                    record.recorded_at.format("%Y-%m-%d %H:%M UTC")
                );
                if verbose {
                    println!("    commit: {}", record.commit.dimmed());
                }
            }
            None => println!("    known-good: {}", "none".dimmed()),
        }

        if let Some(deployed) = current_deployment(&runs, &env.name) {
            let is_known_good = known_good
                .get(&env.name)
                .is_some_and(|record| record.commit == deployed);
            if !is_known_good {
                println!(
                    "    last deployed: {} {}",
                    short_sha(&deployed).yellow(),
                    "(not known-good)".yellow()
                );
            }
        }
    }

    print_section("Latest run");
    match runs.last() {
        Some(run) => {
            let outcome = run
                .overall_outcome
                .map(|o| o.to_string())
                .unwrap_or_else(|| "unfinished".to_string());
            println!(
                "  {} {} @ {} on {}: {}",
                run.created_at.format("%Y-%m-%d %H:%M"),
                short_sha(&run.id),
                short_sha(&run.commit_sha),
                run.branch,
                outcome
            );
        }
        None => println!("  {}", "No runs yet".dimmed()),
    }

    let pending = runs
        .iter()
        .filter(|r| r.is_finished() && !r.promotions_applied && !r.promotions.is_empty())
        .count();
    if pending > 0 {
        println!();
        println!(
            "  {} {} run(s) have unapplied promotions; run {}",
            "⚠".yellow(),
            pending,
            "deployflow reconcile".cyan()
        );
    }

    Ok(())
}
