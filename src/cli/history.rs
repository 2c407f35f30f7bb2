// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! History command - list past runs and rollbacks

use colored::Colorize;
use miette::Result;
use std::path::PathBuf;

use super::{load_pipeline, open_store, report};
use crate::config::Settings;
use crate::pipeline::{PipelineRun, RunOutcome};
use crate::state::StateStore;
use crate::utils::{print_section, short_sha};

/// Run the history command
pub async fn run(
    pipeline_path: PathBuf,
    environment: Option<String>,
    limit: usize,
    verbose: bool,
) -> Result<()> {
    let settings = Settings::load().map_err(report)?;
    let pipeline = load_pipeline(&pipeline_path)?;
    if let Some(ref env) = environment {
        if pipeline.get_environment(env).is_none() {
            return Err(miette::miette!("Unknown environment: '{}'", env));
        }
    }

    let store = open_store(&settings, &pipeline_path, &pipeline)?;
    let runs = store.list_runs().await.map_err(report)?;
    let rollbacks = store
        .list_rollbacks(environment.as_deref())
        .await
        .map_err(report)?;

    let runs: Vec<&PipelineRun> = runs
        .iter()
        .rev()
        .filter(|run| {
            environment
                .as_ref()
                .map_or(true, |env| run.target_environments.contains(env))
        })
        .take(limit)
        .collect();

    print_section("Runs");
    if runs.is_empty() {
        println!("  {}", "No runs recorded".dimmed());
    }
    for run in runs {
        let outcome = match run.overall_outcome {
            Some(RunOutcome::Succeeded) => "succeeded".green(),
            Some(RunOutcome::Failed) => "failed".red(),
            Some(RunOutcome::Cancelled) => "cancelled".yellow(),
            None => "unfinished".dimmed(),
        };
        let targets = if run.target_environments.is_empty() {
            "-".to_string()
        } else {
            run.target_environments.join(", ")
        };

        println!(
            "  {}  {}  {}  {:<20} {:<12} {}",
            run.created_at.format("%Y-%m-%d %H:%M"),
            short_sha(&run.id).dimmed(),
            short_sha(&run.commit_sha),
            run.branch,
            targets,
            outcome
        );

        if verbose {
            for gate in &run.gates {
                println!(
                    "      gate {} {} by {}",
                    gate.environment,
                    gate.state,
                    gate.decided_by.as_deref().unwrap_or("nobody")
                );
            }
            for promotion in &run.promotions {
                println!("      promoted {}", promotion.environment);
            }
        }
    }

    print_section("Rollbacks");
    if rollbacks.is_empty() {
        println!("  {}", "No rollbacks recorded".dimmed());
    }
    for record in rollbacks.iter().rev() {
        println!(
            "  {}  {}  {} → {}  {} by {}",
            record.timestamp.format("%Y-%m-%d %H:%M"),
            record.environment.bold(),
            short_sha(&record.from_commit),
            short_sha(&record.to_commit),
            record.strategy,
            record.initiated_by
        );
        if let Some(ref reason) = record.reason {
            println!("      {}", reason.dimmed());
        }
    }

    Ok(())
}
