// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! Rollback command - recommend and record a rollback

use colored::Colorize;
use miette::Result;
use std::path::PathBuf;
use std::sync::Arc;

use super::{load_pipeline, open_store, pipeline_dir, report};
use crate::config::Settings;
use crate::environment::EnvironmentSet;
use crate::rollback::{
    current_deployment, GitHistory, RollbackAdvisor, RollbackPlan, RollbackRequest,
    RollbackStrategy,
};
use crate::state::{promotion, StateStore};
use crate::utils::{create_spinner, print_info, print_success, print_warning, short_sha};

/// Options for the rollback command
#[derive(Debug, Clone, Default)]
pub struct RollbackOptions {
    pub to: Option<String>,
    pub bad: Option<String>,
    pub critical: bool,
    pub confirm: bool,
    pub notify: Vec<String>,
    pub reason: Option<String>,
    pub dry_run: bool,
}

/// Run the rollback command
pub async fn run(
    pipeline_path: PathBuf,
    environment: String,
    options: RollbackOptions,
    _verbose: bool,
) -> Result<()> {
    let settings = Settings::load().map_err(report)?;
    let pipeline = load_pipeline(&pipeline_path)?;
    let store = open_store(&settings, &pipeline_path, &pipeline)?;

    // Known-good must reflect every finished run before choosing a target
    promotion::reconcile(store.as_ref())
        .await
        .map_err(report)?;

    let environments = EnvironmentSet::from_pipeline(&pipeline)
        .map_err(report)?
        .with_known_good(store.as_ref())
        .await
        .map_err(report)?;
    let env = environments.require(&environment).map_err(report)?;

    let bad_commit = match options.bad {
        Some(commit) => commit,
        None => {
            let runs = store.list_runs().await.map_err(report)?;
            current_deployment(&runs, &env.name).ok_or_else(|| {
                miette::miette!(
                    "No deployment to '{}' is recorded; pass --bad with the deployed commit",
                    env.name
                )
            })?
        }
    };

    let request = RollbackRequest {
        bad_commit,
        target: options.to,
        critical: options.critical,
        initiated_by: settings.identity(),
        reason: options.reason,
        notify: options.notify,
    };

    let history = GitHistory::new(&pipeline_dir(&pipeline_path)).map_err(report)?;
    let advisor = RollbackAdvisor::new(Arc::new(history));

    let spinner = create_spinner("Inspecting commit history...");
    let plan = advisor.recommend(env, &request).await;
    spinner.finish_and_clear();
    let plan = plan.map_err(report)?;

    print_plan(&plan);

    if options.dry_run {
        println!();
        println!("{}", "Dry run: nothing was recorded.".dimmed());
        return Ok(());
    }

    let record = advisor
        .initiate(&plan, options.confirm, store.as_ref())
        .await
        .map_err(report)?;

    println!();
    print_success(&format!("Rollback {} recorded", short_sha(&record.id)));
    if !record.notified.is_empty() {
        print_info(&format!("Notify: {}", record.notified.join(", ")));
    }

    Ok(())
}

fn print_plan(plan: &RollbackPlan) {
    let record = &plan.record;

    println!(
        "{} {}: {} → {}",
        "Rollback".bold(),
        record.environment.bold(),
        short_sha(&record.from_commit).red(),
        short_sha(&record.to_commit).green()
    );
    println!("  Strategy: {}", record.strategy.to_string().cyan());
    println!("  {}", plan.rationale);

    if record.strategy == RollbackStrategy::EmergencyReset {
        println!();
        print_warning("This rewrites the promotion branch history");
    }

    println!();
    println!("{}:", "Commands".bold());
    for command in plan.action.commands() {
        println!("  $ {}", command);
    }

    match &plan.next_run {
        Some(next) => {
            println!();
            println!(
                "Then run {}",
                format!(
                    "deployflow run --branch {} --commit {}",
                    next.branch, next.commit_sha
                )
                .cyan()
            );
        }
        None => {
            println!();
            println!(
                "{}",
                "The pushed revert triggers the redeploying run.".dimmed()
            );
        }
    }
}
