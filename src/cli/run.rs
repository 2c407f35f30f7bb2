// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! Run command - execute the pipeline for a commit

use colored::Colorize;
use miette::Result;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use super::{load_pipeline, open_store, pipeline_dir, report};
use crate::collaborators::{Collaborators, ShellCollaborators};
use crate::config::Settings;
use crate::environment::DeployLocks;
use crate::gate::{Approver, ConsoleApprover, ManualApprover, PresetApprover};
use crate::pipeline::{
    cancellation, PipelineExecutor, PipelineRun, RunOutcome, RunPlan, RunRequest, StageOutcome,
};
use crate::state::promotion;
use crate::utils::{create_spinner, short_sha};

/// Options for the run command
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub branch: Option<String>,
    pub commit: Option<String>,
    pub dry_run: bool,
    pub approve: bool,
    pub reject: Option<String>,
    pub identity: Option<String>,
}

/// Run the pipeline
pub async fn run(pipeline_path: PathBuf, options: RunOptions, verbose: bool) -> Result<()> {
    let settings = Settings::load().map_err(report)?;
    let mut pipeline = load_pipeline(&pipeline_path)?;
    pipeline.gate.timeout_secs = settings.gate_timeout(&pipeline).as_secs();

    let working_dir = pipeline_dir(&pipeline_path);
    let branch = match options.branch {
        Some(branch) => branch,
        None => git_output(&working_dir, &["rev-parse", "--abbrev-ref", "HEAD"]).ok_or_else(
            || miette::miette!("Could not determine the branch; pass --branch"),
        )?,
    };
    let commit = match options.commit {
        Some(commit) => commit,
        None => git_output(&working_dir, &["rev-parse", "HEAD"])
            .ok_or_else(|| miette::miette!("Could not determine the commit; pass --commit"))?,
    };

    let plan = RunPlan::build(&pipeline, RunRequest::new(&commit, &branch)).map_err(report)?;

    if verbose || options.dry_run {
        for warning in &plan.warnings {
            eprintln!("  {} {}", "⚠".yellow(), warning);
        }
    }

    if options.dry_run {
        print_plan(&plan);
        return Ok(());
    }

    let shell = ShellCollaborators::from_pipeline(&pipeline, &working_dir);
    let missing_tools = shell.check_tools();
    if !missing_tools.is_empty() {
        eprintln!("{}", "Missing required tools:".red().bold());
        for tool in &missing_tools {
            eprintln!("  {} {}", "✗".red(), tool);
        }
        return Err(miette::miette!("Required tools are not installed"));
    }

    let store = open_store(&settings, &pipeline_path, &pipeline)?;

    let spinner = create_spinner("Checking for pending promotions...");
    let reconciled = promotion::reconcile(store.as_ref()).await;
    spinner.finish_and_clear();
    let reconciled = reconciled.map_err(report)?;
    if !reconciled.is_empty() {
        println!(
            "  {} Applied pending promotions from {} earlier run(s)",
            "→".blue(),
            reconciled.runs_applied.len()
        );
    }

    let identity = options.identity.unwrap_or_else(|| settings.identity());
    let approver: Arc<dyn Approver> = if options.approve {
        Arc::new(PresetApprover::approve(&identity))
    } else if let Some(reason) = options.reject {
        Arc::new(PresetApprover::reject(&identity, &reason))
    } else if console::user_attended() {
        Arc::new(ConsoleApprover::new(&identity))
    } else {
        if pipeline.environments.iter().any(|e| e.requires_gate) {
            eprintln!(
                "  {} No terminal attached; gates will expire after {}s unless --approve or --reject is given",
                "⚠".yellow(),
                pipeline.gate.timeout_secs
            );
        }
        Arc::new(ManualApprover)
    };

    println!(
        "{} {} @ {} on {}",
        "Running".bold(),
        pipeline.name.bold(),
        short_sha(&commit).cyan(),
        branch.cyan()
    );
    println!("  Route: {}", plan.route);
    println!();

    let (canceller, signal) = cancellation();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!();
            eprintln!("  {} Cancelling run...", "⊘".yellow());
            canceller.cancel();
        }
    });

    let locks = DeployLocks::in_dir(store.root().join("locks"));
    let executor = PipelineExecutor::new(Collaborators::uniform(Arc::new(shell)), store)
        .with_locks(Arc::new(locks))
        .with_approver(approver)
        .with_progress(true);
    let result = executor.execute(&plan, signal).await;
    interrupt.abort();

    let run = result.map_err(report)?;
    print_summary(&run, verbose);

    match run.overall_outcome {
        Some(RunOutcome::Succeeded) => Ok(()),
        Some(RunOutcome::Cancelled) => Err(miette::miette!("Run {} was cancelled", run.id)),
        _ => Err(miette::miette!("Run {} failed", run.id)),
    }
}

/// Trimmed stdout of a git command, if it succeeds
pub(crate) fn git_output(dir: &Path, args: &[&str]) -> Option<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!value.is_empty()).then_some(value)
}

fn print_plan(plan: &RunPlan) {
    println!(
        "{} {} @ {} on {}",
        "Run plan for".bold(),
        plan.pipeline.name.bold(),
        short_sha(&plan.request.commit_sha).cyan(),
        plan.request.branch.cyan()
    );
    println!("  Route: {}", plan.route);
    println!();

    for (i, stage) in plan.stages().enumerate() {
        let target = stage
            .environment
            .as_ref()
            .map(|env| format!(" → {}", env))
            .unwrap_or_default();

        if plan.is_branch_skipped(&stage.name) {
            println!(
                "  {} {}{} {}",
                "⊘".dimmed(),
                stage.name.dimmed(),
                target.dimmed(),
                "(branch mismatch)".dimmed()
            );
            continue;
        }

        let gated = stage
            .environment
            .as_deref()
            .and_then(|env| plan.environments.get(env))
            .filter(|env| env.requires_gate)
            .map(|_| format!(" {}", "(approval required)".yellow()))
            .unwrap_or_default();
        println!("  {}. {}{}{}", i + 1, stage.name, target, gated);
    }

    println!();
    println!("{}", "Dry run: nothing was executed.".dimmed());
}

fn print_summary(run: &PipelineRun, verbose: bool) {
    let failures: Vec<_> = run
        .stages
        .iter()
        .filter(|s| s.outcome == StageOutcome::Failed)
        .collect();

    if !failures.is_empty() {
        println!();
        println!("{}:", "Failed stages".red().bold());
        for stage in failures {
            println!("  {} {}", "✗".red(), stage.name);
            for step in stage.steps.iter().filter(|s| s.outcome.is_failed()) {
                let message = step.outcome.message().unwrap_or_default();
                println!("      {}: {}", step.kind, message.dimmed());
            }
        }
    }

    for gate in &run.gates {
        let by = gate.decided_by.as_deref().unwrap_or("nobody");
        let detail = match gate.reason {
            Some(ref reason) => format!("{} by {}: {}", gate.state, by, reason),
            None => format!("{} by {}", gate.state, by),
        };
        println!("  {} gate {}", gate.environment.bold(), detail.dimmed());
    }

    if !run.promotions.is_empty() {
        println!();
        println!("{}:", "Promoted".green().bold());
        for promotion in &run.promotions {
            println!(
                "  {} {} is now at {}",
                "✓".green(),
                promotion.environment,
                short_sha(&promotion.commit)
            );
        }
    }

    if verbose && !run.artifacts.is_empty() {
        println!();
        println!("{}:", "Artifacts".bold());
        for artifact in run.artifacts.iter() {
            println!("  - {} (from {})", artifact.name, artifact.stage);
        }
    }
}
