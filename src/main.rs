// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! deployflow - Deployment Pipeline Orchestrator
//!
//! Promote commits through environments with approval gates and guided rollback.

use clap::Parser;
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use deployflow::cli::{rollback::RollbackOptions, run::RunOptions, Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "deployflow=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    if !deployflow::utils::should_use_colors() {
        colored::control::set_override(false);
    }

    let cli = Cli::parse();

    // Change to specified directory if provided
    if let Some(ref dir) = cli.directory {
        std::env::set_current_dir(dir).map_err(|e| {
            miette::miette!("Failed to change to directory '{}': {}", dir.display(), e)
        })?;
    }

    // Dispatch to command handlers
    match cli.command {
        Commands::Init { name, force } => deployflow::cli::init::run(name, force, cli.verbose).await,
        Commands::Validate { pipeline } => {
            deployflow::cli::validate::run(pipeline, cli.verbose).await
        }
        Commands::Graph { pipeline, format } => {
            deployflow::cli::graph::run(pipeline, format, cli.verbose).await
        }
        Commands::Run {
            pipeline,
            branch,
            commit,
            dry_run,
            approve,
            reject,
            identity,
        } => {
            let options = RunOptions {
                branch,
                commit,
                dry_run,
                approve,
                reject,
                identity,
            };
            deployflow::cli::run::run(pipeline, options, cli.verbose).await
        }
        Commands::Status { pipeline } => deployflow::cli::status::run(pipeline, cli.verbose).await,
        Commands::History {
            pipeline,
            environment,
            limit,
        } => deployflow::cli::history::run(pipeline, environment, limit, cli.verbose).await,
        Commands::Rollback {
            environment,
            pipeline,
            to,
            bad,
            critical,
            confirm,
            notify,
            reason,
            dry_run,
        } => {
            let options = RollbackOptions {
                to,
                bad,
                critical,
                confirm,
                notify,
                reason,
                dry_run,
            };
            deployflow::cli::rollback::run(pipeline, environment, options, cli.verbose).await
        }
        Commands::Reconcile { pipeline } => {
            deployflow::cli::reconcile::run(pipeline, cli.verbose).await
        }
    }
}
