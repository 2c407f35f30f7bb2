// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! CLI command definitions and handlers
//!
//! Defines the command-line interface for deployflow.

pub mod graph;
pub mod history;
pub mod init;
pub mod reconcile;
pub mod rollback;
pub mod run;
pub mod status;
pub mod validate;

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Settings;
use crate::errors::{DeployflowError, RecoverySuggestion};
use crate::pipeline::Pipeline;
use crate::state::FilesystemStore;

/// Default pipeline file name
pub const DEFAULT_PIPELINE: &str = ".deployflow.yaml";

/// Deployment pipeline orchestrator
///
/// Build, scan, gate and promote commits through environments.
#[derive(Parser, Debug)]
#[clap(
    name = "deployflow",
    version,
    about = "Deployment pipeline orchestrator with approval gates and guided rollback",
    long_about = None,
    after_help = "Examples:\n\
        deployflow init                         Create a starter pipeline\n\
        deployflow run --branch develop         Run the pipeline for a branch\n\
        deployflow status                       Show known-good commits\n\
        deployflow rollback production          Recommend a rollback\n\n\
        See 'deployflow <command> --help' for more information on a specific command."
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,

    /// Enable verbose output
    #[clap(short, long, global = true)]
    pub verbose: bool,

    /// Change to directory before executing
    #[clap(short = 'C', long, global = true, value_name = "DIR")]
    pub directory: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a starter pipeline file
    Init {
        /// Pipeline name (defaults to current directory name)
        name: Option<String>,

        /// Overwrite an existing pipeline file
        #[clap(long)]
        force: bool,
    },

    /// Validate pipeline configuration
    Validate {
        /// Pipeline file to validate
        #[clap(default_value = DEFAULT_PIPELINE)]
        pipeline: PathBuf,
    },

    /// Show pipeline as a graph
    Graph {
        /// Pipeline file
        #[clap(default_value = DEFAULT_PIPELINE)]
        pipeline: PathBuf,

        /// Output format
        #[clap(short, long, value_enum, default_value_t = GraphFormat::Text)]
        format: GraphFormat,
    },

    /// Run the pipeline for a commit
    Run {
        /// Pipeline file
        #[clap(short, long, default_value = DEFAULT_PIPELINE)]
        pipeline: PathBuf,

        /// Branch the commit was pushed to (defaults to the checked-out branch)
        #[clap(short, long)]
        branch: Option<String>,

        /// Commit to run (defaults to HEAD)
        #[clap(short, long)]
        commit: Option<String>,

        /// Show what would run without running it
        #[clap(long)]
        dry_run: bool,

        /// Approve every gate opened by this run
        #[clap(long, conflicts_with = "reject")]
        approve: bool,

        /// Reject every gate opened by this run
        #[clap(long, value_name = "REASON")]
        reject: Option<String>,

        /// Identity recorded on gate decisions
        #[clap(long)]
        identity: Option<String>,
    },

    /// Show environments and their known-good commits
    Status {
        /// Pipeline file
        #[clap(short, long, default_value = DEFAULT_PIPELINE)]
        pipeline: PathBuf,
    },

    /// List past runs and rollbacks
    History {
        /// Pipeline file
        #[clap(short, long, default_value = DEFAULT_PIPELINE)]
        pipeline: PathBuf,

        /// Only runs targeting this environment
        #[clap(short, long)]
        environment: Option<String>,

        /// Number of runs to show
        #[clap(short = 'n', long, default_value = "10")]
        limit: usize,
    },

    /// Recommend and record a rollback
    Rollback {
        /// Environment to roll back
        environment: String,

        /// Pipeline file
        #[clap(short, long, default_value = DEFAULT_PIPELINE)]
        pipeline: PathBuf,

        /// Commit to return to (defaults to the last known-good commit)
        #[clap(long)]
        to: Option<String>,

        /// Commit currently deployed (defaults to the latest deployed commit)
        #[clap(long)]
        bad: Option<String>,

        /// Treat as critical: reset the promotion branch
        #[clap(long)]
        critical: bool,

        /// Confirm a destructive emergency reset
        #[clap(long)]
        confirm: bool,

        /// People to notify
        #[clap(long, value_delimiter = ',')]
        notify: Vec<String>,

        /// Why the rollback is happening
        #[clap(long)]
        reason: Option<String>,

        /// Show the recommendation without recording it
        #[clap(long)]
        dry_run: bool,
    },

    /// Apply promotions left over from interrupted runs
    Reconcile {
        /// Pipeline file
        #[clap(short, long, default_value = DEFAULT_PIPELINE)]
        pipeline: PathBuf,
    },
}

/// Graph output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum GraphFormat {
    Text,
    Dot,
    Mermaid,
}

/// Load a pipeline file, printing a recovery hint on failure
pub(crate) fn load_pipeline(path: &Path) -> miette::Result<Pipeline> {
    Pipeline::from_file(path).map_err(report)
}

/// Directory collaborators and git run in: the pipeline file's directory
pub(crate) fn pipeline_dir(pipeline_path: &Path) -> PathBuf {
    match pipeline_path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Open the state store for a pipeline
pub(crate) fn open_store(
    settings: &Settings,
    pipeline_path: &Path,
    pipeline: &Pipeline,
) -> miette::Result<Arc<FilesystemStore>> {
    let dir = settings.state_dir(pipeline_path, pipeline);
    tracing::debug!(state_dir = %dir.display(), "opening state store");
    FilesystemStore::new(dir).map(Arc::new).map_err(report)
}

/// Print any recovery suggestion for `error` and convert it for miette
pub(crate) fn report(error: DeployflowError) -> miette::Report {
    if let Some(suggestion) = RecoverySuggestion::for_error(&error) {
        eprintln!("{}", suggestion.to_string().yellow());
    }
    miette::Report::new(error)
}
