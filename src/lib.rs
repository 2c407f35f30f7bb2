// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! # deployflow - Deployment Pipeline Orchestrator
//!
//! `deployflow` runs a commit through build, test, scan and deploy stages,
//! promoting it branch by branch into ephemeral environments.
//!
//! ## Features
//!
//! - **Branch promotion** - Each environment deploys from exactly one branch
//! - **Approval gates** - Human sign-off before gated environments deploy
//! - **Known-good tracking** - Only fully verified deployments advance
//! - **Guided rollback** - Revert, redeploy or reset, chosen from history
//!
//! ## Quick Start
//!
//! ```bash
//! # Create a starter pipeline
//! deployflow init
//!
//! # Preview what a branch would run
//! deployflow run --branch develop --dry-run
//!
//! # Run it
//! deployflow run --branch develop
//!
//! # Roll production back
//! deployflow rollback production
//! ```

pub mod cli;
pub mod collaborators;
pub mod config;
pub mod environment;
pub mod errors;
pub mod gate;
pub mod pipeline;
pub mod rollback;
pub mod state;
pub mod utils;

// Re-export commonly used types
pub use errors::{DeployflowError, DeployflowResult};
pub use pipeline::{Pipeline, PipelineExecutor, PipelineRun, RunPlan, RunRequest, Stage};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
