// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! Pipeline definitions and execution
//!
//! This module defines the pipeline schema, the stage dependency graph,
//! run construction and the engine that executes runs.

mod cancel;
mod dag;
mod definition;
mod executor;
mod plan;
mod run;
mod validation;

pub use cancel::{cancellation, CancelSignal, Canceller};
pub use dag::DagBuilder;
pub use definition::*;
pub use executor::PipelineExecutor;
pub use plan::{RunPlan, RunRequest};
pub use run::{
    Artifact, ArtifactStore, ArtifactValue, PipelineRun, Promotion, RunOutcome, SkipReason,
    StageOutcome, StageRecord, StepOutcome, StepRecord,
};
pub use validation::{PipelineValidator, ValidationResult};
