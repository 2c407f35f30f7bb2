// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! Pipeline run records
//!
//! A [`PipelineRun`] is the retained history of one trigger: every stage,
//! step and gate outcome. It is sealed by [`PipelineRun::finish`] and never
//! changes afterwards, except for the `promotions_applied` marker written by
//! the promotion path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::collaborators::ImageRef;
use crate::environment::BranchRoute;
use crate::gate::{Gate, GateState};
use crate::pipeline::StepKind;

/// Why a stage did not run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// The run's branch does not promote into the stage's environment
    BranchMismatch,
    /// A dependency failed, or was itself skipped because of a failure
    UpstreamFailed { stage: String },
    /// The environment's gate ended without approval
    GateNotApproved {
        environment: String,
        state: GateState,
    },
    Cancelled,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BranchMismatch => write!(f, "branch does not target this environment"),
            Self::UpstreamFailed { stage } => write!(f, "upstream stage '{}' failed", stage),
            Self::GateNotApproved { environment, state } => {
                write!(f, "gate for '{}' {}", environment, state)
            }
            Self::Cancelled => write!(f, "run cancelled"),
        }
    }
}

/// Stage outcome
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum StageOutcome {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped(SkipReason),
}

impl StageOutcome {
    pub fn is_succeeded(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    /// Succeeded, or skipped only because the branch targets elsewhere
    pub fn is_acceptable(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Skipped(SkipReason::BranchMismatch))
    }
}

impl std::fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped(reason) => write!(f, "skipped ({})", reason),
        }
    }
}

/// Step outcome
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    #[default]
    Pending,
    Succeeded {
        message: String,
    },
    Failed {
        message: String,
    },
    Skipped,
}

impl StepOutcome {
    pub fn is_succeeded(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Succeeded { message } | Self::Failed { message } => Some(message),
            _ => None,
        }
    }
}

/// Record of one step call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub kind: StepKind,
    pub collaborator: String,
    pub outcome: StepOutcome,
    /// Failure was recorded without failing the stage
    #[serde(default)]
    pub advisory: bool,
    /// Name of the artifact produced, if any
    #[serde(default)]
    pub artifact: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    pub fn pending(kind: StepKind, collaborator: &str) -> Self {
        Self {
            kind,
            collaborator: collaborator.to_string(),
            outcome: StepOutcome::Pending,
            advisory: false,
            artifact: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Record of one stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    pub name: String,
    pub environment: Option<String>,
    pub outcome: StageOutcome,
    pub steps: Vec<StepRecord>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StageRecord {
    /// Whether a step of this kind succeeded
    pub fn step_succeeded(&self, kind: StepKind) -> bool {
        self.steps
            .iter()
            .any(|s| s.kind == kind && s.outcome.is_succeeded())
    }

    /// Mark this stage and all its unfinished steps skipped
    pub fn skip(&mut self, reason: SkipReason) {
        for step in &mut self.steps {
            if step.outcome == StepOutcome::Pending {
                step.outcome = StepOutcome::Skipped;
            }
        }
        self.outcome = StageOutcome::Skipped(reason);
    }
}

/// Value of an artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ArtifactValue {
    Image(ImageRef),
    Report(String),
}

/// An artifact owned by the step that produced it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub stage: String,
    pub step: usize,
    pub value: ArtifactValue,
}

/// The run's artifacts, keyed by name; later steps borrow from here
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactStore {
    artifacts: BTreeMap<String, Artifact>,
}

impl ArtifactStore {
    pub fn insert(&mut self, artifact: Artifact) {
        self.artifacts.insert(artifact.name.clone(), artifact);
    }

    pub fn get(&self, name: &str) -> Option<&Artifact> {
        self.artifacts.get(name)
    }

    /// Borrow an image artifact
    pub fn image(&self, name: &str) -> Option<&ImageRef> {
        match self.get(name).map(|a| &a.value) {
            Some(ArtifactValue::Image(image)) => Some(image),
            _ => None,
        }
    }

    /// Values for the named artifacts; `Err` carries the first name not present
    pub fn resolve<'a>(
        &self,
        names: &'a [String],
    ) -> Result<BTreeMap<String, ArtifactValue>, &'a str> {
        names
            .iter()
            .map(|name| match self.get(name) {
                Some(artifact) => Ok((name.clone(), artifact.value.clone())),
                None => Err(name.as_str()),
            })
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Artifact> {
        self.artifacts.values()
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }
}

/// Overall outcome of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Succeeded,
    Failed,
    Cancelled,
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A known-good advance earned by a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Promotion {
    pub environment: String,
    pub commit: String,
}

/// One execution of a pipeline for a commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: String,
    pub pipeline: String,
    pub commit_sha: String,
    pub branch: String,
    pub route: BranchRoute,
    pub target_environments: Vec<String>,
    pub stages: Vec<StageRecord>,
    #[serde(default)]
    pub gates: Vec<Gate>,
    #[serde(default)]
    pub artifacts: ArtifactStore,
    #[serde(default)]
    pub cancelled: bool,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub overall_outcome: Option<RunOutcome>,
    #[serde(default)]
    pub promotions: Vec<Promotion>,
    #[serde(default)]
    pub promotions_applied: bool,
}

impl PipelineRun {
    pub fn stage(&self, name: &str) -> Option<&StageRecord> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn is_finished(&self) -> bool {
        self.overall_outcome.is_some()
    }

    /// Gate opened for an environment in this run
    pub fn gate_for(&self, environment: &str) -> Option<&Gate> {
        self.gates.iter().find(|g| g.environment == environment)
    }

    /// Derive the overall outcome from stage and gate records
    ///
    /// Succeeded only when every stage succeeded or was skipped by branch
    /// mismatch, and every gate opened by the run was approved.
    pub fn derive_outcome(&self) -> RunOutcome {
        if self.cancelled {
            return RunOutcome::Cancelled;
        }

        let stages_ok = self.stages.iter().all(|s| s.outcome.is_acceptable());
        let gates_ok = self.gates.iter().all(|g| g.state == GateState::Approved);

        if stages_ok && gates_ok {
            RunOutcome::Succeeded
        } else {
            RunOutcome::Failed
        }
    }

    /// Environments this run deployed and smoke-tested successfully
    fn earned_promotions(&self) -> Vec<Promotion> {
        self.target_environments
            .iter()
            .filter(|env| {
                let stages: Vec<_> = self
                    .stages
                    .iter()
                    .filter(|s| s.environment.as_deref() == Some(env.as_str()))
                    .collect();

                let gate_ok = self
                    .gate_for(env)
                    .map_or(true, |g| g.state == GateState::Approved);

                gate_ok
                    && !stages.is_empty()
                    && stages.iter().all(|s| s.outcome.is_succeeded())
                    && stages.iter().any(|s| s.step_succeeded(StepKind::Deploy))
                    && stages.iter().any(|s| s.step_succeeded(StepKind::SmokeTest))
            })
            .map(|env| Promotion {
                environment: env.clone(),
                commit: self.commit_sha.clone(),
            })
            .collect()
    }

    /// Seal the run; a finished run is left untouched
    pub fn finish(&mut self) -> RunOutcome {
        if let Some(outcome) = self.overall_outcome {
            return outcome;
        }

        let outcome = self.derive_outcome();
        self.finished_at = Some(Utc::now());
        if outcome == RunOutcome::Succeeded {
            self.promotions = self.earned_promotions();
        }
        self.overall_outcome = Some(outcome);
        outcome
    }

    /// Environments where a deploy step succeeded in this run
    pub fn deployed_environments(&self) -> Vec<&str> {
        let mut environments: Vec<&str> = self
            .stages
            .iter()
            .filter(|s| s.step_succeeded(StepKind::Deploy))
            .filter_map(|s| s.environment.as_deref())
            .collect();
        environments.dedup();
        environments
    }
}
