// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! Rollback advisor
//!
//! Targets are ephemeral and keep no deployment history, so rolling back
//! means running the pipeline again at an earlier commit. The advisor picks
//! a strategy, renders the git action an operator performs, and describes
//! the run that re-enters the pipeline. It never deploys anything itself.

mod history;

pub use history::{CommitHistory, GitHistory, LinearHistory};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::environment::Environment;
use crate::errors::DeployflowError;
use crate::pipeline::{PipelineRun, RunRequest};
use crate::state::StateStore;

/// How to get an environment back to a good commit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStrategy {
    /// Push an inverse commit of the single bad commit
    Revert,
    /// Re-run the pipeline at the last known-good commit
    RedeployPrevious,
    /// Rewrite the promotion branch back to a good commit
    EmergencyReset,
}

impl std::fmt::Display for RollbackStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Revert => write!(f, "revert"),
            Self::RedeployPrevious => write!(f, "redeploy-previous"),
            Self::EmergencyReset => write!(f, "emergency-reset"),
        }
    }
}

/// Durable record of an operator-initiated rollback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackRecord {
    pub id: String,
    pub environment: String,
    pub from_commit: String,
    pub to_commit: String,
    pub strategy: RollbackStrategy,
    pub initiated_by: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub reason: Option<String>,
    /// Identities told about the rollback
    #[serde(default)]
    pub notified: Vec<String>,
}

/// What the operator asks for
#[derive(Debug, Clone, Default)]
pub struct RollbackRequest {
    /// Commit currently deployed and considered bad
    pub bad_commit: String,
    /// Commit to return to; the last known-good commit when absent
    pub target: Option<String>,
    pub critical: bool,
    pub initiated_by: String,
    pub reason: Option<String>,
    pub notify: Vec<String>,
}

/// Git action the operator performs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackAction {
    RevertCommit { commit: String, branch: String },
    CreateBranch { name: String, commit: String },
    ResetBranch { branch: String, commit: String },
}

impl RollbackAction {
    /// Shell commands that carry out the action
    pub fn commands(&self) -> Vec<String> {
        match self {
            Self::RevertCommit { commit, branch } => vec![
                format!("git checkout {}", branch),
                format!("git revert --no-edit {}", commit),
                format!("git push origin {}", branch),
            ],
            Self::CreateBranch { name, commit } => vec![
                format!("git branch {} {}", name, commit),
                format!("git push origin {}", name),
            ],
            Self::ResetBranch { branch, commit } => vec![
                format!("git checkout {}", branch),
                format!("git reset --hard {}", commit),
                format!("git push --force-with-lease origin {}", branch),
            ],
        }
    }
}

/// A recommendation, not yet initiated
#[derive(Debug, Clone)]
pub struct RollbackPlan {
    pub record: RollbackRecord,
    pub action: RollbackAction,
    /// Run that redeploys the good commit; a revert is redeployed by the
    /// run its pushed commit triggers
    pub next_run: Option<RunRequest>,
    pub rationale: String,
}

fn short(commit: &str) -> &str {
    commit.get(..8).unwrap_or(commit)
}

/// Chooses rollback strategies
pub struct RollbackAdvisor {
    history: Arc<dyn CommitHistory>,
}

impl RollbackAdvisor {
    pub fn new(history: Arc<dyn CommitHistory>) -> Self {
        Self { history }
    }

    /// Recommend how to roll `environment` back
    pub async fn recommend(
        &self,
        environment: &Environment,
        request: &RollbackRequest,
    ) -> Result<RollbackPlan, DeployflowError> {
        let target = request
            .target
            .clone()
            .or_else(|| environment.last_known_good_commit().map(String::from))
            .ok_or_else(|| DeployflowError::NoKnownGoodCommit {
                environment: environment.name.clone(),
            })?;
        let bad = request.bad_commit.clone();

        let nothing_to_do = || DeployflowError::NothingToRollBack {
            environment: environment.name.clone(),
            commit: target.clone(),
        };
        if bad == target {
            return Err(nothing_to_do());
        }

        let branch = environment.promotion_branch.clone();
        let (strategy, action, next_run, rationale) = if request.critical {
            (
                RollbackStrategy::EmergencyReset,
                RollbackAction::ResetBranch {
                    branch: branch.clone(),
                    commit: target.clone(),
                },
                Some(RunRequest::new(&target, &branch)),
                format!(
                    "flagged critical: reset '{}' to {} and redeploy",
                    branch,
                    short(&target)
                ),
            )
        } else {
            match self.history.distance(&target, &bad).await? {
                0 => return Err(nothing_to_do()),
                1 => (
                    RollbackStrategy::Revert,
                    RollbackAction::RevertCommit {
                        commit: bad.clone(),
                        branch: branch.clone(),
                    },
                    None,
                    format!(
                        "{} is the only commit since {}; revert it and let the pipeline redeploy",
                        short(&bad),
                        short(&target)
                    ),
                ),
                n => (
                    RollbackStrategy::RedeployPrevious,
                    RollbackAction::CreateBranch {
                        name: format!("rollback/{}-{}", environment.name, short(&target)),
                        commit: target.clone(),
                    },
                    Some(RunRequest::new(&target, &branch)),
                    format!(
                        "{} commits separate {} from {}; redeploy the known-good commit",
                        n,
                        short(&target),
                        short(&bad)
                    ),
                ),
            }
        };

        tracing::info!(
            environment = %environment.name,
            from = %bad,
            to = %target,
            strategy = %strategy,
            "rollback recommended"
        );

        Ok(RollbackPlan {
            record: RollbackRecord {
                id: uuid::Uuid::new_v4().to_string(),
                environment: environment.name.clone(),
                from_commit: bad,
                to_commit: target,
                strategy,
                initiated_by: request.initiated_by.clone(),
                timestamp: Utc::now(),
                reason: request.reason.clone(),
                notified: request.notify.clone(),
            },
            action,
            next_run,
            rationale,
        })
    }

    /// Record an operator's decision to carry out a plan
    ///
    /// An emergency reset is refused without confirmation, before anything
    /// is written.
    pub async fn initiate(
        &self,
        plan: &RollbackPlan,
        confirmed: bool,
        store: &dyn StateStore,
    ) -> Result<RollbackRecord, DeployflowError> {
        let record = &plan.record;

        if record.strategy == RollbackStrategy::EmergencyReset {
            if !confirmed {
                return Err(DeployflowError::DestructiveActionRequiresConfirmation {
                    environment: record.environment.clone(),
                });
            }

            tracing::warn!(
                environment = %record.environment,
                to = %record.to_commit,
                initiated_by = %record.initiated_by,
                notified = ?record.notified,
                "emergency reset initiated; branch history will be rewritten"
            );
            if record.notified.is_empty() {
                tracing::warn!(environment = %record.environment, "emergency reset notified nobody");
            }
        }

        store.save_rollback(record).await?;
        tracing::info!(
            rollback_id = %record.id,
            environment = %record.environment,
            strategy = %record.strategy,
            "rollback recorded"
        );
        Ok(record.clone())
    }
}

/// Commit most recently deployed to `environment` by any run
///
/// `runs` must be ordered oldest first.
pub fn current_deployment(runs: &[PipelineRun], environment: &str) -> Option<String> {
    runs.iter()
        .rev()
        .find(|run| run.deployed_environments().contains(&environment))
        .map(|run| run.commit_sha.clone())
}
