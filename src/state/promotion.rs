// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! Known-good promotion
//!
//! The only code path that advances an environment's last known-good
//! commit. A finished run is saved first and its promotions applied
//! afterwards; if the process dies in between, [`reconcile`] applies them
//! on the next start. Applying is monotonic and idempotent, so running it
//! any number of times converges on the same state.

use chrono::Utc;

use super::StateStore;
use crate::environment::KnownGood;
use crate::errors::DeployflowError;
use crate::pipeline::{PipelineRun, RunOutcome};

/// Apply a finished run's promotions; returns the environments advanced
pub async fn apply_promotions(
    store: &dyn StateStore,
    run: &PipelineRun,
) -> Result<Vec<String>, DeployflowError> {
    if run.overall_outcome != Some(RunOutcome::Succeeded) {
        return Ok(Vec::new());
    }

    let run_finished_at = run.finished_at.ok_or_else(|| DeployflowError::StateError {
        message: format!("run '{}' succeeded but has no finish time", run.id),
    })?;

    let mut advanced = Vec::new();
    for promotion in &run.promotions {
        let candidate = KnownGood {
            commit: promotion.commit.clone(),
            run_id: run.id.clone(),
            run_finished_at,
            recorded_at: Utc::now(),
        };

        if store
            .record_known_good(&promotion.environment, candidate)
            .await?
        {
            tracing::info!(
                environment = %promotion.environment,
                commit = %promotion.commit,
                run_id = %run.id,
                "advanced last known-good commit"
            );
            advanced.push(promotion.environment.clone());
        } else {
            tracing::debug!(
                environment = %promotion.environment,
                run_id = %run.id,
                "known-good already at or past this run"
            );
        }
    }

    store.mark_promotions_applied(&run.id).await?;
    Ok(advanced)
}

/// Result of a reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Runs whose promotions were pending
    pub runs_applied: Vec<String>,
    /// Environments whose known-good advanced
    pub environments_advanced: Vec<String>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.runs_applied.is_empty()
    }
}

/// Apply every pending promotion of succeeded runs, oldest run first
pub async fn reconcile(store: &dyn StateStore) -> Result<ReconcileReport, DeployflowError> {
    let mut report = ReconcileReport::default();

    for run in store.list_runs().await? {
        if run.promotions_applied || run.overall_outcome != Some(RunOutcome::Succeeded) {
            continue;
        }

        tracing::info!(run_id = %run.id, "applying promotions left pending by an earlier process");
        let advanced = apply_promotions(store, &run).await?;
        report.runs_applied.push(run.id.clone());
        for environment in advanced {
            if !report.environments_advanced.contains(&environment) {
                report.environments_advanced.push(environment);
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::BranchRoute;
    use crate::pipeline::{ArtifactStore, Promotion};
    use crate::state::MemoryStore;
    use chrono::Duration;

    fn succeeded_run(id: &str, commit: &str, finished_offset_secs: i64) -> PipelineRun {
        let finished = Utc::now() + Duration::seconds(finished_offset_secs);
        PipelineRun {
            id: id.into(),
            pipeline: "web-app".into(),
            commit_sha: commit.into(),
            branch: "develop".into(),
            route: BranchRoute::Promote {
                environment: "staging".into(),
            },
            target_environments: vec!["staging".into()],
            stages: vec![],
            gates: vec![],
            artifacts: ArtifactStore::default(),
            cancelled: false,
            created_at: finished,
            finished_at: Some(finished),
            overall_outcome: Some(RunOutcome::Succeeded),
            promotions: vec![Promotion {
                environment: "staging".into(),
                commit: commit.into(),
            }],
            promotions_applied: false,
        }
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let store = MemoryStore::new();
        let run = succeeded_run("run-1", "c1", 0);
        store.save_run(&run).await.unwrap();

        let first = apply_promotions(&store, &run).await.unwrap();
        let second = apply_promotions(&store, &run).await.unwrap();

        assert_eq!(first, vec!["staging"]);
        assert!(second.is_empty());
        let known_good = store.known_good("staging").await.unwrap().unwrap();
        assert_eq!(known_good.commit, "c1");
        assert_eq!(known_good.run_id, "run-1");
    }

    #[tokio::test]
    async fn test_failed_run_never_promotes() {
        let store = MemoryStore::new();
        let mut run = succeeded_run("run-1", "c1", 0);
        run.overall_outcome = Some(RunOutcome::Failed);
        store.save_run(&run).await.unwrap();

        assert!(apply_promotions(&store, &run).await.unwrap().is_empty());
        assert!(store.known_good("staging").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_older_run_does_not_regress() {
        let store = MemoryStore::new();
        let newer = succeeded_run("run-2", "c2", 10);
        let older = succeeded_run("run-1", "c1", 0);
        store.save_run(&newer).await.unwrap();
        store.save_run(&older).await.unwrap();

        apply_promotions(&store, &newer).await.unwrap();
        apply_promotions(&store, &older).await.unwrap();

        assert_eq!(
            store.known_good("staging").await.unwrap().unwrap().commit,
            "c2"
        );
    }

    #[tokio::test]
    async fn test_reconcile_after_crash() {
        let store = MemoryStore::new();
        // Saved but never promoted, as if the process died in between
        store.save_run(&succeeded_run("run-1", "c1", 0)).await.unwrap();
        store.save_run(&succeeded_run("run-2", "c2", 5)).await.unwrap();

        let report = reconcile(&store).await.unwrap();
        assert_eq!(report.runs_applied, vec!["run-1", "run-2"]);
        assert_eq!(report.environments_advanced, vec!["staging"]);
        assert_eq!(
            store.known_good("staging").await.unwrap().unwrap().commit,
            "c2"
        );

        // A second pass finds nothing to do and changes nothing
        let before = store.known_good("staging").await.unwrap();
        let again = reconcile(&store).await.unwrap();
        assert!(again.is_empty());
        assert_eq!(store.known_good("staging").await.unwrap(), before);
    }
}
