// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! In-memory state store

use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::Mutex;

use super::StateStore;
use crate::environment::KnownGood;
use crate::errors::DeployflowError;
use crate::pipeline::PipelineRun;
use crate::rollback::RollbackRecord;

#[derive(Debug, Default)]
struct Inner {
    runs: Vec<PipelineRun>,
    known_good: BTreeMap<String, KnownGood>,
    rollbacks: Vec<RollbackRecord>,
}

/// State store that lives as long as the process
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn save_run(&self, run: &PipelineRun) -> Result<(), DeployflowError> {
        let mut inner = self.inner.lock().await;
        match inner.runs.iter_mut().find(|r| r.id == run.id) {
            Some(existing) => *existing = run.clone(),
            None => inner.runs.push(run.clone()),
        }
        Ok(())
    }

    async fn load_run(&self, run_id: &str) -> Result<Option<PipelineRun>, DeployflowError> {
        let inner = self.inner.lock().await;
        Ok(inner.runs.iter().find(|r| r.id == run_id).cloned())
    }

    async fn list_runs(&self) -> Result<Vec<PipelineRun>, DeployflowError> {
        let mut runs = self.inner.lock().await.runs.clone();
        runs.sort_by_key(|r| r.created_at);
        Ok(runs)
    }

    async fn mark_promotions_applied(&self, run_id: &str) -> Result<(), DeployflowError> {
        let mut inner = self.inner.lock().await;
        let run = inner
            .runs
            .iter_mut()
            .find(|r| r.id == run_id)
            .ok_or_else(|| DeployflowError::StateError {
                message: format!("run '{}' not found", run_id),
            })?;
        run.promotions_applied = true;
        Ok(())
    }

    async fn known_good(&self, environment: &str) -> Result<Option<KnownGood>, DeployflowError> {
        Ok(self.inner.lock().await.known_good.get(environment).cloned())
    }

    async fn all_known_good(&self) -> Result<BTreeMap<String, KnownGood>, DeployflowError> {
        Ok(self.inner.lock().await.known_good.clone())
    }

    async fn record_known_good(
        &self,
        environment: &str,
        candidate: KnownGood,
    ) -> Result<bool, DeployflowError> {
        let mut inner = self.inner.lock().await;
        if let Some(current) = inner.known_good.get(environment) {
            if !candidate.supersedes(current) {
                return Ok(false);
            }
        }
        inner.known_good.insert(environment.to_string(), candidate);
        Ok(true)
    }

    async fn save_rollback(&self, record: &RollbackRecord) -> Result<(), DeployflowError> {
        self.inner.lock().await.rollbacks.push(record.clone());
        Ok(())
    }

    async fn list_rollbacks(
        &self,
        environment: Option<&str>,
    ) -> Result<Vec<RollbackRecord>, DeployflowError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .rollbacks
            .iter()
            .filter(|r| environment.map_or(true, |env| r.environment == env))
            .cloned()
            .collect())
    }
}
