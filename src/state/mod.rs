// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! Durable state
//!
//! Runs, rollback records and each environment's last known-good commit
//! outlive the process. Everything else about a run is reconstructed from
//! the stored [`PipelineRun`].

mod filesystem;
mod memory;
pub mod promotion;

pub use filesystem::FilesystemStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::environment::KnownGood;
use crate::errors::DeployflowError;
use crate::pipeline::PipelineRun;
use crate::rollback::RollbackRecord;

/// Storage for runs, known-good commits and rollback records
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Persist a run, replacing any earlier copy with the same id
    async fn save_run(&self, run: &PipelineRun) -> Result<(), DeployflowError>;

    async fn load_run(&self, run_id: &str) -> Result<Option<PipelineRun>, DeployflowError>;

    /// All runs, oldest first
    async fn list_runs(&self) -> Result<Vec<PipelineRun>, DeployflowError>;

    /// Record that a run's promotions have been applied
    async fn mark_promotions_applied(&self, run_id: &str) -> Result<(), DeployflowError>;

    async fn known_good(&self, environment: &str) -> Result<Option<KnownGood>, DeployflowError>;

    /// Every environment with a known-good commit
    async fn all_known_good(&self) -> Result<BTreeMap<String, KnownGood>, DeployflowError>;

    /// Store `candidate` if it supersedes the current record
    ///
    /// The check and the write happen atomically. Returns whether the record
    /// changed.
    async fn record_known_good(
        &self,
        environment: &str,
        candidate: KnownGood,
    ) -> Result<bool, DeployflowError>;

    async fn save_rollback(&self, record: &RollbackRecord) -> Result<(), DeployflowError>;

    /// Rollback records, oldest first, optionally for one environment
    async fn list_rollbacks(
        &self,
        environment: Option<&str>,
    ) -> Result<Vec<RollbackRecord>, DeployflowError>;
}
