// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! Filesystem-based state store
//!
//! Stores each record as a JSON file under the state directory:
//!
//! ```text
//! runs/<run id>.json
//! environments/<environment>.json
//! rollbacks/<timestamp>-<id>.json
//! ```
//!
//! Files are wrapped in an envelope carrying a BLAKE3 checksum of the
//! payload and are written to a temporary file first, then renamed into
//! place, so readers never observe a partial write.
//!
//! Updating a known-good record also holds `environments/<environment>.lock`,
//! so processes sharing the directory never interleave the check and the
//! write.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use super::StateStore;
use crate::environment::{lock_file, KnownGood};
use crate::errors::DeployflowError;
use crate::pipeline::PipelineRun;
use crate::rollback::RollbackRecord;

/// On-disk wrapper for every record
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    checksum: String,
    payload: serde_json::Value,
}

fn checksum(payload: &serde_json::Value) -> Result<String, DeployflowError> {
    let bytes = serde_json::to_vec(payload)?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

/// Filesystem-based state store
pub struct FilesystemStore {
    root: PathBuf,
    /// Serializes read-modify-write cycles within this process
    write_lock: Mutex<()>,
}

impl FilesystemStore {
    /// Open (creating if needed) a store rooted at `root`
    pub fn new(root: PathBuf) -> Result<Self, DeployflowError> {
        for dir in ["runs", "environments", "rollbacks"] {
            let path = root.join(dir);
            std::fs::create_dir_all(&path).map_err(|e| DeployflowError::StateError {
                message: format!("Failed to create state directory {}: {}", path.display(), e),
            })?;
        }

        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_path(&self, run_id: &str) -> PathBuf {
        self.root.join("runs").join(format!("{}.json", run_id))
    }

    fn environment_path(&self, environment: &str) -> PathBuf {
        self.root
            .join("environments")
            .join(format!("{}.json", environment))
    }

    fn environment_lock_path(&self, environment: &str) -> PathBuf {
        self.root
            .join("environments")
            .join(format!("{}.lock", environment))
    }

    async fn write<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), DeployflowError> {
        let payload = serde_json::to_value(value)?;
        let envelope = Envelope {
            checksum: checksum(&payload)?,
            payload,
        };
        let json = serde_json::to_string_pretty(&envelope)?;

        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| DeployflowError::FileWriteError {
                path: tmp.clone(),
                error: e.to_string(),
            })?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| DeployflowError::FileWriteError {
                path: path.to_path_buf(),
                error: e.to_string(),
            })?;

        tracing::debug!(path = %path.display(), "state written");
        Ok(())
    }

    async fn read<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>, DeployflowError> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(DeployflowError::FileReadError {
                    path: path.to_path_buf(),
                    error: e.to_string(),
                })
            }
        };

        let corrupted = || DeployflowError::StateCorrupted {
            path: path.to_path_buf(),
        };

        let envelope: Envelope = serde_json::from_str(&content).map_err(|_| corrupted())?;
        if checksum(&envelope.payload)? != envelope.checksum {
            return Err(corrupted());
        }

        serde_json::from_value(envelope.payload)
            .map(Some)
            .map_err(|_| corrupted())
    }

    /// Read every record in a subdirectory, skipping unreadable files
    async fn read_all<T: DeserializeOwned>(&self, dir: &str) -> Result<Vec<T>, DeployflowError> {
        let dir = self.root.join(dir);
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| DeployflowError::StateError {
                message: format!("Failed to read state directory {}: {}", dir.display(), e),
            })?;

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut records = Vec::new();
        for path in paths {
            match self.read(&path).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping state file"),
            }
        }

        Ok(records)
    }
}

#[async_trait]
impl StateStore for FilesystemStore {
    async fn save_run(&self, run: &PipelineRun) -> Result<(), DeployflowError> {
        let _guard = self.write_lock.lock().await;
        self.write(&self.run_path(&run.id), run).await
    }

    async fn load_run(&self, run_id: &str) -> Result<Option<PipelineRun>, DeployflowError> {
        self.read(&self.run_path(run_id)).await
    }

    async fn list_runs(&self) -> Result<Vec<PipelineRun>, DeployflowError> {
        let mut runs: Vec<PipelineRun> = self.read_all("runs").await?;
        runs.sort_by_key(|r| r.created_at);
        Ok(runs)
    }

    async fn mark_promotions_applied(&self, run_id: &str) -> Result<(), DeployflowError> {
        let _guard = self.write_lock.lock().await;
        let path = self.run_path(run_id);

        let mut run: PipelineRun =
            self.read(&path)
                .await?
                .ok_or_else(|| DeployflowError::StateError {
                    message: format!("run '{}' not found", run_id),
                })?;
        run.promotions_applied = true;
        self.write(&path, &run).await
    }

    async fn known_good(&self, environment: &str) -> Result<Option<KnownGood>, DeployflowError> {
        self.read(&self.environment_path(environment)).await
    }

    async fn all_known_good(&self) -> Result<BTreeMap<String, KnownGood>, DeployflowError> {
        let dir = self.root.join("environments");
        let mut entries = tokio::fs::read_dir(&dir).await?;
        let mut known_good = BTreeMap::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(environment) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Some(record) = self.read::<KnownGood>(&path).await? {
                known_good.insert(environment.to_string(), record);
            }
        }

        Ok(known_good)
    }

    async fn record_known_good(
        &self,
        environment: &str,
        candidate: KnownGood,
    ) -> Result<bool, DeployflowError> {
        let _guard = self.write_lock.lock().await;
        let _file = lock_file(&self.environment_lock_path(environment)).await?;
        let path = self.environment_path(environment);

        if let Some(current) = self.read::<KnownGood>(&path).await? {
            if !candidate.supersedes(&current) {
                return Ok(false);
            }
        }

        self.write(&path, &candidate).await?;
        Ok(true)
    }

    async fn save_rollback(&self, record: &RollbackRecord) -> Result<(), DeployflowError> {
        let _guard = self.write_lock.lock().await;
        let path = self.root.join("rollbacks").join(format!(
            "{}-{}.json",
            record.timestamp.format("%Y%m%dT%H%M%S%.3fZ"),
            record.id
        ));
        self.write(&path, record).await
    }

    async fn list_rollbacks(
        &self,
        environment: Option<&str>,
    ) -> Result<Vec<RollbackRecord>, DeployflowError> {
        let records: Vec<RollbackRecord> = self.read_all("rollbacks").await?;
        Ok(records
            .into_iter()
            .filter(|r| environment.map_or(true, |env| r.environment == env))
            .collect())
    }
}
