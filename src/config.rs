// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! Per-user settings
//!
//! Read from `<config dir>/deployflow/config.toml`, then overridden by the
//! `DEPLOYFLOW_IDENTITY` and `DEPLOYFLOW_STATE_DIR` environment variables.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::DeployflowError;
use crate::pipeline::Pipeline;

/// Settings for the local user
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Name recorded as approver and rollback initiator
    pub identity: Option<String>,

    /// State directory, overriding the pipeline's `state.directory`
    pub state_dir: Option<PathBuf>,

    /// Gate timeout, overriding the pipeline's `gate.timeout_secs`
    pub gate_timeout_secs: Option<u64>,
}

impl Settings {
    /// Location of the user settings file, if the platform has one
    pub fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "deployflow").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load the settings file (if any) and apply environment overrides
    pub fn load() -> Result<Self, DeployflowError> {
        let settings = match Self::config_path() {
            Some(path) if path.exists() => {
                let content =
                    std::fs::read_to_string(&path).map_err(|e| DeployflowError::FileReadError {
                        path: path.clone(),
                        error: e.to_string(),
                    })?;
                tracing::debug!(path = %path.display(), "loaded user settings");
                Self::from_toml(&content)?
            }
            _ => Self::default(),
        };

        Ok(settings.with_overrides(
            std::env::var("DEPLOYFLOW_IDENTITY").ok(),
            std::env::var("DEPLOYFLOW_STATE_DIR").ok(),
        ))
    }

    pub fn from_toml(content: &str) -> Result<Self, DeployflowError> {
        Ok(toml::from_str(content)?)
    }

    /// Apply identity and state directory overrides; empty values are ignored
    pub fn with_overrides(mut self, identity: Option<String>, state_dir: Option<String>) -> Self {
        if let Some(identity) = identity.filter(|s| !s.trim().is_empty()) {
            self.identity = Some(identity);
        }
        if let Some(dir) = state_dir.filter(|s| !s.trim().is_empty()) {
            self.state_dir = Some(PathBuf::from(dir));
        }
        self
    }

    /// The configured identity, falling back to the login name
    pub fn identity(&self) -> String {
        self.identity
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .or_else(|| std::env::var("USERNAME").ok())
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// State directory for a pipeline loaded from `pipeline_path`
    ///
    /// Relative pipeline directories resolve against the pipeline file's
    /// directory.
    pub fn state_dir(&self, pipeline_path: &Path, pipeline: &Pipeline) -> PathBuf {
        if let Some(dir) = &self.state_dir {
            return dir.clone();
        }

        if pipeline.state.directory.is_absolute() {
            return pipeline.state.directory.clone();
        }

        pipeline_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(&pipeline.state.directory)
    }

    pub fn gate_timeout(&self, pipeline: &Pipeline) -> Duration {
        Duration::from_secs(self.gate_timeout_secs.unwrap_or(pipeline.gate.timeout_secs))
    }
}
