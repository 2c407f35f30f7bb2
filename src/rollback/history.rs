// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! Commit history lookups

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;

use crate::errors::DeployflowError;

/// Answers how far apart two commits are
#[async_trait]
pub trait CommitHistory: Send + Sync {
    /// Number of commits reachable from `descendant` but not from `ancestor`
    async fn distance(&self, ancestor: &str, descendant: &str) -> Result<usize, DeployflowError>;
}

/// History read from a local git repository
#[derive(Debug, Clone)]
pub struct GitHistory {
    repo: PathBuf,
}

impl GitHistory {
    pub fn new(repo: &Path) -> Result<Self, DeployflowError> {
        which::which("git").map_err(|_| DeployflowError::tool_not_found("git"))?;
        Ok(Self {
            repo: repo.to_path_buf(),
        })
    }

    async fn git(&self, args: &[&str]) -> Result<std::process::Output, DeployflowError> {
        Command::new("git")
            .args(args)
            .current_dir(&self.repo)
            .output()
            .await
            .map_err(|e| DeployflowError::HistoryError {
                message: format!("failed to run git: {}", e),
            })
    }
}

#[async_trait]
impl CommitHistory for GitHistory {
    async fn distance(&self, ancestor: &str, descendant: &str) -> Result<usize, DeployflowError> {
        // Exit 1 means "not an ancestor"; anything else non-zero is a git error
        let check = self
            .git(&["merge-base", "--is-ancestor", ancestor, descendant])
            .await?;
        match check.status.code() {
            Some(0) => {}
            Some(1) => {
                return Err(DeployflowError::HistoryError {
                    message: format!("'{}' is not an ancestor of '{}'", ancestor, descendant),
                })
            }
            _ => {
                return Err(DeployflowError::HistoryError {
                    message: String::from_utf8_lossy(&check.stderr).trim().to_string(),
                })
            }
        }

        let range = format!("{}..{}", ancestor, descendant);
        let output = self.git(&["rev-list", "--count", &range]).await?;

        if !output.status.success() {
            return Err(DeployflowError::HistoryError {
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let count = String::from_utf8_lossy(&output.stdout);
        count
            .trim()
            .parse()
            .map_err(|_| DeployflowError::HistoryError {
                message: format!("unexpected git rev-list output: '{}'", count.trim()),
            })
    }
}

/// A single linear branch of commits, oldest first
#[derive(Debug, Clone, Default)]
pub struct LinearHistory {
    commits: Vec<String>,
}

impl LinearHistory {
    pub fn new<I, S>(commits: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            commits: commits.into_iter().map(Into::into).collect(),
        }
    }

    fn position(&self, commit: &str) -> Result<usize, DeployflowError> {
        self.commits
            .iter()
            .position(|c| c == commit)
            .ok_or_else(|| DeployflowError::HistoryError {
                message: format!("unknown commit '{}'", commit),
            })
    }
}

#[async_trait]
impl CommitHistory for LinearHistory {
    async fn distance(&self, ancestor: &str, descendant: &str) -> Result<usize, DeployflowError> {
        let from = self.position(ancestor)?;
        let to = self.position(descendant)?;
        to.checked_sub(from)
            .ok_or_else(|| DeployflowError::HistoryError {
                message: format!("'{}' is not an ancestor of '{}'", ancestor, descendant),
            })
    }
}
