// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! Deployment environments and branch routing
//!
//! A run's branch selects at most one environment. Routing is a pure
//! function over the configured environments; nothing else in the engine
//! inspects branch names.

mod lock;

pub use lock::{DeployGuard, DeployLocks};
pub(crate) use lock::lock_file;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::errors::DeployflowError;
use crate::pipeline::{EnvironmentConfig, Pipeline};
use crate::state::StateStore;

/// The most recent commit fully deployed (gate included) to an environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownGood {
    /// Deployed commit
    pub commit: String,
    /// Run that deployed it
    pub run_id: String,
    /// When the run finished; orders competing promotions
    pub run_finished_at: DateTime<Utc>,
    /// When the promotion was recorded
    pub recorded_at: DateTime<Utc>,
}

impl KnownGood {
    /// Whether this record should replace `current`
    ///
    /// Later-finishing runs win; re-applying the same run is a no-op.
    pub fn supersedes(&self, current: &KnownGood) -> bool {
        self.run_id != current.run_id && self.run_finished_at >= current.run_finished_at
    }
}

/// A deployment target
#[derive(Debug, Clone)]
pub struct Environment {
    pub name: String,
    pub promotion_branch: String,
    pub requires_gate: bool,
    pub replicas: u32,
    pub endpoints: Vec<String>,
    pub provisioner: Option<String>,
    /// Only advanced through [`crate::state::promotion::apply_promotions`]
    pub last_known_good: Option<KnownGood>,
}

impl Environment {
    pub fn from_config(config: &EnvironmentConfig) -> Self {
        Self {
            name: config.name.clone(),
            promotion_branch: config.promotion_branch.clone(),
            requires_gate: config.requires_gate,
            replicas: config.replicas,
            endpoints: config.endpoints.clone(),
            provisioner: config.provisioner.clone(),
            last_known_good: None,
        }
    }

    /// Commit of the last known-good deployment, if any
    pub fn last_known_good_commit(&self) -> Option<&str> {
        self.last_known_good.as_ref().map(|k| k.commit.as_str())
    }
}

/// Where a run's branch sends it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BranchRoute {
    /// No environment matches; build, test and scan only
    PullRequest,
    /// The branch promotes into this environment
    Promote { environment: String },
}

impl BranchRoute {
    /// Environment targeted by this route
    pub fn environment(&self) -> Option<&str> {
        match self {
            Self::PullRequest => None,
            Self::Promote { environment } => Some(environment),
        }
    }

    /// Whether stages bound to `environment` run on this route
    pub fn targets(&self, environment: &str) -> bool {
        self.environment() == Some(environment)
    }
}

impl std::fmt::Display for BranchRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PullRequest => write!(f, "no environment (build and scan only)"),
            Self::Promote { environment } => write!(f, "promote to {}", environment),
        }
    }
}

/// The configured environments of a pipeline, keyed by name
#[derive(Debug, Clone, Default)]
pub struct EnvironmentSet {
    environments: BTreeMap<String, Environment>,
    by_branch: BTreeMap<String, String>,
}

impl EnvironmentSet {
    /// Build from configuration, rejecting ambiguous promotion branches
    pub fn new(configs: &[EnvironmentConfig]) -> Result<Self, DeployflowError> {
        let mut set = Self::default();

        for config in configs {
            if let Some(first) = set.by_branch.get(&config.promotion_branch) {
                return Err(DeployflowError::DuplicatePromotionBranch {
                    branch: config.promotion_branch.clone(),
                    first: first.clone(),
                    second: config.name.clone(),
                });
            }
            if config.replicas == 0 {
                return Err(DeployflowError::InvalidPipeline {
                    reason: format!("environment '{}' has zero replicas", config.name),
                    help: Some("Set 'replicas' to a positive number".into()),
                });
            }
            set.by_branch
                .insert(config.promotion_branch.clone(), config.name.clone());
            set.environments
                .insert(config.name.clone(), Environment::from_config(config));
        }

        Ok(set)
    }

    pub fn from_pipeline(pipeline: &Pipeline) -> Result<Self, DeployflowError> {
        Self::new(&pipeline.environments)
    }

    /// Fill in last known-good commits from durable state
    pub async fn with_known_good(mut self, store: &dyn StateStore) -> Result<Self, DeployflowError> {
        for env in self.environments.values_mut() {
            env.last_known_good = store.known_good(&env.name).await?;
        }
        Ok(self)
    }

    /// Route a branch to its environment (exact match)
    pub fn route(&self, branch: &str) -> BranchRoute {
        match self.by_branch.get(branch) {
            Some(environment) => BranchRoute::Promote {
                environment: environment.clone(),
            },
            None => BranchRoute::PullRequest,
        }
    }

    pub fn get(&self, name: &str) -> Option<&Environment> {
        self.environments.get(name)
    }

    /// Look up an environment or fail with `UnknownEnvironment`
    pub fn require(&self, name: &str) -> Result<&Environment, DeployflowError> {
        self.get(name).ok_or_else(|| DeployflowError::UnknownEnvironment {
            environment: name.to_string(),
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Environment> {
        self.environments.values()
    }

    pub fn len(&self) -> usize {
        self.environments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.environments.is_empty()
    }
}
