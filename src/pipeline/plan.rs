// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! Run construction
//!
//! Turning a pipeline and a trigger into a [`RunPlan`] is where every
//! configuration error surfaces. Nothing here talks to a collaborator, so a
//! bad pipeline fails before any side effect.

use std::collections::HashSet;

use crate::environment::{BranchRoute, EnvironmentSet};
use crate::errors::DeployflowError;
use crate::pipeline::{DagBuilder, Pipeline, PipelineValidator, Stage};

/// A trigger: a commit pushed to a branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub commit_sha: String,
    pub branch: String,
}

impl RunRequest {
    pub fn new(commit_sha: &str, branch: &str) -> Self {
        Self {
            commit_sha: commit_sha.to_string(),
            branch: branch.to_string(),
        }
    }
}

/// A validated, routed pipeline ready to execute
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub pipeline: Pipeline,
    pub request: RunRequest,
    pub route: BranchRoute,
    pub environments: EnvironmentSet,
    /// Stage indices in execution order
    order: Vec<usize>,
    /// Stages skipped because the branch targets another environment
    branch_skipped: HashSet<String>,
    /// Validation warnings
    pub warnings: Vec<String>,
}

impl RunPlan {
    /// Validate and route; fails with a configuration error
    pub fn build(pipeline: &Pipeline, request: RunRequest) -> Result<Self, DeployflowError> {
        let dag = DagBuilder::build(pipeline)?;
        let environments = EnvironmentSet::from_pipeline(pipeline)?;
        let order = dag.topological_order()?;
        let route = environments.route(&request.branch);

        // Order is topological, so dependencies are decided first
        let mut branch_skipped = HashSet::new();
        for &idx in &order {
            let stage = &pipeline.stages[idx];
            let mismatched = stage
                .environment
                .as_deref()
                .is_some_and(|env| !route.targets(env));
            let downstream = stage
                .depends_on
                .iter()
                .any(|dep| branch_skipped.contains(dep));

            if mismatched || downstream {
                branch_skipped.insert(stage.name.clone());
            }
        }

        // Duplicate producers are reported by the validator below
        if let Ok(producers) = PipelineValidator::artifact_producers(pipeline) {
            for stage in &pipeline.stages {
                if branch_skipped.contains(&stage.name) {
                    continue;
                }
                for artifact in stage.steps.iter().flat_map(|s| &s.reads) {
                    match producers.get(artifact.as_str()) {
                        None => {
                            return Err(DeployflowError::missing_artifact(
                                &stage.name,
                                artifact,
                                None,
                            ))
                        }
                        Some((producer, _)) if branch_skipped.contains(producer) => {
                            return Err(DeployflowError::missing_artifact(
                                &stage.name,
                                artifact,
                                Some(producer),
                            ))
                        }
                        Some(_) => {}
                    }
                }
            }
        }

        let warnings = PipelineValidator::validate(pipeline).into_result()?;

        tracing::debug!(
            pipeline = %pipeline.name,
            branch = %request.branch,
            route = %route,
            skipped = branch_skipped.len(),
            "run plan built"
        );

        Ok(Self {
            pipeline: pipeline.clone(),
            request,
            route,
            environments,
            order,
            branch_skipped,
            warnings,
        })
    }

    /// Stages in execution order
    pub fn stages(&self) -> impl Iterator<Item = &Stage> {
        self.order.iter().map(|&idx| &self.pipeline.stages[idx])
    }

    pub fn is_branch_skipped(&self, stage: &str) -> bool {
        self.branch_skipped.contains(stage)
    }

    /// Names of the stages this plan will attempt, in order
    pub fn runnable_stages(&self) -> Vec<&str> {
        self.stages()
            .filter(|s| !self.is_branch_skipped(&s.name))
            .map(|s| s.name.as_str())
            .collect()
    }

    /// Environments the run deploys to
    pub fn target_environments(&self) -> Vec<String> {
        self.route.environment().map(String::from).into_iter().collect()
    }
}
