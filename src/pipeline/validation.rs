// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! Pipeline validation
//!
//! Validates pipeline configuration before any run is constructed.

use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use crate::errors::DeployflowError;
use crate::pipeline::{DagBuilder, Pipeline, Stage, StepKind};

/// Environment names become namespace names on the target cluster.
fn dns_label() -> &'static Regex {
    static DNS_LABEL: OnceLock<Regex> = OnceLock::new();
    DNS_LABEL.get_or_init(|| {
        Regex::new(r"^[a-z0-9]([-a-z0-9]{0,61}[a-z0-9])?$").expect("valid DNS label pattern")
    })
}

/// Pipeline validator
pub struct PipelineValidator;

impl PipelineValidator {
    /// Validate a pipeline configuration
    pub fn validate(pipeline: &Pipeline) -> ValidationResult {
        let mut result = ValidationResult::new();

        if pipeline.stages.is_empty() {
            result.add_error("Pipeline has no stages defined");
        }

        let mut seen_names = HashSet::new();
        for stage in &pipeline.stages {
            if !seen_names.insert(&stage.name) {
                result.add_error(&format!("Duplicate stage name: '{}'", stage.name));
            }
        }

        Self::validate_environments(pipeline, &mut result);

        for stage in &pipeline.stages {
            Self::validate_stage(stage, pipeline, &mut result);
        }

        // Artifact and deploy ordering checks need a sound graph
        match DagBuilder::build(pipeline) {
            Ok(dag) => Self::validate_data_flow(pipeline, &dag, &mut result),
            Err(DeployflowError::CircularDependency { stages }) => {
                result.add_error(&format!("Circular dependency: {}", stages.join(" → ")));
            }
            Err(DeployflowError::UnknownDependency { stage, dependency }) => {
                result.add_error(&format!(
                    "Stage '{}' depends on unknown stage '{}'",
                    stage, dependency
                ));
            }
            Err(DeployflowError::DuplicateStage { .. }) => {}
            Err(e) => {
                result.add_error(&format!("DAG validation error: {}", e));
            }
        }

        result
    }

    /// Validate environment definitions
    fn validate_environments(pipeline: &Pipeline, result: &mut ValidationResult) {
        let mut names = HashSet::new();
        let mut branches: HashMap<&str, &str> = HashMap::new();

        for env in &pipeline.environments {
            if !names.insert(env.name.as_str()) {
                result.add_error(&format!("Duplicate environment name: '{}'", env.name));
            }

            if !dns_label().is_match(&env.name) {
                result.add_error(&format!(
                    "Environment '{}': name must be a lowercase DNS label",
                    env.name
                ));
            }

            if env.promotion_branch.is_empty() {
                result.add_error(&format!(
                    "Environment '{}': promotion branch is empty",
                    env.name
                ));
            } else if let Some(first) = branches.insert(&env.promotion_branch, &env.name) {
                result.add_error(&format!(
                    "Branch '{}' promotes to both '{}' and '{}'",
                    env.promotion_branch, first, env.name
                ));
            }

            if env.replicas == 0 {
                result.add_error(&format!(
                    "Environment '{}': replica count must be positive",
                    env.name
                ));
            }

            if let Some(ref provisioner) = env.provisioner {
                Self::check_collaborator(pipeline, &env.name, provisioner, result);
            }

            if !pipeline
                .stages
                .iter()
                .any(|s| s.environment.as_deref() == Some(env.name.as_str()))
            {
                result.add_warning(&format!(
                    "Environment '{}' has no stage deploying to it",
                    env.name
                ));
            }
        }
    }

    /// Validate a single stage
    fn validate_stage(stage: &Stage, pipeline: &Pipeline, result: &mut ValidationResult) {
        if stage.steps.is_empty() {
            result.add_error(&format!("Stage '{}': no steps defined", stage.name));
        }

        match stage.environment {
            Some(ref env) if pipeline.get_environment(env).is_none() => {
                result.add_error(&format!(
                    "Stage '{}': unknown environment '{}'",
                    stage.name, env
                ));
            }
            Some(ref env) => {
                if stage.has_step(StepKind::Deploy) && !stage.has_step(StepKind::SmokeTest) {
                    result.add_warning(&format!(
                        "Stage '{}': deploys to '{}' without a smoke test; \
                         its known-good commit will never advance",
                        stage.name, env
                    ));
                }
            }
            None => {}
        }

        for step in &stage.steps {
            let label = format!("Stage '{}' step '{}'", stage.name, step.kind);

            Self::check_collaborator(pipeline, &stage.name, &step.collaborator, result);

            if step.kind.targets_environment() && stage.environment.is_none() {
                result.add_error(&format!("{}: requires the stage to name an environment", label));
            }

            match (step.kind.is_scan(), step.policy) {
                (true, None) => result.add_error(&format!(
                    "{}: scan steps must declare 'policy: advisory' or 'policy: blocking'",
                    label
                )),
                (false, Some(_)) => result.add_error(&format!(
                    "{}: only scan steps take a policy; failures here always block",
                    label
                )),
                _ => {}
            }

            if step.fail_on.is_some() && !step.kind.is_scan() {
                result.add_warning(&format!("{}: 'fail_on' is ignored on non-scan steps", label));
            }

            if step.kind == StepKind::BuildImage && step.produces.is_none() {
                result.add_error(&format!("{}: must declare the image it produces", label));
            }

            if step.kind.needs_image() && step.reads.len() != 1 {
                result.add_error(&format!("{}: must read exactly one image artifact", label));
            }

            if step.produces.is_some() && !step.kind.yields_artifact() {
                result.add_error(&format!(
                    "{}: this step kind never produces an artifact",
                    label
                ));
            }
        }
    }

    fn check_collaborator(
        pipeline: &Pipeline,
        owner: &str,
        collaborator: &str,
        result: &mut ValidationResult,
    ) {
        if collaborator.is_empty() {
            result.add_error(&format!("'{}': collaborator reference is empty", owner));
        } else if pipeline.collaborators.is_empty() {
            // Collaborators may be supplied programmatically
        } else if !pipeline.collaborators.contains_key(collaborator) {
            result.add_error(&format!(
                "'{}': unknown collaborator '{}'",
                owner, collaborator
            ));
        }
    }

    /// Check artifact producers/readers and deploy-before-smoke ordering
    fn validate_data_flow(pipeline: &Pipeline, dag: &DagBuilder, result: &mut ValidationResult) {
        let producers = match Self::artifact_producers(pipeline) {
            Ok(producers) => producers,
            Err(duplicates) => {
                for (artifact, first, second) in duplicates {
                    result.add_error(&format!(
                        "Artifact '{}' is produced by both '{}' and '{}'",
                        artifact, first, second
                    ));
                }
                return;
            }
        };

        for stage in &pipeline.stages {
            for (step_idx, step) in stage.steps.iter().enumerate() {
                for artifact in &step.reads {
                    match producers.get(artifact.as_str()) {
                        None => result.add_error(&format!(
                            "Stage '{}': reads unknown artifact '{}'",
                            stage.name, artifact
                        )),
                        Some((producer, producer_step)) => {
                            if step.kind.needs_image()
                                && Self::producer_kind(pipeline, producer, *producer_step)
                                    != Some(StepKind::BuildImage)
                            {
                                result.add_error(&format!(
                                    "Stage '{}' step '{}': artifact '{}' is not an image; \
                                     only build_image steps produce images",
                                    stage.name, step.kind, artifact
                                ));
                            }

                            let visible = if *producer == stage.name {
                                *producer_step < step_idx
                            } else {
                                dag.depends_on(&stage.name, producer)
                            };
                            if !visible {
                                result.add_error(&format!(
                                    "Stage '{}': reads artifact '{}' from '{}' which does not run before it",
                                    stage.name, artifact, producer
                                ));
                            }
                        }
                    }
                }

                if step.kind == StepKind::SmokeTest {
                    if let Some(ref env) = stage.environment {
                        if !Self::deploy_precedes(pipeline, dag, stage, step_idx, env) {
                            result.add_error(&format!(
                                "Stage '{}': smoke test runs before anything deploys to '{}'",
                                stage.name, env
                            ));
                        }
                    }
                }
            }
        }
    }

    /// Map artifact name to producing (stage, step index)
    #[allow(clippy::type_complexity)]
    pub(crate) fn artifact_producers(
        pipeline: &Pipeline,
    ) -> Result<HashMap<&str, (String, usize)>, Vec<(String, String, String)>> {
        let mut producers: HashMap<&str, (String, usize)> = HashMap::new();
        let mut duplicates = Vec::new();

        for stage in &pipeline.stages {
            for (idx, step) in stage.steps.iter().enumerate() {
                let Some(ref artifact) = step.produces else {
                    continue;
                };
                if let Some((first, _)) = producers.get(artifact.as_str()) {
                    duplicates.push((artifact.clone(), first.clone(), stage.name.clone()));
                } else {
                    producers.insert(artifact.as_str(), (stage.name.clone(), idx));
                }
            }
        }

        if duplicates.is_empty() {
            Ok(producers)
        } else {
            Err(duplicates)
        }
    }

    fn producer_kind(pipeline: &Pipeline, stage: &str, step_idx: usize) -> Option<StepKind> {
        pipeline
            .stages
            .iter()
            .find(|s| s.name == stage)
            .and_then(|s| s.steps.get(step_idx))
            .map(|s| s.kind)
    }

    fn deploy_precedes(
        pipeline: &Pipeline,
        dag: &DagBuilder,
        stage: &Stage,
        step_idx: usize,
        env: &str,
    ) -> bool {
        if stage.steps[..step_idx]
            .iter()
            .any(|s| s.kind == StepKind::Deploy)
        {
            return true;
        }

        pipeline.stages.iter().any(|other| {
            other.environment.as_deref() == Some(env)
                && other.has_step(StepKind::Deploy)
                && dag.depends_on(&stage.name, &other.name)
        })
    }
}

/// Result of pipeline validation
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, message: &str) {
        self.errors.push(message.to_string());
    }

    pub fn add_warning(&mut self, message: &str) {
        self.warnings.push(message.to_string());
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    /// Collapse errors into a single configuration error
    pub fn into_result(self) -> Result<Vec<String>, DeployflowError> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(DeployflowError::InvalidPipeline {
                reason: self.errors.join("; "),
                help: Some("Run 'deployflow validate' for the full report".into()),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validate(yaml: &str) -> ValidationResult {
        let pipeline = Pipeline::from_yaml(yaml).unwrap();
        PipelineValidator::validate(&pipeline)
    }

    #[test]
    fn test_validate_empty_pipeline() {
        let result = validate("name: empty\nstages: []\n");
        assert!(!result.is_valid());
        assert!(result.errors[0].contains("no stages"));
    }

    #[test]
    fn test_validate_duplicate_names() {
        let result = validate(
            r#"
name: dup
stages:
  - name: build
    steps: [{ kind: build, collaborator: make }]
  - name: build
    steps: [{ kind: test, collaborator: make }]
"#,
        );
        assert!(!result.is_valid());
        assert!(result.errors.iter().any(|e| e.contains("Duplicate stage")));
    }

    #[test]
    fn test_duplicate_promotion_branch() {
        let result = validate(
            r#"
name: envs
environments:
  - { name: staging, promotion_branch: main }
  - { name: production, promotion_branch: main }
stages:
  - name: build
    steps: [{ kind: build, collaborator: make }]
"#,
        );
        assert!(result
            .errors
            .iter()
            .any(|e| e.contains("promotes to both 'staging' and 'production'")));
    }

    #[test]
    fn test_environment_name_and_replicas() {
        let result = validate(
            r#"
name: envs
environments:
  - { name: Prod_EU, promotion_branch: main, replicas: 0 }
stages:
  - name: build
    steps: [{ kind: build, collaborator: make }]
"#,
        );
        assert!(result.errors.iter().any(|e| e.contains("DNS label")));
        assert!(result.errors.iter().any(|e| e.contains("replica count")));
    }

    #[test]
    fn test_scan_policy_must_be_declared() {
        let result = validate(
            r#"
name: scans
stages:
  - name: scan
    steps:
      - { kind: security_scan_code, collaborator: bandit }
      - { kind: lint, collaborator: flake8, policy: advisory }
"#,
        );
        assert_eq!(result.errors.len(), 2);
        assert!(result.errors[0].contains("must declare 'policy"));
        assert!(result.errors[1].contains("only scan steps"));
    }

    #[test]
    fn test_deploy_requires_environment_stage() {
        let result = validate(
            r#"
name: deploy
stages:
  - name: image
    steps:
      - { kind: build_image, collaborator: docker, produces: image }
      - { kind: deploy, collaborator: kubectl, reads: [image] }
"#,
        );
        assert!(result
            .errors
            .iter()
            .any(|e| e.contains("requires the stage to name an environment")));
    }

    #[test]
    fn test_artifact_must_come_from_upstream() {
        let result = validate(
            r#"
name: artifacts
environments:
  - { name: staging, promotion_branch: develop }
stages:
  - name: image
    steps:
      - { kind: build_image, collaborator: docker, produces: image }
  - name: deploy
    environment: staging
    steps:
      - { kind: deploy, collaborator: kubectl, reads: [image] }
      - { kind: smoke_test, collaborator: curl }
"#,
        );
        assert!(result
            .errors
            .iter()
            .any(|e| e.contains("does not run before it")));
    }

    #[test]
    fn test_deploy_must_read_an_image() {
        let result = validate(
            r#"
name: images
environments:
  - { name: staging, promotion_branch: develop }
stages:
  - name: test
    steps:
      - { kind: test, collaborator: pytest, produces: coverage }
  - name: deploy
    depends_on: [test]
    environment: staging
    steps:
      - { kind: deploy, collaborator: kubectl, reads: [coverage] }
      - { kind: smoke_test, collaborator: curl, produces: smoke-log }
"#,
        );
        assert!(result
            .errors
            .iter()
            .any(|e| e.contains("artifact 'coverage' is not an image")));
        assert!(result
            .errors
            .iter()
            .any(|e| e.contains("'smoke_test': this step kind never produces")));
    }

    #[test]
    fn test_smoke_test_needs_prior_deploy() {
        let result = validate(
            r#"
name: smoke
environments:
  - { name: staging, promotion_branch: develop }
stages:
  - name: smoke
    environment: staging
    steps:
      - { kind: smoke_test, collaborator: curl }
"#,
        );
        assert!(result
            .errors
            .iter()
            .any(|e| e.contains("smoke test runs before anything deploys")));
    }

    #[test]
    fn test_unknown_collaborator() {
        let result = validate(
            r#"
name: collab
collaborators:
  make: { command: "make" }
stages:
  - name: build
    steps: [{ kind: build, collaborator: cargo }]
"#,
        );
        assert!(result.errors.iter().any(|e| e.contains("unknown collaborator 'cargo'")));
    }

    #[test]
    fn test_deploy_without_smoke_warns() {
        let result = validate(
            r#"
name: warn
environments:
  - { name: staging, promotion_branch: develop }
stages:
  - name: image
    steps:
      - { kind: build_image, collaborator: docker, produces: image }
  - name: deploy
    depends_on: [image]
    environment: staging
    steps:
      - { kind: deploy, collaborator: kubectl, reads: [image] }
"#,
        );
        assert!(result.is_valid());
        assert!(result.warnings.iter().any(|w| w.contains("never advance")));
    }

    #[test]
    fn test_into_result_collapses_errors() {
        let result = validate("name: empty\nstages: []\n");
        let err = result.into_result().unwrap_err();
        assert!(err.is_configuration_error());
    }
}
