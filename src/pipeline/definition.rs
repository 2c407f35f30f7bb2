// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! Pipeline definition structures
//!
//! Defines the schema for .deployflow.yaml files.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::errors::DeployflowError;

/// Pipeline definition from .deployflow.yaml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    /// Pipeline version (for future compatibility)
    #[serde(default = "default_version")]
    pub version: String,

    /// Pipeline name
    pub name: String,

    /// Pipeline description
    #[serde(default)]
    pub description: Option<String>,

    /// Approval gate settings
    #[serde(default)]
    pub gate: GateConfig,

    /// Durable state settings
    #[serde(default)]
    pub state: StateConfig,

    /// Named external collaborators referenced by steps
    #[serde(default)]
    pub collaborators: BTreeMap<String, CollaboratorConfig>,

    /// Deployment targets
    #[serde(default)]
    pub environments: Vec<EnvironmentConfig>,

    /// Stages, in declaration order
    pub stages: Vec<Stage>,
}

fn default_version() -> String {
    "1".to_string()
}

impl Pipeline {
    /// Load pipeline from a YAML or TOML file
    pub fn from_file(path: &Path) -> Result<Self, DeployflowError> {
        if !path.exists() {
            return Err(DeployflowError::PipelineNotFound {
                path: path.to_path_buf(),
            });
        }

        let content =
            std::fs::read_to_string(path).map_err(|e| DeployflowError::FileReadError {
                path: path.to_path_buf(),
                error: e.to_string(),
            })?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml(&content),
            _ => Self::from_yaml(&content),
        }
    }

    /// Parse pipeline from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, DeployflowError> {
        serde_yaml::from_str(yaml).map_err(Into::into)
    }

    /// Parse pipeline from TOML string
    pub fn from_toml(content: &str) -> Result<Self, DeployflowError> {
        toml::from_str(content).map_err(Into::into)
    }

    /// Serialize pipeline to YAML
    pub fn to_yaml(&self) -> Result<String, DeployflowError> {
        serde_yaml::to_string(self).map_err(Into::into)
    }

    /// Get a stage by name
    pub fn get_stage(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Get all stage names
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    /// Get an environment by name
    pub fn get_environment(&self, name: &str) -> Option<&EnvironmentConfig> {
        self.environments.iter().find(|e| e.name == name)
    }
}

/// A single pipeline stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    /// Stage name (must be unique within pipeline)
    pub name: String,

    /// Stage description
    #[serde(default)]
    pub description: Option<String>,

    /// Stage dependencies (other stage names)
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Environment this stage deploys to; the stage only runs when the
    /// run's branch promotes into it
    #[serde(default)]
    pub environment: Option<String>,

    /// Steps, executed strictly in order
    pub steps: Vec<Step>,
}

impl Stage {
    /// Whether any step of this stage is of the given kind
    pub fn has_step(&self, kind: StepKind) -> bool {
        self.steps.iter().any(|s| s.kind == kind)
    }
}

/// A single step: one call to an external collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// What the step does
    pub kind: StepKind,

    /// Name of the collaborator that performs it
    pub collaborator: String,

    /// Failure policy; required on scan steps, forbidden elsewhere
    #[serde(default)]
    pub policy: Option<ScanPolicy>,

    /// Lowest finding severity that fails a scan step
    #[serde(default)]
    pub fail_on: Option<Severity>,

    /// Name of the artifact this step produces
    #[serde(default)]
    pub produces: Option<String>,

    /// Artifacts this step reads
    #[serde(default)]
    pub reads: Vec<String>,
}

impl Step {
    /// Whether a failure of this step aborts its stage
    pub fn is_blocking(&self) -> bool {
        match self.policy {
            Some(ScanPolicy::Advisory) => false,
            Some(ScanPolicy::Blocking) | None => true,
        }
    }

    /// Severity threshold for scan steps
    pub fn fail_threshold(&self) -> Severity {
        self.fail_on.unwrap_or(Severity::High)
    }
}

/// Step kinds
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Build,
    Lint,
    Test,
    SecurityScanCode,
    BuildImage,
    ScanImage,
    Deploy,
    SmokeTest,
}

impl StepKind {
    /// Scan steps carry an explicit advisory/blocking policy
    pub fn is_scan(self) -> bool {
        matches!(self, Self::SecurityScanCode | Self::ScanImage)
    }

    /// Steps that act on an environment's cluster
    pub fn targets_environment(self) -> bool {
        matches!(self, Self::Deploy | Self::SmokeTest)
    }

    /// Steps that consume an image artifact
    pub fn needs_image(self) -> bool {
        matches!(self, Self::ScanImage | Self::Deploy)
    }

    /// Deploys and smoke tests act on an environment and leave nothing behind
    pub fn yields_artifact(self) -> bool {
        !self.targets_environment()
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Build => write!(f, "build"),
            Self::Lint => write!(f, "lint"),
            Self::Test => write!(f, "test"),
            Self::SecurityScanCode => write!(f, "security_scan_code"),
            Self::BuildImage => write!(f, "build_image"),
            Self::ScanImage => write!(f, "scan_image"),
            Self::Deploy => write!(f, "deploy"),
            Self::SmokeTest => write!(f, "smoke_test"),
        }
    }
}

/// Whether a failing scan blocks the run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScanPolicy {
    /// Failure is recorded but the stage continues
    Advisory,
    /// Failure aborts the stage
    Blocking,
}

/// Finding severity, ordered from least to most severe
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// A named collaborator backed by a shell command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaboratorConfig {
    /// Command to run
    pub command: String,

    /// Command run when a resource it created is released (provisioners)
    #[serde(default)]
    pub teardown: Option<String>,

    /// Shell to use (bash, sh, etc.)
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Extra environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_shell() -> String {
    "bash".to_string()
}

/// Deployment target configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// Environment name
    pub name: String,

    /// Branch whose runs deploy here (exact match)
    pub promotion_branch: String,

    /// Whether a human must approve deployment
    #[serde(default)]
    pub requires_gate: bool,

    /// Desired replica count
    #[serde(default = "default_replicas")]
    pub replicas: u32,

    /// Endpoints probed by smoke tests
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,

    /// Collaborator that provisions the cluster
    #[serde(default)]
    pub provisioner: Option<String>,
}

fn default_replicas() -> u32 {
    1
}

fn default_endpoints() -> Vec<String> {
    vec!["/".into(), "/health".into(), "/api/status".into()]
}

/// Approval gate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Seconds an open gate waits for a decision before expiring
    #[serde(default = "default_gate_timeout")]
    pub timeout_secs: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_gate_timeout(),
        }
    }
}

fn default_gate_timeout() -> u64 {
    3600
}

/// Durable state configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// State directory, relative to the pipeline file
    #[serde(default = "default_state_dir")]
    pub directory: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            directory: default_state_dir(),
        }
    }
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".deployflow/state")
}

#[cfg(test)]
mod tests {
    use super::*;

    const WEB_APP: &str = r#"
version: "1"
name: "web-app"
collaborators:
  pytest:
    command: "pytest --cov=app"
  docker:
    command: "docker build -t app:$DEPLOYFLOW_COMMIT ."
environments:
  - name: staging
    promotion_branch: develop
    replicas: 2
  - name: production
    promotion_branch: main
    requires_gate: true
    replicas: 3
stages:
  - name: test
    steps:
      - kind: test
        collaborator: pytest
        produces: coverage
  - name: image
    depends_on: [test]
    steps:
      - kind: build_image
        collaborator: docker
        produces: image
      - kind: scan_image
        collaborator: trivy
        policy: blocking
        fail_on: critical
        reads: [image]
  - name: deploy-staging
    depends_on: [image]
    environment: staging
    steps:
      - kind: deploy
        collaborator: kubectl
        reads: [image]
      - kind: smoke_test
        collaborator: curl
"#;

    #[test]
    fn test_parse_pipeline() {
        let pipeline = Pipeline::from_yaml(WEB_APP).unwrap();
        assert_eq!(pipeline.name, "web-app");
        assert_eq!(pipeline.stages.len(), 3);
        assert_eq!(pipeline.environments.len(), 2);
        assert_eq!(pipeline.gate.timeout_secs, 3600);

        let production = pipeline.get_environment("production").unwrap();
        assert!(production.requires_gate);
        assert_eq!(production.replicas, 3);
        assert_eq!(production.endpoints, vec!["/", "/health", "/api/status"]);
    }

    #[test]
    fn test_parse_scan_step() {
        let pipeline = Pipeline::from_yaml(WEB_APP).unwrap();
        let image = pipeline.get_stage("image").unwrap();
        let scan = &image.steps[1];

        assert_eq!(scan.kind, StepKind::ScanImage);
        assert_eq!(scan.policy, Some(ScanPolicy::Blocking));
        assert_eq!(scan.fail_threshold(), Severity::Critical);
        assert!(scan.is_blocking());
        assert_eq!(scan.reads, vec!["image"]);
    }

    #[test]
    fn test_advisory_step_is_not_blocking() {
        let step = Step {
            kind: StepKind::SecurityScanCode,
            collaborator: "bandit".into(),
            policy: Some(ScanPolicy::Advisory),
            fail_on: None,
            produces: None,
            reads: vec![],
        };
        assert!(!step.is_blocking());
        assert_eq!(step.fail_threshold(), Severity::High);
    }

    #[test]
    fn test_parse_toml_pipeline() {
        let content = r#"
name = "toml-app"

[[environments]]
name = "staging"
promotion_branch = "develop"

[[stages]]
name = "build"

[[stages.steps]]
kind = "build"
collaborator = "make"
"#;

        let pipeline = Pipeline::from_toml(content).unwrap();
        assert_eq!(pipeline.name, "toml-app");
        assert_eq!(pipeline.stages[0].steps[0].kind, StepKind::Build);
        assert_eq!(pipeline.environments[0].replicas, 1);
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::Low > Severity::None);
    }

    #[test]
    fn test_round_trip_yaml() {
        let pipeline = Pipeline::from_yaml(WEB_APP).unwrap();
        let yaml = pipeline.to_yaml().unwrap();
        let parsed = Pipeline::from_yaml(&yaml).unwrap();

        assert_eq!(parsed.name, pipeline.name);
        assert_eq!(parsed.stages.len(), pipeline.stages.len());
    }
}
