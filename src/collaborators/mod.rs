// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! External collaborators
//!
//! Every step calls exactly one collaborator and gets back a typed outcome.
//! The engine never looks inside a collaborator: build toolchains, image
//! builders, scanners, provisioners, manifest appliers and smoke testers are
//! all reached through the traits below.

mod shell;
#[cfg(test)]
pub(crate) mod testing;

pub use shell::{CommandOutput, ShellCollaborators};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::environment::Environment;
use crate::errors::DeployflowError;
use crate::pipeline::{ArtifactValue, Severity, StepKind};

/// Context passed with every collaborator call
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Opaque collaborator reference from the step
    pub collaborator: String,
    pub run_id: String,
    pub stage: String,
    pub kind: StepKind,
    pub commit: String,
    pub branch: String,
    pub environment: Option<String>,
    /// Artifacts the step declared in `reads`, by name
    pub artifacts: BTreeMap<String, ArtifactValue>,
}

/// Outcome of a build, lint or test call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildReport {
    pub passed: bool,
    pub summary: String,
    /// Report content (coverage, lint output) kept as an artifact
    pub artifact: Option<String>,
}

/// A single scanner finding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub id: String,
    pub severity: Severity,
    #[serde(default)]
    pub description: String,
}

/// Outcome of a code or image scan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    #[serde(default)]
    pub findings: Vec<Finding>,
    /// Highest severity reported
    #[serde(default)]
    pub severity: Severity,
}

impl ScanReport {
    pub fn clean() -> Self {
        Self::default()
    }

    /// Build a report whose overall severity is the worst finding's
    pub fn from_findings(findings: Vec<Finding>) -> Self {
        let severity = findings
            .iter()
            .map(|f| f.severity)
            .max()
            .unwrap_or_default();
        Self { findings, severity }
    }

    /// Whether this report fails a step with the given threshold
    pub fn blocks_at(&self, threshold: Severity) -> bool {
        self.severity != Severity::None && self.severity >= threshold
    }

    pub fn summary(&self) -> String {
        if self.findings.is_empty() && self.severity == Severity::None {
            "no findings".to_string()
        } else {
            format!(
                "{} finding{} (highest: {})",
                self.findings.len(),
                if self.findings.len() == 1 { "" } else { "s" },
                self.severity
            )
        }
    }
}

/// Identifier of a built image
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageRef(pub String);

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle to an ephemeral cluster, valid until torn down at run end
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterHandle {
    pub environment: String,
    pub id: String,
}

/// Outcome of applying manifests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub deployed: bool,
    pub message: String,
}

/// Runs builds, linters and test suites
#[async_trait]
pub trait BuildRunner: Send + Sync {
    async fn run(&self, invocation: &Invocation) -> Result<BuildReport, DeployflowError>;
}

/// Scans source code for vulnerabilities
#[async_trait]
pub trait CodeScanner: Send + Sync {
    async fn scan(&self, invocation: &Invocation) -> Result<ScanReport, DeployflowError>;
}

/// Builds container images
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    async fn build(&self, invocation: &Invocation) -> Result<ImageRef, DeployflowError>;
}

/// Scans built images
#[async_trait]
pub trait ImageScanner: Send + Sync {
    async fn scan(
        &self,
        invocation: &Invocation,
        image: &ImageRef,
    ) -> Result<ScanReport, DeployflowError>;
}

/// Creates and destroys ephemeral clusters
#[async_trait]
pub trait ClusterProvisioner: Send + Sync {
    async fn provision(
        &self,
        invocation: &Invocation,
        environment: &Environment,
    ) -> Result<ClusterHandle, DeployflowError>;

    async fn teardown(
        &self,
        invocation: &Invocation,
        cluster: &ClusterHandle,
    ) -> Result<(), DeployflowError>;
}

/// Applies deployment manifests to a cluster
#[async_trait]
pub trait ManifestApplier: Send + Sync {
    async fn apply(
        &self,
        invocation: &Invocation,
        cluster: &ClusterHandle,
        image: &ImageRef,
        replicas: u32,
    ) -> Result<ApplyOutcome, DeployflowError>;
}

/// Probes deployed endpoints
#[async_trait]
pub trait SmokeTester: Send + Sync {
    /// Returns whether every endpoint is healthy
    async fn probe(
        &self,
        invocation: &Invocation,
        cluster: &ClusterHandle,
        endpoints: &[String],
    ) -> Result<bool, DeployflowError>;
}

/// The full set of collaborators a run needs
#[derive(Clone)]
pub struct Collaborators {
    pub builds: Arc<dyn BuildRunner>,
    pub code_scanner: Arc<dyn CodeScanner>,
    pub image_builder: Arc<dyn ImageBuilder>,
    pub image_scanner: Arc<dyn ImageScanner>,
    pub provisioner: Arc<dyn ClusterProvisioner>,
    pub applier: Arc<dyn ManifestApplier>,
    pub smoke_tester: Arc<dyn SmokeTester>,
}

impl Collaborators {
    /// Use one implementation for every role
    pub fn uniform<T>(collaborator: Arc<T>) -> Self
    where
        T: BuildRunner
            + CodeScanner
            + ImageBuilder
            + ImageScanner
            + ClusterProvisioner
            + ManifestApplier
            + SmokeTester
            + 'static,
    {
        Self {
            builds: collaborator.clone(),
            code_scanner: collaborator.clone(),
            image_builder: collaborator.clone(),
            image_scanner: collaborator.clone(),
            provisioner: collaborator.clone(),
            applier: collaborator.clone(),
            smoke_tester: collaborator,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_report_threshold() {
        let report = ScanReport::from_findings(vec![
            Finding {
                id: "CVE-1".into(),
                severity: Severity::Medium,
                description: String::new(),
            },
            Finding {
                id: "CVE-2".into(),
                severity: Severity::High,
                description: String::new(),
            },
        ]);

        assert_eq!(report.severity, Severity::High);
        assert!(report.blocks_at(Severity::High));
        assert!(report.blocks_at(Severity::Low));
        assert!(!report.blocks_at(Severity::Critical));
        assert_eq!(report.summary(), "2 findings (highest: high)");
    }

    #[test]
    fn test_clean_report_never_blocks() {
        let report = ScanReport::clean();
        assert!(!report.blocks_at(Severity::None));
        assert_eq!(report.summary(), "no findings");
    }
}
