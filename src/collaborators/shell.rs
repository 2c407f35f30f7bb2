// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! Shell-backed collaborators
//!
//! Every named collaborator in the pipeline file is a shell command. The
//! command receives its context through `DEPLOYFLOW_*` environment variables
//! and reports back through its exit code and stdout.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::process::Command;

use super::{
    ApplyOutcome, BuildReport, BuildRunner, ClusterHandle, ClusterProvisioner, CodeScanner,
    Finding, ImageBuilder, ImageRef, ImageScanner, Invocation, ManifestApplier, ScanReport,
    SmokeTester,
};
use crate::environment::Environment;
use crate::errors::DeployflowError;
use crate::pipeline::{ArtifactValue, CollaboratorConfig, Pipeline, Severity};

/// Captured result of one command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration: Duration,
}

impl CommandOutput {
    /// Last non-empty line of stdout
    pub fn last_line(&self) -> Option<&str> {
        self.stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .last()
    }

    /// Short human-readable summary
    pub fn summary(&self) -> String {
        let tail = if self.success {
            self.last_line()
        } else {
            self.stderr
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .last()
                .or_else(|| self.last_line())
        };

        match tail {
            Some(line) => line.to_string(),
            None if self.success => "ok".to_string(),
            None => format!("exited with code {}", self.exit_code),
        }
    }
}

/// Runs collaborators as shell commands
#[derive(Debug, Clone)]
pub struct ShellCollaborators {
    collaborators: BTreeMap<String, CollaboratorConfig>,
    working_dir: PathBuf,
}

impl ShellCollaborators {
    pub fn new(collaborators: BTreeMap<String, CollaboratorConfig>, working_dir: &Path) -> Self {
        Self {
            collaborators,
            working_dir: working_dir.to_path_buf(),
        }
    }

    /// Use the collaborators declared in a pipeline file
    pub fn from_pipeline(pipeline: &Pipeline, working_dir: &Path) -> Self {
        Self::new(pipeline.collaborators.clone(), working_dir)
    }

    fn config(&self, name: &str) -> Result<&CollaboratorConfig, DeployflowError> {
        self.collaborators
            .get(name)
            .ok_or_else(|| DeployflowError::UnknownCollaborator {
                collaborator: name.to_string(),
            })
    }

    /// Tools referenced by collaborator commands that are not on PATH
    pub fn check_tools(&self) -> Vec<String> {
        let mut missing = Vec::new();

        for config in self.collaborators.values() {
            let program = config
                .command
                .split_whitespace()
                .next()
                .filter(|p| !p.contains(['$', '=', '/', '(']));

            for tool in [Some(config.shell.as_str()), program].into_iter().flatten() {
                if which::which(tool).is_err() && !missing.iter().any(|m| m == tool) {
                    missing.push(tool.to_string());
                }
            }
        }

        missing
    }

    async fn invoke(
        &self,
        invocation: &Invocation,
        extra_env: &[(&str, String)],
    ) -> Result<CommandOutput, DeployflowError> {
        let config = self.config(&invocation.collaborator)?;
        self.run_command(
            &invocation.collaborator,
            &config.command,
            config,
            invocation,
            extra_env,
        )
        .await
    }

    async fn run_command(
        &self,
        name: &str,
        command: &str,
        config: &CollaboratorConfig,
        invocation: &Invocation,
        extra_env: &[(&str, String)],
    ) -> Result<CommandOutput, DeployflowError> {
        let start = Instant::now();

        let mut env: HashMap<String, String> = HashMap::new();
        env.insert("DEPLOYFLOW_RUN_ID".into(), invocation.run_id.clone());
        env.insert("DEPLOYFLOW_STAGE".into(), invocation.stage.clone());
        env.insert("DEPLOYFLOW_STEP".into(), invocation.kind.to_string());
        env.insert("DEPLOYFLOW_COMMIT".into(), invocation.commit.clone());
        env.insert("DEPLOYFLOW_BRANCH".into(), invocation.branch.clone());
        if let Some(environment) = &invocation.environment {
            env.insert("DEPLOYFLOW_ENVIRONMENT".into(), environment.clone());
        }
        for (name, value) in &invocation.artifacts {
            env.insert(artifact_var(name), artifact_value(value));
        }
        for (key, value) in extra_env {
            env.insert(key.to_string(), value.clone());
        }

        let mut cmd = Command::new(&config.shell);
        cmd.arg("-c").arg(command);
        cmd.current_dir(&self.working_dir);
        cmd.envs(&config.env);
        cmd.envs(env);

        tracing::debug!(
            collaborator = name,
            stage = %invocation.stage,
            step = %invocation.kind,
            "invoking collaborator"
        );

        let output = cmd
            .output()
            .await
            .map_err(|e| DeployflowError::CollaboratorFailed {
                collaborator: name.to_string(),
                error: e.to_string(),
                help: Some(format!("Shell '{}' may not be available", config.shell)),
            })?;

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
            duration: start.elapsed(),
        })
    }

    fn failed(name: &str, output: &CommandOutput) -> DeployflowError {
        DeployflowError::CollaboratorFailed {
            collaborator: name.to_string(),
            error: output.summary(),
            help: None,
        }
    }
}

/// `DEPLOYFLOW_ARTIFACT_<NAME>`, with the name upper-cased and anything
/// outside `[A-Z0-9]` replaced by `_`
fn artifact_var(name: &str) -> String {
    let name: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("DEPLOYFLOW_ARTIFACT_{}", name)
}

/// Images are passed by reference, reports by content
fn artifact_value(value: &ArtifactValue) -> String {
    match value {
        ArtifactValue::Image(image) => image.0.clone(),
        ArtifactValue::Report(content) => content.clone(),
    }
}

/// Interpret scanner output: a JSON report on stdout wins, otherwise the exit
/// code decides between a clean report and a single high finding
fn scan_report(collaborator: &str, output: &CommandOutput) -> ScanReport {
    if let Ok(mut report) = serde_json::from_str::<ScanReport>(output.stdout.trim()) {
        let worst = report
            .findings
            .iter()
            .map(|f| f.severity)
            .max()
            .unwrap_or_default();
        report.severity = report.severity.max(worst);
        return report;
    }

    if output.success {
        ScanReport::clean()
    } else {
        ScanReport::from_findings(vec![Finding {
            id: collaborator.to_string(),
            severity: Severity::High,
            description: output.summary(),
        }])
    }
}

#[async_trait]
impl BuildRunner for ShellCollaborators {
    async fn run(&self, invocation: &Invocation) -> Result<BuildReport, DeployflowError> {
        let output = self.invoke(invocation, &[]).await?;
        let stdout = output.stdout.trim();

        Ok(BuildReport {
            passed: output.success,
            summary: output.summary(),
            artifact: (!stdout.is_empty()).then(|| stdout.to_string()),
        })
    }
}

#[async_trait]
impl CodeScanner for ShellCollaborators {
    async fn scan(&self, invocation: &Invocation) -> Result<ScanReport, DeployflowError> {
        let output = self.invoke(invocation, &[]).await?;
        Ok(scan_report(&invocation.collaborator, &output))
    }
}

#[async_trait]
impl ImageBuilder for ShellCollaborators {
    async fn build(&self, invocation: &Invocation) -> Result<ImageRef, DeployflowError> {
        let output = self.invoke(invocation, &[]).await?;
        if !output.success {
            return Err(Self::failed(&invocation.collaborator, &output));
        }

        output
            .last_line()
            .map(|line| ImageRef(line.to_string()))
            .ok_or_else(|| DeployflowError::CollaboratorFailed {
                collaborator: invocation.collaborator.clone(),
                error: "image builder printed no image reference".to_string(),
                help: Some("Print the built image reference as the last line of stdout".into()),
            })
    }
}

#[async_trait]
impl ImageScanner for ShellCollaborators {
    async fn scan(
        &self,
        invocation: &Invocation,
        image: &ImageRef,
    ) -> Result<ScanReport, DeployflowError> {
        let output = self
            .invoke(invocation, &[("DEPLOYFLOW_IMAGE", image.0.clone())])
            .await?;
        Ok(scan_report(&invocation.collaborator, &output))
    }
}

#[async_trait]
impl ClusterProvisioner for ShellCollaborators {
    async fn provision(
        &self,
        invocation: &Invocation,
        environment: &Environment,
    ) -> Result<ClusterHandle, DeployflowError> {
        let default_id = format!("{}-{}", environment.name, invocation.run_id);

        // Without a provisioner the applier targets the environment directly
        let Some(name) = &environment.provisioner else {
            return Ok(ClusterHandle {
                environment: environment.name.clone(),
                id: default_id,
            });
        };

        let invocation = Invocation {
            collaborator: name.clone(),
            ..invocation.clone()
        };
        let output = self
            .invoke(
                &invocation,
                &[("DEPLOYFLOW_REPLICAS", environment.replicas.to_string())],
            )
            .await?;
        if !output.success {
            return Err(Self::failed(name, &output));
        }

        Ok(ClusterHandle {
            environment: environment.name.clone(),
            id: output
                .last_line()
                .map(str::to_string)
                .unwrap_or(default_id),
        })
    }

    async fn teardown(
        &self,
        invocation: &Invocation,
        cluster: &ClusterHandle,
    ) -> Result<(), DeployflowError> {
        let Ok(config) = self.config(&invocation.collaborator) else {
            return Ok(());
        };
        let Some(teardown) = &config.teardown else {
            return Ok(());
        };

        let output = self
            .run_command(
                &invocation.collaborator,
                teardown,
                config,
                invocation,
                &[("DEPLOYFLOW_CLUSTER", cluster.id.clone())],
            )
            .await?;
        if output.success {
            Ok(())
        } else {
            Err(Self::failed(&invocation.collaborator, &output))
        }
    }
}

#[async_trait]
impl ManifestApplier for ShellCollaborators {
    async fn apply(
        &self,
        invocation: &Invocation,
        cluster: &ClusterHandle,
        image: &ImageRef,
        replicas: u32,
    ) -> Result<ApplyOutcome, DeployflowError> {
        let output = self
            .invoke(
                invocation,
                &[
                    ("DEPLOYFLOW_CLUSTER", cluster.id.clone()),
                    ("DEPLOYFLOW_IMAGE", image.0.clone()),
                    ("DEPLOYFLOW_REPLICAS", replicas.to_string()),
                ],
            )
            .await?;

        Ok(ApplyOutcome {
            deployed: output.success,
            message: output.summary(),
        })
    }
}

#[async_trait]
impl SmokeTester for ShellCollaborators {
    async fn probe(
        &self,
        invocation: &Invocation,
        cluster: &ClusterHandle,
        endpoints: &[String],
    ) -> Result<bool, DeployflowError> {
        let output = self
            .invoke(
                invocation,
                &[
                    ("DEPLOYFLOW_CLUSTER", cluster.id.clone()),
                    ("DEPLOYFLOW_ENDPOINTS", endpoints.join(" ")),
                ],
            )
            .await?;
        Ok(output.success)
    }
}
