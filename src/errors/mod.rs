// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! Error types with actionable messages
//!
//! Configuration problems are reported before a run starts, so every
//! configuration variant carries enough context to fix the pipeline file
//! without re-running anything.

mod recovery;

pub use recovery::RecoverySuggestion;

use miette::Diagnostic;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for deployflow operations
pub type DeployflowResult<T> = Result<T, DeployflowError>;

/// Main error type for deployflow
#[derive(Error, Debug, Diagnostic)]
pub enum DeployflowError {
    // ─────────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Pipeline file not found: {path}")]
    #[diagnostic(
        code(deployflow::pipeline_not_found),
        help("Create a pipeline with 'deployflow init' or create .deployflow.yaml manually")
    )]
    PipelineNotFound { path: PathBuf },

    #[error("Invalid pipeline configuration: {reason}")]
    #[diagnostic(code(deployflow::invalid_pipeline))]
    InvalidPipeline {
        reason: String,
        #[help]
        help: Option<String>,
    },

    #[error("Stage '{stage}' is invalid: {reason}")]
    #[diagnostic(code(deployflow::invalid_stage))]
    InvalidStage { stage: String, reason: String },

    #[error("Stage '{stage}' is defined more than once")]
    #[diagnostic(
        code(deployflow::duplicate_stage),
        help("Stage names must be unique within a pipeline")
    )]
    DuplicateStage { stage: String },

    #[error("Circular dependency detected: {}", .stages.join(" -> "))]
    #[diagnostic(
        code(deployflow::circular_dependency),
        help("Review your stage dependencies to remove the cycle")
    )]
    CircularDependency { stages: Vec<String> },

    #[error("Stage '{stage}' depends on unknown stage '{dependency}'")]
    #[diagnostic(
        code(deployflow::unknown_dependency),
        help("Check that '{dependency}' is defined in your pipeline")
    )]
    UnknownDependency { stage: String, dependency: String },

    #[error("Branch '{branch}' promotes to both '{first}' and '{second}'")]
    #[diagnostic(
        code(deployflow::duplicate_promotion_branch),
        help("Each promotion branch may target exactly one environment")
    )]
    DuplicatePromotionBranch {
        branch: String,
        first: String,
        second: String,
    },

    #[error("Stage '{stage}' reads artifact '{artifact}' which is never produced in this run")]
    #[diagnostic(code(deployflow::missing_artifact))]
    MissingArtifact {
        stage: String,
        artifact: String,
        #[help]
        help: Option<String>,
    },

    #[error("Environment '{environment}' is not defined")]
    #[diagnostic(code(deployflow::unknown_environment))]
    UnknownEnvironment { environment: String },

    #[error("Collaborator '{collaborator}' is not defined")]
    #[diagnostic(
        code(deployflow::unknown_collaborator),
        help("Add '{collaborator}' under 'collaborators:' in the pipeline file")
    )]
    UnknownCollaborator { collaborator: String },

    #[error("Stage '{stage}' not found in pipeline")]
    #[diagnostic(code(deployflow::stage_not_found))]
    StageNotFound { stage: String },

    // ─────────────────────────────────────────────────────────────────────────
    // Collaborator Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Tool '{tool}' not found")]
    #[diagnostic(code(deployflow::tool_not_found), help("{suggestion}"))]
    ToolNotFound { tool: String, suggestion: String },

    #[error("Collaborator '{collaborator}' failed: {error}")]
    #[diagnostic(code(deployflow::collaborator_failed))]
    CollaboratorFailed {
        collaborator: String,
        error: String,
        #[help]
        help: Option<String>,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Gate Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("An approval gate for '{environment}' is already open in run {run_id}")]
    #[diagnostic(
        code(deployflow::gate_conflict),
        help("Decide the open gate before requesting another one")
    )]
    GateConflict { run_id: String, environment: String },

    #[error("Gate {gate_id} not found")]
    #[diagnostic(code(deployflow::gate_not_found))]
    GateNotFound { gate_id: String },

    #[error("Gate {gate_id} is already {state} and cannot be decided again")]
    #[diagnostic(code(deployflow::invalid_gate_state))]
    InvalidGateState { gate_id: String, state: String },

    #[error("Rejecting gate {gate_id} requires a reason")]
    #[diagnostic(code(deployflow::rejection_reason_required))]
    RejectionReasonRequired { gate_id: String },

    // ─────────────────────────────────────────────────────────────────────────
    // Rollback Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Emergency reset of '{environment}' requires explicit confirmation")]
    #[diagnostic(
        code(deployflow::confirmation_required),
        help("Emergency reset rewrites branch history. Re-run with --confirm once the listed people have been notified")
    )]
    DestructiveActionRequiresConfirmation { environment: String },

    #[error("Environment '{environment}' has no known-good commit")]
    #[diagnostic(
        code(deployflow::no_known_good),
        help("Pass an explicit target commit with --to")
    )]
    NoKnownGoodCommit { environment: String },

    #[error("Environment '{environment}' is already at {commit}; nothing to roll back")]
    #[diagnostic(code(deployflow::nothing_to_roll_back))]
    NothingToRollBack { environment: String, commit: String },

    #[error("Commit history lookup failed: {message}")]
    #[diagnostic(code(deployflow::history_error))]
    HistoryError { message: String },

    // ─────────────────────────────────────────────────────────────────────────
    // State Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("State error: {message}")]
    #[diagnostic(code(deployflow::state_error))]
    StateError { message: String },

    #[error("State file '{path}' failed its integrity check")]
    #[diagnostic(
        code(deployflow::state_corrupted),
        help("The file was modified or only partially written. Restore it or delete it and re-run 'deployflow reconcile'")
    )]
    StateCorrupted { path: PathBuf },

    // ─────────────────────────────────────────────────────────────────────────
    // IO/System Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Failed to read file '{path}': {error}")]
    #[diagnostic(code(deployflow::file_read_error))]
    FileReadError { path: PathBuf, error: String },

    #[error("Failed to write file '{path}': {error}")]
    #[diagnostic(code(deployflow::file_write_error))]
    FileWriteError { path: PathBuf, error: String },

    #[error("IO error: {message}")]
    #[diagnostic(code(deployflow::io_error))]
    Io { message: String },

    #[error("YAML parsing error: {message}")]
    #[diagnostic(code(deployflow::yaml_error))]
    Yaml { message: String },

    #[error("JSON parsing error: {message}")]
    #[diagnostic(code(deployflow::json_error))]
    Json { message: String },

    #[error("TOML parsing error: {message}")]
    #[diagnostic(code(deployflow::toml_error))]
    Toml { message: String },
}

impl From<std::io::Error> for DeployflowError {
    fn from(e: std::io::Error) -> Self {
        Self::Io { message: e.to_string() }
    }
}

impl From<serde_yaml::Error> for DeployflowError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Yaml { message: e.to_string() }
    }
}

impl From<serde_json::Error> for DeployflowError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json { message: e.to_string() }
    }
}

impl From<toml::de::Error> for DeployflowError {
    fn from(e: toml::de::Error) -> Self {
        Self::Toml { message: e.to_string() }
    }
}

impl DeployflowError {
    /// Create a tool not found error with installation suggestion
    pub fn tool_not_found(tool: &str) -> Self {
        let suggestion = match tool {
            "git" => "Install git: https://git-scm.com/downloads".to_string(),
            "bash" | "sh" => format!("A POSIX shell ('{}') is required to run collaborators", tool),
            _ => format!("Install {} and ensure it's in your PATH", tool),
        };

        Self::ToolNotFound {
            tool: tool.to_string(),
            suggestion,
        }
    }

    /// Create a missing artifact error explaining why the producer never runs
    pub fn missing_artifact(stage: &str, artifact: &str, producer: Option<&str>) -> Self {
        let help = match producer {
            Some(producer) => Some(format!(
                "'{}' is produced by stage '{}', which is skipped for this branch",
                artifact, producer
            )),
            None => Some(format!(
                "Add 'produces: {}' to a step in a stage that '{}' depends on",
                artifact, stage
            )),
        };

        Self::MissingArtifact {
            stage: stage.to_string(),
            artifact: artifact.to_string(),
            help,
        }
    }

    /// Whether this error was raised while constructing a run, before any
    /// collaborator could have been invoked
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::PipelineNotFound { .. }
                | Self::InvalidPipeline { .. }
                | Self::InvalidStage { .. }
                | Self::DuplicateStage { .. }
                | Self::CircularDependency { .. }
                | Self::UnknownDependency { .. }
                | Self::DuplicatePromotionBranch { .. }
                | Self::MissingArtifact { .. }
                | Self::UnknownEnvironment { .. }
                | Self::UnknownCollaborator { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_errors_are_classified() {
        let cycle = DeployflowError::CircularDependency {
            stages: vec!["a".into(), "b".into(), "a".into()],
        };
        assert!(cycle.is_configuration_error());
        assert_eq!(cycle.to_string(), "Circular dependency detected: a -> b -> a");

        let conflict = DeployflowError::GateConflict {
            run_id: "r1".into(),
            environment: "production".into(),
        };
        assert!(!conflict.is_configuration_error());
    }

    #[test]
    fn test_missing_artifact_help_names_producer() {
        let err = DeployflowError::missing_artifact("smoke", "image", Some("package"));
        match err {
            DeployflowError::MissingArtifact { help: Some(help), .. } => {
                assert!(help.contains("package"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
