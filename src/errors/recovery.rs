// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! Error recovery suggestions
//!
//! Provides actionable suggestions for recovering from errors.

use super::DeployflowError;

/// A recovery suggestion with concrete steps
#[derive(Debug, Clone)]
pub struct RecoverySuggestion {
    /// Brief description of what to do
    pub action: String,
    /// Detailed steps
    pub steps: Vec<String>,
    /// Commands to run
    pub commands: Vec<String>,
}

impl RecoverySuggestion {
    /// Pick a suggestion for an error, if one applies
    pub fn for_error(error: &DeployflowError) -> Option<Self> {
        match error {
            DeployflowError::CircularDependency { stages } => {
                Some(Self::fix_circular_dependency(stages))
            }
            DeployflowError::DuplicatePromotionBranch {
                branch,
                first,
                second,
            } => Some(Self::fix_duplicate_promotion_branch(branch, first, second)),
            DeployflowError::MissingArtifact {
                stage, artifact, ..
            } => Some(Self::fix_missing_artifact(stage, artifact)),
            DeployflowError::PipelineNotFound { .. } => Some(Self::create_pipeline()),
            DeployflowError::DestructiveActionRequiresConfirmation { environment } => {
                Some(Self::confirm_emergency_reset(environment))
            }
            DeployflowError::StateCorrupted { .. } => Some(Self::repair_state()),
            _ => None,
        }
    }

    /// Suggest fixing a circular dependency
    pub fn fix_circular_dependency(stages: &[String]) -> Self {
        Self {
            action: "Remove circular dependency".into(),
            steps: vec![
                format!("Detected cycle: {}", stages.join(" → ")),
                "Review your stage dependencies".into(),
                "Ensure stages form a directed acyclic graph (DAG)".into(),
            ],
            commands: vec![
                "# Visualize your pipeline:".into(),
                "deployflow graph --format mermaid".into(),
            ],
        }
    }

    /// Suggest separating two environments that share a promotion branch
    pub fn fix_duplicate_promotion_branch(branch: &str, first: &str, second: &str) -> Self {
        Self {
            action: format!("Give '{}' or '{}' its own promotion branch", first, second),
            steps: vec![
                format!("Pushing '{}' would deploy to both environments at once", branch),
                "Map every environment to a distinct branch".into(),
                "Promote between environments by merging, e.g. develop → main".into(),
            ],
            commands: vec![],
        }
    }

    /// Suggest declaring the producer of an artifact
    pub fn fix_missing_artifact(stage: &str, artifact: &str) -> Self {
        Self {
            action: format!("Make '{}' available to stage '{}'", artifact, stage),
            steps: vec![
                format!("Declare 'produces: {}' on a step in an upstream stage", artifact),
                format!("Add that stage to the 'depends_on' list of '{}'", stage),
                "Producers must not sit behind an environment stage this branch skips".into(),
            ],
            commands: vec![
                "# Check the plan for a branch:".into(),
                "deployflow run --branch <branch> --commit <sha> --dry-run".into(),
            ],
        }
    }

    /// Suggest creating a pipeline file
    pub fn create_pipeline() -> Self {
        Self {
            action: "Create a pipeline configuration".into(),
            steps: vec![
                "No .deployflow.yaml found in current directory".into(),
                "Initialize a new project or create the file manually".into(),
            ],
            commands: vec!["deployflow init".into()],
        }
    }

    /// Explain what an emergency reset needs before it proceeds
    pub fn confirm_emergency_reset(environment: &str) -> Self {
        Self {
            action: format!("Confirm the emergency reset of '{}'", environment),
            steps: vec![
                "Emergency reset force-pushes the promotion branch".into(),
                "Commits after the known-good commit disappear from the branch".into(),
                "Notify everyone with work on that branch first".into(),
            ],
            commands: vec![format!(
                "deployflow rollback {} --critical --confirm --notify <identity>",
                environment
            )],
        }
    }

    /// Suggest rebuilding state after a failed integrity check
    pub fn repair_state() -> Self {
        Self {
            action: "Repair the state directory".into(),
            steps: vec![
                "Restore the damaged file from a backup, or remove it".into(),
                "A removed environment file clears its known-good commit until the next successful run".into(),
            ],
            commands: vec!["deployflow status".into()],
        }
    }
}

impl std::fmt::Display for RecoverySuggestion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "→ {}", self.action)?;

        for step in &self.steps {
            writeln!(f, "  {}", step)?;
        }

        if !self.commands.is_empty() {
            writeln!(f)?;
            for cmd in &self.commands {
                writeln!(f, "  {}", cmd)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suggestion_for_cycle() {
        let err = DeployflowError::CircularDependency {
            stages: vec!["a".into(), "b".into()],
        };
        let suggestion = RecoverySuggestion::for_error(&err).unwrap();
        assert!(suggestion.to_string().contains("a → b"));
    }

    #[test]
    fn test_no_suggestion_for_io() {
        let err = DeployflowError::Io {
            message: "disk full".into(),
        };
        assert!(RecoverySuggestion::for_error(&err).is_none());
    }
}
