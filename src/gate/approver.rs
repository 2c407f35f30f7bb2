// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! Approver collaborators
//!
//! The engine hands each new gate to an [`Approver`]. An approver either
//! answers itself or returns `None`, in which case the decision must arrive
//! through [`super::GateKeeper::decide`] from elsewhere.

use async_trait::async_trait;
use colored::Colorize;
use console::Term;

use super::{Gate, GateDecision};

/// Something that can decide gates
#[async_trait]
pub trait Approver: Send + Sync {
    async fn review(&self, gate: &Gate) -> Option<GateDecision>;
}

/// Leaves every gate to external decisions
#[derive(Debug, Default, Clone)]
pub struct ManualApprover;

#[async_trait]
impl Approver for ManualApprover {
    async fn review(&self, _gate: &Gate) -> Option<GateDecision> {
        None
    }
}

/// Answers every gate with the same decision
#[derive(Debug, Clone)]
pub struct PresetApprover {
    decision: GateDecision,
}

impl PresetApprover {
    pub fn new(decision: GateDecision) -> Self {
        Self { decision }
    }

    pub fn approve(by: &str) -> Self {
        Self::new(GateDecision::Approve { by: by.to_string() })
    }

    pub fn reject(by: &str, reason: &str) -> Self {
        Self::new(GateDecision::Reject {
            by: by.to_string(),
            reason: reason.to_string(),
        })
    }
}

#[async_trait]
impl Approver for PresetApprover {
    async fn review(&self, gate: &Gate) -> Option<GateDecision> {
        tracing::debug!(gate_id = %gate.id, "answering gate with preset decision");
        Some(self.decision.clone())
    }
}

/// Asks the operator at the terminal
#[derive(Debug, Clone)]
pub struct ConsoleApprover {
    identity: String,
}

impl ConsoleApprover {
    pub fn new(identity: &str) -> Self {
        Self {
            identity: identity.to_string(),
        }
    }
}

#[async_trait]
impl Approver for ConsoleApprover {
    async fn review(&self, gate: &Gate) -> Option<GateDecision> {
        let gate = gate.clone();
        let identity = self.identity.clone();

        match tokio::task::spawn_blocking(move || prompt(&gate, &identity)).await {
            Ok(Ok(decision)) => Some(decision),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "console prompt failed; waiting for an external decision");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "console prompt aborted");
                None
            }
        }
    }
}

fn prompt(gate: &Gate, identity: &str) -> std::io::Result<GateDecision> {
    let term = Term::stderr();
    term.write_line(&format!(
        "{} Deploy run {} to {}? (gate expires {})",
        "?".yellow().bold(),
        gate.run_id.dimmed(),
        gate.environment.bold(),
        gate.deadline.format("%H:%M:%S UTC")
    ))?;
    term.write_str("  approve [y/N]: ")?;
    let answer = term.read_line()?;

    if is_yes(&answer) {
        return Ok(GateDecision::Approve {
            by: identity.to_string(),
        });
    }

    term.write_str("  reason for rejection: ")?;
    let reason = term.read_line()?;
    let reason = match reason.trim() {
        "" => "rejected at console".to_string(),
        r => r.to_string(),
    };

    Ok(GateDecision::Reject {
        by: identity.to_string(),
        reason,
    })
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_yes() {
        assert!(is_yes("y"));
        assert!(is_yes(" YES\n"));
        assert!(!is_yes(""));
        assert!(!is_yes("n"));
        assert!(!is_yes("yep"));
    }

    #[tokio::test]
    async fn test_preset_approver_answers_every_gate() {
        let gate = Gate {
            id: "g1".into(),
            run_id: "r1".into(),
            environment: "production".into(),
            state: super::super::GateState::Open,
            requested_at: chrono::Utc::now(),
            deadline: chrono::Utc::now(),
            decided_by: None,
            decided_at: None,
            reason: None,
        };

        assert_eq!(ManualApprover.review(&gate).await, None);
        assert_eq!(
            PresetApprover::reject("bob", "not today").review(&gate).await,
            Some(GateDecision::Reject {
                by: "bob".into(),
                reason: "not today".into()
            })
        );
    }
}
