// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! Approval gates
//!
//! A gate blocks an environment's deployment within one run until a human
//! approves it. State machine: `Open → Approved | Rejected | Expired`; the
//! three right-hand states are terminal.
//!
//! Waiting is event driven: every gate owns a `watch` channel that carries
//! its latest state, and waiters race that channel against the gate's
//! deadline and the run's cancel signal.
//!
//! Once a wait returns, the gate's slot is retired into a bounded archive of
//! closed gates, so a long-lived keeper holds only open gates plus the most
//! recent [`CLOSED_HISTORY`] closed ones.

mod approver;

pub use approver::{Approver, ConsoleApprover, ManualApprover, PresetApprover};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::time::Instant;

use crate::errors::DeployflowError;
use crate::pipeline::CancelSignal;

/// Reason recorded when a run is cancelled while its gate is open
pub const CANCELLED_REASON: &str = "cancelled";

/// Closed gates kept for lookups after their wait returned
pub const CLOSED_HISTORY: usize = 256;

/// Deadline used when a configured timeout overflows the clock
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

/// Gate states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateState {
    /// Awaiting a decision
    Open,
    Approved,
    Rejected,
    Expired,
}

impl GateState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Open)
    }
}

impl std::fmt::Display for GateState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Approved => write!(f, "approved"),
            Self::Rejected => write!(f, "rejected"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

/// An approval checkpoint for one environment within one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gate {
    pub id: String,
    pub run_id: String,
    pub environment: String,
    pub state: GateState,
    pub requested_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    /// Identity that decided; empty until decided and for expiry/cancellation
    pub decided_by: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
    /// Required on rejection
    pub reason: Option<String>,
}

/// A decision submitted by an approver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Approve { by: String },
    Reject { by: String, reason: String },
}

struct GateSlot {
    gate: Gate,
    timeout: Duration,
    deadline: Instant,
    tx: watch::Sender<Gate>,
}

/// Retired gates, oldest first
#[derive(Default)]
struct ClosedGates {
    gates: HashMap<String, Gate>,
    order: VecDeque<String>,
}

impl ClosedGates {
    fn push(&mut self, gate: Gate) {
        if self.gates.insert(gate.id.clone(), gate.clone()).is_none() {
            self.order.push_back(gate.id);
        }
        while self.order.len() > CLOSED_HISTORY {
            if let Some(oldest) = self.order.pop_front() {
                self.gates.remove(&oldest);
            }
        }
    }

    fn get(&self, gate_id: &str) -> Option<&Gate> {
        self.gates.get(gate_id)
    }
}

/// Registry of gates, shared by the engine and approvers
pub struct GateKeeper {
    default_timeout: Duration,
    gates: RwLock<HashMap<String, GateSlot>>,
    closed: RwLock<ClosedGates>,
}

impl GateKeeper {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            default_timeout,
            gates: RwLock::new(HashMap::new()),
            closed: RwLock::new(ClosedGates::default()),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Open a gate for (run, environment)
    ///
    /// Fails with `GateConflict` while another gate for the same pair is open.
    pub async fn request(
        &self,
        run_id: &str,
        environment: &str,
        timeout: Option<Duration>,
    ) -> Result<Gate, DeployflowError> {
        let mut gates = self.gates.write().await;

        if gates.values().any(|slot| {
            slot.gate.run_id == run_id
                && slot.gate.environment == environment
                && slot.gate.state == GateState::Open
        }) {
            return Err(DeployflowError::GateConflict {
                run_id: run_id.to_string(),
                environment: environment.to_string(),
            });
        }

        let timeout = timeout.unwrap_or(self.default_timeout);
        let now = Utc::now();
        let deadline = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|t| now.checked_add_signed(t))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let gate = Gate {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            environment: environment.to_string(),
            state: GateState::Open,
            requested_at: now,
            deadline,
            decided_by: None,
            decided_at: None,
            reason: None,
        };

        let (tx, _) = watch::channel(gate.clone());
        gates.insert(
            gate.id.clone(),
            GateSlot {
                gate: gate.clone(),
                timeout,
                deadline: Instant::now()
                    .checked_add(timeout)
                    .unwrap_or_else(|| Instant::now() + FAR_FUTURE),
                tx,
            },
        );

        tracing::info!(
            gate_id = %gate.id,
            run_id,
            environment,
            timeout_secs = timeout.as_secs(),
            "approval requested"
        );
        Ok(gate)
    }

    /// Record a human decision on an open gate
    pub async fn decide(
        &self,
        gate_id: &str,
        decision: GateDecision,
    ) -> Result<Gate, DeployflowError> {
        let (state, by, reason) = match decision {
            GateDecision::Approve { by } => (GateState::Approved, by, None),
            GateDecision::Reject { by, reason } => {
                if reason.trim().is_empty() {
                    return Err(DeployflowError::RejectionReasonRequired {
                        gate_id: gate_id.to_string(),
                    });
                }
                (GateState::Rejected, by, Some(reason))
            }
        };

        let mut gates = self.gates.write().await;
        let Some(slot) = gates.get_mut(gate_id) else {
            return Err(match self.closed.read().await.get(gate_id) {
                Some(gate) => DeployflowError::InvalidGateState {
                    gate_id: gate_id.to_string(),
                    state: gate.state.to_string(),
                },
                None => DeployflowError::GateNotFound {
                    gate_id: gate_id.to_string(),
                },
            });
        };

        if slot.gate.state.is_terminal() {
            return Err(DeployflowError::InvalidGateState {
                gate_id: gate_id.to_string(),
                state: slot.gate.state.to_string(),
            });
        }

        let gate = Self::transition(slot, state, Some(by), reason);
        tracing::info!(
            gate_id,
            environment = %gate.environment,
            state = %gate.state,
            decided_by = gate.decided_by.as_deref().unwrap_or_default(),
            "gate decided"
        );
        Ok(gate)
    }

    /// Reject an open gate because its run was cancelled
    pub async fn cancel(&self, gate_id: &str) -> Result<Gate, DeployflowError> {
        self.resolve(gate_id, GateState::Rejected, CANCELLED_REASON.to_string())
            .await
    }

    async fn expire(&self, gate_id: &str, timeout: Duration) -> Result<Gate, DeployflowError> {
        let reason = format!("no decision within {}s", timeout.as_secs());
        self.resolve(gate_id, GateState::Expired, reason).await
    }

    /// Move an open gate to a terminal state without a human decision.
    /// A gate that is already terminal is returned unchanged.
    async fn resolve(
        &self,
        gate_id: &str,
        state: GateState,
        reason: String,
    ) -> Result<Gate, DeployflowError> {
        let mut gates = self.gates.write().await;
        let Some(slot) = gates.get_mut(gate_id) else {
            return self
                .closed
                .read()
                .await
                .get(gate_id)
                .cloned()
                .ok_or_else(|| DeployflowError::GateNotFound {
                    gate_id: gate_id.to_string(),
                });
        };

        if slot.gate.state.is_terminal() {
            return Ok(slot.gate.clone());
        }

        let gate = Self::transition(slot, state, None, Some(reason));
        tracing::warn!(
            gate_id,
            environment = %gate.environment,
            state = %gate.state,
            reason = gate.reason.as_deref().unwrap_or_default(),
            "gate closed without approval"
        );
        Ok(gate)
    }

    fn transition(
        slot: &mut GateSlot,
        state: GateState,
        by: Option<String>,
        reason: Option<String>,
    ) -> Gate {
        slot.gate.state = state;
        slot.gate.decided_by = by;
        slot.gate.decided_at = Some(Utc::now());
        slot.gate.reason = reason;
        slot.tx.send_replace(slot.gate.clone());
        slot.gate.clone()
    }

    /// Wait until the gate is decided, expires, or the run is cancelled
    pub async fn wait(&self, gate_id: &str, cancel: &CancelSignal) -> Result<Gate, DeployflowError> {
        let (mut rx, timeout, deadline) = {
            let gates = self.gates.read().await;
            let slot = gates
                .get(gate_id)
                .ok_or_else(|| DeployflowError::GateNotFound {
                    gate_id: gate_id.to_string(),
                })?;
            (slot.tx.subscribe(), slot.timeout, slot.deadline)
        };

        let decided = async {
            rx.wait_for(|gate| gate.state.is_terminal())
                .await
                .map(|gate| gate.clone())
        };

        let resolved = tokio::select! {
            result = tokio::time::timeout_at(deadline, decided) => match result {
                Ok(Ok(gate)) => Ok(gate),
                Ok(Err(_)) => Err(DeployflowError::GateNotFound {
                    gate_id: gate_id.to_string(),
                }),
                Err(_) => self.expire(gate_id, timeout).await,
            },
            _ = cancel.cancelled() => self.cancel(gate_id).await,
        };

        if resolved.is_ok() {
            self.retire(gate_id).await;
        }
        resolved
    }

    /// Move a closed gate out of the live table into the archive
    async fn retire(&self, gate_id: &str) {
        let mut gates = self.gates.write().await;
        if gates
            .get(gate_id)
            .is_some_and(|slot| slot.gate.state.is_terminal())
        {
            if let Some(slot) = gates.remove(gate_id) {
                self.closed.write().await.push(slot.gate);
                tracing::debug!(gate_id, "gate retired");
            }
        }
    }

    pub async fn get(&self, gate_id: &str) -> Option<Gate> {
        let gates = self.gates.read().await;
        match gates.get(gate_id) {
            Some(slot) => Some(slot.gate.clone()),
            None => self.closed.read().await.get(gate_id).cloned(),
        }
    }

    /// Gates still tracked in the live table, open or awaiting retirement
    pub async fn live_count(&self) -> usize {
        self.gates.read().await.len()
    }

    /// Gates still awaiting a decision, oldest first
    pub async fn open_gates(&self) -> Vec<Gate> {
        let gates = self.gates.read().await;
        let mut open: Vec<Gate> = gates
            .values()
            .filter(|s| s.gate.state == GateState::Open)
            .map(|s| s.gate.clone())
            .collect();
        open.sort_by_key(|g| g.requested_at);
        open
    }
}

impl Default for GateKeeper {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600))
    }
}
