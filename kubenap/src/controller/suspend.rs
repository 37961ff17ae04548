use std::sync::Arc;

use chrono::{DateTime, Utc};
use kubenap_common::{IdlePolicy, ServiceIdentity, SuspendState, WorkloadSnapshot};
use log::{debug, info, warn};

use crate::activity::ActivityLedger;
use crate::kubernetes::gateway::{GatewayError, WorkloadGateway};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SuspendPhase {
    /// Recording the durable marker.
    Capture,
    /// Scaling to zero.
    ScaleDown,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SuspendOutcome {
    /// No activity has been observed; unknown is never idle.
    Untracked,
    Active,
    AlreadyScaledDown,
    Suspended { original_replicas: i32 },
    Aborted { phase: SuspendPhase, error: GatewayError },
}

pub struct SuspendEngine {
    ledger: Arc<ActivityLedger>,
    gateway: Arc<dyn WorkloadGateway>,
}

impl SuspendEngine {
    pub fn new(ledger: Arc<ActivityLedger>, gateway: Arc<dyn WorkloadGateway>) -> Self {
        Self { ledger, gateway }
    }

    pub async fn evaluate(&self, snapshot: &WorkloadSnapshot, policy: &IdlePolicy) -> SuspendOutcome {
        self.evaluate_at(snapshot, policy, Utc::now()).await
    }

    pub async fn evaluate_at(
        &self,
        snapshot: &WorkloadSnapshot,
        policy: &IdlePolicy,
        now: DateTime<Utc>,
    ) -> SuspendOutcome {
        let id = &snapshot.identity;

        let Some(last_seen) = self.ledger.get(id) else {
            debug!(target: "suspend", "No activity recorded for {}, skipping", id);
            return SuspendOutcome::Untracked;
        };

        let idle_for = now.signed_duration_since(last_seen);
        let threshold = chrono::Duration::from_std(policy.idle_after)
            .unwrap_or(chrono::Duration::MAX);
        if idle_for < threshold {
            debug!(target: "suspend", "{} is still active (last seen {}s ago)", id, idle_for.num_seconds());
            return SuspendOutcome::Active;
        }

        match snapshot.state() {
            SuspendState::Active => {}
            SuspendState::Suspended => {
                debug!(target: "suspend", "{} is already scaled down", id);
                return SuspendOutcome::AlreadyScaledDown;
            }
            SuspendState::Unknown => {
                debug!(target: "suspend", "{} was scaled to zero outside kubenap, leaving it alone", id);
                return SuspendOutcome::AlreadyScaledDown;
            }
        }

        self.suspend(snapshot, idle_for).await
    }

    /// Phase A records the restore point, phase B zeroes replicas. Each phase
    /// is idempotent, so a retry after a failure between them is safe.
    async fn suspend(&self, snapshot: &WorkloadSnapshot, idle_for: chrono::Duration) -> SuspendOutcome {
        let id = &snapshot.identity;

        let original_replicas = match snapshot.original_replicas {
            Some(recorded) => recorded,
            None => {
                if let Err(error) = self
                    .gateway
                    .record_original_replicas(id, snapshot.replicas)
                    .await
                {
                    log_failure(id, "record original replicas for", &error);
                    return SuspendOutcome::Aborted {
                        phase: SuspendPhase::Capture,
                        error,
                    };
                }
                snapshot.replicas
            }
        };

        if let Err(error) = self.gateway.set_replicas(id, 0).await {
            log_failure(id, "scale down", &error);
            return SuspendOutcome::Aborted {
                phase: SuspendPhase::ScaleDown,
                error,
            };
        }

        info!(
            target: "suspend",
            "Suspended {} due to inactivity (last seen {}s ago, restore to {})",
            id,
            idle_for.num_seconds(),
            original_replicas
        );
        SuspendOutcome::Suspended { original_replicas }
    }
}

fn log_failure(id: &ServiceIdentity, action: &str, error: &GatewayError) {
    match error {
        GatewayError::NotFound(_) => info!(target: "suspend", "{} vanished, cannot {} it", id, action),
        e if e.is_retryable() => {
            warn!(target: "suspend", "Failed to {} {}: {}, retrying next tick", action, id, e)
        }
        e => warn!(target: "suspend", "Failed to {} {}: {}", action, id, e),
    }
}
