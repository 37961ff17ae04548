use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use kubenap_common::ServiceIdentity;
use log::{debug, info, warn};

use super::{PolicyLoader, load_or_default};
use crate::kubernetes::gateway::{GatewayError, WorkloadGateway};

const SCALE_UP_ATTEMPTS: u32 = 3;
const CONFLICT_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ResumeOutcome {
    /// The workload was already running at its target; nothing was written.
    AlreadyReady { replicas: i32 },
    Resumed { replicas: i32 },
}

type ResumeResult = Result<ResumeOutcome, GatewayError>;
type Flight = Shared<BoxFuture<'static, ResumeResult>>;
type FlightMap = Arc<Mutex<HashMap<ServiceIdentity, (u64, Flight)>>>;

/// Restores suspended workloads, running at most one resume per identity.
///
/// The resume itself runs on a spawned task. Callers await a shared handle to
/// it, so a caller that gives up (client disconnect, its own timeout) only
/// drops its handle while the scale-up finishes for everyone else.
pub struct ResumeEngine {
    gateway: Arc<dyn WorkloadGateway>,
    policies: Arc<dyn PolicyLoader>,
    inflight: FlightMap,
    next_flight: AtomicU64,
}

impl ResumeEngine {
    pub fn new(gateway: Arc<dyn WorkloadGateway>, policies: Arc<dyn PolicyLoader>) -> Self {
        Self {
            gateway,
            policies,
            inflight: Arc::new(Mutex::new(HashMap::new())),
            next_flight: AtomicU64::new(0),
        }
    }

    pub async fn resume_and_wait(&self, id: &ServiceIdentity, timeout: Duration) -> ResumeResult {
        self.join_or_start(id, timeout).await
    }

    /// Number of resumes currently running.
    pub fn in_flight(&self) -> usize {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn join_or_start(&self, id: &ServiceIdentity, timeout: Duration) -> Flight {
        // Held across spawn and insert so the task cannot deregister before
        // its entry exists.
        let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((_, flight)) = inflight.get(id) {
            debug!(target: "resume", "Joining in-flight resume of {}", id);
            return flight.clone();
        }

        let flight_id = self.next_flight.fetch_add(1, Ordering::Relaxed);
        let gateway = self.gateway.clone();
        let policies = self.policies.clone();
        let registry = self.inflight.clone();
        let key = id.clone();

        let handle = tokio::spawn(async move {
            let _registration = Registration {
                registry,
                key: key.clone(),
                flight_id,
            };
            resume(gateway.as_ref(), policies.as_ref(), &key, timeout).await
        });

        let flight = async move {
            handle
                .await
                .unwrap_or_else(|e| Err(GatewayError::Transient(format!("resume task failed: {}", e))))
        }
        .boxed()
        .shared();

        inflight.insert(id.clone(), (flight_id, flight.clone()));
        flight
    }
}

/// Removes a flight from the registry when its task ends, including by panic.
struct Registration {
    registry: FlightMap,
    key: ServiceIdentity,
    flight_id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut inflight = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        if inflight.get(&self.key).is_some_and(|(owner, _)| *owner == self.flight_id) {
            inflight.remove(&self.key);
        }
    }
}

async fn resume(
    gateway: &dyn WorkloadGateway,
    policies: &dyn PolicyLoader,
    id: &ServiceIdentity,
    timeout: Duration,
) -> ResumeResult {
    let snapshot = gateway.get_snapshot(id).await?;

    let target = match snapshot.original_replicas {
        Some(recorded) => recorded,
        None => {
            let policy = load_or_default(policies, &snapshot);
            info!(
                target: "resume",
                "{} has no recorded replica count, using policy default {}",
                id, policy.replica_count
            );
            policy.replica_count
        }
    };

    if snapshot.replicas >= target && snapshot.is_ready() {
        debug!(target: "resume", "{} already running with {} replicas", id, snapshot.replicas);
        return Ok(ResumeOutcome::AlreadyReady {
            replicas: snapshot.replicas,
        });
    }

    if snapshot.replicas < target {
        info!(target: "resume", "Scaling up {} from {} to {} replicas", id, snapshot.replicas, target);
        scale_up(gateway, id, target).await?;
    }

    gateway.wait_until_ready(id, timeout).await?;
    info!(target: "resume", "{} is ready", id);
    Ok(ResumeOutcome::Resumed {
        replicas: target.max(snapshot.replicas),
    })
}

async fn scale_up(gateway: &dyn WorkloadGateway, id: &ServiceIdentity, target: i32) -> Result<(), GatewayError> {
    let mut attempt = 1;
    loop {
        match gateway.set_replicas(id, target).await {
            Err(GatewayError::Conflict(reason)) if attempt < SCALE_UP_ATTEMPTS => {
                warn!(
                    target: "resume",
                    "Conflict scaling up {} (attempt {}/{}): {}",
                    id, attempt, SCALE_UP_ATTEMPTS, reason
                );
                tokio::time::sleep(CONFLICT_BACKOFF * attempt).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}
