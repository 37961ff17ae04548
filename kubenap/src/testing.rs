//! In-memory gateway used by the engine and API tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use kubenap_common::{ANNOTATION_ORIGINAL_REPLICAS, ServiceIdentity, WorkloadSnapshot};

use crate::kubernetes::gateway::{GatewayError, WorkloadGateway};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FakeOp {
    Get,
    Record,
    SetReplicas,
    Wait,
}

pub struct FakeGateway {
    workloads: Mutex<HashMap<ServiceIdentity, WorkloadSnapshot>>,
    failures: Mutex<VecDeque<(FakeOp, GatewayError)>>,
    panics: Mutex<Vec<FakeOp>>,
    writes: Mutex<Vec<(ServiceIdentity, i32)>>,
    records: AtomicUsize,
    waits: AtomicUsize,
    /// Time the fake takes to bring replicas up; `None` never becomes ready.
    ready_delay: Mutex<Option<Duration>>,
}

impl Default for FakeGateway {
    fn default() -> Self {
        Self {
            workloads: Mutex::new(HashMap::new()),
            failures: Mutex::new(VecDeque::new()),
            panics: Mutex::new(Vec::new()),
            writes: Mutex::new(Vec::new()),
            records: AtomicUsize::new(0),
            waits: AtomicUsize::new(0),
            ready_delay: Mutex::new(Some(Duration::from_millis(100))),
        }
    }
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a running workload whose replicas are all ready.
    pub fn with_workload(self, id: &ServiceIdentity, replicas: i32) -> Self {
        self.insert(WorkloadSnapshot::new(id.clone(), replicas, replicas));
        self
    }

    pub fn insert(&self, snapshot: WorkloadSnapshot) {
        self.workloads
            .lock()
            .unwrap()
            .insert(snapshot.identity.clone(), snapshot);
    }

    pub fn snapshot(&self, id: &ServiceIdentity) -> WorkloadSnapshot {
        self.workloads.lock().unwrap().get(id).cloned().unwrap()
    }

    pub fn set_ready_delay(&self, delay: Option<Duration>) {
        *self.ready_delay.lock().unwrap() = delay;
    }

    pub fn fail_next(&self, op: FakeOp, err: GatewayError) {
        self.failures.lock().unwrap().push_back((op, err));
    }

    /// The next call of `op` panics, as a buggy client would.
    pub fn panic_next(&self, op: FakeOp) {
        self.panics.lock().unwrap().push(op);
    }

    pub fn writes(&self) -> Vec<(ServiceIdentity, i32)> {
        self.writes.lock().unwrap().clone()
    }

    pub fn record_calls(&self) -> usize {
        self.records.load(Ordering::SeqCst)
    }

    pub fn wait_calls(&self) -> usize {
        self.waits.load(Ordering::SeqCst)
    }

    fn scripted_failure(&self, op: FakeOp) -> Result<(), GatewayError> {
        let scripted_panic = {
            let mut panics = self.panics.lock().unwrap();
            panics.iter().position(|o| *o == op).map(|pos| panics.remove(pos))
        };
        if let Some(op) = scripted_panic {
            panic!("scripted {:?} panic", op);
        }

        let mut failures = self.failures.lock().unwrap();
        if let Some(pos) = failures.iter().position(|(o, _)| *o == op) {
            let (_, err) = failures.remove(pos).unwrap();
            return Err(err);
        }
        Ok(())
    }

    fn with_workload_mut<T>(
        &self,
        id: &ServiceIdentity,
        f: impl FnOnce(&mut WorkloadSnapshot) -> T,
    ) -> Result<T, GatewayError> {
        let mut workloads = self.workloads.lock().unwrap();
        let workload = workloads
            .get_mut(id)
            .ok_or_else(|| GatewayError::NotFound(id.clone()))?;
        Ok(f(workload))
    }
}

#[async_trait]
impl WorkloadGateway for FakeGateway {
    async fn get_snapshot(&self, id: &ServiceIdentity) -> Result<WorkloadSnapshot, GatewayError> {
        self.scripted_failure(FakeOp::Get)?;
        self.with_workload_mut(id, |w| w.clone())
    }

    async fn record_original_replicas(
        &self,
        id: &ServiceIdentity,
        count: i32,
    ) -> Result<(), GatewayError> {
        self.records.fetch_add(1, Ordering::SeqCst);
        self.scripted_failure(FakeOp::Record)?;
        self.with_workload_mut(id, |w| {
            if w.original_replicas.is_none() {
                w.original_replicas = Some(count);
                w.annotations
                    .insert(ANNOTATION_ORIGINAL_REPLICAS.to_string(), count.to_string());
            }
        })
    }

    async fn set_replicas(&self, id: &ServiceIdentity, count: i32) -> Result<(), GatewayError> {
        self.writes.lock().unwrap().push((id.clone(), count));
        self.scripted_failure(FakeOp::SetReplicas)?;
        self.with_workload_mut(id, |w| {
            w.replicas = count;
            w.ready_replicas = w.ready_replicas.min(count);
        })
    }

    async fn wait_until_ready(
        &self,
        id: &ServiceIdentity,
        timeout: Duration,
    ) -> Result<(), GatewayError> {
        self.waits.fetch_add(1, Ordering::SeqCst);
        self.scripted_failure(FakeOp::Wait)?;
        let delay = *self.ready_delay.lock().unwrap();
        match delay {
            Some(delay) if delay <= timeout => {
                tokio::time::sleep(delay).await;
                self.with_workload_mut(id, |w| w.ready_replicas = w.replicas)
            }
            _ => {
                tokio::time::sleep(timeout).await;
                Err(GatewayError::Timeout(timeout))
            }
        }
    }
}
