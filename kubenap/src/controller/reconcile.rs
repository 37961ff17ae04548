use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};

use super::suspend::{SuspendEngine, SuspendOutcome};
use super::{PolicyLoader, WorkloadLister, load_or_default};

/// Tally of one reconciliation pass.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub struct CycleReport {
    pub evaluated: usize,
    pub suspended: usize,
    pub aborted: usize,
}

/// Periodically evaluates every listed workload for suspension.
pub struct SuspendLoop {
    lister: Arc<dyn WorkloadLister>,
    policies: Arc<dyn PolicyLoader>,
    engine: Arc<SuspendEngine>,
    interval: Duration,
}

impl SuspendLoop {
    pub fn new(
        lister: Arc<dyn WorkloadLister>,
        policies: Arc<dyn PolicyLoader>,
        engine: Arc<SuspendEngine>,
        interval: Duration,
    ) -> Self {
        Self {
            lister,
            policies,
            engine,
            interval,
        }
    }

    /// Runs until the shutdown flag flips to `true` or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(target: "reconcile", "Suspend loop started (interval: {:?})", self.interval);

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.run_once().await;
                    debug!(
                        target: "reconcile",
                        "Cycle complete: evaluated={} suspended={} aborted={}",
                        report.evaluated, report.suspended, report.aborted
                    );
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(target: "reconcile", "Suspend loop exiting");
    }

    /// Evaluates each workload once. Failures stay local to their workload.
    pub async fn run_once(&self) -> CycleReport {
        let mut report = CycleReport::default();
        for snapshot in self.lister.list() {
            let policy = load_or_default(self.policies.as_ref(), &snapshot);
            report.evaluated += 1;
            match self.engine.evaluate(&snapshot, &policy).await {
                SuspendOutcome::Suspended { .. } => report.suspended += 1,
                SuspendOutcome::Aborted { .. } => report.aborted += 1,
                _ => {}
            }
        }
        report
    }
}
