use kubenap_common::{ConfigError, IdlePolicy, WorkloadSnapshot};
use log::warn;

pub mod reconcile;
pub mod resume;
pub mod suspend;

/// Supplies the workloads evaluated on each reconciliation tick.
pub trait WorkloadLister: Send + Sync {
    fn list(&self) -> Vec<WorkloadSnapshot>;
}

impl<F> WorkloadLister for F
where
    F: Fn() -> Vec<WorkloadSnapshot> + Send + Sync,
{
    fn list(&self) -> Vec<WorkloadSnapshot> {
        self()
    }
}

/// Supplies the idle policy of a workload.
pub trait PolicyLoader: Send + Sync {
    fn load(&self, snapshot: &WorkloadSnapshot) -> Result<IdlePolicy, ConfigError>;
}

/// Reads the policy from the workload's annotations. Malformed values are
/// logged and replaced by defaults, so this loader never fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct AnnotationPolicyLoader;

impl PolicyLoader for AnnotationPolicyLoader {
    fn load(&self, snapshot: &WorkloadSnapshot) -> Result<IdlePolicy, ConfigError> {
        let (policy, problems) = IdlePolicy::from_annotations(&snapshot.annotations);
        for problem in problems {
            warn!(target: "policy", "{}: {}, using default", snapshot.identity, problem);
        }
        Ok(policy)
    }
}

/// Loads a policy, degrading to the defaults when the loader fails.
pub(crate) fn load_or_default(loader: &dyn PolicyLoader, snapshot: &WorkloadSnapshot) -> IdlePolicy {
    loader.load(snapshot).unwrap_or_else(|e| {
        warn!(target: "policy", "Failed to load policy for {}: {}, using defaults", snapshot.identity, e);
        IdlePolicy::default()
    })
}
