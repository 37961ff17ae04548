use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

pub mod policy;

pub use policy::{ConfigError, IdlePolicy, parse_duration};

/// Label that opts a workload into idle management.
pub const ENABLED_LABEL: &str = "kubenap/enabled";

pub const ANNOTATION_IDLE_AFTER: &str = "kubenap/idleAfter";
pub const ANNOTATION_REPLICA_COUNT: &str = "kubenap/replicaCount";
pub const ANNOTATION_SERVICE: &str = "kubenap/service";
pub const ANNOTATION_INGRESS: &str = "kubenap/ingress";
/// Durable marker holding the replica count captured before scaling to zero.
pub const ANNOTATION_ORIGINAL_REPLICAS: &str = "kubenap/originalReplicas";

/// Serializes as `namespace=..&name=..` when used as a query string.
#[derive(Debug, Clone, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize)]
pub struct ServiceIdentity {
    pub namespace: String,
    pub name: String,
}

impl ServiceIdentity {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ServiceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Point-in-time view of a workload as read from the orchestrator.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct WorkloadSnapshot {
    pub identity: ServiceIdentity,
    /// Desired replica count.
    pub replicas: i32,
    pub ready_replicas: i32,
    /// Value of the durable marker, if a valid one is present.
    pub original_replicas: Option<i32>,
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SuspendState {
    Active,
    Suspended,
    /// Scaled to zero by something other than this controller.
    Unknown,
}

impl WorkloadSnapshot {
    pub fn new(identity: ServiceIdentity, replicas: i32, ready_replicas: i32) -> Self {
        Self {
            identity,
            replicas,
            ready_replicas,
            original_replicas: None,
            annotations: BTreeMap::new(),
        }
    }

    /// Builds a snapshot from raw annotations, extracting the durable marker.
    pub fn from_annotations(
        identity: ServiceIdentity,
        replicas: i32,
        ready_replicas: i32,
        annotations: BTreeMap<String, String>,
    ) -> Self {
        let original_replicas = annotations
            .get(ANNOTATION_ORIGINAL_REPLICAS)
            .and_then(|v| parse_marker(v));
        Self {
            identity,
            replicas,
            ready_replicas,
            original_replicas,
            annotations,
        }
    }

    pub fn state(&self) -> SuspendState {
        match (self.replicas, self.original_replicas) {
            (r, _) if r > 0 => SuspendState::Active,
            (_, Some(_)) => SuspendState::Suspended,
            (_, None) => SuspendState::Unknown,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.replicas > 0 && self.ready_replicas >= self.replicas
    }
}

/// A marker is only valid when it holds a positive integer.
pub fn parse_marker(value: &str) -> Option<i32> {
    value.trim().parse::<i32>().ok().filter(|n| *n > 0)
}
