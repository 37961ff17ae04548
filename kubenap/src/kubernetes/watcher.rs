use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::Api;
use kube::runtime::reflector::{self, Store, store::Writer};
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use kubenap_common::WorkloadSnapshot;
use log::{debug, info, warn};
use tokio::sync::watch;

use super::gateway::snapshot_from_deployment;
use crate::controller::WorkloadLister;

const WATCH_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Read side of the Deployment cache, used as the reconciliation lister.
#[derive(Clone)]
pub struct DeploymentStore {
    reader: Store<Deployment>,
}

impl WorkloadLister for DeploymentStore {
    fn list(&self) -> Vec<WorkloadSnapshot> {
        self.reader
            .state()
            .iter()
            .filter_map(|d| snapshot_from_deployment(d))
            .collect()
    }
}

/// Keeps a label-selected cache of Deployments up to date.
pub struct DeploymentWatcher {
    api: Api<Deployment>,
    selector: String,
    writer: Writer<Deployment>,
}

impl DeploymentWatcher {
    pub fn new(client: Client, namespace: Option<&str>, selector: &str) -> (Self, DeploymentStore) {
        let api = match namespace {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::all(client),
        };
        let writer = Writer::default();
        let store = DeploymentStore {
            reader: writer.as_reader(),
        };
        (
            Self {
                api,
                selector: selector.to_string(),
                writer,
            },
            store,
        )
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(target: "watcher", "Watching deployments with selector {}", self.selector);

        let config = watcher::Config::default().labels(&self.selector);
        let mut events = reflector::reflector(self.writer, watcher(self.api, config)).boxed();

        loop {
            tokio::select! {
                event = events.next() => match event {
                    Some(Ok(watcher::Event::Applied(d))) => {
                        debug!(target: "watcher", "Watched deployment: {}/{}", d.namespace().unwrap_or_default(), d.name_any());
                    }
                    Some(Ok(watcher::Event::Deleted(d))) => {
                        debug!(target: "watcher", "Deployment removed: {}/{}", d.namespace().unwrap_or_default(), d.name_any());
                    }
                    Some(Ok(watcher::Event::Restarted(all))) => {
                        info!(target: "watcher", "Deployment cache synced with {} workloads", all.len());
                    }
                    Some(Err(e)) => {
                        warn!(target: "watcher", "Deployment watch failed: {}, retrying", e);
                        tokio::select! {
                            _ = tokio::time::sleep(WATCH_RETRY_DELAY) => {}
                            _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
                        }
                    }
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(target: "watcher", "Deployment watcher exiting");
    }
}
