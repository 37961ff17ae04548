//! Pull-based traffic observation.
//!
//! A [`TrafficSource`] reports when a service last served a request, e.g. a
//! proxy's stats endpoint or a metrics sidecar. The [`TrafficPoller`] asks it
//! about every managed workload and folds the answers into the ledger.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kubenap_common::ServiceIdentity;
use log::{debug, info, warn};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};

use crate::activity::ActivityLedger;
use crate::controller::WorkloadLister;

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum TrafficError {
    #[error("traffic source unavailable: {0}")]
    Unavailable(String),
    #[error("unexpected traffic source response: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait TrafficSource: Send + Sync {
    /// Time of the last request served by `id`, or `None` if the source has
    /// not seen any.
    async fn last_request_time(&self, id: &ServiceIdentity) -> Result<Option<DateTime<Utc>>, TrafficError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LastRequest {
    last_request_time: Option<DateTime<Utc>>,
}

/// Queries `GET <url>?namespace=..&name=..`, which answers
/// `{"lastRequestTime": "<RFC 3339>"}` or `404` for services it never saw.
pub struct HttpTrafficSource {
    client: reqwest::Client,
    url: Url,
}

impl HttpTrafficSource {
    pub fn new(url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;
        let url = Url::parse(url).context("Invalid traffic source URL")?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl TrafficSource for HttpTrafficSource {
    async fn last_request_time(&self, id: &ServiceIdentity) -> Result<Option<DateTime<Utc>>, TrafficError> {
        let response = self
            .client
            .get(self.url.clone())
            .query(id)
            .send()
            .await
            .map_err(|e| TrafficError::Unavailable(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let body: LastRequest = response
                    .json()
                    .await
                    .map_err(|e| TrafficError::InvalidResponse(e.to_string()))?;
                Ok(body.last_request_time)
            }
            status => Err(TrafficError::Unavailable(format!("status {}", status))),
        }
    }
}

/// Periodically feeds a traffic source into the activity ledger.
pub struct TrafficPoller {
    source: Arc<dyn TrafficSource>,
    lister: Arc<dyn WorkloadLister>,
    ledger: Arc<ActivityLedger>,
    interval: Duration,
}

impl TrafficPoller {
    pub fn new(
        source: Arc<dyn TrafficSource>,
        lister: Arc<dyn WorkloadLister>,
        ledger: Arc<ActivityLedger>,
        interval: Duration,
    ) -> Self {
        Self {
            source,
            lister,
            ledger,
            interval,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(target: "traffic", "Traffic poller started (interval: {:?})", self.interval);

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let updated = self.poll_once().await;
                    debug!(target: "traffic", "Poll complete: {} services updated", updated);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(target: "traffic", "Traffic poller exiting");
    }

    /// Asks the source about every listed workload and returns how many
    /// ledger records moved forward.
    pub async fn poll_once(&self) -> usize {
        let now = Utc::now();
        let mut updated = 0;
        for snapshot in self.lister.list() {
            let id = &snapshot.identity;
            match self.source.last_request_time(id).await {
                Ok(Some(at)) => {
                    if self.ledger.observe(id, at.min(now)) {
                        updated += 1;
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(target: "traffic", "No traffic data for {}: {}", id, e),
            }
        }
        updated
    }
}
