use std::time::Duration;

use clap::Parser;
use kubenap_common::{ENABLED_LABEL, parse_duration};

#[derive(Debug, Clone, Parser)]
#[command(name = "kubenap", version, about = "Scales idle workloads to zero and wakes them on demand")]
pub struct Opt {
    /// Port for the wake and activity endpoints.
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// How often idle workloads are evaluated.
    #[arg(long, env = "KUBENAP_TICK_INTERVAL", default_value = "30s", value_parser = positive_duration)]
    pub tick_interval: Duration,

    /// How long a wake request waits for the workload to become ready.
    #[arg(long, env = "KUBENAP_WAKE_TIMEOUT", default_value = "30s", value_parser = positive_duration)]
    pub wake_timeout: Duration,

    #[arg(long, env = "KUBENAP_READY_POLL", default_value = "1s", value_parser = positive_duration)]
    pub ready_poll_interval: Duration,

    /// Label selector for managed deployments.
    #[arg(long, env = "KUBENAP_LABEL_SELECTOR", default_value_t = format!("{}=true", ENABLED_LABEL))]
    pub label_selector: String,

    /// Restrict the watch to one namespace; all namespaces when unset.
    #[arg(long, env = "KUBENAP_NAMESPACE")]
    pub namespace: Option<String>,

    /// Endpoint reporting each service's last request time. Only pushes to
    /// `/activity` are observed when unset.
    #[arg(long, env = "KUBENAP_TRAFFIC_SOURCE_URL")]
    pub traffic_source_url: Option<String>,

    #[arg(long, env = "KUBENAP_TRAFFIC_POLL_INTERVAL", default_value = "15s", value_parser = positive_duration)]
    pub traffic_poll_interval: Duration,
}

fn positive_duration(input: &str) -> Result<Duration, String> {
    let d = parse_duration(input)?;
    if d.is_zero() {
        return Err("duration must be greater than zero".into());
    }
    Ok(d)
}
