use std::sync::Arc;

use clap::Parser;
use kube::Client;
#[rustfmt::skip]
use log::{info, error};
use tokio::sync::watch;
use tokio::task;

mod activity;
mod api;
mod config;
mod controller;
mod kubernetes;
mod traffic;
#[cfg(test)]
mod testing;

use activity::ActivityLedger;
use controller::reconcile::SuspendLoop;
use controller::resume::ResumeEngine;
use controller::suspend::SuspendEngine;
use controller::{AnnotationPolicyLoader, PolicyLoader, WorkloadLister};
use kubernetes::gateway::{KubeGateway, WorkloadGateway};
use kubernetes::watcher::DeploymentWatcher;
use traffic::{HttpTrafficSource, TrafficPoller};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logger with custom timestamp format
    env_logger::Builder::from_default_env()
        .format(|buf, record| {
            use std::io::Write;
            let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
            writeln!(buf, "[{}] [{}] [{}:{}] {}",
                timestamp,
                record.level(),
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .init();

    let opt = config::Opt::parse();
    info!("Starting kubenap controller with {:?}", opt);

    let client = Client::try_default().await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let ledger = Arc::new(ActivityLedger::new());
    let gateway: Arc<dyn WorkloadGateway> =
        Arc::new(KubeGateway::new(client.clone(), opt.ready_poll_interval));
    let policies: Arc<dyn PolicyLoader> = Arc::new(AnnotationPolicyLoader);

    // Keep the deployment cache in sync in background
    let (deployment_watcher, store) =
        DeploymentWatcher::new(client, opt.namespace.as_deref(), &opt.label_selector);
    let watcher_handle = task::spawn(deployment_watcher.run(shutdown_rx.clone()));
    let lister: Arc<dyn WorkloadLister> = Arc::new(store);

    // Pull last-request times from an external source, if one is configured
    let poller_handle = match &opt.traffic_source_url {
        Some(url) => {
            let source = HttpTrafficSource::new(url, opt.traffic_poll_interval)?;
            let poller = TrafficPoller::new(
                Arc::new(source),
                lister.clone(),
                ledger.clone(),
                opt.traffic_poll_interval,
            );
            Some(task::spawn(poller.run(shutdown_rx.clone())))
        }
        None => None,
    };

    // Evaluate idle workloads in background
    let suspend_loop = SuspendLoop::new(
        lister,
        policies.clone(),
        Arc::new(SuspendEngine::new(ledger.clone(), gateway.clone())),
        opt.tick_interval,
    );
    let loop_handle = task::spawn(suspend_loop.run(shutdown_rx.clone()));

    let state = api::AppState {
        ledger,
        resume: Arc::new(ResumeEngine::new(gateway, policies)),
        interceptor: Arc::new(api::QueryInterceptor),
        wake_timeout: opt.wake_timeout,
    };
    let mut server = task::spawn(api::serve(opt.port, state, shutdown_rx));

    let server_failed = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            false
        }
        result = &mut server => {
            // Only returns early when the listener could not be started.
            match result {
                Ok(Ok(())) => error!("Server stopped unexpectedly"),
                Ok(Err(e)) => error!("Server failed: {}", e),
                Err(e) => error!("Server task panicked: {}", e),
            }
            true
        }
    };

    let _ = shutdown_tx.send(true);
    if let Some(handle) = poller_handle {
        let _ = handle.await;
    }
    if server_failed {
        let _ = tokio::join!(watcher_handle, loop_handle);
        anyhow::bail!("wake endpoint is not serving");
    }
    let _ = tokio::join!(server, watcher_handle, loop_handle);
    info!("kubenap stopped");
    Ok(())
}
