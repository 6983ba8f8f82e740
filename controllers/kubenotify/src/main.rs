//! kubenotify
//!
//! Watches Deployments, StatefulSets and DaemonSets and:
//! - reports filtered spec changes, creations and deletions
//! - diagnoses workloads that stay below their desired ready count, down to
//!   the pods that block them
//!
//! Notifications go to the configured webhooks, or to stdout.

mod backoff;
mod change;
mod config;
mod controller;
mod diff;
mod duration;
mod error;
mod handler;
mod informer;
mod inspector;
mod lister;
mod metrics;
mod model;
mod queue;
#[cfg(test)]
mod test_utils;

use anyhow::{Context, anyhow};
use clap::Parser;
use config::{Args, Options};
use controller::Controller;
use kube::Client;
use metrics::{Metrics, ProbeState};
use notify_client::{Notifier, StdoutNotifier, WebhookFanout};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing(debug: bool) {
    let default = if debug { "info,kubenotify=debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    // Configure rustls crypto provider before any TLS client is built
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("failed to install rustls crypto provider"))?;

    info!("Starting kubenotify");
    let options = Options::try_from(args).context("invalid configuration")?;

    info!("Configuration:");
    info!("  Resources: {:?}", options.resources);
    info!(
        "  Namespaces: {}",
        if options.namespaces.is_empty() {
            "all namespaces".to_string()
        } else {
            format!("{:?}", options.namespaces)
        }
    );
    info!("  Webhooks: {}", options.webhooks.len());
    info!("  Workers: {}", options.workers);

    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;

    let notifier: Arc<dyn Notifier> = if options.webhooks.is_empty() {
        info!("No webhook configured, printing notifications to stdout");
        Arc::new(StdoutNotifier)
    } else {
        Arc::new(WebhookFanout::new(options.webhooks.clone()).context("invalid webhook")?)
    };

    let metrics = Metrics::new().context("failed to register metrics")?;
    let controller = Controller::new(&options, client, notifier, metrics.clone());

    let (stop_tx, mut stop_rx) = watch::channel(false);
    let probes = options.metrics_addr.map(|addr| {
        let state = ProbeState {
            metrics,
            sync: controller.sync_flags(),
        };
        tokio::spawn(async move {
            let stopped = async move {
                let _ = stop_rx.wait_for(|stop| *stop).await;
            };
            if let Err(e) = metrics::serve(addr, state, stopped).await {
                warn!("Probe server failed: {}", e);
            }
        })
    });

    let result = controller.run(shutdown_signal()).await;

    let _ = stop_tx.send(true);
    if let Some(probes) = probes {
        let _ = probes.await;
    }

    result.context("controller failed")
}
