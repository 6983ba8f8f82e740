//! Prometheus counters and the probe/metrics HTTP server.

use crate::change::ChangeAction;
use crate::error::ControllerError;
use crate::informer::SyncFlags;
use crate::model::WorkloadKind;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::routing::get;
use prometheus::{IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::future::Future;
use std::net::SocketAddr;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Where a notification came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationSource {
    Change,
    Inspection,
}

impl NotificationSource {
    fn as_str(self) -> &'static str {
        match self {
            Self::Change => "change",
            Self::Inspection => "inspection",
        }
    }
}

/// Controller counters, registered on a private registry.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    changes: IntCounterVec,
    notifications: IntCounterVec,
    inspections: IntCounterVec,
    requeues: IntCounter,
    dropped: IntCounter,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Metrics {
    pub fn new() -> Result<Self, ControllerError> {
        let registry = Registry::new();

        let changes = IntCounterVec::new(
            Opts::new("kubenotify_changes_total", "Detected workload changes"),
            &["kind", "action"],
        )?;
        let notifications = IntCounterVec::new(
            Opts::new("kubenotify_notifications_total", "Notifications sent"),
            &["source", "result"],
        )?;
        let inspections = IntCounterVec::new(
            Opts::new("kubenotify_inspections_total", "Readiness inspections"),
            &["kind", "result"],
        )?;
        let requeues = IntCounter::new("kubenotify_requeues_total", "Rate limited re-adds")?;
        let dropped = IntCounter::new("kubenotify_dropped_total", "Work items dropped after exhausting retries")?;

        registry.register(Box::new(changes.clone()))?;
        registry.register(Box::new(notifications.clone()))?;
        registry.register(Box::new(inspections.clone()))?;
        registry.register(Box::new(requeues.clone()))?;
        registry.register(Box::new(dropped.clone()))?;

        Ok(Self {
            registry,
            changes,
            notifications,
            inspections,
            requeues,
            dropped,
        })
    }

    pub fn record_change(&self, kind: WorkloadKind, action: ChangeAction) {
        self.changes.with_label_values(&[kind.as_str(), action.as_str()]).inc();
    }

    pub fn record_notification(&self, source: NotificationSource, ok: bool) {
        let result = if ok { "ok" } else { "error" };
        self.notifications.with_label_values(&[source.as_str(), result]).inc();
    }

    /// `result` is `ok` or an error label.
    pub fn record_inspection(&self, kind: WorkloadKind, result: &str) {
        self.inspections.with_label_values(&[kind.as_str(), result]).inc();
    }

    pub fn record_requeue(&self) {
        self.requeues.inc();
    }

    pub fn record_drop(&self) {
        self.dropped.inc();
    }

    /// Renders every counter in the Prometheus text format.
    pub fn encode(&self) -> Result<String, ControllerError> {
        Ok(TextEncoder::new().encode_to_string(&self.registry.gather())?)
    }
}

/// Shared state of the probe server.
#[derive(Debug, Clone)]
pub struct ProbeState {
    pub metrics: Metrics,
    pub sync: SyncFlags,
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(state): State<ProbeState>) -> impl IntoResponse {
    if state.sync.has_synced() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "caches not synced")
    }
}

async fn metrics(State(state): State<ProbeState>) -> impl IntoResponse {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// Routes for `/healthz`, `/readyz` and `/metrics`.
pub fn router(state: ProbeState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves the probe routes on `addr` until `shutdown` resolves.
pub async fn serve(
    addr: SocketAddr,
    state: ProbeState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), ControllerError> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Serving probes and metrics on {}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
