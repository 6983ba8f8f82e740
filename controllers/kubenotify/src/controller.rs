//! Main controller implementation.
//!
//! The `Controller` owns the informer tasks and the readiness worker pool:
//! - Pods and ReplicaSets are always cached, for lookups only
//! - ControllerRevisions are cached when revision tracking is enabled
//! - every enabled workload kind is cached and drives change detection
//!
//! Detected changes are queued as work items; workers pop them and run the
//! inspector until the queue shuts down.

use crate::backoff::controller_rate_limiter;
use crate::change::ChangeDetector;
use crate::config::Options;
use crate::error::ControllerError;
use crate::handler::WorkloadEventHandler;
use crate::informer::{Informer, ResourceEventHandler, SyncFlags};
use crate::inspector::{Inspector, Listers};
use crate::metrics::Metrics;
use crate::model::{WorkItem, Workload, WorkloadKind};
use crate::queue::WorkQueue;
use futures::future::select_all;
use k8s_openapi::api::apps::v1::{ControllerRevision, DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client, Resource};
use kube_runtime::reflector::Store;
use notify_client::Notifier;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type InformerTask = (&'static str, JoinHandle<Result<(), ControllerError>>);

/// Pops work items and inspects them.
#[derive(Clone)]
pub struct ReadinessWorker {
    queue: WorkQueue<WorkItem>,
    inspector: Arc<Inspector>,
    max_retries: u32,
    metrics: Option<Metrics>,
}

impl ReadinessWorker {
    pub fn new(queue: WorkQueue<WorkItem>, inspector: Arc<Inspector>, max_retries: u32) -> Self {
        Self {
            queue,
            inspector,
            max_retries,
            metrics: None,
        }
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Processes items until the queue shuts down.
    pub async fn run(self) {
        while self.process_next_work_item().await {}
    }

    /// Processes one item. Returns `false` once the queue has shut down.
    pub async fn process_next_work_item(&self) -> bool {
        let Some(item) = self.queue.get().await else {
            return false;
        };

        let result = self.inspector.inspect(item.kind, &item.key).await;
        self.handle_err(&item, result);
        self.queue.done(&item);
        true
    }

    fn handle_err(&self, item: &WorkItem, result: Result<(), ControllerError>) {
        let label = match &result {
            Ok(()) => "ok",
            Err(e) => e.label(),
        };
        if let Some(metrics) = &self.metrics {
            metrics.record_inspection(item.kind, label);
        }

        let Err(e) = result else {
            self.queue.forget(item);
            return;
        };

        let retries = self.queue.num_requeues(item);
        if retries < self.max_retries {
            debug!("retry {} ({}/{}): {}", item, retries + 1, self.max_retries, e);
            self.queue.add_rate_limited(item.clone());
            if let Some(metrics) = &self.metrics {
                metrics.record_requeue();
            }
            return;
        }

        warn!("drop {} after {} retries: {}", item, retries, e);
        self.queue.forget(item);
        if let Some(metrics) = &self.metrics {
            metrics.record_drop();
        }
    }
}

/// Main controller for change notification and readiness diagnosis.
pub struct Controller {
    workers: usize,
    queue: WorkQueue<WorkItem>,
    worker: ReadinessWorker,
    sync: SyncFlags,
    informers: Vec<InformerTask>,
}

impl Controller {
    /// Creates the caches and starts their watch tasks.
    pub fn new(options: &Options, client: Client, notifier: Arc<dyn Notifier>, metrics: Metrics) -> Self {
        info!("Initializing kubenotify controller");

        let queue = WorkQueue::new(controller_rate_limiter(options.init_backoff, options.max_backoff));
        let handler = Arc::new(
            WorkloadEventHandler::new(
                ChangeDetector::new(
                    options.filters.clone(),
                    options.ignore_created_before,
                    options.namespaces.clone(),
                ),
                queue.clone(),
                Arc::clone(&notifier),
                options.time_format.clone(),
                options.debug,
            )
            .with_metrics(metrics.clone()),
        );

        let mut sync = SyncFlags::default();
        let mut informers = Vec::new();
        let mut listers = Listers::default();

        listers.pods = Arc::new(start::<Pod>("Pod", &client, None, &mut sync, &mut informers));
        listers.replica_sets = Arc::new(start::<ReplicaSet>("ReplicaSet", &client, None, &mut sync, &mut informers));
        if options.enable_revision {
            listers.controller_revisions = Arc::new(start::<ControllerRevision>(
                "ControllerRevision",
                &client,
                None,
                &mut sync,
                &mut informers,
            ));
        }

        for kind in options.watched_kinds() {
            match kind {
                WorkloadKind::Deployment => {
                    listers.deployments =
                        Arc::new(start_workload::<Deployment>(&client, &handler, &mut sync, &mut informers));
                }
                WorkloadKind::StatefulSet => {
                    listers.stateful_sets =
                        Arc::new(start_workload::<StatefulSet>(&client, &handler, &mut sync, &mut informers));
                }
                WorkloadKind::DaemonSet => {
                    listers.daemon_sets =
                        Arc::new(start_workload::<DaemonSet>(&client, &handler, &mut sync, &mut informers));
                }
            }
        }

        let inspector = Inspector::new(listers, sync.clone(), notifier, options.enable_revision)
            .with_metrics(metrics.clone());
        let worker = ReadinessWorker::new(queue.clone(), Arc::new(inspector), options.max_retries)
            .with_metrics(metrics);

        Self {
            workers: options.workers,
            queue,
            worker,
            sync,
            informers,
        }
    }

    /// Sync gate of all caches.
    pub fn sync_flags(&self) -> SyncFlags {
        self.sync.clone()
    }

    /// Runs the workers until `shutdown` resolves or an informer exits.
    ///
    /// In-flight inspections finish before this returns.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<(), ControllerError> {
        let Self {
            workers,
            queue,
            worker,
            informers,
            ..
        } = self;

        info!("Starting {} readiness workers", workers);
        let pool: Vec<JoinHandle<()>> = (0..workers).map(|_| tokio::spawn(worker.clone().run())).collect();

        let (kinds, mut handles): (Vec<&'static str>, Vec<_>) = informers.into_iter().unzip();
        let result = tokio::select! {
            () = shutdown => {
                info!("Shutdown signal received");
                Ok(())
            }
            (exited, index, _) = select_all(handles.iter_mut()) => {
                let kind = kinds[index];
                match exited {
                    Ok(Ok(())) => Err(ControllerError::Watch(format!("{kind} informer exited"))),
                    Ok(Err(e)) => Err(e),
                    Err(e) => Err(ControllerError::Watch(format!("{kind} informer panicked: {e}"))),
                }
            }
        };

        if !queue.is_empty() {
            info!("Dropping {} queued work items", queue.len());
        }
        queue.shut_down();
        for handle in &handles {
            handle.abort();
        }
        for task in pool {
            if let Err(e) = task.await {
                warn!("Readiness worker panicked: {}", e);
            }
        }
        info!("kubenotify controller stopped");
        result
    }
}

/// Starts an informer over all namespaces and returns its store.
fn start<K>(
    kind: &'static str,
    client: &Client,
    handler: Option<Arc<dyn ResourceEventHandler<K>>>,
    sync: &mut SyncFlags,
    informers: &mut Vec<InformerTask>,
) -> Store<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let mut informer = Informer::new(kind);
    if let Some(handler) = handler {
        informer.add_event_handler(handler);
    }
    sync.push(informer.synced_flag());
    let store = informer.store();

    let api: Api<K> = Api::all(client.clone());
    informers.push((kind, tokio::spawn(informer.run(api))));
    store
}

fn start_workload<K: Workload>(
    client: &Client,
    handler: &Arc<WorkloadEventHandler>,
    sync: &mut SyncFlags,
    informers: &mut Vec<InformerTask>,
) -> Store<K> {
    let handler: Arc<dyn ResourceEventHandler<K>> = handler.clone();
    start(K::KIND.as_str(), client, Some(handler), sync, informers)
}
