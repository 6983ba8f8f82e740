//! Workload event handler.
//!
//! Runs the change detector on every workload event. A detected change is
//! scheduled for a readiness inspection and announced through the notifier.

use crate::change::{ChangeDetector, ChangeRecord};
use crate::informer::ResourceEventHandler;
use crate::metrics::{Metrics, NotificationSource};
use crate::model::{ObjectIdentity, WorkItem, Workload};
use crate::queue::WorkQueue;
use chrono::{DateTime, Utc};
use kube::ResourceExt;
use notify_client::Notifier;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Connects workload informers to the detector, the queue and the notifier.
pub struct WorkloadEventHandler {
    detector: ChangeDetector,
    queue: WorkQueue<WorkItem>,
    notifier: Arc<dyn Notifier>,
    time_format: String,
    debug: bool,
    metrics: Option<Metrics>,
}

impl WorkloadEventHandler {
    pub fn new(
        detector: ChangeDetector,
        queue: WorkQueue<WorkItem>,
        notifier: Arc<dyn Notifier>,
        time_format: String,
        debug: bool,
    ) -> Self {
        Self {
            detector,
            queue,
            notifier,
            time_format,
            debug,
            metrics: None,
        }
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Handles one event; `before = None` is a creation, `after = None` a deletion.
    pub fn on_change<K: Workload>(&self, before: Option<&K>, after: Option<&K>) {
        self.on_change_at(before, after, Utc::now());
    }

    /// Returns the notification task when a change was detected.
    pub(crate) fn on_change_at<K: Workload>(
        &self,
        before: Option<&K>,
        after: Option<&K>,
        now: DateTime<Utc>,
    ) -> Option<JoinHandle<()>> {
        let obj = after.or(before)?;
        let identity = ObjectIdentity::of(obj);

        let record = match self.detector.detect(before, after, now) {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!(
                    "ignore {}({}-{})",
                    identity.kind,
                    identity.key(),
                    obj.resource_version().unwrap_or_default()
                );
                return None;
            }
            Err(e) => {
                warn!("diff {}({}): {}", identity.kind, identity.key(), e);
                return None;
            }
        };

        debug!(
            "enqueue {}({}-{})",
            identity.kind,
            identity.key(),
            obj.resource_version().unwrap_or_default()
        );
        self.queue.add(identity.work_item());

        if let Some(metrics) = &self.metrics {
            metrics.record_change(identity.kind, record.action);
        }
        Some(self.send(&record))
    }

    fn send(&self, record: &ChangeRecord) -> JoinHandle<()> {
        let msg = record.render(&self.time_format, self.debug);
        let notifier = Arc::clone(&self.notifier);
        let metrics = self.metrics.clone();

        tokio::spawn(async move {
            let sent = notifier.notify(&msg).await;
            if let Err(e) = &sent {
                warn!("notify msg({}): {}", msg, e);
            }
            if let Some(metrics) = metrics {
                metrics.record_notification(NotificationSource::Change, sent.is_ok());
            }
        })
    }
}

impl<K: Workload> ResourceEventHandler<K> for WorkloadEventHandler {
    fn on_add(&self, obj: &K) {
        self.on_change(None, Some(obj));
    }

    fn on_update(&self, old: &K, new: &K) {
        self.on_change(Some(old), Some(new));
    }

    fn on_delete(&self, obj: &K) {
        self.on_change(Some(obj), None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::controller_rate_limiter;
    use crate::change::FilterSet;
    use crate::model::WorkloadKind;
    use crate::test_utils::deployment;
    use chrono::TimeDelta;
    use k8s_openapi::api::apps::v1::Deployment;
    use notify_client::MockNotifier;
    use std::collections::HashSet;
    use std::time::Duration;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn handler(notifier: &MockNotifier) -> (WorkloadEventHandler, WorkQueue<WorkItem>) {
        let queue = WorkQueue::new(controller_rate_limiter(Duration::from_millis(10), Duration::from_secs(1)));
        let detector = ChangeDetector::new(
            FilterSet::compile(&["^metadata\\.", "^status\\."], &[]).unwrap(),
            TimeDelta::minutes(1),
            HashSet::new(),
        );
        let handler = WorkloadEventHandler::new(
            detector,
            queue.clone(),
            Arc::new(notifier.clone()),
            "%H:%M:%S".to_string(),
            false,
        );
        (handler, queue)
    }

    fn web(image: &str, ready: i32) -> Deployment {
        deployment("prod", "web", "uid-web", "2024-05-01T09:59:30Z", image, 3, ready)
    }

    #[tokio::test]
    async fn test_update_enqueues_and_notifies() {
        let notifier = MockNotifier::new();
        let (handler, queue) = handler(&notifier);

        let task = handler.on_change_at(Some(&web("web:1", 3)), Some(&web("web:2", 3)), now());
        task.unwrap().await.unwrap();

        assert_eq!(queue.len(), 1);
        let item = queue.get().await.unwrap();
        assert_eq!(item.to_string(), "Deployment;prod/web");

        let messages = notifier.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].starts_with("Deployment(prod/web) ChangedAt("));
        assert!(messages[0].ends_with("spec.template.spec.containers.0.image(web:1 - web:2)"));
    }

    #[tokio::test]
    async fn test_filtered_update_neither_enqueues_nor_notifies() {
        let notifier = MockNotifier::new();
        let (handler, queue) = handler(&notifier);

        let task = handler.on_change_at(Some(&web("web:1", 3)), Some(&web("web:1", 1)), now());

        assert!(task.is_none());
        assert!(queue.is_empty());
        assert_eq!(notifier.count(), 0);
    }

    #[tokio::test]
    async fn test_notify_failure_is_swallowed() {
        let notifier = MockNotifier::new();
        notifier.set_failing(true);
        let (handler, queue) = handler(&notifier);

        let task = handler.on_change_at(None, Some(&web("web:1", 0)), now());
        task.unwrap().await.unwrap();

        assert_eq!(notifier.count(), 1);
        assert_eq!(queue.len(), 1, "enqueue does not depend on delivery");
    }

    #[tokio::test]
    async fn test_delete_enqueues_work_item() {
        let notifier = MockNotifier::new();
        let (handler, queue) = handler(&notifier);

        ResourceEventHandler::<Deployment>::on_delete(&handler, &web("web:1", 3));

        let item = queue.get().await.unwrap();
        assert_eq!(item.kind, WorkloadKind::Deployment);
        assert_eq!(item.key, "prod/web");
    }
}
