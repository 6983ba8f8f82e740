//! Readiness inspection.
//!
//! For a workload with fewer ready replicas than desired, the inspector
//! walks the ownership graph down to the pods:
//!
//! - Deployment: newest owned ReplicaSet, then its pods
//! - StatefulSet: its own pods, aged by the current update revision
//! - DaemonSet: its own pods
//!
//! and reports every owned pod that is not running, with the most specific
//! reason it can find. The inspection then fails with `NotReady` so the
//! queue checks again later.

use crate::duration::pretty_duration;
use crate::error::ControllerError;
use crate::informer::SyncFlags;
use crate::lister::{Lister, StaticLister};
use crate::metrics::{Metrics, NotificationSource};
use crate::model::{ObjectIdentity, WorkloadKind, creation_time, meta_namespace_key, split_meta_namespace_key};
use chrono::{DateTime, TimeDelta, Utc};
use k8s_openapi::api::apps::v1::{ControllerRevision, DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;
use notify_client::Notifier;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Read access to every cache the inspector walks.
#[derive(Clone)]
pub struct Listers {
    pub pods: Arc<dyn Lister<Pod>>,
    pub replica_sets: Arc<dyn Lister<ReplicaSet>>,
    pub deployments: Arc<dyn Lister<Deployment>>,
    pub stateful_sets: Arc<dyn Lister<StatefulSet>>,
    pub daemon_sets: Arc<dyn Lister<DaemonSet>>,
    pub controller_revisions: Arc<dyn Lister<ControllerRevision>>,
}

impl Default for Listers {
    fn default() -> Self {
        Self {
            pods: Arc::new(StaticLister::default()),
            replica_sets: Arc::new(StaticLister::default()),
            deployments: Arc::new(StaticLister::default()),
            stateful_sets: Arc::new(StaticLister::default()),
            daemon_sets: Arc::new(StaticLister::default()),
            controller_revisions: Arc::new(StaticLister::default()),
        }
    }
}

/// Kind-independent view of the inspected workload.
#[derive(Debug, Clone, Default)]
struct Primary {
    uid: Option<String>,
    created: Option<DateTime<Utc>>,
    desired: i32,
    ready: i32,
    update_revision: Option<String>,
}

/// The object whose pods are diagnosed, and when it was created.
#[derive(Debug, Clone, Default)]
struct Owner {
    uid: Option<String>,
    created: Option<DateTime<Utc>>,
}

type LookupFn = fn(&Inspector, &str, &str) -> Option<Primary>;
type ResolveOwnerFn = fn(&Inspector, &str, &Primary) -> Result<Owner, ControllerError>;

/// Per-kind accessors.
struct KindTable {
    lookup: LookupFn,
    resolve_owner: ResolveOwnerFn,
}

const DEPLOYMENT: KindTable = KindTable {
    lookup: lookup_deployment,
    resolve_owner: newest_replica_set,
};

const STATEFUL_SET: KindTable = KindTable {
    lookup: lookup_stateful_set,
    resolve_owner: stateful_set_revision,
};

const DAEMON_SET: KindTable = KindTable {
    lookup: lookup_daemon_set,
    resolve_owner: itself,
};

fn table(kind: WorkloadKind) -> &'static KindTable {
    match kind {
        WorkloadKind::Deployment => &DEPLOYMENT,
        WorkloadKind::StatefulSet => &STATEFUL_SET,
        WorkloadKind::DaemonSet => &DAEMON_SET,
    }
}

fn lookup_deployment(inspector: &Inspector, ns: &str, name: &str) -> Option<Primary> {
    let obj = inspector.listers.deployments.get(ns, name)?;
    let status = obj.status.clone().unwrap_or_default();
    Some(Primary {
        uid: obj.uid(),
        created: creation_time(&*obj),
        desired: status.replicas.unwrap_or(0),
        ready: status.ready_replicas.unwrap_or(0),
        update_revision: None,
    })
}

fn lookup_stateful_set(inspector: &Inspector, ns: &str, name: &str) -> Option<Primary> {
    let obj = inspector.listers.stateful_sets.get(ns, name)?;
    let status = obj.status.clone().unwrap_or_default();
    Some(Primary {
        uid: obj.uid(),
        created: creation_time(&*obj),
        desired: status.replicas,
        ready: status.ready_replicas.unwrap_or(0),
        update_revision: status.update_revision,
    })
}

fn lookup_daemon_set(inspector: &Inspector, ns: &str, name: &str) -> Option<Primary> {
    let obj = inspector.listers.daemon_sets.get(ns, name)?;
    let status = obj.status.clone().unwrap_or_default();
    Some(Primary {
        uid: obj.uid(),
        created: creation_time(&*obj),
        desired: status.desired_number_scheduled,
        ready: status.number_ready,
        update_revision: None,
    })
}

fn owned_by(references: Option<&Vec<OwnerReference>>, uid: &str) -> bool {
    references.is_some_and(|refs| refs.iter().any(|r| r.uid == uid))
}

/// Newest ReplicaSet owned by the deployment; ties go to the last name.
fn newest_replica_set(inspector: &Inspector, ns: &str, primary: &Primary) -> Result<Owner, ControllerError> {
    let Some(uid) = primary.uid.as_deref() else {
        return Ok(Owner::default());
    };

    let newest = inspector
        .listers
        .replica_sets
        .list(ns)
        .into_iter()
        .filter(|rs| owned_by(rs.metadata.owner_references.as_ref(), uid))
        .max_by(|a, b| {
            creation_time(&**a)
                .cmp(&creation_time(&**b))
                .then_with(|| a.name_any().cmp(&b.name_any()))
        });

    Ok(newest.map_or_else(Owner::default, |rs| Owner {
        uid: rs.uid(),
        created: creation_time(&*rs),
    }))
}

fn stateful_set_revision(inspector: &Inspector, ns: &str, primary: &Primary) -> Result<Owner, ControllerError> {
    let mut owner = itself(inspector, ns, primary)?;
    if !inspector.enable_revision {
        return Ok(owner);
    }

    let revision_name = primary.update_revision.as_deref().unwrap_or_default();
    let revision = inspector
        .listers
        .controller_revisions
        .get(ns, revision_name)
        .ok_or_else(|| ControllerError::NotFound {
            kind: "ControllerRevision".to_string(),
            key: meta_namespace_key(ns, revision_name),
        })?;
    owner.created = creation_time(&*revision);
    Ok(owner)
}

fn itself(_inspector: &Inspector, _ns: &str, primary: &Primary) -> Result<Owner, ControllerError> {
    Ok(Owner {
        uid: primary.uid.clone(),
        created: primary.created,
    })
}

/// Phase and reason of one unhealthy pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodDiagnosis {
    pub phase: String,
    pub reason: String,
}

impl PodDiagnosis {
    /// Diagnoses a pod: the pod-level reason, replaced by
    /// `container[reason]` for each unready container (the last one wins).
    #[must_use]
    pub fn of(pod: &Pod) -> Self {
        let status = pod.status.as_ref();
        let phase = status.and_then(|s| s.phase.clone()).unwrap_or_default();
        let mut reason = status.and_then(|s| s.reason.clone()).unwrap_or_default();

        let containers = status.and_then(|s| s.container_statuses.as_ref());
        for container in containers.into_iter().flatten() {
            if container.ready {
                continue;
            }
            let state = container.state.as_ref();
            if let Some(waiting) = state.and_then(|s| s.waiting.as_ref()) {
                reason = format!("{}[{}]", container.name, waiting.reason.as_deref().unwrap_or_default());
            } else if let Some(terminated) = state.and_then(|s| s.terminated.as_ref()) {
                reason = format!("{}[{}]", container.name, terminated.reason.as_deref().unwrap_or_default());
            }
        }

        Self { phase, reason }
    }
}

impl fmt::Display for PodDiagnosis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.phase, self.reason)
    }
}

/// Result of one inspection.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadinessReport {
    pub identity: ObjectIdentity,
    pub age: TimeDelta,
    pub ready: i32,
    pub desired: i32,
    pub pods: Vec<PodDiagnosis>,
}

impl ReadinessReport {
    pub fn is_ready(&self) -> bool {
        self.ready == self.desired
    }

    /// `<kind>(<key>) Age(<age>) READY(<ready>/<desired>) <phase>(<reason>) ...`
    pub fn render(&self) -> String {
        let mut msg = format!(
            "{}({}) Age({}) READY({}/{})",
            self.identity.kind,
            self.identity.key(),
            pretty_duration(self.age, 2),
            self.ready,
            self.desired
        );
        for pod in &self.pods {
            msg.push(' ');
            msg.push_str(&pod.to_string());
        }
        msg
    }
}

/// Diagnoses workloads that are not fully ready.
pub struct Inspector {
    listers: Listers,
    sync: SyncFlags,
    notifier: Arc<dyn Notifier>,
    enable_revision: bool,
    metrics: Option<Metrics>,
}

impl Inspector {
    pub fn new(listers: Listers, sync: SyncFlags, notifier: Arc<dyn Notifier>, enable_revision: bool) -> Self {
        Self {
            listers,
            sync,
            notifier,
            enable_revision,
            metrics: None,
        }
    }

    /// Counts sent notifications on `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Inspects the workload `key` of `kind` now.
    pub async fn inspect(&self, kind: WorkloadKind, key: &str) -> Result<(), ControllerError> {
        self.inspect_at(kind, key, Utc::now()).await
    }

    /// Inspects the workload, computing ages relative to `now`.
    ///
    /// Succeeds when the workload is ready. Otherwise the diagnosis is sent
    /// to the notifier and `NotReady` is returned.
    pub async fn inspect_at(&self, kind: WorkloadKind, key: &str, now: DateTime<Utc>) -> Result<(), ControllerError> {
        let report = self.report(kind, key, now)?;
        if report.is_ready() {
            debug!("{}", report.render());
            return Ok(());
        }

        let msg = report.render();
        let sent = self.notifier.notify(&msg).await;
        if let Err(e) = &sent {
            warn!("notify {}: {}", msg, e);
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_notification(NotificationSource::Inspection, sent.is_ok());
        }

        Err(ControllerError::NotReady(format!("{kind}({key})")))
    }

    /// Builds the readiness report without notifying.
    pub fn report(&self, kind: WorkloadKind, key: &str, now: DateTime<Utc>) -> Result<ReadinessReport, ControllerError> {
        let (ns, name) = split_meta_namespace_key(key)?;
        if !self.sync.has_synced() {
            return Err(ControllerError::NotSynced);
        }

        let table = table(kind);
        let primary = (table.lookup)(self, ns, name).ok_or_else(|| ControllerError::NotFound {
            kind: kind.to_string(),
            key: key.to_string(),
        })?;

        let identity = ObjectIdentity {
            kind,
            namespace: ns.to_string(),
            name: name.to_string(),
        };
        if primary.desired == primary.ready {
            return Ok(ReadinessReport {
                identity,
                age: age(primary.created, now),
                ready: primary.ready,
                desired: primary.desired,
                pods: Vec::new(),
            });
        }

        let owner = (table.resolve_owner)(self, ns, &primary)?;
        let pods = match owner.uid.as_deref() {
            Some(uid) => self
                .listers
                .pods
                .list(ns)
                .into_iter()
                .filter(|pod| owned_by(pod.metadata.owner_references.as_ref(), uid))
                .filter(|pod| pod.status.as_ref().and_then(|s| s.phase.as_deref()) != Some("Running"))
                .map(|pod| PodDiagnosis::of(&pod))
                .collect(),
            None => Vec::new(),
        };

        Ok(ReadinessReport {
            identity,
            age: age(owner.created, now),
            ready: primary.ready,
            desired: primary.desired,
            pods,
        })
    }
}

fn age(created: Option<DateTime<Utc>>, now: DateTime<Utc>) -> TimeDelta {
    created.map_or_else(TimeDelta::zero, |created| now - created)
}
