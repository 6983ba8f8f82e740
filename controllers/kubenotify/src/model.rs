//! Workload identities and queue keys.

use crate::error::ControllerError;
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::str::FromStr;

/// Workload kinds the controller can watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WorkloadKind {
    /// `apps/v1` Deployment
    Deployment,
    /// `apps/v1` StatefulSet
    StatefulSet,
    /// `apps/v1` DaemonSet
    DaemonSet,
}

impl WorkloadKind {
    /// Every supported kind, in a stable order.
    pub const ALL: [Self; 3] = [Self::Deployment, Self::StatefulSet, Self::DaemonSet];

    /// Kubernetes kind name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Deployment => "Deployment",
            Self::StatefulSet => "StatefulSet",
            Self::DaemonSet => "DaemonSet",
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkloadKind {
    type Err = ControllerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "deployment" | "deployments" => Ok(Self::Deployment),
            "statefulset" | "statefulsets" => Ok(Self::StatefulSet),
            "daemonset" | "daemonsets" => Ok(Self::DaemonSet),
            other => Err(ControllerError::InvalidConfig(format!(
                "unsupported resource: {other}"
            ))),
        }
    }
}

/// Identity of a watched workload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectIdentity {
    /// Workload kind
    pub kind: WorkloadKind,
    /// Namespace, empty for cluster-scoped objects
    pub namespace: String,
    /// Object name
    pub name: String,
}

impl ObjectIdentity {
    /// Identity of a typed workload object.
    pub fn of<K: Workload>(obj: &K) -> Self {
        Self {
            kind: K::KIND,
            namespace: obj.namespace().unwrap_or_default(),
            name: obj.name_any(),
        }
    }

    /// Cache key: `namespace/name`, or `name` when the namespace is empty.
    #[must_use]
    pub fn key(&self) -> String {
        meta_namespace_key(&self.namespace, &self.name)
    }

    /// Queue key for readiness inspection.
    #[must_use]
    pub fn work_item(&self) -> WorkItem {
        WorkItem {
            kind: self.kind,
            key: self.key(),
        }
    }
}

/// Unit of work in the scheduling queue: `<kind>;<namespace/name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkItem {
    /// Workload kind
    pub kind: WorkloadKind,
    /// Cache key of the workload
    pub key: String,
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};{}", self.kind, self.key)
    }
}

impl FromStr for WorkItem {
    type Err = ControllerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, key) = s
            .split_once(';')
            .ok_or_else(|| ControllerError::InvalidKey(s.to_string()))?;
        if key.is_empty() || key.contains(';') {
            return Err(ControllerError::InvalidKey(s.to_string()));
        }
        let kind = kind
            .parse()
            .map_err(|_| ControllerError::InvalidKey(s.to_string()))?;
        Ok(Self {
            kind,
            key: key.to_string(),
        })
    }
}

/// Builds a `namespace/name` cache key.
#[must_use]
pub fn meta_namespace_key(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{namespace}/{name}")
    }
}

/// Splits a cache key into `(namespace, name)`.
pub fn split_meta_namespace_key(key: &str) -> Result<(&str, &str), ControllerError> {
    let mut parts = key.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(name), None, None) if !name.is_empty() => Ok(("", name)),
        (Some(ns), Some(name), None) if !name.is_empty() => Ok((ns, name)),
        _ => Err(ControllerError::InvalidKey(key.to_string())),
    }
}

/// Converts an API timestamp into a chrono timestamp.
///
/// Goes through the wire representation so it does not depend on the
/// timestamp backend `k8s-openapi` was built with.
#[must_use]
pub fn to_chrono(time: &Time) -> Option<DateTime<Utc>> {
    let value = serde_json::to_value(time).ok()?;
    DateTime::parse_from_rfc3339(value.as_str()?)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Creation timestamp of any API object.
pub fn creation_time<K: Resource>(obj: &K) -> Option<DateTime<Utc>> {
    obj.meta().creation_timestamp.as_ref().and_then(to_chrono)
}

/// Typed workload objects that drive change detection.
pub trait Workload:
    Resource<DynamicType = ()> + Serialize + DeserializeOwned + fmt::Debug + Clone + Send + Sync + 'static
{
    /// Kind tag for this type.
    const KIND: WorkloadKind;
}

impl Workload for Deployment {
    const KIND: WorkloadKind = WorkloadKind::Deployment;
}

impl Workload for StatefulSet {
    const KIND: WorkloadKind = WorkloadKind::StatefulSet;
}

impl Workload for DaemonSet {
    const KIND: WorkloadKind = WorkloadKind::DaemonSet;
}
