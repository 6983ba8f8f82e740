//! Change detection: decides whether a lifecycle event is worth a
//! notification and renders the message.

use crate::diff::{FieldChange, diff};
use crate::error::ControllerError;
use crate::model::{ObjectIdentity, Workload, creation_time};
use chrono::{DateTime, Local, Offset, TimeDelta, TimeZone, Utc};
use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;
use std::fmt::{self, Write as _};
use tracing::debug;

/// Default strftime format for message timestamps.
pub const DEFAULT_TIME_FORMAT: &str = "%H:%M:%S%:z";

/// Path filters applied to every reported field change.
///
/// A path survives when no exclude matches and, if includes are configured,
/// at least one include matches. Patterns are searched, not anchored.
#[derive(Debug, Clone, Default)]
pub struct FilterSet {
    excludes: Vec<Regex>,
    includes: Vec<Regex>,
}

impl FilterSet {
    /// Builds a filter set from compiled patterns.
    #[must_use]
    pub fn new(excludes: Vec<Regex>, includes: Vec<Regex>) -> Self {
        Self { excludes, includes }
    }

    /// Compiles a filter set, failing on the first invalid pattern.
    pub fn compile<S: AsRef<str>>(excludes: &[S], includes: &[S]) -> Result<Self, ControllerError> {
        Ok(Self::new(compile_all(excludes)?, compile_all(includes)?))
    }

    /// Whether a dotted path survives the filters.
    #[must_use]
    pub fn allows(&self, path: &str) -> bool {
        if self.excludes.iter().any(|re| re.is_match(path)) {
            return false;
        }
        self.includes.is_empty() || self.includes.iter().any(|re| re.is_match(path))
    }
}

fn compile_all<S: AsRef<str>>(patterns: &[S]) -> Result<Vec<Regex>, ControllerError> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(p.as_ref()).map_err(|e| {
                ControllerError::InvalidConfig(format!("invalid pattern {:?}: {e}", p.as_ref()))
            })
        })
        .collect()
}

/// An object marshalled to a generic JSON tree, plus the metadata the
/// detector needs.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectSnapshot {
    pub identity: ObjectIdentity,
    pub value: Value,
    pub resource_version: Option<String>,
    pub creation_timestamp: Option<DateTime<Utc>>,
    pub owner_uid: Option<String>,
}

impl ObjectSnapshot {
    /// Snapshots a typed workload.
    pub fn from_workload<K: Workload>(obj: &K) -> Result<Self, ControllerError> {
        let meta = obj.meta();
        Ok(Self {
            identity: ObjectIdentity::of(obj),
            value: serde_json::to_value(obj)?,
            resource_version: meta.resource_version.clone(),
            creation_timestamp: creation_time(obj),
            owner_uid: meta
                .owner_references
                .as_ref()
                .and_then(|refs| refs.iter().find(|r| r.controller == Some(true)))
                .map(|r| r.uid.clone()),
        })
    }
}

/// What happened to the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeAction {
    Created,
    Updated,
    Deleted,
}

impl ChangeAction {
    /// Lower-case label used for metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
        }
    }
}

/// A notification-worthy change.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    pub identity: ObjectIdentity,
    pub action: ChangeAction,
    /// Creation time for `Created`, observation time otherwise
    pub at: DateTime<Utc>,
    /// Surviving field changes, in diff order; empty unless `Updated`
    pub field_changes: Vec<FieldChange>,
    pub resource_version: Option<String>,
}

impl ChangeRecord {
    /// Renders the message with timestamps in local time.
    #[must_use]
    pub fn render(&self, time_format: &str, debug: bool) -> String {
        self.render_in(&Local, time_format, debug)
    }

    /// Renders the message with timestamps in `tz`.
    pub fn render_in<Tz>(&self, tz: &Tz, time_format: &str, debug: bool) -> String
    where
        Tz: TimeZone,
        Tz::Offset: fmt::Display,
    {
        let ts = format_time(&self.at.with_timezone(tz), time_format);
        let mut msg = match self.action {
            ChangeAction::Created => format!("{}({}) CreatedAt({ts})", self.identity.kind, self.identity.key()),
            ChangeAction::Deleted => format!("{}({}) DeletedAt({ts})", self.identity.kind, self.identity.key()),
            ChangeAction::Updated => {
                let mut msg = format!("{}({}) ChangedAt({ts})", self.identity.kind, self.identity.key());
                for change in &self.field_changes {
                    msg.push(' ');
                    msg.push_str(&render_field_change(change));
                }
                msg
            }
        };

        if debug {
            let _ = write!(msg, " ResourceVersion({})", self.resource_version.as_deref().unwrap_or(""));
        }
        msg
    }
}

fn format_time<Tz>(ts: &DateTime<Tz>, time_format: &str) -> String
where
    Tz: TimeZone,
    Tz::Offset: fmt::Display,
{
    // `%:z` renders a zero offset as `Z`
    let utc_format;
    let time_format = if ts.offset().fix().local_minus_utc() == 0 && time_format.contains("%:z") {
        utc_format = time_format.replace("%:z", "Z");
        utc_format.as_str()
    } else {
        time_format
    };

    let mut out = String::new();
    if write!(out, "{}", ts.format(time_format)).is_err() {
        // Unparseable format strings are rejected at startup; keep going anyway.
        return ts.to_rfc3339();
    }
    out
}

/// Renders one change as `path(from - to)`.
#[must_use]
pub fn render_field_change(change: &FieldChange) -> String {
    format!(
        "{}({} - {})",
        change.dotted_path(),
        render_value(change.from.as_ref()),
        render_value(change.to.as_ref())
    )
}

fn render_value(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => "<nil>".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Decides which lifecycle events are notification-worthy.
#[derive(Debug, Clone)]
pub struct ChangeDetector {
    filters: FilterSet,
    ignore_created_before: TimeDelta,
    include_namespaces: HashSet<String>,
}

impl ChangeDetector {
    #[must_use]
    pub fn new(filters: FilterSet, ignore_created_before: TimeDelta, include_namespaces: HashSet<String>) -> Self {
        Self {
            filters,
            ignore_created_before,
            include_namespaces,
        }
    }

    /// Detects a change between two typed objects.
    ///
    /// `before = None` is a creation, `after = None` a deletion.
    pub fn detect<K: Workload>(
        &self,
        before: Option<&K>,
        after: Option<&K>,
        now: DateTime<Utc>,
    ) -> Result<Option<ChangeRecord>, ControllerError> {
        let before = before.map(ObjectSnapshot::from_workload).transpose()?;
        let after = after.map(ObjectSnapshot::from_workload).transpose()?;
        Ok(self.detect_snapshots(before.as_ref(), after.as_ref(), now))
    }

    /// Detects a change between two snapshots.
    #[must_use]
    pub fn detect_snapshots(
        &self,
        before: Option<&ObjectSnapshot>,
        after: Option<&ObjectSnapshot>,
        now: DateTime<Utc>,
    ) -> Option<ChangeRecord> {
        let current = after.or(before)?;
        let namespace = &current.identity.namespace;
        if !self.include_namespaces.is_empty()
            && !namespace.is_empty()
            && !self.include_namespaces.contains(namespace)
        {
            return None;
        }

        match (before, after) {
            (None, Some(created)) => {
                // Without a creation timestamp the object is treated as old.
                let created_at = created.creation_timestamp?;
                if now - created_at > self.ignore_created_before {
                    debug!(
                        "replayed creation of {}({}) owned by {}",
                        created.identity.kind,
                        created.identity.key(),
                        created.owner_uid.as_deref().unwrap_or("<none>")
                    );
                    return None;
                }
                Some(ChangeRecord {
                    identity: created.identity.clone(),
                    action: ChangeAction::Created,
                    at: created_at,
                    field_changes: Vec::new(),
                    resource_version: created.resource_version.clone(),
                })
            }
            (Some(deleted), None) => Some(ChangeRecord {
                identity: deleted.identity.clone(),
                action: ChangeAction::Deleted,
                at: now,
                field_changes: Vec::new(),
                resource_version: deleted.resource_version.clone(),
            }),
            (Some(old), Some(new)) => {
                let field_changes: Vec<FieldChange> = diff(&old.value, &new.value)
                    .into_iter()
                    .filter(|c| self.filters.allows(&c.dotted_path()))
                    .collect();
                if field_changes.is_empty() {
                    return None;
                }
                Some(ChangeRecord {
                    identity: new.identity.clone(),
                    action: ChangeAction::Updated,
                    at: now,
                    field_changes,
                    resource_version: new.resource_version.clone(),
                })
            }
            (None, None) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::WorkloadKind;
    use crate::test_utils::deployment;
    use k8s_openapi::api::apps::v1::Deployment;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn detector(excludes: &[&str], includes: &[&str], namespaces: &[&str]) -> ChangeDetector {
        ChangeDetector::new(
            FilterSet::compile(excludes, includes).unwrap(),
            TimeDelta::minutes(1),
            namespaces.iter().map(|s| s.to_string()).collect(),
        )
    }

    fn web(namespace: &str, created: &str, image: &str, ready: i32) -> Deployment {
        deployment(namespace, "web", "uid-web", created, image, 3, ready)
    }

    #[test]
    fn test_filter_set_excludes_then_includes() {
        let filters = FilterSet::compile(&["^status\\."], &["image", "replicas"]).unwrap();
        assert!(filters.allows("spec.template.spec.containers.0.image"));
        assert!(filters.allows("spec.replicas"));
        assert!(!filters.allows("status.replicas"), "excludes win");
        assert!(!filters.allows("spec.paused"), "not included");
        assert!(FilterSet::default().allows("anything"));
    }

    #[test]
    fn test_filter_set_rejects_invalid_pattern() {
        let err = FilterSet::compile(&["("], &[]).unwrap_err();
        assert!(matches!(err, ControllerError::InvalidConfig(_)));
    }

    #[test]
    fn test_created_outside_ignore_window_is_suppressed() {
        let d = detector(&[], &[], &[]);
        let old = web("default", "2024-05-01T09:58:00Z", "nginx:1", 3);
        assert!(d.detect(None, Some(&old), now()).unwrap().is_none());
    }

    #[test]
    fn test_created_inside_ignore_window() {
        let d = detector(&[], &[], &[]);
        let fresh = web("default", "2024-05-01T09:59:30Z", "nginx:1", 0);

        let record = d.detect(None, Some(&fresh), now()).unwrap().unwrap();

        assert_eq!(record.action, ChangeAction::Created);
        assert!(record.field_changes.is_empty());
        assert_eq!(
            record.render_in(&Utc, "%H:%M:%S", false),
            "Deployment(default/web) CreatedAt(09:59:30)"
        );
    }

    #[test]
    fn test_deleted_is_always_reported() {
        let d = detector(&[], &[], &[]);
        let old = web("default", "2020-01-01T00:00:00Z", "nginx:1", 3);

        let record = d.detect(Some(&old), None, now()).unwrap().unwrap();

        assert_eq!(record.action, ChangeAction::Deleted);
        assert_eq!(
            record.render_in(&Utc, "%H:%M:%S%:z", false),
            "Deployment(default/web) DeletedAt(10:00:00Z)"
        );
    }

    #[test]
    fn test_default_time_format_offsets() {
        let d = detector(&[], &[], &[]);
        let old = web("default", "2020-01-01T00:00:00Z", "nginx:1", 3);
        let record = d.detect(Some(&old), None, now()).unwrap().unwrap();

        let east = chrono::FixedOffset::east_opt(2 * 3600).unwrap();
        assert_eq!(
            record.render_in(&east, DEFAULT_TIME_FORMAT, false),
            "Deployment(default/web) DeletedAt(12:00:00+02:00)"
        );
        assert_eq!(
            record.render_in(&Utc, DEFAULT_TIME_FORMAT, false),
            "Deployment(default/web) DeletedAt(10:00:00Z)"
        );
    }

    #[test]
    fn test_snapshot_records_controller_owner() {
        let mut obj = web("default", "2020-01-01T00:00:00Z", "nginx:1", 3);
        obj.metadata.owner_references = Some(vec![
            serde_json::from_value(json!({
                "apiVersion": "v1", "kind": "ConfigMap", "name": "ref", "uid": "uid-ref"
            }))
            .unwrap(),
            serde_json::from_value(json!({
                "apiVersion": "example.com/v1", "kind": "App", "name": "web",
                "uid": "uid-app", "controller": true
            }))
            .unwrap(),
        ]);

        let snapshot = ObjectSnapshot::from_workload(&obj).unwrap();
        assert_eq!(snapshot.owner_uid.as_deref(), Some("uid-app"));
        assert_eq!(snapshot.resource_version, obj.metadata.resource_version);

        let unowned = ObjectSnapshot::from_workload(&web("default", "2020-01-01T00:00:00Z", "nginx:1", 3)).unwrap();
        assert_eq!(unowned.owner_uid, None);
    }

    #[test]
    fn test_update_keeps_only_filtered_changes() {
        let d = detector(&["status\\..*"], &[], &[]);
        let before = web("default", "2020-01-01T00:00:00Z", "nginx:1", 3);
        let after = web("default", "2020-01-01T00:00:00Z", "nginx:2", 2);

        let record = d.detect(Some(&before), Some(&after), now()).unwrap().unwrap();

        let paths: Vec<String> = record.field_changes.iter().map(FieldChange::dotted_path).collect();
        assert_eq!(paths, vec!["spec.template.spec.containers.0.image"]);
        assert_eq!(
            record.render_in(&Utc, "%H:%M:%S", false),
            "Deployment(default/web) ChangedAt(10:00:00) spec.template.spec.containers.0.image(nginx:1 - nginx:2)"
        );
    }

    #[test]
    fn test_update_with_only_filtered_paths_is_ignored() {
        let d = detector(&["^status\\."], &[], &[]);
        let before = web("default", "2020-01-01T00:00:00Z", "nginx:1", 3);
        let after = web("default", "2020-01-01T00:00:00Z", "nginx:1", 1);

        assert!(d.detect(Some(&before), Some(&after), now()).unwrap().is_none());
    }

    #[test]
    fn test_identical_pair_never_notifies() {
        let d = detector(&[], &[], &[]);
        let obj = web("default", "2020-01-01T00:00:00Z", "nginx:1", 3);
        for _ in 0..3 {
            assert!(d.detect(Some(&obj), Some(&obj), now()).unwrap().is_none());
        }
    }

    #[test]
    fn test_namespace_allow_list_wins() {
        let d = detector(&[], &[], &["prod"]);
        let fresh = web("staging", "2024-05-01T09:59:59Z", "nginx:1", 0);
        let changed = web("staging", "2024-05-01T09:59:59Z", "nginx:2", 0);

        assert!(d.detect(None, Some(&fresh), now()).unwrap().is_none());
        assert!(d.detect(Some(&fresh), Some(&changed), now()).unwrap().is_none());
        assert!(d.detect(Some(&fresh), None, now()).unwrap().is_none());

        let prod = web("prod", "2024-05-01T09:59:59Z", "nginx:1", 0);
        assert!(d.detect(None, Some(&prod), now()).unwrap().is_some());
    }

    #[test]
    fn test_debug_appends_resource_version() {
        let record = ChangeRecord {
            identity: ObjectIdentity {
                kind: WorkloadKind::DaemonSet,
                namespace: "kube-system".to_string(),
                name: "agent".to_string(),
            },
            action: ChangeAction::Deleted,
            at: now(),
            field_changes: Vec::new(),
            resource_version: Some("4711".to_string()),
        };
        assert_eq!(
            record.render_in(&Utc, "%H:%M", true),
            "DaemonSet(kube-system/agent) DeletedAt(10:00) ResourceVersion(4711)"
        );
    }

    #[test]
    fn test_render_field_change_values() {
        let added = FieldChange {
            path: vec!["metadata".into(), "labels".into(), "tier".into()],
            from: None,
            to: Some(json!("web")),
        };
        assert_eq!(render_field_change(&added), "metadata.labels.tier(<nil> - web)");

        let replicas = FieldChange {
            path: vec!["spec".into(), "replicas".into()],
            from: Some(json!(3)),
            to: Some(json!(5)),
        };
        assert_eq!(render_field_change(&replicas), "spec.replicas(3 - 5)");

        let args = FieldChange {
            path: vec!["args".into()],
            from: Some(json!(["a", "b"])),
            to: Some(Value::Null),
        };
        assert_eq!(render_field_change(&args), "args([\"a\",\"b\"] - <nil>)");
    }
}
