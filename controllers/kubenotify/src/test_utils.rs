//! Test utilities for unit testing the detector, inspector and controller.
//!
//! Fixtures are built from JSON so they read like the manifests the API
//! server returns.

use k8s_openapi::api::apps::v1::{ControllerRevision, DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::Pod;
use serde_json::{Value, json};

fn from_json<T: serde::de::DeserializeOwned>(value: Value) -> T {
    serde_json::from_value(value).expect("fixture should deserialize")
}

fn owner(kind: &str, name: &str, uid: &str) -> Value {
    json!([{
        "apiVersion": "apps/v1",
        "kind": kind,
        "name": name,
        "uid": uid,
        "controller": true
    }])
}

/// Helper to create a Deployment with `replicas` desired and `ready` ready pods
pub fn deployment(
    namespace: &str,
    name: &str,
    uid: &str,
    created: &str,
    image: &str,
    replicas: i32,
    ready: i32,
) -> Deployment {
    from_json(json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": name,
            "namespace": namespace,
            "uid": uid,
            "resourceVersion": "1",
            "creationTimestamp": created
        },
        "spec": {
            "replicas": replicas,
            "selector": {"matchLabels": {"app": name}},
            "template": {
                "metadata": {"labels": {"app": name}},
                "spec": {"containers": [{"name": "app", "image": image}]}
            }
        },
        "status": {"replicas": replicas, "readyReplicas": ready}
    }))
}

/// Helper to create a ReplicaSet owned by the Deployment with `owner_uid`
pub fn replica_set(namespace: &str, name: &str, uid: &str, owner_uid: &str, created: &str) -> ReplicaSet {
    from_json(json!({
        "apiVersion": "apps/v1",
        "kind": "ReplicaSet",
        "metadata": {
            "name": name,
            "namespace": namespace,
            "uid": uid,
            "creationTimestamp": created,
            "ownerReferences": owner("Deployment", "owner", owner_uid)
        },
        "spec": {"selector": {"matchLabels": {"app": "x"}}}
    }))
}

/// Helper to create a StatefulSet
pub fn stateful_set(
    namespace: &str,
    name: &str,
    uid: &str,
    created: &str,
    replicas: i32,
    ready: i32,
    update_revision: &str,
) -> StatefulSet {
    from_json(json!({
        "apiVersion": "apps/v1",
        "kind": "StatefulSet",
        "metadata": {
            "name": name,
            "namespace": namespace,
            "uid": uid,
            "creationTimestamp": created
        },
        "spec": {
            "replicas": replicas,
            "serviceName": name,
            "selector": {"matchLabels": {"app": name}},
            "template": {
                "metadata": {"labels": {"app": name}},
                "spec": {"containers": [{"name": "db", "image": "postgres:16"}]}
            }
        },
        "status": {
            "replicas": replicas,
            "readyReplicas": ready,
            "updateRevision": update_revision
        }
    }))
}

/// Helper to create a ControllerRevision
pub fn controller_revision(namespace: &str, name: &str, created: &str) -> ControllerRevision {
    from_json(json!({
        "apiVersion": "apps/v1",
        "kind": "ControllerRevision",
        "metadata": {
            "name": name,
            "namespace": namespace,
            "creationTimestamp": created
        },
        "revision": 2
    }))
}

/// Helper to create a DaemonSet
pub fn daemon_set(namespace: &str, name: &str, uid: &str, created: &str, desired: i32, ready: i32) -> DaemonSet {
    from_json(json!({
        "apiVersion": "apps/v1",
        "kind": "DaemonSet",
        "metadata": {
            "name": name,
            "namespace": namespace,
            "uid": uid,
            "creationTimestamp": created
        },
        "spec": {
            "selector": {"matchLabels": {"app": name}},
            "template": {
                "metadata": {"labels": {"app": name}},
                "spec": {"containers": [{"name": "agent", "image": "agent:1"}]}
            }
        },
        "status": {
            "currentNumberScheduled": desired,
            "desiredNumberScheduled": desired,
            "numberMisscheduled": 0,
            "numberReady": ready
        }
    }))
}

/// Helper to create a Pod owned by `owner_uid` with the given container statuses
pub fn pod(
    namespace: &str,
    name: &str,
    owner_uid: &str,
    phase: &str,
    reason: Option<&str>,
    container_statuses: Value,
) -> Pod {
    let mut status = json!({
        "phase": phase,
        "containerStatuses": container_statuses
    });
    if let Some(reason) = reason {
        status["reason"] = json!(reason);
    }
    from_json(json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": name,
            "namespace": namespace,
            "ownerReferences": owner("ReplicaSet", "owner", owner_uid)
        },
        "spec": {"containers": [{"name": "app", "image": "app:1"}]},
        "status": status
    }))
}

/// Container status stuck in `waiting` with `reason`
pub fn waiting(container: &str, reason: &str) -> Value {
    json!({
        "name": container,
        "ready": false,
        "restartCount": 0,
        "image": "app:1",
        "imageID": "",
        "state": {"waiting": {"reason": reason}}
    })
}

/// Container status that `terminated` with `reason`
pub fn terminated(container: &str, reason: &str) -> Value {
    json!({
        "name": container,
        "ready": false,
        "restartCount": 1,
        "image": "app:1",
        "imageID": "",
        "state": {"terminated": {"exitCode": 1, "reason": reason}}
    })
}

/// Ready, running container status
pub fn running(container: &str) -> Value {
    json!({
        "name": container,
        "ready": true,
        "restartCount": 0,
        "image": "app:1",
        "imageID": "",
        "state": {"running": {"startedAt": "2024-05-01T09:00:00Z"}}
    })
}
