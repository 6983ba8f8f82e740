//! Kubernetes watch caches.
//!
//! An [`Informer`] keeps a local reflector store of one resource kind up to
//! date from a watch stream and turns the stream into add/update/delete
//! callbacks on registered [`ResourceEventHandler`]s.
//!
//! The previous version of an object is read from the store before the
//! event is written, so updates carry both sides. When the watch relists,
//! objects that disappeared while the watch was down are reported as
//! deletions once the relist completes.

use crate::error::ControllerError;
use futures::StreamExt;
use kube::Api;
use kube::Resource;
use kube_runtime::reflector::store::Writer;
use kube_runtime::reflector::{ObjectRef, Store};
use kube_runtime::watcher::{self, Event};
use kube_runtime::WatchStreamExt;
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Callbacks for object lifecycle events.
pub trait ResourceEventHandler<K>: Send + Sync {
    fn on_add(&self, obj: &K);
    fn on_update(&self, old: &K, new: &K);
    fn on_delete(&self, obj: &K);
}

/// Watch cache for one resource kind.
pub struct Informer<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    kind: &'static str,
    writer: Writer<K>,
    store: Store<K>,
    synced: Arc<AtomicBool>,
    handlers: Vec<Arc<dyn ResourceEventHandler<K>>>,
    relisted: Option<HashSet<ObjectRef<K>>>,
}

impl<K> Informer<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    /// Creates an informer with an empty store.
    pub fn new(kind: &'static str) -> Self {
        let writer = Writer::default();
        let store = writer.as_reader();
        Self {
            kind,
            writer,
            store,
            synced: Arc::new(AtomicBool::new(false)),
            handlers: Vec::new(),
            relisted: None,
        }
    }

    /// Registers a handler. Must be called before [`Informer::run`].
    pub fn add_event_handler(&mut self, handler: Arc<dyn ResourceEventHandler<K>>) {
        self.handlers.push(handler);
    }

    /// Read handle on the local store.
    pub fn store(&self) -> Store<K> {
        self.store.clone()
    }

    /// Flag that turns true after the first complete list.
    pub fn synced_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.synced)
    }

    /// Watches `api` until the stream ends.
    ///
    /// Watch errors are retried with backoff; the stream only ends if the
    /// watcher itself gives up, which is reported as an error.
    pub async fn run(mut self, api: Api<K>) -> Result<(), ControllerError> {
        info!("Starting {} informer", self.kind);

        let mut stream = watcher::watcher(api, watcher::Config::default())
            .default_backoff()
            .boxed();

        while let Some(event) = stream.next().await {
            match event {
                Ok(event) => self.handle(event),
                Err(e) => warn!("{} watch error (will retry): {}", self.kind, e),
            }
        }

        Err(ControllerError::Watch(format!("{} watch stream ended", self.kind)))
    }

    /// Applies one watch event to the store and dispatches callbacks.
    pub fn handle(&mut self, event: Event<K>) {
        match &event {
            Event::Apply(obj) => {
                let previous = self.store.get(&ObjectRef::from_obj(obj));
                self.writer.apply_watcher_event(&event);
                self.dispatch_apply(previous.as_deref(), obj);
            }
            Event::Delete(obj) => {
                let previous = self.store.get(&ObjectRef::from_obj(obj));
                self.writer.apply_watcher_event(&event);
                let last_known = previous.as_deref().unwrap_or(obj);
                for handler in &self.handlers {
                    handler.on_delete(last_known);
                }
            }
            Event::Init => {
                debug!("{} relist started", self.kind);
                self.relisted = Some(HashSet::new());
                self.writer.apply_watcher_event(&event);
            }
            Event::InitApply(obj) => {
                let obj_ref = ObjectRef::from_obj(obj);
                let previous = self.store.get(&obj_ref);
                self.relisted.get_or_insert_with(HashSet::new).insert(obj_ref);
                self.writer.apply_watcher_event(&event);
                self.dispatch_apply(previous.as_deref(), obj);
            }
            Event::InitDone => {
                let relisted = self.relisted.take().unwrap_or_default();
                let vanished: Vec<Arc<K>> = self
                    .store
                    .state()
                    .into_iter()
                    .filter(|obj| !relisted.contains(&ObjectRef::from_obj(&**obj)))
                    .collect();
                self.writer.apply_watcher_event(&event);

                for obj in &vanished {
                    for handler in &self.handlers {
                        handler.on_delete(obj);
                    }
                }
                if !self.synced.swap(true, Ordering::AcqRel) {
                    info!("{} cache synced ({} objects)", self.kind, relisted.len());
                }
            }
        }
    }

    fn dispatch_apply(&self, previous: Option<&K>, obj: &K) {
        for handler in &self.handlers {
            match previous {
                Some(old) => handler.on_update(old, obj),
                None => handler.on_add(obj),
            }
        }
    }
}

/// Conjunction of informer sync flags.
#[derive(Debug, Clone, Default)]
pub struct SyncFlags(Vec<Arc<AtomicBool>>);

impl SyncFlags {
    pub fn push(&mut self, flag: Arc<AtomicBool>) {
        self.0.push(flag);
    }

    /// True once every informer has completed its first list.
    pub fn has_synced(&self) -> bool {
        self.0.iter().all(|flag| flag.load(Ordering::Acquire))
    }
}
