//! Read-only, namespace-scoped lookups over cached objects.

use kube::{Resource, ResourceExt};
use kube_runtime::reflector::{ObjectRef, Store};
use std::sync::Arc;

/// Read-only view of a cache of `K`.
pub trait Lister<K>: Send + Sync {
    /// Looks up one object; `namespace` is empty for cluster-scoped kinds.
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>>;

    /// Every object in `namespace`, sorted by name.
    fn list(&self, namespace: &str) -> Vec<Arc<K>>;
}

fn in_namespace<K: Resource>(obj: &K, namespace: &str) -> bool {
    obj.meta().namespace.as_deref().unwrap_or("") == namespace
}

fn sorted_by_name<K: Resource>(mut objects: Vec<Arc<K>>) -> Vec<Arc<K>> {
    objects.sort_by_key(|obj| obj.name_any());
    objects
}

impl<K> Lister<K> for Store<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        let obj_ref = ObjectRef::<K>::new(name);
        let obj_ref = if namespace.is_empty() {
            obj_ref
        } else {
            obj_ref.within(namespace)
        };
        Store::get(self, &obj_ref)
    }

    fn list(&self, namespace: &str) -> Vec<Arc<K>> {
        sorted_by_name(
            self.state()
                .into_iter()
                .filter(|obj| in_namespace(&**obj, namespace))
                .collect(),
        )
    }
}

/// A fixed set of objects.
///
/// Stands in for the cache of a kind that is not watched.
#[derive(Debug, Clone)]
pub struct StaticLister<K> {
    objects: Vec<Arc<K>>,
}

impl<K> Default for StaticLister<K> {
    fn default() -> Self {
        Self { objects: Vec::new() }
    }
}

#[cfg(test)]
impl<K: Resource> StaticLister<K> {
    pub fn new(objects: impl IntoIterator<Item = K>) -> Self {
        Self {
            objects: objects.into_iter().map(Arc::new).collect(),
        }
    }
}

impl<K> Lister<K> for StaticLister<K>
where
    K: Resource + Send + Sync,
{
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        self.objects
            .iter()
            .find(|obj| in_namespace(&***obj, namespace) && obj.meta().name.as_deref() == Some(name))
            .cloned()
    }

    fn list(&self, namespace: &str) -> Vec<Arc<K>> {
        sorted_by_name(
            self.objects
                .iter()
                .filter(|obj| in_namespace(&***obj, namespace))
                .cloned()
                .collect(),
        )
    }
}
