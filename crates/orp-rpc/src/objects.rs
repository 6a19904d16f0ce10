//! Remote-object and resource ownership registry.
//!
//! Three arena maps keyed by instance path: the object table and the
//! parent/child edge pair forming an ownership forest (a child has exactly
//! one parent). Resource paths additionally carry a cancelable job handle.
//! Forward and reverse edges are updated in the same logical step but not
//! under one cross-map transaction, so removal paths are presence-checked.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use orp_protocol::InstanceId;
use tokio::task::AbortHandle;
use tracing::debug;

use crate::RegistryError;
use crate::service::{RemoteServiceDyn, ResolvedService, ServiceDescriptor};

pub struct ObjectRegistry {
    objects: DashMap<InstanceId, ResolvedService>,
    children: DashMap<InstanceId, HashSet<InstanceId>>,
    parents: DashMap<InstanceId, InstanceId>,
    resources: DashMap<InstanceId, AbortHandle>,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self {
            objects: DashMap::new(),
            children: DashMap::new(),
            parents: DashMap::new(),
            resources: DashMap::new(),
        }
    }

    /// Resolve a live registration.
    pub fn lookup(&self, path: &InstanceId) -> Option<ResolvedService> {
        self.objects.get(path).map(|o| o.value().clone())
    }

    pub fn contains(&self, path: &InstanceId) -> bool {
        self.objects.contains_key(path)
    }

    /// Register a remote object under a unique path.
    ///
    /// Registering the same instance at an occupied path is an idempotent
    /// no-op; a different instance at the same path is a correlation bug
    /// and fails hard.
    pub fn register_remote_object(
        &self,
        path: InstanceId,
        descriptor: Arc<ServiceDescriptor>,
        instance: Arc<dyn RemoteServiceDyn>,
        parent: Option<&InstanceId>,
    ) -> Result<(), RegistryError> {
        match self.objects.entry(path.clone()) {
            Entry::Occupied(existing) => {
                if Arc::ptr_eq(&existing.get().instance, &instance) {
                    return Ok(());
                }
                return Err(RegistryError::DuplicatePath(path));
            }
            Entry::Vacant(slot) => {
                slot.insert(ResolvedService {
                    descriptor,
                    instance,
                });
            }
        }
        if let Some(parent) = parent {
            self.children
                .entry(parent.clone())
                .or_default()
                .insert(path.clone());
            self.parents.insert(path.clone(), parent.clone());
        }
        debug!("remote object registered: {path}");
        Ok(())
    }

    /// Register an acquired resource: a remote object plus the cancelable
    /// job holding its lease.
    pub fn register_resource(
        &self,
        path: InstanceId,
        descriptor: Arc<ServiceDescriptor>,
        instance: Arc<dyn RemoteServiceDyn>,
        parent: Option<&InstanceId>,
        job: AbortHandle,
    ) -> Result<(), RegistryError> {
        self.register_remote_object(path.clone(), descriptor, instance, parent)?;
        if self.resources.insert(path.clone(), job).is_some() {
            return Err(RegistryError::DuplicateResource(path));
        }
        Ok(())
    }

    /// Remove a registration and every transitive descendant. Idempotent;
    /// safe to call for paths that are already (partially) gone.
    pub fn unregister_remote_object(&self, path: &InstanceId) {
        if self.objects.remove(path).is_some() {
            debug!("remote object unregistered: {path}");
        }
        if let Some((_, job)) = self.resources.remove(path) {
            job.abort();
        }
        if let Some((_, parent)) = self.parents.remove(path) {
            let now_empty = match self.children.get_mut(&parent) {
                Some(mut siblings) => {
                    siblings.remove(path);
                    siblings.is_empty()
                }
                None => false,
            };
            if now_empty {
                self.children.remove_if(&parent, |_, set| set.is_empty());
            }
        }
        let descendants: Vec<InstanceId> = match self.children.remove(path) {
            Some((_, set)) => set.into_iter().collect(),
            None => Vec::new(),
        };
        for child in descendants {
            self.unregister_remote_object(&child);
        }
    }

    /// Unregister a resource: cancel its job, then remove it (and any
    /// descendants) like a remote object.
    pub fn unregister_resource(&self, path: &InstanceId) {
        if let Some((_, job)) = self.resources.remove(path) {
            job.abort();
        }
        self.unregister_remote_object(path);
    }

    // ── Introspection ─────────────────────────────────────────────────────

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn parent_of(&self, path: &InstanceId) -> Option<InstanceId> {
        self.parents.get(path).map(|p| p.value().clone())
    }

    pub fn children_of(&self, path: &InstanceId) -> Vec<InstanceId> {
        let mut list: Vec<_> = self
            .children
            .get(path)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        list.sort();
        list
    }

    pub fn has_resource(&self, path: &InstanceId) -> bool {
        self.resources.contains_key(path)
    }

    /// True when every table is empty — no residue after cascaded removal.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
            && self.children.is_empty()
            && self.parents.is_empty()
            && self.resources.is_empty()
    }
}

impl Default for ObjectRegistry {
    fn default() -> Self {
        Self::new()
    }
}
