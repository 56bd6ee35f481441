//! In-process transport: finds the region of an entity type on a given node.
//!
//! Stands in for a network transport. Regions register themselves here when
//! they start and unregister when they stop; routers only ever see the
//! resulting directory, never a region they have not looked up.

use crate::framework::{EventSourcedEntity, ShardingError};
use crate::sharding::region::RegionHandle;
use crate::sharding::types::NodeId;
use parking_lot::RwLock;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

/// Regions of one entity type, by node.
pub struct RegionDirectory<E: EventSourcedEntity> {
    regions: Arc<RwLock<HashMap<NodeId, RegionHandle<E>>>>,
}

impl<E: EventSourcedEntity> Clone for RegionDirectory<E> {
    fn clone(&self) -> Self {
        Self {
            regions: self.regions.clone(),
        }
    }
}

impl<E: EventSourcedEntity> Default for RegionDirectory<E> {
    fn default() -> Self {
        Self {
            regions: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl<E: EventSourcedEntity> RegionDirectory<E> {
    pub fn register(&self, node_id: NodeId, region: RegionHandle<E>) {
        self.regions.write().insert(node_id, region);
    }

    pub fn unregister(&self, node_id: &NodeId) {
        self.regions.write().remove(node_id);
    }

    pub fn lookup(&self, node_id: &NodeId) -> Option<RegionHandle<E>> {
        self.regions.read().get(node_id).cloned()
    }

    pub fn nodes(&self) -> Vec<NodeId> {
        self.regions.read().keys().cloned().collect()
    }
}

#[derive(Default)]
pub struct LocalTransport {
    directories: RwLock<HashMap<String, Box<dyn Any + Send + Sync>>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory for `type_name`, created on first use.
    ///
    /// # Errors
    /// [`ShardingError::AlreadyRegistered`] when the name is already used by a
    /// different behavior type.
    pub fn directory<E: EventSourcedEntity>(
        &self,
        type_name: &str,
    ) -> Result<RegionDirectory<E>, ShardingError> {
        let mut directories = self.directories.write();
        let entry = directories
            .entry(type_name.to_string())
            .or_insert_with(|| Box::new(RegionDirectory::<E>::default()));
        entry
            .downcast_ref::<RegionDirectory<E>>()
            .cloned()
            .ok_or_else(|| ShardingError::AlreadyRegistered(type_name.to_string()))
    }
}
