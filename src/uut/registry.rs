//! Owning registry of UUT handles, indexed by id.
//!
//! The facade owns one registry per session. Nothing else keeps a global list of
//! units or of "the current chain"; components receive the handles they operate on.

use std::collections::HashMap;
use std::sync::Arc;

use super::{UutHandle, UutId};
use crate::error::{AcqError, AcqResult};

/// Registry of UUT handles in registration order.
#[derive(Debug, Default)]
pub struct UutRegistry {
    order: Vec<UutId>,
    handles: HashMap<UutId, Arc<UutHandle>>,
}

impl UutRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handle. Duplicate ids are rejected.
    pub fn register(&mut self, handle: UutHandle) -> AcqResult<Arc<UutHandle>> {
        let id = handle.id().clone();
        if self.handles.contains_key(&id) {
            return Err(AcqError::InvalidConfig(format!("UUT '{id}' registered twice")));
        }
        let handle = Arc::new(handle);
        self.order.push(id.clone());
        self.handles.insert(id, Arc::clone(&handle));
        Ok(handle)
    }

    /// Look up one handle.
    pub fn get(&self, id: &UutId) -> AcqResult<Arc<UutHandle>> {
        self.handles
            .get(id)
            .cloned()
            .ok_or_else(|| AcqError::UnknownUut(id.clone()))
    }

    /// Look up handles for `ids`, preserving their order.
    pub fn resolve(&self, ids: &[UutId]) -> AcqResult<Vec<Arc<UutHandle>>> {
        ids.iter().map(|id| self.get(id)).collect()
    }

    /// True if `id` is registered.
    pub fn contains(&self, id: &UutId) -> bool {
        self.handles.contains_key(id)
    }

    /// Registered ids in registration order.
    pub fn ids(&self) -> &[UutId] {
        &self.order
    }

    /// Handles in registration order.
    pub fn handles(&self) -> Vec<Arc<UutHandle>> {
        self.order
            .iter()
            .filter_map(|id| self.handles.get(id).cloned())
            .collect()
    }

    /// Number of registered units.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// True when no units are registered.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Close every command channel.
    pub async fn close_all(&self) {
        let closing = self.handles().into_iter().map(|h| async move { h.close().await });
        futures::future::join_all(closing).await;
    }
}
