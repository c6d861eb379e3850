//! Resource usage tracking.
//!
//! A resource is "in use" while at least one consumer (a mounted view, a
//! running export) holds it. Topic handlers gate their server connection on
//! this signal so topics nobody is looking at are not kept open.

use std::collections::HashSet;

use parking_lot::Mutex;
use tracing::trace;

use dbweb_core::SyncExecutor;

/// Collaborator signalling whether a downstream consumer needs live data.
pub trait ResourceUsage: Send + Sync {
    fn name(&self) -> &str;

    fn is_resource_in_use(&self) -> bool;

    /// Fired on every in-use transition with the new state.
    fn on_use(&self) -> &SyncExecutor<bool>;
}

/// Set-of-users tracker: in use while the set is non-empty.
#[derive(Debug)]
pub struct UseTracker {
    name: String,
    users: Mutex<HashSet<String>>,
    on_use: SyncExecutor<bool>,
}

impl UseTracker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            users: Mutex::new(HashSet::new()),
            on_use: SyncExecutor::new(),
        }
    }

    /// Mark `user` as a consumer. Returns `true` if this made the resource
    /// transition into use.
    pub fn use_resource(&self, user: impl Into<String>) -> bool {
        let became_used = {
            let mut users = self.users.lock();
            let was_empty = users.is_empty();
            users.insert(user.into()) && was_empty
        };
        if became_used {
            trace!(resource = %self.name, "resource in use");
            self.on_use.execute(&true);
        }
        became_used
    }

    /// Drop `user`. Returns `true` if this was the last consumer.
    pub fn free_resource(&self, user: &str) -> bool {
        let became_free = {
            let mut users = self.users.lock();
            users.remove(user) && users.is_empty()
        };
        if became_free {
            trace!(resource = %self.name, "resource released");
            self.on_use.execute(&false);
        }
        became_free
    }

    pub fn user_count(&self) -> usize {
        self.users.lock().len()
    }
}

impl ResourceUsage for UseTracker {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_resource_in_use(&self) -> bool {
        !self.users.lock().is_empty()
    }

    fn on_use(&self) -> &SyncExecutor<bool> {
        &self.on_use
    }
}
