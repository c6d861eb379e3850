//! Synchronous multi-subscriber notification.
//!
//! Stateful entities (tasks, usage trackers, containers) expose a
//! [`SyncExecutor`] and fire it after each mutation. Consumers re-derive
//! whatever they need from the notified value instead of tracking fields.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Token returned by [`SyncExecutor::add_handler`], used to detach the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Ordered list of handlers invoked synchronously by [`SyncExecutor::execute`].
///
/// Handlers run outside the internal lock, so a handler may add or remove
/// handlers (including itself) or re-enter `execute`. Handlers added during
/// an `execute` call are not invoked by that call.
pub struct SyncExecutor<T> {
    handlers: Mutex<Vec<(HandlerId, Handler<T>)>>,
    next_id: AtomicU64,
}

impl<T> SyncExecutor<T> {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn add_handler(&self, handler: impl Fn(&T) + Send + Sync + 'static) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.lock().push((id, Arc::new(handler)));
        id
    }

    /// Detach a handler. Returns `false` if it was already removed.
    pub fn remove_handler(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.lock();
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        handlers.len() != before
    }

    /// Invoke every handler registered at call time, in registration order.
    pub fn execute(&self, data: &T) {
        let snapshot: Vec<Handler<T>> = self
            .handlers
            .lock()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        for handler in snapshot {
            handler(data);
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.lock().is_empty()
    }
}

impl<T> Default for SyncExecutor<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for SyncExecutor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncExecutor")
            .field("handlers", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn execute_runs_handlers_in_order() {
        let executor = SyncExecutor::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let first = Arc::clone(&seen);
        executor.add_handler(move |v| first.lock().push(("first", *v)));
        let second = Arc::clone(&seen);
        executor.add_handler(move |v| second.lock().push(("second", *v)));

        executor.execute(&7);
        assert_eq!(*seen.lock(), vec![("first", 7), ("second", 7)]);
    }

    #[test]
    fn removed_handler_is_not_called() {
        let executor = SyncExecutor::<()>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let id = executor.add_handler(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert!(executor.remove_handler(id));
        assert!(!executor.remove_handler(id));
        executor.execute(&());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(executor.is_empty());
    }

    #[test]
    fn handler_can_detach_itself_while_executing() {
        let executor = Arc::new(SyncExecutor::<()>::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<HandlerId>>> = Arc::new(Mutex::new(None));

        let weak = Arc::downgrade(&executor);
        let c = Arc::clone(&calls);
        let s = Arc::clone(&slot);
        let id = executor.add_handler(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            if let (Some(exec), Some(id)) = (weak.upgrade(), *s.lock()) {
                exec.remove_handler(id);
            }
        });
        *slot.lock() = Some(id);

        executor.execute(&());
        executor.execute(&());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
