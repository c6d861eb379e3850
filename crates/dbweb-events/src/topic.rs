//! TopicEventHandler: per-topic demultiplexer over a shared event source.
//!
//! Listeners attach to a multicast list that survives disconnects; the
//! underlying source stream (and therefore the server-side topic
//! subscription) is only open while someone needs it:
//!
//! - at least one registered resource reports itself in use, or
//! - at least one explicit [`Connection`] handle is held.
//!
//! A listener registered without a resource does not open the connection on
//! its own; consumers that need the stream unconditionally call
//! [`TopicEventHandler::connect`].
//!
//! Each distinct resource is registered once no matter how many listeners
//! reference it; its usage callback is detached when its last listener
//! unsubscribes.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures_util::{StreamExt, future};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use dbweb_core::{HandlerId, ServerEvent, SyncExecutor, TopicEvent};

use crate::error::EventError;
use crate::source::{EventSource, EventStream};
use crate::usage::ResourceUsage;

type EventMap<E> = Arc<dyn Fn(ServerEvent) -> Option<E> + Send + Sync>;
type Deliver<E> = Arc<dyn Fn(&E) + Send + Sync>;
type Release = Box<dyn FnOnce() + Send>;

/// Identity of a registered resource (address of its shared allocation).
type ResourceKey = usize;

fn resource_key(resource: &Arc<dyn ResourceUsage>) -> ResourceKey {
    Arc::as_ptr(resource) as *const () as usize
}

// ─── Handles ──────────────────────────────────────────────────────

/// Listener registration returned by [`TopicEventHandler::on`] and
/// [`TopicEventHandler::on_event`].
///
/// The listener stays attached until [`Subscription::unsubscribe`] is called;
/// dropping the handle does not detach it.
#[must_use = "keep the subscription to be able to unsubscribe"]
pub struct Subscription {
    release: Mutex<Option<Release>>,
}

impl Subscription {
    fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Mutex::new(Some(Box::new(release))),
        }
    }

    /// Detach the listener. Safe to call any number of times.
    pub fn unsubscribe(&self) {
        let release = self.release.lock().take();
        if let Some(release) = release {
            release();
        }
    }

    pub fn is_active(&self) -> bool {
        self.release.lock().is_some()
    }
}

/// Explicit hold on a topic connection. Closed on drop.
#[must_use = "dropping a Connection closes it"]
pub struct Connection {
    release: Option<Release>,
}

impl Connection {
    pub fn close(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.release_now();
    }
}

// ─── Handler ──────────────────────────────────────────────────────

/// Demultiplexes one topic of an [`EventSource`] into typed events.
///
/// Must be connected from within a tokio runtime: the open connection is
/// driven by a spawned task that forwards source events to listeners.
pub struct TopicEventHandler<E> {
    inner: Arc<HandlerInner<E>>,
}

impl<E> Clone for TopicEventHandler<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct HandlerInner<E> {
    topic: String,
    source: Arc<dyn EventSource>,
    map: EventMap<E>,
    listeners: Mutex<Vec<(u64, Deliver<E>)>>,
    state: Mutex<ConnectionState>,
    on_init: Arc<SyncExecutor<()>>,
    source_init_handler: HandlerId,
    next_listener: AtomicU64,
}

#[derive(Default)]
struct ConnectionState {
    connection: Option<CancellationToken>,
    explicit: usize,
    active_resources: Vec<ResourceKey>,
    subscribed: HashMap<ResourceKey, SubscribedResource>,
}

struct SubscribedResource {
    listeners: usize,
    resource: Arc<dyn ResourceUsage>,
    handler: HandlerId,
}

impl TopicEventHandler<ServerEvent> {
    /// Handler that passes source events through untouched.
    pub fn raw(topic: impl Into<String>, source: Arc<dyn EventSource>) -> Self {
        Self::new(topic, source, Some)
    }
}

impl<E> TopicEventHandler<E>
where
    E: Send + Sync + 'static,
{
    /// `map` converts source events into this handler's event type; events
    /// it rejects (`None`) are dropped.
    pub fn new(
        topic: impl Into<String>,
        source: Arc<dyn EventSource>,
        map: impl Fn(ServerEvent) -> Option<E> + Send + Sync + 'static,
    ) -> Self {
        let on_init = Arc::new(SyncExecutor::new());
        let forward = Arc::clone(&on_init);
        let source_init_handler = source.on_init().add_handler(move |_| forward.execute(&()));

        Self {
            inner: Arc::new(HandlerInner {
                topic: topic.into(),
                source,
                map: Arc::new(map),
                listeners: Mutex::new(Vec::new()),
                state: Mutex::new(ConnectionState::default()),
                on_init,
                source_init_handler,
                next_listener: AtomicU64::new(0),
            }),
        }
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    /// Fired when the underlying source (re)initializes.
    pub fn on_init(&self) -> &SyncExecutor<()> {
        &self.inner.on_init
    }

    /// Stream of `topic` events from the source, mapped through this
    /// handler's map and then `map_to`. Independent of the shared connection.
    pub fn multiplex<T>(
        &self,
        topic: &str,
        map_to: impl Fn(E) -> T + Send + Sync + 'static,
    ) -> EventStream<T>
    where
        T: Send + 'static,
    {
        let map = Arc::clone(&self.inner.map);
        Box::pin(
            self.inner
                .source
                .multiplex(topic)
                .filter_map(move |event| future::ready(map(event).map(&map_to))),
        )
    }

    /// Attach a listener for events accepted by `filter`.
    ///
    /// With a `resource`, the connection is additionally gated on that
    /// resource being in use.
    pub fn on<T>(
        &self,
        filter: impl Fn(&E) -> bool + Send + Sync + 'static,
        map_to: impl Fn(&E) -> T + Send + Sync + 'static,
        callback: impl Fn(T) + Send + Sync + 'static,
        resource: Option<Arc<dyn ResourceUsage>>,
    ) -> Subscription {
        let listener_id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        let deliver: Deliver<E> = Arc::new(move |event: &E| {
            if filter(event) {
                callback(map_to(event));
            }
        });
        self.inner.listeners.lock().push((listener_id, deliver));

        let key = resource.as_ref().map(|resource| {
            HandlerInner::register_resource(&self.inner, resource);
            resource_key(resource)
        });

        let weak = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            inner.listeners.lock().retain(|(id, _)| *id != listener_id);
            if let Some(key) = key {
                HandlerInner::remove_resource(&inner, key);
            }
        })
    }

    /// Forward a client event to the source. Not echoed to listeners.
    pub fn emit(&self, event: ServerEvent) -> Result<(), EventError> {
        self.inner.source.emit(event)
    }

    /// Push a locally produced event into the handler's stream. Delivered
    /// only while connected; returns whether it was delivered.
    pub fn dispatch_local(&self, event: E) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.inner.deliver(&event);
        true
    }

    /// Hold the connection open independently of resources.
    pub fn connect(&self) -> Connection {
        {
            let mut state = self.inner.state.lock();
            state.explicit += 1;
            HandlerInner::sync_connection(&self.inner, &mut state);
        }

        let weak: Weak<HandlerInner<E>> = Arc::downgrade(&self.inner);
        Connection {
            release: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    let mut state = inner.state.lock();
                    state.explicit = state.explicit.saturating_sub(1);
                    HandlerInner::sync_connection(&inner, &mut state);
                }
            })),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().connection.is_some()
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }

    /// Number of distinct resources currently registered.
    pub fn resource_count(&self) -> usize {
        self.inner.state.lock().subscribed.len()
    }
}

impl<E> TopicEventHandler<E>
where
    E: TopicEvent + Send + Sync + 'static,
{
    /// Attach a listener for events whose id is `id`.
    pub fn on_event<T>(
        &self,
        id: &str,
        map_to: impl Fn(&E) -> T + Send + Sync + 'static,
        callback: impl Fn(T) + Send + Sync + 'static,
        resource: Option<Arc<dyn ResourceUsage>>,
    ) -> Subscription {
        let id = id.to_owned();
        self.on(
            move |event: &E| event.event_id() == id,
            map_to,
            callback,
            resource,
        )
    }
}

impl<E> HandlerInner<E>
where
    E: Send + Sync + 'static,
{
    fn deliver(&self, event: &E) {
        let snapshot: Vec<Deliver<E>> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, deliver)| Arc::clone(deliver))
            .collect();
        for deliver in snapshot {
            deliver(event);
        }
    }

    fn register_resource(inner: &Arc<Self>, resource: &Arc<dyn ResourceUsage>) {
        let key = resource_key(resource);
        let mut state = inner.state.lock();
        match state.subscribed.entry(key) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().listeners += 1;
                return;
            }
            Entry::Vacant(entry) => {
                let weak = Arc::downgrade(inner);
                let handler = resource.on_use().add_handler(move |_| {
                    if let Some(inner) = weak.upgrade() {
                        let mut state = inner.state.lock();
                        Self::apply_usage(&inner, &mut state, key);
                    }
                });
                trace!(topic = %inner.topic, resource = resource.name(), "resource registered");
                entry.insert(SubscribedResource {
                    listeners: 1,
                    resource: Arc::clone(resource),
                    handler,
                });
            }
        }
        // A resource may already be in use when its first listener arrives.
        Self::apply_usage(inner, &mut state, key);
    }

    fn remove_resource(inner: &Arc<Self>, key: ResourceKey) {
        let mut state = inner.state.lock();
        let Some(info) = state.subscribed.get_mut(&key) else {
            return;
        };
        info.listeners -= 1;
        if info.listeners > 0 {
            return;
        }
        if let Some(info) = state.subscribed.remove(&key) {
            info.resource.on_use().remove_handler(info.handler);
            trace!(topic = %inner.topic, resource = info.resource.name(), "resource unregistered");
        }
        state.active_resources.retain(|active| *active != key);
        Self::sync_connection(inner, &mut state);
    }

    fn apply_usage(inner: &Arc<Self>, state: &mut ConnectionState, key: ResourceKey) {
        let Some(info) = state.subscribed.get(&key) else {
            return;
        };
        let in_use = info.resource.is_resource_in_use();
        let position = state.active_resources.iter().position(|active| *active == key);

        match (position, in_use) {
            (Some(index), false) => {
                state.active_resources.remove(index);
            }
            (None, true) => state.active_resources.push(key),
            _ => return,
        }
        Self::sync_connection(inner, state);
    }

    fn sync_connection(inner: &Arc<Self>, state: &mut ConnectionState) {
        let wanted = !state.active_resources.is_empty() || state.explicit > 0;
        if wanted && state.connection.is_none() {
            state.connection = Self::open(inner);
        } else if !wanted {
            if let Some(token) = state.connection.take() {
                debug!(topic = %inner.topic, "closing topic connection");
                token.cancel();
            }
        }
    }

    fn open(inner: &Arc<Self>) -> Option<CancellationToken> {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(topic = %inner.topic, "no tokio runtime, topic connection not opened");
            return None;
        };

        let mut events = inner.source.multiplex(&inner.topic);
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let weak = Arc::downgrade(inner);
        let topic = inner.topic.clone();
        debug!(topic = %topic, "opening topic connection");

        runtime.spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancelled.cancelled() => break,
                    next = events.next() => {
                        let Some(event) = next else {
                            debug!(topic = %topic, "event source stream ended");
                            break;
                        };
                        let Some(inner) = weak.upgrade() else {
                            break;
                        };
                        if let Some(mapped) = (inner.map)(event) {
                            inner.deliver(&mapped);
                        }
                    }
                }
            }
        });

        Some(token)
    }
}

impl<E> Drop for HandlerInner<E> {
    fn drop(&mut self) {
        self.source.on_init().remove_handler(self.source_init_handler);
        let state = self.state.get_mut();
        if let Some(token) = state.connection.take() {
            token.cancel();
        }
        for (_, info) in state.subscribed.drain() {
            info.resource.on_use().remove_handler(info.handler);
        }
    }
}
