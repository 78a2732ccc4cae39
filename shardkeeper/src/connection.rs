//! Connection handles with explicit lifecycle signals.
//!
//! A [`ConnectionHandle`] wraps one session opened through a [`Driver`].
//! Lifecycle changes are delivered to registered [`LifecycleObserver`]s,
//! which are awaited in registration order. `connect()` only returns once
//! every `on_ready` observer has finished, so anything an observer does on
//! ready (such as replaying subscriptions) is complete by then.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;

use crate::address::NodeAddress;
use crate::factory::ConnectionParams;
use crate::topology::TopologySnapshot;
use crate::{lock, Error};

const MAX_BACKOFF_EXPONENT: u32 = 6;

/// Lifecycle signal of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Connecting,
    Ready,
    Error(String),
    Reconnecting,
    Ended,
}

/// Status tag carried by every handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected yet, or the last connect attempt gave up.
    Idle,
    Connecting,
    Ready,
    /// A transport error was seen; commands are still attempted.
    Broken,
    /// Disconnected. Terminal.
    Closed,
}

/// Receives lifecycle signals of the handles it is registered with.
#[async_trait]
pub trait LifecycleObserver: Send + Sync {
    async fn on_connecting(&self, _handle: &ConnectionHandle) {}

    async fn on_ready(&self, _handle: &ConnectionHandle) {}

    async fn on_error(&self, _handle: &ConnectionHandle, _error: &str) {}

    async fn on_reconnecting(&self, _handle: &ConnectionHandle) {}

    async fn on_end(&self, _handle: &ConnectionHandle) {}
}

/// Channel message callback, invoked as `(message, channel)`.
///
/// Listeners compare by identity: clones of one listener are equal,
/// two listeners built from identical closures are not.
#[derive(Clone)]
pub struct Listener(Arc<dyn Fn(&str, &str) + Send + Sync>);

impl Listener {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn call(&self, message: &str, channel: &str) {
        (self.0)(message, channel)
    }

    fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

impl PartialEq for Listener {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl Eq for Listener {}

impl Hash for Listener {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Listener({:#x})", self.addr())
    }
}

/// Opens sessions to the store. The transport seam of the crate.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Open a session. `sink` reports failures the session detects on its
    /// own, outside of any command.
    async fn open(
        &self,
        params: &ConnectionParams,
        sink: LifecycleSink,
    ) -> Result<Arc<dyn Session>, Error>;
}

/// An open session. Commands take `&self`; sessions handle their own
/// interior concurrency.
#[async_trait]
pub trait Session: Send + Sync {
    async fn ping(&self) -> Result<(), Error>;

    async fn get(&self, key: &str) -> Result<Option<String>, Error>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), Error>;

    async fn del(&self, key: &str) -> Result<u64, Error>;

    async fn publish(&self, channel: &str, message: &str) -> Result<u64, Error>;

    async fn subscribe(&self, channel: &str, listener: Listener) -> Result<(), Error>;

    /// Slot ownership as reported by the server, addresses unmapped.
    async fn cluster_slots(&self) -> Result<TopologySnapshot, Error>;

    async fn close(&self) -> Result<(), Error>;
}

/// Lets a session report failures detected in the background.
#[derive(Clone)]
pub struct LifecycleSink {
    handle: Weak<HandleInner>,
}

impl LifecycleSink {
    /// A sink attached to no handle; reports go nowhere.
    pub fn detached() -> Self {
        Self { handle: Weak::new() }
    }

    pub fn report_error(&self, message: impl Into<String>) {
        if let Some(inner) = self.handle.upgrade() {
            let handle = ConnectionHandle { inner };
            let message = message.into();
            tokio::spawn(async move {
                handle.fail(message).await;
            });
        }
    }

    pub fn report_end(&self) {
        if let Some(inner) = self.handle.upgrade() {
            let handle = ConnectionHandle { inner };
            tokio::spawn(async move {
                if let Err(e) = handle.disconnect().await {
                    tracing::debug!(connection = %handle.name(), "Close after remote end failed: {}", e);
                }
            });
        }
    }
}

struct HandleInner {
    name: String,
    params: ConnectionParams,
    driver: Arc<dyn Driver>,
    state: Mutex<ConnectionState>,
    session: Mutex<Option<Arc<dyn Session>>>,
    observers: Mutex<Vec<Arc<dyn LifecycleObserver>>>,
    subscriptions: Mutex<HashMap<String, HashSet<Listener>>>,
}

/// Shared reference to one connection. Clones refer to the same
/// connection and compare equal.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

impl ConnectionHandle {
    pub(crate) fn new(name: String, params: ConnectionParams, driver: Arc<dyn Driver>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                name,
                params,
                driver,
                state: Mutex::new(ConnectionState::Idle),
                session: Mutex::new(None),
                observers: Mutex::new(Vec::new()),
                subscriptions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Display name: purpose, endpoint and a short random suffix.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn params(&self) -> &ConnectionParams {
        &self.inner.params
    }

    pub fn address(&self) -> NodeAddress {
        self.inner.params.address()
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.inner.state)
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    pub fn observe(&self, observer: Arc<dyn LifecycleObserver>) {
        lock(&self.inner.observers).push(observer);
    }

    /// Channels this connection has subscribed to.
    pub fn subscribed_channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = lock(&self.inner.subscriptions).keys().cloned().collect();
        channels.sort();
        channels
    }

    /// Open the session, retrying with exponential backoff.
    ///
    /// Emits `Connecting`, then `Error` after each failed attempt and
    /// `Reconnecting` before each retry, then `Ready`. Returns after every
    /// ready observer ran. Connecting an already connected handle is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the last attempt's error once retries are exhausted,
    /// `Error::Closed` if the handle was disconnected.
    pub async fn connect(&self) -> Result<(), Error> {
        {
            let mut state = lock(&self.inner.state);
            match *state {
                ConnectionState::Ready | ConnectionState::Broken => return Ok(()),
                ConnectionState::Closed => return Err(Error::Closed(self.inner.name.clone())),
                ConnectionState::Connecting => {
                    return Err(Error::NotReady(self.inner.name.clone()));
                }
                ConnectionState::Idle => *state = ConnectionState::Connecting,
            }
        }

        self.emit(LifecycleEvent::Connecting).await;

        let attempts = self.inner.params.connect_retries.saturating_add(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                let backoff_ms = 100 * 2u64.pow(attempt.min(MAX_BACKOFF_EXPONENT));
                let jitter_ms = rand::random::<u64>() % (backoff_ms / 2 + 1);
                tracing::debug!(
                    connection = %self.inner.name,
                    attempt,
                    backoff_ms = backoff_ms + jitter_ms,
                    "Backing off before reconnecting"
                );
                tokio::time::sleep(Duration::from_millis(backoff_ms + jitter_ms)).await;
                if self.state() == ConnectionState::Closed {
                    return Err(Error::Closed(self.inner.name.clone()));
                }
                self.emit(LifecycleEvent::Reconnecting).await;
            }

            match self.inner.driver.open(&self.inner.params, self.sink()).await {
                Ok(session) => {
                    let closed_meanwhile = {
                        let mut state = lock(&self.inner.state);
                        if *state == ConnectionState::Closed {
                            true
                        } else {
                            *lock(&self.inner.session) = Some(session.clone());
                            *state = ConnectionState::Ready;
                            false
                        }
                    };
                    if closed_meanwhile {
                        if let Err(e) = session.close().await {
                            tracing::debug!(connection = %self.inner.name, "Close of abandoned session failed: {}", e);
                        }
                        return Err(Error::Closed(self.inner.name.clone()));
                    }

                    self.emit(LifecycleEvent::Ready).await;
                    return Ok(());
                }
                Err(e) => {
                    self.emit(LifecycleEvent::Error(e.to_string())).await;
                    last_error = Some(e);
                }
            }
        }

        {
            let mut state = lock(&self.inner.state);
            if *state == ConnectionState::Connecting {
                *state = ConnectionState::Idle;
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Connection(self.inner.name.clone())))
    }

    /// Close the session and emit `Ended`. Idempotent.
    pub async fn disconnect(&self) -> Result<(), Error> {
        let previous = {
            let mut state = lock(&self.inner.state);
            std::mem::replace(&mut *state, ConnectionState::Closed)
        };
        if previous == ConnectionState::Closed {
            return Ok(());
        }

        let session = lock(&self.inner.session).take();
        let result = match session {
            Some(session) => session.close().await,
            None => Ok(()),
        };

        self.emit(LifecycleEvent::Ended).await;
        result
    }

    pub async fn ping(&self) -> Result<(), Error> {
        let session = self.session()?;
        self.run("PING", session.ping()).await
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        let session = self.session()?;
        self.run("GET", session.get(key)).await
    }

    pub async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), Error> {
        let session = self.session()?;
        self.run("SET", session.set_ex(key, value, ttl)).await
    }

    pub async fn del(&self, key: &str) -> Result<u64, Error> {
        let session = self.session()?;
        self.run("DEL", session.del(key)).await
    }

    pub async fn publish(&self, channel: &str, message: &str) -> Result<u64, Error> {
        let session = self.session()?;
        self.run("PUBLISH", session.publish(channel, message)).await
    }

    pub async fn cluster_slots(&self) -> Result<TopologySnapshot, Error> {
        let session = self.session()?;
        self.run("CLUSTER SLOTS", session.cluster_slots()).await
    }

    /// Subscribe `listener` to `channel`. Subscribing the same listener to
    /// the same channel twice on one connection is a no-op.
    pub async fn subscribe(&self, channel: &str, listener: Listener) -> Result<(), Error> {
        let session = self.session()?;

        let reserved = lock(&self.inner.subscriptions)
            .entry(channel.to_string())
            .or_default()
            .insert(listener.clone());
        if !reserved {
            return Ok(());
        }

        let result = self
            .run("SUBSCRIBE", session.subscribe(channel, listener.clone()))
            .await;

        if result.is_err() {
            let mut subscriptions = lock(&self.inner.subscriptions);
            if let Some(listeners) = subscriptions.get_mut(channel) {
                listeners.remove(&listener);
                if listeners.is_empty() {
                    subscriptions.remove(channel);
                }
            }
        }
        result
    }

    fn session(&self) -> Result<Arc<dyn Session>, Error> {
        match self.state() {
            ConnectionState::Closed => Err(Error::Closed(self.inner.name.clone())),
            ConnectionState::Idle | ConnectionState::Connecting => {
                Err(Error::NotReady(self.inner.name.clone()))
            }
            ConnectionState::Ready | ConnectionState::Broken => lock(&self.inner.session)
                .clone()
                .ok_or_else(|| Error::NotReady(self.inner.name.clone())),
        }
    }

    async fn run<T, F>(&self, command: &str, fut: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, Error>>,
    {
        let timeout = self.inner.params.command_timeout;
        let result = match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                name: self.inner.name.clone(),
                after_ms: timeout.as_millis() as u64,
            }),
        };

        match &result {
            Ok(_) => {
                let mut state = lock(&self.inner.state);
                if *state == ConnectionState::Broken {
                    tracing::debug!(connection = %self.inner.name, "Connection recovered");
                    *state = ConnectionState::Ready;
                }
            }
            Err(e) if e.is_connection_error() => {
                self.fail(format!("{} failed: {}", command, e)).await;
            }
            Err(_) => {}
        }
        result
    }

    async fn fail(&self, message: String) {
        {
            let mut state = lock(&self.inner.state);
            match *state {
                ConnectionState::Closed => return,
                ConnectionState::Ready => *state = ConnectionState::Broken,
                _ => {}
            }
        }
        self.emit(LifecycleEvent::Error(message)).await;
    }

    fn sink(&self) -> LifecycleSink {
        LifecycleSink {
            handle: Arc::downgrade(&self.inner),
        }
    }

    async fn emit(&self, event: LifecycleEvent) {
        let observers: Vec<Arc<dyn LifecycleObserver>> = lock(&self.inner.observers).clone();
        for observer in observers {
            match &event {
                LifecycleEvent::Connecting => observer.on_connecting(self).await,
                LifecycleEvent::Ready => observer.on_ready(self).await,
                LifecycleEvent::Error(message) => observer.on_error(self, message).await,
                LifecycleEvent::Reconnecting => observer.on_reconnecting(self).await,
                LifecycleEvent::Ended => observer.on_end(self).await,
            }
        }
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for ConnectionHandle {}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCluster;
    use crate::topology::SlotRange;
    use crate::{ConnectionFactory, KeeperConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<LifecycleEvent>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<LifecycleEvent> {
            lock(&self.events).clone()
        }
    }

    #[async_trait]
    impl LifecycleObserver for Recorder {
        async fn on_connecting(&self, _handle: &ConnectionHandle) {
            lock(&self.events).push(LifecycleEvent::Connecting);
        }

        async fn on_ready(&self, _handle: &ConnectionHandle) {
            lock(&self.events).push(LifecycleEvent::Ready);
        }

        async fn on_error(&self, _handle: &ConnectionHandle, error: &str) {
            lock(&self.events).push(LifecycleEvent::Error(error.to_string()));
        }

        async fn on_reconnecting(&self, _handle: &ConnectionHandle) {
            lock(&self.events).push(LifecycleEvent::Reconnecting);
        }

        async fn on_end(&self, _handle: &ConnectionHandle) {
            lock(&self.events).push(LifecycleEvent::Ended);
        }
    }

    fn setup(retries: u32) -> (MemoryCluster, ConnectionFactory) {
        let cluster = MemoryCluster::new();
        cluster.set_slots(vec![SlotRange::new(
            0,
            16383,
            NodeAddress::new("127.0.0.1", 6379),
        )]);
        let mut config = KeeperConfig::default();
        config.redis.host = "127.0.0.1".into();
        config.connect_retries = retries;
        let factory = ConnectionFactory::new(cluster.driver(), &config);
        (cluster, factory)
    }

    #[tokio::test]
    async fn test_connect_emits_connecting_then_ready() {
        let (_cluster, factory) = setup(0);
        let handle = factory.standalone("test");
        let recorder = Arc::new(Recorder::default());
        handle.observe(recorder.clone());

        assert_eq!(handle.state(), ConnectionState::Idle);
        handle.connect().await.unwrap();

        assert!(handle.is_ready());
        assert_eq!(
            recorder.events(),
            vec![LifecycleEvent::Connecting, LifecycleEvent::Ready]
        );

        // Second connect is a no-op
        handle.connect().await.unwrap();
        assert_eq!(recorder.events().len(), 2);
    }

    #[tokio::test]
    async fn test_commands_rejected_before_ready() {
        let (_cluster, factory) = setup(0);
        let handle = factory.standalone("test");
        assert!(matches!(handle.ping().await, Err(Error::NotReady(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retries_with_reconnecting_events() {
        let (cluster, factory) = setup(2);
        cluster.refuse_connections(6379, true);

        let handle = factory.standalone("test");
        let recorder = Arc::new(Recorder::default());
        handle.observe(recorder.clone());

        let err = handle.connect().await.unwrap_err();
        assert!(err.is_connection_error());
        assert_eq!(handle.state(), ConnectionState::Idle);

        let events = recorder.events();
        assert_eq!(events[0], LifecycleEvent::Connecting);
        let errors = events
            .iter()
            .filter(|e| matches!(e, LifecycleEvent::Error(_)))
            .count();
        let reconnects = events
            .iter()
            .filter(|e| **e == LifecycleEvent::Reconnecting)
            .count();
        assert_eq!(errors, 3);
        assert_eq!(reconnects, 2);

        // The node comes back: a later connect succeeds
        cluster.refuse_connections(6379, false);
        handle.connect().await.unwrap();
        assert!(handle.is_ready());
    }

    #[tokio::test]
    async fn test_command_failure_marks_broken_then_recovers() {
        let (cluster, factory) = setup(0);
        let handle = factory.standalone("test");
        let recorder = Arc::new(Recorder::default());
        handle.observe(recorder.clone());
        handle.connect().await.unwrap();

        cluster.fail_commands(6379, true);
        assert!(handle.ping().await.is_err());
        assert_eq!(handle.state(), ConnectionState::Broken);
        assert!(matches!(
            recorder.events().last(),
            Some(LifecycleEvent::Error(msg)) if msg.starts_with("PING")
        ));

        cluster.fail_commands(6379, false);
        handle.ping().await.unwrap();
        assert_eq!(handle.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_disconnect_emits_ended_once() {
        let (_cluster, factory) = setup(0);
        let handle = factory.standalone("test");
        let recorder = Arc::new(Recorder::default());
        handle.observe(recorder.clone());
        handle.connect().await.unwrap();

        handle.disconnect().await.unwrap();
        handle.disconnect().await.unwrap();

        assert_eq!(handle.state(), ConnectionState::Closed);
        let ends = recorder
            .events()
            .iter()
            .filter(|e| **e == LifecycleEvent::Ended)
            .count();
        assert_eq!(ends, 1);
        assert!(matches!(handle.ping().await, Err(Error::Closed(_))));
        assert!(matches!(handle.connect().await, Err(Error::Closed(_))));
    }

    #[tokio::test]
    async fn test_subscribe_is_idempotent_per_listener() {
        let (cluster, factory) = setup(0);
        let handle = factory.standalone("test");
        handle.connect().await.unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let listener = Listener::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        handle.subscribe("broadcast", listener.clone()).await.unwrap();
        handle.subscribe("broadcast", listener.clone()).await.unwrap();

        assert_eq!(cluster.subscriptions(6379, "broadcast"), 1);
        assert_eq!(handle.subscribed_channels(), vec!["broadcast".to_string()]);

        assert_eq!(cluster.publish("broadcast", "hello"), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_background_failure_reported_through_sink() {
        let (cluster, factory) = setup(0);
        let handle = factory.standalone("test");
        let recorder = Arc::new(Recorder::default());
        handle.observe(recorder.clone());
        handle.connect().await.unwrap();

        cluster.drop_sessions(6379);

        for _ in 0..50 {
            if handle.state() == ConnectionState::Broken {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(handle.state(), ConnectionState::Broken);
        assert!(recorder
            .events()
            .iter()
            .any(|e| matches!(e, LifecycleEvent::Error(_))));
    }

    #[test]
    fn test_listener_identity() {
        let a = Listener::new(|_, _| {});
        let b = Listener::new(|_, _| {});
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }
}
