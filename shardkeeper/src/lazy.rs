use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use futures_util::future::BoxFuture;

use crate::config::KeeperConfig;
use crate::connection::ConnectionHandle;
use crate::{lock, Error};

type CreateFn = Box<dyn Fn() -> BoxFuture<'static, Result<ConnectionHandle, Error>> + Send + Sync>;
type HandleFn = Box<dyn Fn(ConnectionHandle) -> BoxFuture<'static, Result<(), Error>> + Send + Sync>;

/// Initialisation state of a [`LazyConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HolderState {
    Uninitialized,
    Initializing,
    Initialized,
}

struct Holder {
    state: HolderState,
    handle: Option<ConnectionHandle>,
    failure: Option<String>,
}

/// Creates its connection on first use and hands the same one out after.
///
/// Concurrent first callers wait for the one in-flight initialisation by
/// polling every `wait_interval`, up to `max_wait_count` times, then take
/// whatever handle exists. A failed setup still leaves the holder
/// initialised: the caller that ran it gets the error, later callers get
/// the held handle, and nothing retries until [`reset_connection`] is called.
///
/// [`reset_connection`]: LazyConnection::reset_connection
pub struct LazyConnection {
    name: String,
    create: CreateFn,
    setup: HandleFn,
    dispose: Option<HandleFn>,
    wait_interval: Duration,
    max_wait_count: u32,
    holder: Mutex<Holder>,
}

impl LazyConnection {
    pub fn new<C, CF, S, SF>(name: impl Into<String>, create: C, setup: S) -> Self
    where
        C: Fn() -> CF + Send + Sync + 'static,
        CF: Future<Output = Result<ConnectionHandle, Error>> + Send + 'static,
        S: Fn(ConnectionHandle) -> SF + Send + Sync + 'static,
        SF: Future<Output = Result<(), Error>> + Send + 'static,
    {
        let defaults = KeeperConfig::default();
        Self {
            name: name.into(),
            create: Box::new(move || Box::pin(create())),
            setup: Box::new(move |handle| Box::pin(setup(handle))),
            dispose: None,
            wait_interval: defaults.wait_interval,
            max_wait_count: defaults.max_wait_count,
            holder: Mutex::new(Holder {
                state: HolderState::Uninitialized,
                handle: None,
                failure: None,
            }),
        }
    }

    /// Called with the old handle on [`reset_connection`](Self::reset_connection).
    pub fn with_dispose<D, DF>(mut self, dispose: D) -> Self
    where
        D: Fn(ConnectionHandle) -> DF + Send + Sync + 'static,
        DF: Future<Output = Result<(), Error>> + Send + 'static,
    {
        self.dispose = Some(Box::new(move |handle| Box::pin(dispose(handle))));
        self
    }

    pub fn with_wait(mut self, wait_interval: Duration, max_wait_count: u32) -> Self {
        self.wait_interval = wait_interval;
        self.max_wait_count = max_wait_count;
        self
    }

    pub fn with_config(self, config: &KeeperConfig) -> Self {
        self.with_wait(config.wait_interval, config.max_wait_count)
    }

    pub fn state(&self) -> HolderState {
        lock(&self.holder).state
    }

    /// The held handle, if one was created. Never initialises.
    pub fn current(&self) -> Option<ConnectionHandle> {
        lock(&self.holder).handle.clone()
    }

    /// The connection, created and set up on first call.
    ///
    /// # Errors
    ///
    /// The caller that runs a failing initialisation receives its error.
    /// Later callers get `Error::Initialization` only if no handle was ever
    /// created.
    ///
    /// A caller whose wait budget runs out gets the handle being set up, with
    /// a warning logged. If the create callback has not even returned a
    /// handle by then, there is nothing to hand out and the caller gets
    /// `Error::NotReady`.
    pub async fn get_connection(&self) -> Result<ConnectionHandle, Error> {
        let must_initialize = {
            let mut holder = lock(&self.holder);
            match holder.state {
                HolderState::Initialized => return self.held(&holder),
                HolderState::Initializing => false,
                HolderState::Uninitialized => {
                    holder.state = HolderState::Initializing;
                    true
                }
            }
        };

        if must_initialize {
            return self.initialize().await;
        }

        let settled = self.wait_for_initialization().await;
        let holder = lock(&self.holder);
        if !settled && holder.handle.is_none() {
            return Err(Error::NotReady(self.name.clone()));
        }
        self.held(&holder)
    }

    /// Drop the held connection so the next call creates a new one.
    ///
    /// Never interleaves with an initialisation: an in-flight one is waited
    /// out first. The holder is already `Uninitialized` when the dispose
    /// callback runs.
    ///
    /// # Errors
    ///
    /// Returns the dispose callback's error, or `Error::NotReady` without
    /// resetting anything if an initialisation outlasted the wait budget.
    pub async fn reset_connection(&self) -> Result<(), Error> {
        if self.state() == HolderState::Initializing && !self.wait_for_initialization().await {
            tracing::warn!(holder = %self.name, "Skip reset while initialization is still running");
            return Err(Error::NotReady(self.name.clone()));
        }

        let previous = {
            let mut holder = lock(&self.holder);
            if holder.state != HolderState::Initialized {
                return Ok(());
            }
            holder.state = HolderState::Uninitialized;
            holder.failure = None;
            holder.handle.take()
        };

        let Some(previous) = previous else {
            return Ok(());
        };

        tracing::info!(
            holder = %self.name,
            connection = %previous.name(),
            "Dispose existing connection, it will be created again on next use"
        );

        if let Some(dispose) = &self.dispose {
            if let Err(e) = dispose(previous.clone()).await {
                tracing::error!(
                    holder = %self.name,
                    connection = %previous.name(),
                    "Dispose connection failed: {}",
                    e
                );
                return Err(e);
            }
        }
        Ok(())
    }

    async fn initialize(&self) -> Result<ConnectionHandle, Error> {
        let mut guard = InitGuard {
            holder: &self.holder,
            armed: true,
        };

        let handle = match (self.create)().await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(holder = %self.name, "Create connection failed: {}", e);
                self.finish(&mut guard, None, Some(e.to_string()));
                return Err(e);
            }
        };

        lock(&self.holder).handle = Some(handle.clone());
        tracing::debug!(holder = %self.name, connection = %handle.name(), "Initialize connection");

        match (self.setup)(handle.clone()).await {
            Ok(()) => {
                tracing::info!(holder = %self.name, connection = %handle.name(), "Connection initialized");
                self.finish(&mut guard, Some(handle.clone()), None);
                Ok(handle)
            }
            Err(e) => {
                tracing::error!(
                    holder = %self.name,
                    connection = %handle.name(),
                    "Initialize connection failed: {}",
                    e
                );
                self.finish(&mut guard, Some(handle), Some(e.to_string()));
                Err(e)
            }
        }
    }

    fn finish(&self, guard: &mut InitGuard<'_>, handle: Option<ConnectionHandle>, failure: Option<String>) {
        let mut holder = lock(&self.holder);
        holder.state = HolderState::Initialized;
        holder.handle = handle;
        holder.failure = failure;
        guard.armed = false;
    }

    /// Poll until no initialisation is running. Returns false when the
    /// wait budget ran out first.
    async fn wait_for_initialization(&self) -> bool {
        for attempt in 1..=self.max_wait_count {
            tokio::time::sleep(self.wait_interval).await;
            if self.state() != HolderState::Initializing {
                return true;
            }
            tracing::trace!(holder = %self.name, attempt, "Waiting for connection initialization");
        }
        tracing::warn!(
            holder = %self.name,
            attempts = self.max_wait_count,
            "Connection is still initializing, continuing without it"
        );
        false
    }

    fn held(&self, holder: &Holder) -> Result<ConnectionHandle, Error> {
        holder.handle.clone().ok_or_else(|| {
            Error::Initialization(format!(
                "{}: {}",
                self.name,
                holder.failure.as_deref().unwrap_or("no connection available")
            ))
        })
    }
}

/// Resets the holder if an initialisation future is dropped midway, so
/// later callers do not wait on an initialisation nobody is running.
struct InitGuard<'a> {
    holder: &'a Mutex<Holder>,
    armed: bool,
}

impl Drop for InitGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut holder = lock(self.holder);
            holder.state = HolderState::Uninitialized;
            holder.handle = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::NodeAddress;
    use crate::memory::MemoryCluster;
    use crate::topology::SlotRange;
    use crate::ConnectionFactory;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn factory() -> ConnectionFactory {
        let cluster = MemoryCluster::new();
        cluster.set_slots(vec![SlotRange::new(0, 16383, NodeAddress::new("127.0.0.1", 6379))]);
        let mut config = KeeperConfig::default();
        config.connect_retries = 0;
        ConnectionFactory::new(cluster.driver(), &config)
    }

    fn holder(creates: Arc<AtomicUsize>, setup_delay: Duration, fail_setup: bool) -> LazyConnection {
        let factory = factory();
        LazyConnection::new(
            "test",
            move || {
                creates.fetch_add(1, Ordering::SeqCst);
                let handle = factory.standalone("lazy");
                async move { Ok::<_, Error>(handle) }
            },
            move |handle: ConnectionHandle| async move {
                tokio::time::sleep(setup_delay).await;
                handle.connect().await?;
                if fail_setup {
                    return Err(Error::Connection("setup refused".into()));
                }
                Ok::<(), Error>(())
            },
        )
        .with_wait(Duration::from_millis(500), 20)
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_initialization() {
        let creates = Arc::new(AtomicUsize::new(0));
        let lazy = holder(creates.clone(), Duration::from_millis(1200), false);

        let (a, b) = tokio::join!(lazy.get_connection(), lazy.get_connection());
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a, b);
        assert!(a.is_ready());
        assert_eq!(creates.load(Ordering::SeqCst), 1);
        assert_eq!(lazy.state(), HolderState::Initialized);

        let c = lazy.get_connection().await.unwrap();
        assert_eq!(a, c);
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_failure_surfaces_once_then_holds() {
        let creates = Arc::new(AtomicUsize::new(0));
        let lazy = holder(creates.clone(), Duration::ZERO, true);

        assert!(lazy.get_connection().await.is_err());
        assert_eq!(lazy.state(), HolderState::Initialized);

        // No retry: the held handle is returned as-is
        let held = lazy.get_connection().await.unwrap();
        assert_eq!(Some(held), lazy.current());
        assert_eq!(creates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_failure_reports_initialization_error() {
        let lazy = LazyConnection::new(
            "broken",
            || async { Err::<ConnectionHandle, _>(Error::Config("no host".into())) },
            |_handle: ConnectionHandle| async { Ok::<(), Error>(()) },
        );

        assert!(matches!(lazy.get_connection().await, Err(Error::Config(_))));
        assert!(matches!(
            lazy.get_connection().await,
            Err(Error::Initialization(msg)) if msg.contains("no host")
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_gives_up_after_max_wait_count() {
        let creates = Arc::new(AtomicUsize::new(0));
        let lazy = holder(creates, Duration::from_secs(60), false).with_wait(Duration::from_millis(100), 3);

        let (first, second) = tokio::join!(lazy.get_connection(), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let started = tokio::time::Instant::now();
            let result = lazy.get_connection().await;
            (result, started.elapsed())
        });

        assert!(first.is_ok());
        let (result, waited) = second;
        // Best effort: the handle exists but setup is still running
        assert!(result.is_ok());
        assert!(waited >= Duration::from_millis(300));
        assert!(waited < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_waits_for_inflight_initialization() {
        let creates = Arc::new(AtomicUsize::new(0));
        let disposed = Arc::new(AtomicUsize::new(0));
        let counter = disposed.clone();
        let lazy = holder(creates.clone(), Duration::from_millis(1200), false).with_dispose(
            move |handle: ConnectionHandle| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { handle.disconnect().await }
            },
        );

        let (first, reset) = tokio::join!(lazy.get_connection(), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            lazy.reset_connection().await
        });

        let first = first.unwrap();
        reset.unwrap();

        // The reset ran after initialization completed, never during it
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
        assert_eq!(lazy.state(), HolderState::Uninitialized);
        assert!(!first.is_ready());

        let second = lazy.get_connection().await.unwrap();
        assert_ne!(first, second);
        assert_eq!(creates.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_failure_is_returned_after_reset() {
        let creates = Arc::new(AtomicUsize::new(0));
        let lazy = holder(creates, Duration::ZERO, false)
            .with_dispose(|_handle: ConnectionHandle| async { Err::<(), _>(Error::Connection("close failed".into())) });

        lazy.get_connection().await.unwrap();
        assert!(lazy.reset_connection().await.is_err());
        assert_eq!(lazy.state(), HolderState::Uninitialized);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_initialization_does_not_wedge_holder() {
        let creates = Arc::new(AtomicUsize::new(0));
        let lazy = holder(creates.clone(), Duration::from_secs(30), false);

        let abandoned = tokio::time::timeout(Duration::from_secs(1), lazy.get_connection()).await;
        assert!(abandoned.is_err());
        assert_eq!(lazy.state(), HolderState::Uninitialized);

        assert!(lazy.get_connection().await.is_ok());
        assert_eq!(creates.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_without_any_handle_is_not_ready() {
        let factory = factory();
        let lazy = LazyConnection::new(
            "slow-create",
            move || {
                let handle = factory.standalone("lazy");
                async move {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok::<_, Error>(handle)
                }
            },
            |_handle: ConnectionHandle| async { Ok::<(), Error>(()) },
        )
        .with_wait(Duration::from_millis(100), 3);

        let (first, second) = tokio::join!(lazy.get_connection(), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            lazy.get_connection().await
        });

        assert!(first.is_ok());
        assert!(matches!(second, Err(Error::NotReady(name)) if name == "slow-create"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_reports_skip_when_initialization_outlasts_wait() {
        let creates = Arc::new(AtomicUsize::new(0));
        let disposed = Arc::new(AtomicUsize::new(0));
        let counter = disposed.clone();
        let lazy = holder(creates.clone(), Duration::from_secs(60), false)
            .with_wait(Duration::from_millis(100), 3)
            .with_dispose(move |handle: ConnectionHandle| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { handle.disconnect().await }
            });

        let (first, reset) = tokio::join!(lazy.get_connection(), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            lazy.reset_connection().await
        });

        assert!(matches!(reset, Err(Error::NotReady(_))));
        assert!(first.unwrap().is_ready());
        assert_eq!(disposed.load(Ordering::SeqCst), 0);
        assert_eq!(lazy.state(), HolderState::Initialized);
        assert_eq!(creates.load(Ordering::SeqCst), 1);
    }
}
