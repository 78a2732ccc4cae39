use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Mutex;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::lock;

struct Running {
    cancel_token: CancellationToken,
    handle: JoinHandle<()>,
}

/// One self-rescheduling background loop.
///
/// The next cycle starts `interval` after the previous one finished, so
/// cycles never overlap. Stopping never interrupts a cycle in flight.
pub(crate) struct Periodic {
    name: &'static str,
    interval: Duration,
    running: Mutex<Option<Running>>,
}

impl Periodic {
    pub(crate) fn new(name: &'static str, interval: Duration) -> Self {
        Self {
            name,
            interval,
            running: Mutex::new(None),
        }
    }

    /// Spawn the loop. Returns false if it is already running, or if a
    /// stopped loop is still finishing its last cycle.
    pub(crate) fn start<F, Fut>(&self, mut cycle: F) -> bool
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut running = lock(&self.running);
        if let Some(r) = running.as_ref().filter(|r| !r.handle.is_finished()) {
            if r.cancel_token.is_cancelled() {
                tracing::warn!(task = self.name, "Previous loop is still finishing a cycle, not starting");
            }
            return false;
        }

        let cancel_token = CancellationToken::new();
        let token = cancel_token.clone();
        let name = self.name;
        let interval = self.interval;

        let handle = tokio::spawn(async move {
            tracing::debug!(task = name, interval_ms = interval.as_millis() as u64, "Periodic task started");
            loop {
                if token.is_cancelled() {
                    break;
                }

                if AssertUnwindSafe(cycle()).catch_unwind().await.is_err() {
                    tracing::error!(task = name, "Periodic cycle panicked");
                }

                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            tracing::debug!(task = name, "Periodic task shutting down");
        });

        *running = Some(Running {
            cancel_token,
            handle,
        });
        true
    }

    /// Ask the loop to exit. Returns false if it was not running.
    pub(crate) fn stop(&self) -> bool {
        match lock(&self.running).as_ref() {
            Some(r) if !r.cancel_token.is_cancelled() => {
                r.cancel_token.cancel();
                true
            }
            _ => false,
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        lock(&self.running)
            .as_ref()
            .is_some_and(|r| !r.cancel_token.is_cancelled() && !r.handle.is_finished())
    }

    /// Stop and wait for the current cycle to finish.
    pub(crate) async fn shutdown(&self) {
        let running = lock(&self.running).take();
        if let Some(running) = running {
            running.cancel_token.cancel();
            if let Err(e) = running.handle.await {
                tracing::warn!(task = self.name, "Periodic task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for Periodic {
    fn drop(&mut self) {
        if let Some(running) = lock(&self.running).as_ref() {
            running.cancel_token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_runs_immediately_then_every_interval() {
        let periodic = Periodic::new("test", Duration::from_secs(10));
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();

        assert!(periodic.start(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));
        assert!(periodic.is_running());

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);

        periodic.shutdown().await;
        assert!(!periodic.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_stop_are_idempotent() {
        let periodic = Periodic::new("test", Duration::from_secs(1));
        assert!(!periodic.stop());

        assert!(periodic.start(|| async {}));
        assert!(!periodic.start(|| async {}));

        assert!(periodic.stop());
        assert!(!periodic.stop());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!periodic.is_running());

        // Restart after stop
        assert!(periodic.start(|| async {}));
        periodic.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_cycle_keeps_loop_alive() {
        let periodic = Periodic::new("test", Duration::from_secs(1));
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();

        periodic.start(move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("first cycle fails");
                }
            }
        });

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(periodic.is_running());
        periodic.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_does_not_interrupt_cycle() {
        let periodic = Periodic::new("test", Duration::from_secs(1));
        let finished = Arc::new(AtomicUsize::new(0));
        let done = finished.clone();

        periodic.start(move || {
            let done = done.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                done.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        periodic.stop();
        periodic.shutdown().await;

        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_waits_for_draining_cycle() {
        let periodic = Periodic::new("test", Duration::from_secs(1));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));

        let cycle = {
            let in_flight = in_flight.clone();
            let max_in_flight = max_in_flight.clone();
            move || {
                let in_flight = in_flight.clone();
                let max_in_flight = max_in_flight.clone();
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_in_flight.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                }
            }
        };

        assert!(periodic.start(cycle.clone()));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(periodic.stop());

        // The stopped loop is mid-cycle
        assert!(!periodic.start(cycle.clone()));
        assert!(!periodic.is_running());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(periodic.start(cycle));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
        periodic.shutdown().await;
    }
}
