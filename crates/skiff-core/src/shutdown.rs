//! Delayed shutdown timers.
//!
//! A stop with a delay installs one cancellable timer per instance; the timer
//! fires the actual shutdown and unregisters itself. Cancellation happens
//! explicitly (stop --cancel) or implicitly when start, delete, suspend, or
//! restart touch the instance.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

struct DelayedShutdown {
    /// Distinguishes this timer from a later one installed under the same
    /// name, so a firing timer never unregisters its successor.
    id: u64,
    token: CancellationToken,
    deadline: Instant,
}

/// One timer per instance currently scheduled to stop.
#[derive(Default)]
pub struct DelayedShutdownRegistry {
    timers: HashMap<String, DelayedShutdown>,
    next_id: u64,
}

impl DelayedShutdownRegistry {
    /// True when the instance has a pending shutdown.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.timers.contains_key(name)
    }

    /// Time until the pending shutdown of an instance fires.
    #[must_use]
    pub fn time_remaining(&self, name: &str) -> Option<Duration> {
        self.timers
            .get(name)
            .map(|timer| timer.deadline.saturating_duration_since(Instant::now()))
    }

    /// Installs a timer for an instance, replacing (and cancelling) any
    /// previous one. `make_on_expire` receives the timer id and builds the
    /// future run when the delay elapses uncancelled; that future must call
    /// [`DelayedShutdownRegistry::unregister`] with the id.
    pub fn schedule<F, Fut>(&mut self, name: &str, delay: Duration, make_on_expire: F) -> u64
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cancel(name);

        let id = self.next_id;
        self.next_id += 1;

        let on_expire = make_on_expire(id);
        let token = CancellationToken::new();
        let task_token = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = task_token.cancelled() => {}
                () = tokio::time::sleep(delay) => on_expire.await,
            }
        });

        self.timers.insert(
            name.to_string(),
            DelayedShutdown {
                id,
                token,
                deadline: Instant::now() + delay,
            },
        );
        id
    }

    /// Cancels the pending shutdown of an instance, if any.
    ///
    /// Returns whether a timer was cancelled.
    pub fn cancel(&mut self, name: &str) -> bool {
        if let Some(timer) = self.timers.remove(name) {
            timer.token.cancel();
            true
        } else {
            false
        }
    }

    /// Removes a fired timer, but only if it is still the registered one.
    pub fn unregister(&mut self, name: &str, id: u64) {
        if self.timers.get(name).is_some_and(|timer| timer.id == id) {
            self.timers.remove(name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_delay() {
        let mut registry = DelayedShutdownRegistry::default();
        let fired = Arc::new(AtomicBool::new(false));

        let flag = fired.clone();
        registry.schedule("vm1", Duration::from_secs(60), |_id| async move {
            flag.store(true, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(!fired.load(Ordering::SeqCst));
        assert!(registry.time_remaining("vm1").unwrap() <= Duration::from_secs(1));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_firing() {
        let mut registry = DelayedShutdownRegistry::default();
        let fired = Arc::new(AtomicBool::new(false));

        let flag = fired.clone();
        registry.schedule("vm1", Duration::from_secs(60), |_id| async move {
            flag.store(true, Ordering::SeqCst);
        });

        assert!(registry.cancel("vm1"));
        assert!(!registry.contains("vm1"));

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(!fired.load(Ordering::SeqCst));
        assert!(!registry.cancel("vm1"), "nothing left to cancel");
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_previous_timer() {
        let mut registry = DelayedShutdownRegistry::default();
        let first = Arc::new(AtomicBool::new(false));
        let second = Arc::new(AtomicBool::new(false));

        let flag = first.clone();
        registry.schedule("vm1", Duration::from_secs(10), |_id| async move {
            flag.store(true, Ordering::SeqCst);
        });
        let flag = second.clone();
        registry.schedule("vm1", Duration::from_secs(30), |_id| async move {
            flag.store(true, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert!(!first.load(Ordering::SeqCst), "replaced timer must not fire");
        assert!(!second.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(second.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregister_ignores_stale_id() {
        let mut registry = DelayedShutdownRegistry::default();
        let stale = registry.schedule("vm1", Duration::from_secs(600), |_id| async {});
        registry.cancel("vm1");
        let _fresh = registry.schedule("vm1", Duration::from_secs(600), |_id| async {});

        registry.unregister("vm1", stale);
        assert!(registry.contains("vm1"), "stale id must not unregister");
    }
}
