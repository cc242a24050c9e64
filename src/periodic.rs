//! Cancellable background loops.
//!
//! Every daemon loop shares one [`Shutdown`] token. Waits are timed waits on
//! the token's condvar, so firing it wakes every sleeping loop immediately
//! instead of after its next tick.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};

/// Cooperative cancellation signal shared between the daemon and its loops.
#[derive(Clone, Default)]
pub struct Shutdown {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal. Idempotent.
    pub fn trigger(&self) {
        let (lock, cvar) = &*self.inner;
        let mut fired = lock.lock().unwrap_or_else(|e| e.into_inner());
        *fired = true;
        cvar.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        let (lock, _) = &*self.inner;
        *lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Sleep for `timeout` unless the signal fires first.
    ///
    /// Returns `true` when the signal fired (the caller should exit).
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let (lock, cvar) = &*self.inner;
        let mut fired = lock.lock().unwrap_or_else(|e| e.into_inner());
        while !*fired {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = cvar
                .wait_timeout(fired, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            fired = guard;
        }
        true
    }
}

impl fmt::Debug for Shutdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shutdown")
            .field("triggered", &self.is_triggered())
            .finish()
    }
}

/// A per-item failure inside one loop cycle.
///
/// Cycle bodies collect these; the driver logs them.
#[derive(Debug)]
pub struct ItemError {
    pub item: String,
    pub error: anyhow::Error,
}

impl ItemError {
    pub fn new(item: impl Into<String>, error: anyhow::Error) -> Self {
        Self {
            item: item.into(),
            error,
        }
    }
}

/// Outcome of one loop cycle.
#[derive(Debug, Default)]
pub struct CycleReport {
    /// Items that were acted upon (scanned, reclaimed, enqueued...).
    pub acted: usize,
    /// Items that were evaluated and intentionally left alone.
    pub skipped: usize,
    pub errors: Vec<ItemError>,
}

impl CycleReport {
    pub fn fail(&mut self, item: impl Into<String>, error: anyhow::Error) {
        self.errors.push(ItemError::new(item, error));
    }

    /// Log non-fatal item errors at `warn` and a one-line cycle summary at `debug`.
    pub fn log(&self, task: &str) {
        for failure in &self.errors {
            let message = format!("{:#}", failure.error);
            warn!(
                task = task,
                item = %failure.item,
                error = %message,
                "non-fatal error during cycle"
            );
        }
        debug!(
            task = task,
            acted = self.acted,
            skipped = self.skipped,
            errors = self.errors.len(),
            "cycle finished"
        );
    }
}

/// Spawn a named thread that runs `body` every `period` until `shutdown` fires.
///
/// The first invocation happens one full period after spawning. A panicking
/// cycle is logged and the loop keeps ticking.
pub fn spawn<F>(
    name: &str,
    period: Duration,
    shutdown: Shutdown,
    mut body: F,
) -> Result<JoinHandle<()>>
where
    F: FnMut() -> CycleReport + Send + 'static,
{
    let task = name.to_string();
    thread::Builder::new()
        .name(task.clone())
        .spawn(move || {
            info!(task = %task, period_ms = period.as_millis() as u64, "loop started");
            while !shutdown.wait_timeout(period) {
                match catch_unwind(AssertUnwindSafe(&mut body)) {
                    Ok(report) => report.log(&task),
                    Err(_) => error!(task = %task, "cycle panicked; continuing"),
                }
            }
            info!(task = %task, "loop stopped");
        })
        .with_context(|| format!("failed to spawn {name} thread"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn wait_timeout_returns_false_when_not_triggered() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn trigger_wakes_waiter_early() {
        let shutdown = Shutdown::new();
        let waiter = shutdown.clone();
        let started = Instant::now();
        let handle = thread::spawn(move || waiter.wait_timeout(Duration::from_secs(30)));
        thread::sleep(Duration::from_millis(50));
        shutdown.trigger();
        assert!(handle.join().unwrap());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn first_cycle_is_delayed_by_one_period() {
        let shutdown = Shutdown::new();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let handle = spawn("delayed", Duration::from_secs(60), shutdown.clone(), move || {
            seen.fetch_add(1, Ordering::SeqCst);
            CycleReport::default()
        })
        .unwrap();

        thread::sleep(Duration::from_millis(50));
        shutdown.trigger();
        handle.join().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn loop_ticks_until_cancelled_and_joins() {
        let shutdown = Shutdown::new();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let handle = spawn("ticker", Duration::from_millis(10), shutdown.clone(), move || {
            seen.fetch_add(1, Ordering::SeqCst);
            CycleReport::default()
        })
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while count.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        shutdown.trigger();
        handle.join().unwrap();
        assert!(count.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn panicking_cycle_does_not_kill_loop() {
        let shutdown = Shutdown::new();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let handle = spawn("panicky", Duration::from_millis(10), shutdown.clone(), move || {
            let n = seen.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                panic!("first cycle explodes");
            }
            CycleReport::default()
        })
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while count.load(Ordering::SeqCst) < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        shutdown.trigger();
        handle.join().unwrap();
        assert!(count.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn cycle_report_collects_failures() {
        let mut report = CycleReport::default();
        report.fail("mission-a", anyhow::anyhow!("boom"));
        report.acted += 1;
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].item, "mission-a");
        report.log("test");
    }
}
