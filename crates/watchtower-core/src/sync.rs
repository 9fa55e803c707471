use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::debug;

/// Mutual exclusion for git-mutating work. Waiters are served in arrival
/// order (tokio's mutex is fair), so a queued user action is never starved
/// by the poll timer.
#[derive(Default)]
pub struct OperationLock {
    inner: Mutex<()>,
    holder: StdMutex<Option<String>>,
    waiting: AtomicUsize,
}

pub struct OperationGuard<'a> {
    lock: &'a OperationLock,
    _guard: MutexGuard<'a, ()>,
}

impl OperationLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, label: &str) -> OperationGuard<'_> {
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let guard = self.inner.lock().await;
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        self.enter(label, guard)
    }

    pub fn try_acquire(&self, label: &str) -> Option<OperationGuard<'_>> {
        let guard = self.inner.try_lock().ok()?;
        Some(self.enter(label, guard))
    }

    pub fn is_locked(&self) -> bool {
        self.inner.try_lock().is_err()
    }

    pub fn holder(&self) -> Option<String> {
        self.holder.lock().ok().and_then(|holder| holder.clone())
    }

    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    fn enter<'a>(&'a self, label: &str, guard: MutexGuard<'a, ()>) -> OperationGuard<'a> {
        if let Ok(mut holder) = self.holder.lock() {
            *holder = Some(label.to_string());
        }
        debug!(label, "operation_lock_acquired");
        OperationGuard {
            lock: self,
            _guard: guard,
        }
    }
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut holder) = self.lock.holder.lock() {
            *holder = None;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("timed out after {}ms", .after.as_millis())]
pub struct TimedOut {
    pub after: Duration,
}

/// Races `fut` against a timer. The loser is dropped; whatever it owned is
/// released with it.
pub async fn with_timeout<F, T>(limit: Duration, fut: F) -> Result<T, TimedOut>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| TimedOut { after: limit })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(200),
            max: Duration::from_secs(5),
            attempts: 3,
        }
    }
}

pub fn next_backoff(current: Duration, max: Duration) -> Duration {
    let next = current + current;
    if next > max {
        max
    } else {
        next
    }
}

/// Runs `op` up to `policy.attempts` times, sleeping with doubling delays in
/// between. Errors for which `retryable` returns false end the loop at once.
pub async fn retry_with_backoff<T, E, F, Fut, R>(policy: Backoff, mut op: F, retryable: R) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
{
    let attempts = policy.attempts.max(1);
    let mut delay = policy.initial;
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= attempts || !retryable(&err) {
                    return Err(err);
                }
                debug!(attempt, delay_ms = delay.as_millis() as u64, "retry_backoff");
                tokio::time::sleep(delay).await;
                delay = next_backoff(delay, policy.max);
                attempt += 1;
            }
        }
    }
}

/// Trailing-edge debounce: every trigger pushes the deadline out again, and
/// the burst fires once the source has been quiet for `delay`.
#[derive(Debug, Clone)]
pub struct Debounce {
    delay: Duration,
    deadline: Option<Instant>,
}

impl Debounce {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            deadline: None,
        }
    }

    pub fn trigger(&mut self, now: Instant) {
        self.deadline = Some(now + self.delay);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    /// True once per burst, when `now` has reached the deadline.
    pub fn take_ready(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

/// Leading-edge throttle: lets one event through per `interval`.
#[derive(Debug, Clone)]
pub struct Throttle {
    interval: Duration,
    last: Option<Instant>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn allow(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        match self.last {
            Some(last) => self
                .interval
                .saturating_sub(now.saturating_duration_since(last)),
            None => Duration::ZERO,
        }
    }
}
