//! Bounded-concurrency task scheduler.
//!
//! Tasks are admitted immediately while fewer than `max_concurrency` are
//! running; the rest wait in a priority queue (FIFO within a priority). A slot
//! is represented by an RAII guard, so a task that panics or is dropped
//! mid-flight still hands its slot to the next waiter.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::stream::{FuturesUnordered, StreamExt};
use serde::Deserialize;
use tokio::sync::{Semaphore, oneshot};

const DURATION_WINDOW: usize = 50;

/// Dispatch priority of a queued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    fn rank(self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

/// Limiter tuning.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    pub max_concurrency: usize,
    #[serde(with = "crate::config::duration_ms")]
    pub backoff_base: Duration,
    #[serde(with = "crate::config::duration_ms")]
    pub backoff_max: Duration,
    /// Failures older than this no longer influence the backoff delay.
    #[serde(with = "crate::config::duration_ms")]
    pub failure_window: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 3,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            failure_window: Duration::from_secs(300),
        }
    }
}

/// Point-in-time view of the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyStats {
    pub running: usize,
    pub queued: usize,
    pub max_concurrency: usize,
    pub completed: u64,
    pub failed: u64,
    pub average_duration: Option<Duration>,
}

/// Per-task result of [`ConcurrencyLimiter::execute_all`].
#[derive(Debug)]
pub enum TaskOutcome<T, E> {
    Completed(T),
    Failed(E),
    TimedOut(Duration),
    /// Never ran to completion because a sibling failed under `fail_fast`.
    Cancelled,
}

impl<T, E> TaskOutcome<T, E> {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Completed(_))
    }

    pub fn ok(self) -> Option<T> {
        match self {
            TaskOutcome::Completed(value) => Some(value),
            _ => None,
        }
    }
}

/// Progress callback: `(finished, total)`.
pub type ProgressFn = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// Options for [`ConcurrencyLimiter::execute_all`].
#[derive(Clone, Default)]
pub struct ExecuteAllOptions {
    pub fail_fast: bool,
    /// Per-task execution deadline, measured once the task holds a slot.
    pub timeout: Option<Duration>,
    pub priority: Priority,
    /// Cap on how many of these tasks hold a limiter slot at once. The
    /// limiter's own bound still applies.
    pub max_in_flight: Option<usize>,
    pub on_progress: Option<ProgressFn>,
}

impl fmt::Debug for ExecuteAllOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecuteAllOptions")
            .field("fail_fast", &self.fail_fast)
            .field("timeout", &self.timeout)
            .field("priority", &self.priority)
            .field("max_in_flight", &self.max_in_flight)
            .field("on_progress", &self.on_progress.is_some())
            .finish()
    }
}

#[derive(Debug)]
struct Waiter {
    priority: Priority,
    name: String,
    enqueued_at: Instant,
    tx: oneshot::Sender<()>,
}

#[derive(Debug)]
struct LimiterState {
    config: LimiterConfig,
    running: usize,
    queue: VecDeque<Waiter>,
    completed: u64,
    failed: u64,
    durations: VecDeque<Duration>,
    failures: VecDeque<Instant>,
}

impl LimiterState {
    fn enqueue(&mut self, waiter: Waiter) {
        let position = self
            .queue
            .iter()
            .position(|queued| queued.priority.rank() > waiter.priority.rank())
            .unwrap_or(self.queue.len());
        self.queue.insert(position, waiter);
    }

    fn dispatch(&mut self) {
        while self.running < self.config.max_concurrency {
            let Some(waiter) = self.queue.pop_front() else {
                break;
            };
            if waiter.tx.send(()).is_ok() {
                self.running += 1;
                log::trace!(
                    "dispatched '{}' after {:?} in queue",
                    waiter.name,
                    waiter.enqueued_at.elapsed()
                );
            }
        }
    }

    fn record_failure(&mut self, at: Instant) {
        self.failures.push_back(at);
        self.prune_failures(at);
    }

    fn prune_failures(&mut self, now: Instant) {
        let window = self.config.failure_window;
        while let Some(oldest) = self.failures.front() {
            if now.saturating_duration_since(*oldest) > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Cloneable handle to a shared scheduler.
#[derive(Clone)]
pub struct ConcurrencyLimiter {
    inner: Arc<Mutex<LimiterState>>,
}

impl fmt::Debug for ConcurrencyLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrencyLimiter")
            .field("stats", &self.stats())
            .finish()
    }
}

impl Default for ConcurrencyLimiter {
    fn default() -> Self {
        Self::new(LimiterConfig::default())
    }
}

impl ConcurrencyLimiter {
    pub fn new(mut config: LimiterConfig) -> Self {
        config.max_concurrency = config.max_concurrency.max(1);
        Self {
            inner: Arc::new(Mutex::new(LimiterState {
                config,
                running: 0,
                queue: VecDeque::new(),
                completed: 0,
                failed: 0,
                durations: VecDeque::with_capacity(DURATION_WINDOW),
                failures: VecDeque::new(),
            })),
        }
    }

    pub fn with_max_concurrency(max_concurrency: usize) -> Self {
        Self::new(LimiterConfig {
            max_concurrency,
            ..LimiterConfig::default()
        })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, LimiterState> {
        self.inner.lock().expect("limiter lock poisoned")
    }

    pub fn max_concurrency(&self) -> usize {
        self.state().config.max_concurrency
    }

    /// Change the bound. Raising it dispatches queued tasks right away;
    /// lowering it lets running tasks finish and takes effect on the next
    /// admission.
    pub fn set_max_concurrency(&self, max_concurrency: usize) {
        let mut state = self.state();
        state.config.max_concurrency = max_concurrency.max(1);
        state.dispatch();
    }

    /// Run `task` once a slot is available.
    pub async fn execute<F, T, E>(&self, task: F, priority: Priority, name: &str) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
    {
        let slot = self.acquire(priority, name).await;
        let result = task.await;
        slot.finish(result.is_ok());
        result
    }

    async fn acquire(&self, priority: Priority, name: &str) -> Slot {
        loop {
            let rx = {
                let mut state = self.state();
                if state.running < state.config.max_concurrency {
                    state.running += 1;
                    return Slot::new(self.inner.clone());
                }
                let (tx, rx) = oneshot::channel();
                state.enqueue(Waiter {
                    priority,
                    name: name.to_string(),
                    enqueued_at: Instant::now(),
                    tx,
                });
                log::trace!("queued '{name}' ({priority:?}), {} waiting", state.queue.len());
                rx
            };

            let mut pending = PendingSlot {
                inner: self.inner.clone(),
                rx: Some(rx),
            };
            if pending.wait().await {
                return Slot::new(self.inner.clone());
            }
        }
    }

    /// Run every task, preserving input order in the returned outcomes.
    pub async fn execute_all<F, T, E>(
        &self,
        tasks: Vec<F>,
        options: ExecuteAllOptions,
    ) -> Vec<TaskOutcome<T, E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        let total = tasks.len();
        let mut outcomes: Vec<Option<TaskOutcome<T, E>>> = (0..total).map(|_| None).collect();
        let mut pending = FuturesUnordered::new();
        let width = options
            .max_in_flight
            .map(|limit| Arc::new(Semaphore::new(limit.max(1))));

        for (index, task) in tasks.into_iter().enumerate() {
            let timeout = options.timeout;
            let priority = options.priority;
            let width = width.clone();
            pending.push(async move {
                let _permit = match &width {
                    Some(width) => width.acquire().await.ok(),
                    None => None,
                };
                let guarded = async move {
                    match timeout {
                        Some(limit) => match tokio::time::timeout(limit, task).await {
                            Ok(result) => result.map_err(TaskOutcome::Failed),
                            Err(_) => Err(TaskOutcome::TimedOut(limit)),
                        },
                        None => task.await.map_err(TaskOutcome::Failed),
                    }
                };
                let name = format!("task-{index}");
                let outcome = match self.execute(guarded, priority, &name).await {
                    Ok(value) => TaskOutcome::Completed(value),
                    Err(outcome) => outcome,
                };
                (index, outcome)
            });
        }

        let mut finished = 0;
        while let Some((index, outcome)) = pending.next().await {
            finished += 1;
            let abort = options.fail_fast && !outcome.is_success();
            outcomes[index] = Some(outcome);
            if let Some(progress) = &options.on_progress {
                progress(finished, total);
            }
            if abort {
                log::debug!("fail-fast: abandoning {} unfinished task(s)", total - finished);
                break;
            }
        }
        drop(pending);

        outcomes
            .into_iter()
            .map(|outcome| outcome.unwrap_or(TaskOutcome::Cancelled))
            .collect()
    }

    pub fn stats(&self) -> ConcurrencyStats {
        let state = self.state();
        let average_duration = (!state.durations.is_empty()).then(|| {
            state.durations.iter().sum::<Duration>() / state.durations.len() as u32
        });
        ConcurrencyStats {
            running: state.running,
            queued: state.queue.len(),
            max_concurrency: state.config.max_concurrency,
            completed: state.completed,
            failed: state.failed,
            average_duration,
        }
    }

    /// Advisory delay callers should wait before their next task. Zero when no
    /// failure happened within the failure window.
    pub fn backoff_delay(&self) -> Duration {
        self.backoff_delay_at(Instant::now())
    }

    pub fn backoff_delay_at(&self, now: Instant) -> Duration {
        let mut state = self.state();
        state.prune_failures(now);
        let recent = state.failures.len();
        if recent == 0 {
            return Duration::ZERO;
        }
        let exponent = (recent - 1).min(5) as i32;
        let delay = state.config.backoff_base.as_secs_f64() * 1.8f64.powi(exponent);
        Duration::from_secs_f64(delay).min(state.config.backoff_max)
    }
}

/// Queued acquisition. Dropping it before the slot was received gives back a
/// slot that was handed over concurrently.
struct PendingSlot {
    inner: Arc<Mutex<LimiterState>>,
    rx: Option<oneshot::Receiver<()>>,
}

impl PendingSlot {
    async fn wait(&mut self) -> bool {
        let Some(rx) = self.rx.as_mut() else {
            return false;
        };
        let granted = rx.await.is_ok();
        self.rx = None;
        granted
    }
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        if let Some(mut rx) = self.rx.take() {
            rx.close();
            if rx.try_recv().is_ok() {
                let mut state = self.inner.lock().expect("limiter lock poisoned");
                state.running = state.running.saturating_sub(1);
                state.dispatch();
            }
        }
    }
}

/// Occupied slot.
struct Slot {
    inner: Arc<Mutex<LimiterState>>,
    started: Instant,
    released: bool,
}

impl Slot {
    fn new(inner: Arc<Mutex<LimiterState>>) -> Self {
        Self {
            inner,
            started: Instant::now(),
            released: false,
        }
    }

    fn finish(mut self, success: bool) {
        let elapsed = self.started.elapsed();
        let mut state = self.inner.lock().expect("limiter lock poisoned");
        if success {
            state.completed += 1;
        } else {
            state.failed += 1;
            state.record_failure(Instant::now());
        }
        if state.durations.len() == DURATION_WINDOW {
            state.durations.pop_front();
        }
        state.durations.push_back(elapsed);
        state.running = state.running.saturating_sub(1);
        state.dispatch();
        self.released = true;
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let mut state = self.inner.lock().expect("limiter lock poisoned");
        state.running = state.running.saturating_sub(1);
        state.dispatch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn never_exceeds_max_concurrency() {
        let limiter = ConcurrencyLimiter::with_max_concurrency(3);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..12)
            .map(|i| {
                let current = current.clone();
                let peak = peak.clone();
                async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(15)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, ()>(i)
                }
            })
            .collect();

        let outcomes = limiter.execute_all(tasks, ExecuteAllOptions::default()).await;
        assert_eq!(outcomes.len(), 12);
        assert!(outcomes.iter().all(TaskOutcome::is_success));
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(peak.load(Ordering::SeqCst), 3);
        assert_eq!(limiter.stats().running, 0);
        assert_eq!(limiter.stats().completed, 12);
    }

    #[tokio::test]
    async fn high_priority_jumps_queued_normal_tasks() {
        let limiter = ConcurrencyLimiter::with_max_concurrency(1);
        let order = Arc::new(Mutex::new(Vec::new()));
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let blocker = {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                limiter
                    .execute(
                        async {
                            let _ = release_rx.await;
                            Ok::<_, ()>(())
                        },
                        Priority::Normal,
                        "blocker",
                    )
                    .await
            })
        };
        while limiter.stats().running < 1 {
            tokio::task::yield_now().await;
        }

        let mut handles = Vec::new();
        for (label, priority) in [
            ("normal-a", Priority::Normal),
            ("normal-b", Priority::Normal),
            ("high", Priority::High),
        ] {
            let task_limiter = limiter.clone();
            let order = order.clone();
            let queued_before = limiter.stats().queued;
            handles.push(tokio::spawn(async move {
                task_limiter
                    .execute(
                        async move {
                            order.lock().unwrap().push(label);
                            Ok::<_, ()>(())
                        },
                        priority,
                        label,
                    )
                    .await
            }));
            while limiter.stats().queued == queued_before {
                tokio::task::yield_now().await;
            }
        }

        release_tx.send(()).unwrap();
        blocker.await.unwrap().unwrap();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec!["high", "normal-a", "normal-b"]);
    }

    #[tokio::test]
    async fn execute_all_preserves_input_order() {
        let limiter = ConcurrencyLimiter::with_max_concurrency(4);
        let tasks: Vec<_> = (0..10)
            .map(|i| {
                let delay = rand::thread_rng().gen_range(1..25);
                async move {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    Ok::<_, String>(i)
                }
            })
            .collect();

        let values: Vec<_> = limiter
            .execute_all(tasks, ExecuteAllOptions::default())
            .await
            .into_iter()
            .map(|outcome| outcome.ok().unwrap())
            .collect();
        assert_eq!(values, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn max_in_flight_narrows_a_batch_without_touching_the_bound() {
        let limiter = ConcurrencyLimiter::with_max_concurrency(4);
        let live = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let tasks: Vec<_> = (0..6)
            .map(|i| {
                let live = live.clone();
                let peak = peak.clone();
                async move {
                    let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    live.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, ()>(i)
                }
            })
            .collect();
        let options = ExecuteAllOptions {
            max_in_flight: Some(2),
            ..ExecuteAllOptions::default()
        };

        let outcomes = limiter.execute_all(tasks, options).await;
        assert!(outcomes.iter().all(TaskOutcome::is_success));
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(limiter.max_concurrency(), 4);
    }

    #[tokio::test]
    async fn failures_and_timeouts_stay_with_their_task() {
        let limiter = ConcurrencyLimiter::with_max_concurrency(2);
        let tasks: Vec<std::pin::Pin<Box<dyn Future<Output = Result<u32, String>> + Send>>> = vec![
            Box::pin(async { Ok(1) }),
            Box::pin(async { Err("boom".to_string()) }),
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(3)
            }),
        ];
        let options = ExecuteAllOptions {
            timeout: Some(Duration::from_millis(30)),
            ..ExecuteAllOptions::default()
        };

        let outcomes = limiter.execute_all(tasks, options).await;
        assert!(matches!(outcomes[0], TaskOutcome::Completed(1)));
        assert!(matches!(&outcomes[1], TaskOutcome::Failed(err) if err == "boom"));
        assert!(matches!(outcomes[2], TaskOutcome::TimedOut(_)));
        assert_eq!(limiter.stats().running, 0);
    }

    #[tokio::test]
    async fn fail_fast_cancels_unfinished_siblings() {
        let limiter = ConcurrencyLimiter::with_max_concurrency(2);
        let tasks: Vec<std::pin::Pin<Box<dyn Future<Output = Result<u32, String>> + Send>>> = vec![
            Box::pin(async { Err("first".to_string()) }),
            Box::pin(async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(2)
            }),
        ];
        let options = ExecuteAllOptions {
            fail_fast: true,
            ..ExecuteAllOptions::default()
        };

        let outcomes = limiter.execute_all(tasks, options).await;
        assert!(matches!(outcomes[0], TaskOutcome::Failed(_)));
        assert!(matches!(outcomes[1], TaskOutcome::Cancelled));
        assert_eq!(limiter.stats().running, 0);
        assert_eq!(limiter.stats().queued, 0);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let limiter = ConcurrencyLimiter::new(LimiterConfig {
            backoff_base: Duration::from_secs(4),
            backoff_max: Duration::from_secs(12),
            ..LimiterConfig::default()
        });
        let start = Instant::now();
        assert_eq!(limiter.backoff_delay_at(start), Duration::ZERO);

        let mut previous = Duration::ZERO;
        let mut delays = Vec::new();
        for offset in 0..3 {
            let at = start + Duration::from_secs(offset);
            limiter.state().record_failure(at);
            let delay = limiter.backoff_delay_at(at);
            delays.push(delay);
        }
        for delay in &delays[..2] {
            assert!(*delay > previous);
            previous = *delay;
        }
        assert_eq!(delays[2], Duration::from_secs(12));
    }

    #[test]
    fn backoff_strictly_increases_below_cap() {
        let limiter = ConcurrencyLimiter::default();
        let start = Instant::now();
        let delays: Vec<_> = (0..3)
            .map(|offset| {
                let at = start + Duration::from_secs(offset);
                limiter.state().record_failure(at);
                limiter.backoff_delay_at(at)
            })
            .collect();
        assert!(delays[0] < delays[1] && delays[1] < delays[2]);
        assert!(delays[2] <= Duration::from_secs(30));
    }

    #[test]
    fn stale_failures_do_not_contribute() {
        let limiter = ConcurrencyLimiter::default();
        let start = Instant::now();
        limiter.state().record_failure(start);
        assert!(limiter.backoff_delay_at(start) > Duration::ZERO);
        assert_eq!(
            limiter.backoff_delay_at(start + Duration::from_secs(400)),
            Duration::ZERO
        );
    }
}
