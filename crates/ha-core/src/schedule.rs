//! Delayed actions as explicit, cancellable scheduled tasks
//!
//! Production code schedules through [`TokioScheduler`]; tests use
//! [`ManualScheduler`] and advance a virtual clock instead of sleeping.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use tokio::task::AbortHandle;
use tracing::trace;

/// A unit of delayed work
pub type Task = Box<dyn FnOnce() + Send + 'static>;

const PENDING: u8 = 0;
const CANCELLED: u8 = 1;
const FIRED: u8 = 2;

/// Handle to a scheduled task
///
/// Cloning the handle shares the same task; cancelling any clone cancels it.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    state: Arc<AtomicU8>,
    /// Timer task backing a real-time schedule
    timer: Arc<OnceLock<AbortHandle>>,
}

impl TaskHandle {
    fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(PENDING)),
            timer: Arc::new(OnceLock::new()),
        }
    }

    /// Prevent the task from running; returns false if it already ran or
    /// was already cancelled
    pub fn cancel(&self) -> bool {
        let cancelled = self
            .state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if cancelled {
            if let Some(timer) = self.timer.get() {
                timer.abort();
            }
        }
        cancelled
    }

    fn attach_timer(&self, timer: AbortHandle) {
        let _ = self.timer.set(timer);
        // Cancelled before the timer was attached
        if self.is_cancelled() {
            if let Some(timer) = self.timer.get() {
                timer.abort();
            }
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state.load(Ordering::Acquire) == PENDING
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    /// Transition to fired; only the caller that wins may run the task
    fn claim(&self) -> bool {
        self.state
            .compare_exchange(PENDING, FIRED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Something that can run a task after a delay
pub trait Scheduler: Send + Sync {
    fn schedule(&self, delay: Duration, task: Task) -> TaskHandle;
}

/// Real-time scheduler backed by the tokio timer
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    runtime: tokio::runtime::Handle,
}

impl TokioScheduler {
    pub fn new(runtime: tokio::runtime::Handle) -> Self {
        Self { runtime }
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: Task) -> TaskHandle {
        let handle = TaskHandle::new();
        let claim = handle.clone();
        let timer = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if claim.claim() {
                task();
            } else {
                trace!("Scheduled task cancelled before firing");
            }
        });
        handle.attach_timer(timer.abort_handle());
        handle
    }
}

struct PendingTask {
    deadline: Duration,
    seq: u64,
    handle: TaskHandle,
    task: Task,
}

#[derive(Default)]
struct ManualState {
    now: Duration,
    seq: u64,
    queue: Vec<PendingTask>,
}

/// Virtual-clock scheduler; nothing runs until [`ManualScheduler::advance`]
#[derive(Default)]
pub struct ManualScheduler {
    state: Mutex<ManualState>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Time elapsed on the virtual clock
    pub fn now(&self) -> Duration {
        self.lock().now
    }

    /// Number of tasks still waiting (cancelled ones included until their
    /// deadline passes)
    pub fn pending(&self) -> usize {
        self.lock().queue.len()
    }

    /// Move the clock forward, running every due task in deadline order
    ///
    /// Tasks run without the scheduler lock held, so they may schedule
    /// further tasks; those run too if they fall due within the window.
    /// Returns the number of tasks that actually ran.
    pub fn advance(&self, by: Duration) -> usize {
        let target = self.lock().now + by;
        let mut ran = 0;

        loop {
            let next = {
                let mut state = self.lock();
                let due = state
                    .queue
                    .iter()
                    .enumerate()
                    .filter(|(_, p)| p.deadline <= target)
                    .min_by_key(|(_, p)| (p.deadline, p.seq))
                    .map(|(i, _)| i);
                match due {
                    Some(i) => {
                        let pending = state.queue.swap_remove(i);
                        state.now = pending.deadline;
                        Some(pending)
                    }
                    None => {
                        state.now = target;
                        None
                    }
                }
            };

            match next {
                Some(pending) => {
                    if pending.handle.claim() {
                        (pending.task)();
                        ran += 1;
                    }
                }
                None => return ran,
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, task: Task) -> TaskHandle {
        let handle = TaskHandle::new();
        let mut state = self.lock();
        state.seq += 1;
        let pending = PendingTask {
            deadline: state.now + delay,
            seq: state.seq,
            handle: handle.clone(),
            task,
        };
        state.queue.push(pending);
        handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> Task) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let make = move |name: &'static str| -> Task {
            let sink = sink.clone();
            Box::new(move || sink.lock().unwrap().push(name))
        };
        (log, make)
    }

    #[test]
    fn test_manual_runs_in_deadline_order() {
        let scheduler = ManualScheduler::new();
        let (log, task) = recorder();

        scheduler.schedule(Duration::from_secs(5), task("five"));
        scheduler.schedule(Duration::from_secs(1), task("one"));
        scheduler.schedule(Duration::from_secs(3), task("three"));

        assert_eq!(scheduler.advance(Duration::from_secs(2)), 1);
        assert_eq!(*log.lock().unwrap(), vec!["one"]);

        assert_eq!(scheduler.advance(Duration::from_secs(10)), 2);
        assert_eq!(*log.lock().unwrap(), vec!["one", "three", "five"]);
        assert_eq!(scheduler.now(), Duration::from_secs(12));
    }

    #[test]
    fn test_cancelled_task_never_runs() {
        let scheduler = ManualScheduler::new();
        let (log, task) = recorder();

        let handle = scheduler.schedule(Duration::from_secs(1), task("reset"));
        assert!(handle.is_pending());
        assert!(handle.cancel());
        assert!(!handle.cancel());

        assert_eq!(scheduler.advance(Duration::from_secs(5)), 0);
        assert!(log.lock().unwrap().is_empty());
        assert!(handle.is_cancelled());
    }

    #[test]
    fn test_cancel_after_fire_is_noop() {
        let scheduler = ManualScheduler::new();
        let (_, task) = recorder();

        let handle = scheduler.schedule(Duration::ZERO, task("now"));
        scheduler.advance(Duration::ZERO);
        assert!(!handle.is_pending());
        assert!(!handle.cancel());
    }

    #[test]
    fn test_task_may_schedule_followup() {
        let scheduler = Arc::new(ManualScheduler::new());
        let count = Arc::new(AtomicUsize::new(0));

        let inner_scheduler = scheduler.clone();
        let inner_count = count.clone();
        scheduler.schedule(
            Duration::from_secs(1),
            Box::new(move || {
                inner_count.fetch_add(1, Ordering::SeqCst);
                let c = inner_count.clone();
                inner_scheduler.schedule(
                    Duration::from_secs(1),
                    Box::new(move || {
                        c.fetch_add(1, Ordering::SeqCst);
                    }),
                );
            }),
        );

        assert_eq!(scheduler.advance(Duration::from_secs(3)), 2);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_tokio_scheduler_fires_and_cancels() {
        let scheduler = TokioScheduler::new(tokio::runtime::Handle::current());
        let (tx, rx) = tokio::sync::oneshot::channel();
        let fired = scheduler.schedule(
            Duration::from_millis(10),
            Box::new(move || {
                let _ = tx.send(());
            }),
        );

        let cancelled_ran = Arc::new(AtomicUsize::new(0));
        let c = cancelled_ran.clone();
        let cancelled = scheduler.schedule(
            Duration::from_millis(10),
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert!(cancelled.cancel());

        tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!fired.is_pending());
        assert_eq!(cancelled_ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_releases_tokio_timer() {
        let scheduler = TokioScheduler::new(tokio::runtime::Handle::current());
        let held = Arc::new(());
        let captured = held.clone();
        let handle = scheduler.schedule(
            Duration::from_secs(3600),
            Box::new(move || drop(captured)),
        );
        assert_eq!(Arc::strong_count(&held), 2);

        assert!(handle.cancel());
        // The aborted timer drops the task long before its deadline
        for _ in 0..100 {
            if Arc::strong_count(&held) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(Arc::strong_count(&held), 1);
        assert!(handle.is_cancelled());
    }
}
