//! Background rotation of windows, caches and budgets.
use crate::error::{SamplerError, SamplerResult};
use opentelemetry::{otel_debug, otel_error, otel_info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Length of one insertion budget period of the workflow sampler.
pub(crate) const BUDGET_PERIOD: Duration = Duration::from_secs(60);

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// How often each piece of state is rotated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Intervals {
    pub(crate) window: Duration,
    pub(crate) cache_lifetime: Duration,
    pub(crate) budget: Duration,
}

/// State rotated by the background task.
pub(crate) trait Rotating: Send + Sync + 'static {
    /// Current intervals. Read again after every rotation and reschedule.
    fn intervals(&self) -> Intervals;
    fn rotate_window(&self);
    fn reset_cache(&self);
    fn reset_budget(&self);
}

#[derive(Debug)]
enum Message {
    Reschedule,
    Shutdown(Sender<bool>),
}

/// Handle of the rotation thread. Dropping it shuts the thread down.
#[derive(Debug)]
pub(crate) struct RotationTask {
    sender: Mutex<Sender<Message>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    is_shutdown: AtomicBool,
}

impl RotationTask {
    pub(crate) fn spawn<R: Rotating>(target: Arc<R>) -> SamplerResult<Self> {
        let (sender, receiver) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("OpenTelemetry.AdaptiveSampler.Rotation".to_string())
            .spawn(move || run(target, receiver))?;
        Ok(RotationTask {
            sender: Mutex::new(sender),
            handle: Mutex::new(Some(handle)),
            is_shutdown: AtomicBool::new(false),
        })
    }

    /// Makes the thread pick up changed intervals now rather than at its next
    /// wake-up.
    pub(crate) fn reschedule(&self) {
        if let Ok(sender) = self.sender.lock() {
            let _ = sender.send(Message::Reschedule);
        }
    }

    pub(crate) fn shutdown(&self) -> SamplerResult<()> {
        if self.is_shutdown.swap(true, Ordering::AcqRel) {
            return Err(SamplerError::AlreadyShutdown);
        }

        let (response_tx, response_rx) = mpsc::channel();
        self.sender
            .lock()?
            .send(Message::Shutdown(response_tx))
            .map_err(|e| SamplerError::ShutdownFailed(e.to_string()))?;

        match response_rx.recv_timeout(SHUTDOWN_TIMEOUT) {
            Ok(_) => {
                if let Some(handle) = self.handle.lock()?.take() {
                    let _ = handle.join();
                }
                Ok(())
            }
            Err(err) => {
                otel_error!(
                    name: "AdaptiveSampler.RotationShutdownFailed",
                    error = format!("{:?}", err)
                );
                Err(SamplerError::ShutdownFailed(err.to_string()))
            }
        }
    }
}

impl Drop for RotationTask {
    fn drop(&mut self) {
        if !self.is_shutdown.load(Ordering::Acquire) {
            let _ = self.shutdown();
        }
    }
}

fn run<R: Rotating>(target: Arc<R>, receiver: Receiver<Message>) {
    otel_info!(name: "AdaptiveSampler.RotationThreadStarted");
    let start = Instant::now();
    let mut last_window = start;
    let mut last_cache = start;
    let mut last_budget = start;

    loop {
        let intervals = target.intervals();
        let window_due = last_window.checked_add(intervals.window);
        let cache_due = last_cache.checked_add(intervals.cache_lifetime);
        let budget_due = last_budget.checked_add(intervals.budget);

        let next = [window_due, cache_due, budget_due]
            .into_iter()
            .flatten()
            .min();
        let message = match next {
            Some(next) => {
                receiver.recv_timeout(next.saturating_duration_since(Instant::now()))
            }
            None => receiver.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match message {
            Ok(Message::Reschedule) => {
                otel_debug!(name: "AdaptiveSampler.RotationRescheduled");
            }
            Ok(Message::Shutdown(response)) => {
                let _ = response.send(true);
                break;
            }
            Err(RecvTimeoutError::Timeout) => {
                let now = Instant::now();
                if window_due.is_some_and(|due| now >= due) {
                    target.rotate_window();
                    last_window = now;
                    otel_debug!(name: "AdaptiveSampler.MinCountWindowRotated");
                }
                if cache_due.is_some_and(|due| now >= due) {
                    target.reset_cache();
                    last_cache = now;
                    otel_debug!(name: "AdaptiveSampler.WorkflowCacheReset");
                }
                if budget_due.is_some_and(|due| now >= due) {
                    target.reset_budget();
                    last_budget = now;
                }
            }
            // every handle is gone
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    otel_info!(name: "AdaptiveSampler.RotationThreadStopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug)]
    struct Counting {
        intervals: Mutex<Intervals>,
        windows: AtomicUsize,
        caches: AtomicUsize,
        budgets: AtomicUsize,
    }

    impl Counting {
        fn new(intervals: Intervals) -> Arc<Self> {
            Arc::new(Counting {
                intervals: Mutex::new(intervals),
                windows: AtomicUsize::new(0),
                caches: AtomicUsize::new(0),
                budgets: AtomicUsize::new(0),
            })
        }
    }

    impl Rotating for Counting {
        fn intervals(&self) -> Intervals {
            *self.intervals.lock().unwrap()
        }
        fn rotate_window(&self) {
            self.windows.fetch_add(1, Ordering::SeqCst);
        }
        fn reset_cache(&self) {
            self.caches.fetch_add(1, Ordering::SeqCst);
        }
        fn reset_budget(&self) {
            self.budgets.fetch_add(1, Ordering::SeqCst);
        }
    }

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn rotates_on_schedule_until_shutdown() {
        let target = Counting::new(Intervals {
            window: Duration::from_millis(10),
            cache_lifetime: HOUR,
            budget: HOUR,
        });
        let task = RotationTask::spawn(Arc::clone(&target)).unwrap();
        thread::sleep(Duration::from_millis(200));
        task.shutdown().unwrap();

        let windows = target.windows.load(Ordering::SeqCst);
        assert!(windows >= 2, "rotated {windows} times");
        assert_eq!(target.caches.load(Ordering::SeqCst), 0);
        assert_eq!(target.budgets.load(Ordering::SeqCst), 0);

        thread::sleep(Duration::from_millis(50));
        assert_eq!(target.windows.load(Ordering::SeqCst), windows);
    }

    #[test]
    fn second_shutdown_fails() {
        let target = Counting::new(Intervals {
            window: HOUR,
            cache_lifetime: HOUR,
            budget: HOUR,
        });
        let task = RotationTask::spawn(target).unwrap();
        assert!(task.shutdown().is_ok());
        assert!(matches!(task.shutdown(), Err(SamplerError::AlreadyShutdown)));
    }

    #[test]
    fn reschedule_applies_new_intervals() {
        let target = Counting::new(Intervals {
            window: HOUR,
            cache_lifetime: HOUR,
            budget: HOUR,
        });
        let task = RotationTask::spawn(Arc::clone(&target)).unwrap();
        target.intervals.lock().unwrap().cache_lifetime = Duration::from_millis(10);
        task.reschedule();
        thread::sleep(Duration::from_millis(200));
        drop(task);

        assert!(target.caches.load(Ordering::SeqCst) >= 1);
        assert_eq!(target.windows.load(Ordering::SeqCst), 0);
    }
}
