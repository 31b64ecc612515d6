//! Thread hopping between the UI thread and the JS thread.
//!
//! Registries never spawn threads. Anything that must run on a specific
//! thread is posted through a [`Scheduler`] provided by the embedder.
//!
//! [`QueueScheduler`] is the stock implementation: jobs are queued on
//! channels and drained by the platform from the right thread via
//! [`QueueScheduler::trigger_ui`] / [`QueueScheduler::trigger_js`]. An
//! optional wake hook lets the platform know a drain is needed (post a
//! runnable to the main looper, dispatch to the main queue, ...).

use crossbeam_channel::{Receiver, Sender, unbounded};
use std::panic::{AssertUnwindSafe, catch_unwind};
use tracing::{error, trace};

use crate::error::ScriptError;

/// A unit of work posted to a thread.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Wake hook invoked after a job is posted.
pub type WakeHook = Box<dyn Fn() + Send + Sync + 'static>;

/// Posts work to the UI thread or the JS thread. Fire-and-forget.
pub trait Scheduler: Send + Sync {
    /// Run `job` on the UI thread.
    fn schedule_on_ui(&self, job: Job);

    /// Run `job` on the JS thread.
    fn schedule_on_js(&self, job: Job);
}

/// Channel-backed scheduler drained explicitly by the platform.
pub struct QueueScheduler {
    ui_tx: Sender<Job>,
    ui_rx: Receiver<Job>,
    js_tx: Sender<Job>,
    js_rx: Receiver<Job>,
    ui_wake: Option<WakeHook>,
    js_wake: Option<WakeHook>,
}

impl QueueScheduler {
    /// Create a scheduler with empty queues and no wake hooks.
    pub fn new() -> Self {
        let (ui_tx, ui_rx) = unbounded();
        let (js_tx, js_rx) = unbounded();
        Self {
            ui_tx,
            ui_rx,
            js_tx,
            js_rx,
            ui_wake: None,
            js_wake: None,
        }
    }

    /// Call `hook` every time a UI job is posted.
    pub fn with_ui_wake<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.ui_wake = Some(Box::new(hook));
        self
    }

    /// Call `hook` every time a JS job is posted.
    pub fn with_js_wake<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.js_wake = Some(Box::new(hook));
        self
    }

    /// Run queued UI jobs on the calling thread until the queue is empty,
    /// including jobs posted while draining. Returns the number of jobs run.
    pub fn trigger_ui(&self) -> usize {
        drain(&self.ui_rx, "ui")
    }

    /// Run queued JS jobs on the calling thread. Returns the number of jobs run.
    pub fn trigger_js(&self) -> usize {
        drain(&self.js_rx, "js")
    }

    /// Jobs waiting for the UI thread.
    pub fn pending_ui(&self) -> usize {
        self.ui_rx.len()
    }

    /// Jobs waiting for the JS thread.
    pub fn pending_js(&self) -> usize {
        self.js_rx.len()
    }
}

impl Default for QueueScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for QueueScheduler {
    fn schedule_on_ui(&self, job: Job) {
        // both ends live in self, so the channel cannot be disconnected
        let _ = self.ui_tx.send(job);
        if let Some(wake) = &self.ui_wake {
            wake();
        }
    }

    fn schedule_on_js(&self, job: Job) {
        let _ = self.js_tx.send(job);
        if let Some(wake) = &self.js_wake {
            wake();
        }
    }
}

impl std::fmt::Debug for QueueScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueScheduler")
            .field("pending_ui", &self.pending_ui())
            .field("pending_js", &self.pending_js())
            .finish()
    }
}

fn drain(rx: &Receiver<Job>, thread: &'static str) -> usize {
    let mut ran = 0;
    while let Ok(job) = rx.try_recv() {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(job)) {
            let err = ScriptError::from_panic(panic.as_ref());
            error!(thread, error = %err, "Scheduled job panicked");
        }
        ran += 1;
    }
    if ran > 0 {
        trace!(thread, ran, "Drained scheduled jobs");
    }
    ran
}

/// Runs every job immediately on the posting thread.
///
/// For embedders (and tests) where the caller is already on the right thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineScheduler;

impl Scheduler for InlineScheduler {
    fn schedule_on_ui(&self, job: Job) {
        job();
    }

    fn schedule_on_js(&self, job: Job) {
        job();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_jobs_wait_for_trigger() {
        let scheduler = QueueScheduler::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let log = log.clone();
            scheduler.schedule_on_ui(Box::new(move || log.lock().push(("ui", i))));
        }
        let js_log = log.clone();
        scheduler.schedule_on_js(Box::new(move || js_log.lock().push(("js", 0))));

        assert!(log.lock().is_empty());
        assert_eq!(scheduler.pending_ui(), 3);

        assert_eq!(scheduler.trigger_ui(), 3);
        assert_eq!(*log.lock(), vec![("ui", 0), ("ui", 1), ("ui", 2)]);

        assert_eq!(scheduler.trigger_js(), 1);
        assert_eq!(log.lock().last(), Some(&("js", 0)));
    }

    #[test]
    fn test_wake_hook_called_per_post() {
        let wakes = Arc::new(AtomicUsize::new(0));
        let wakes_in = wakes.clone();
        let scheduler = QueueScheduler::new().with_ui_wake(move || {
            wakes_in.fetch_add(1, Ordering::SeqCst);
        });

        scheduler.schedule_on_ui(Box::new(|| {}));
        scheduler.schedule_on_ui(Box::new(|| {}));
        scheduler.schedule_on_js(Box::new(|| {}));
        assert_eq!(wakes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_panicking_job_does_not_stop_drain() {
        let scheduler = QueueScheduler::new();
        let ran = Arc::new(AtomicUsize::new(0));
        scheduler.schedule_on_ui(Box::new(|| panic!("bad job")));
        let ran_in = ran.clone();
        scheduler.schedule_on_ui(Box::new(move || {
            ran_in.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(scheduler.trigger_ui(), 2);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_jobs_posted_from_other_threads() {
        let scheduler = Arc::new(QueueScheduler::new());
        let ran = Arc::new(AtomicUsize::new(0));

        let posters: Vec<_> = (0..4)
            .map(|_| {
                let scheduler = scheduler.clone();
                let ran = ran.clone();
                thread::spawn(move || {
                    for _ in 0..25 {
                        let ran = ran.clone();
                        scheduler.schedule_on_ui(Box::new(move || {
                            ran.fetch_add(1, Ordering::SeqCst);
                        }));
                    }
                })
            })
            .collect();
        for poster in posters {
            poster.join().unwrap();
        }

        assert_eq!(scheduler.trigger_ui(), 100);
        assert_eq!(ran.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_inline_scheduler_runs_immediately() {
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_in = ran.clone();
        InlineScheduler.schedule_on_ui(Box::new(move || {
            ran_in.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
