//! The two privileged execution contexts commits hand work to.
//!
//! Tile and entity mutation runs on the side-effect worker; dirty marking and
//! finalizers run on the structural worker. Each context is a single named
//! thread draining a bounded `crossbeam-channel` queue, so jobs on one context
//! run strictly in submission order.

use std::any::Any;
use std::cell::Cell;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, bounded};

use crate::error::SchedulerError;

/// A unit of work for an execution context.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Which worker a job runs on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExecutionContext {
    /// Tile replacement, entity spawn and despawn.
    SideEffects,
    /// Dirty marking and finalizers.
    Structural,
}

impl ExecutionContext {
    /// Worker thread name.
    pub fn thread_name(self) -> &'static str {
        match self {
            Self::SideEffects => "strata-side-effects",
            Self::Structural => "strata-structural",
        }
    }
}

thread_local! {
    /// Context whose worker is the current thread, if any.
    static CURRENT: Cell<Option<ExecutionContext>> = const { Cell::new(None) };
}

/// Cloneable submit handle for one context, usable from inside another job.
#[derive(Clone)]
pub(crate) struct ContextSender {
    context: ExecutionContext,
    sender: Sender<Job>,
    closed: Arc<AtomicBool>,
}

impl ContextSender {
    /// Queues `job`, blocking while the queue is full. Hands the job back if
    /// the context is shut down.
    ///
    /// A worker only ever blocks on the queue of a later context. Sends from
    /// the structural worker, or from any worker into its own queue, hand the
    /// job back when the queue is full so the caller can run it inline.
    pub(crate) fn send(&self, job: Job) -> Result<(), Job> {
        if self.closed.load(Ordering::Acquire) {
            return Err(job);
        }
        let may_block = match CURRENT.with(Cell::get) {
            None => true,
            Some(current) => {
                current == ExecutionContext::SideEffects
                    && self.context == ExecutionContext::Structural
            }
        };
        if may_block {
            self.sender.send(job).map_err(|err| err.into_inner())
        } else {
            self.sender.try_send(job).map_err(|err| err.into_inner())
        }
    }

    pub(crate) fn context(&self) -> ExecutionContext {
        self.context
    }
}

struct Worker {
    sender: Option<Sender<Job>>,
    handle: Option<JoinHandle<()>>,
}

/// Owns the side-effect and structural workers.
pub struct EditScheduler {
    side_effects: Worker,
    structural: Worker,
    closed: Arc<AtomicBool>,
    panics: Arc<AtomicU64>,
}

impl EditScheduler {
    /// Spawns both workers with the given queue capacities.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::Spawn`] if a thread cannot be started.
    pub fn new(side_effect_queue: usize, structural_queue: usize) -> Result<Self, SchedulerError> {
        let panics = Arc::new(AtomicU64::new(0));
        let side_effects = spawn_worker(
            ExecutionContext::SideEffects,
            side_effect_queue.max(1),
            Arc::clone(&panics),
        )?;
        let structural = spawn_worker(
            ExecutionContext::Structural,
            structural_queue.max(1),
            Arc::clone(&panics),
        )?;
        tracing::debug!(
            side_effect_queue,
            structural_queue,
            "edit scheduler started"
        );
        Ok(Self {
            side_effects,
            structural,
            closed: Arc::new(AtomicBool::new(false)),
            panics,
        })
    }

    /// Queues `job` on `context`.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::Closed`] after [`EditScheduler::shutdown`].
    /// [`SchedulerError::Full`] when called from a worker whose send would
    /// otherwise block on a queue that may be waiting on it.
    pub fn submit<F>(&self, context: ExecutionContext, job: F) -> Result<(), SchedulerError>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self
            .sender(context)
            .ok_or(SchedulerError::Closed(context.thread_name()))?;
        sender.send(Box::new(job)).map_err(|_| {
            if self.is_closed() {
                SchedulerError::Closed(context.thread_name())
            } else {
                SchedulerError::Full(context.thread_name())
            }
        })
    }

    /// Submit handle for `context`, or `None` once shut down.
    pub(crate) fn sender(&self, context: ExecutionContext) -> Option<ContextSender> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        let sender = self.worker(context).sender.as_ref()?;
        Some(ContextSender {
            context,
            sender: sender.clone(),
            closed: Arc::clone(&self.closed),
        })
    }

    /// Jobs waiting in `context`'s queue.
    pub fn pending(&self, context: ExecutionContext) -> usize {
        self.worker(context)
            .sender
            .as_ref()
            .map_or(0, |sender| sender.len())
    }

    /// Jobs that panicked so far, across both contexts.
    pub fn panic_count(&self) -> u64 {
        self.panics.load(Ordering::Relaxed)
    }

    /// Returns `true` once [`EditScheduler::shutdown`] ran.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stops accepting jobs, drains both queues and joins the workers.
    ///
    /// The side-effect worker is joined first so its jobs can still reach the
    /// structural queue while draining.
    pub fn shutdown(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        join_worker(&mut self.side_effects);
        join_worker(&mut self.structural);
        tracing::debug!("edit scheduler stopped");
    }

    fn worker(&self, context: ExecutionContext) -> &Worker {
        match context {
            ExecutionContext::SideEffects => &self.side_effects,
            ExecutionContext::Structural => &self.structural,
        }
    }
}

impl Drop for EditScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_worker(
    context: ExecutionContext,
    capacity: usize,
    panics: Arc<AtomicU64>,
) -> Result<Worker, SchedulerError> {
    let (sender, receiver) = bounded::<Job>(capacity);
    let name = context.thread_name();
    let handle = std::thread::Builder::new()
        .name(name.into())
        .spawn(move || {
            CURRENT.with(|current| current.set(Some(context)));
            run_worker(name, receiver, panics)
        })
        .map_err(|source| SchedulerError::Spawn { name, source })?;
    Ok(Worker {
        sender: Some(sender),
        handle: Some(handle),
    })
}

fn run_worker(name: &'static str, receiver: Receiver<Job>, panics: Arc<AtomicU64>) {
    while let Ok(job) = receiver.recv() {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
            panics.fetch_add(1, Ordering::Relaxed);
            tracing::error!(worker = name, "job panicked: {}", panic_message(payload.as_ref()));
        }
    }
}

fn join_worker(worker: &mut Worker) {
    // Dropping the sender lets the worker drain and exit.
    worker.sender.take();
    if let Some(handle) = worker.handle.take() {
        if handle.thread().id() == std::thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            tracing::error!("edit worker exited abnormally");
        }
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[test]
    fn test_jobs_run_in_order_on_named_thread() {
        let scheduler = EditScheduler::new(16, 16).unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        for i in 0..10 {
            let tx = tx.clone();
            scheduler
                .submit(ExecutionContext::SideEffects, move || {
                    let name = std::thread::current().name().map(str::to_string);
                    tx.send((i, name)).unwrap();
                })
                .unwrap();
        }
        for expected in 0..10 {
            let (i, name) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(i, expected);
            assert_eq!(name.as_deref(), Some("strata-side-effects"));
        }
    }

    #[test]
    fn test_panicking_job_does_not_kill_worker() {
        let scheduler = EditScheduler::new(4, 4).unwrap();
        scheduler
            .submit(ExecutionContext::Structural, || panic!("boom"))
            .unwrap();
        let (tx, rx) = crossbeam_channel::bounded(1);
        scheduler
            .submit(ExecutionContext::Structural, move || tx.send(()).unwrap())
            .unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(scheduler.panic_count(), 1);
    }

    #[test]
    fn test_submit_after_shutdown_rejected() {
        let mut scheduler = EditScheduler::new(4, 4).unwrap();
        scheduler.shutdown();
        assert!(scheduler.is_closed());
        let result = scheduler.submit(ExecutionContext::SideEffects, || {});
        assert!(matches!(result, Err(SchedulerError::Closed("strata-side-effects"))));
        assert!(scheduler.sender(ExecutionContext::Structural).is_none());
    }

    #[test]
    fn test_shutdown_drains_queued_jobs() {
        let ran = Arc::new(Mutex::new(Vec::new()));
        let mut scheduler = EditScheduler::new(64, 64).unwrap();
        for i in 0..32 {
            let ran = Arc::clone(&ran);
            scheduler
                .submit(ExecutionContext::SideEffects, move || ran.lock().unwrap().push(i))
                .unwrap();
        }
        scheduler.shutdown();
        assert_eq!(ran.lock().unwrap().len(), 32);
    }

    #[test]
    fn test_cross_context_handoff() {
        let scheduler = EditScheduler::new(4, 4).unwrap();
        let structural = scheduler.sender(ExecutionContext::Structural).unwrap();
        assert_eq!(structural.context(), ExecutionContext::Structural);
        let (tx, rx) = crossbeam_channel::bounded(1);
        scheduler
            .submit(ExecutionContext::SideEffects, move || {
                let job: Job = Box::new(move || {
                    let name = std::thread::current().name().map(str::to_string);
                    tx.send(name).unwrap();
                });
                assert!(structural.send(job).is_ok());
            })
            .unwrap();
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("strata-structural"));
    }

    #[test]
    fn test_worker_never_blocks_on_its_own_full_queue() {
        let scheduler = EditScheduler::new(1, 1).unwrap();
        let structural = scheduler.sender(ExecutionContext::Structural).unwrap();
        let (tx, rx) = crossbeam_channel::bounded(1);
        scheduler
            .submit(ExecutionContext::Structural, move || {
                // This job was dequeued, so exactly one slot is free.
                let first = structural.send(Box::new(|| {})).is_ok();
                let second = structural.send(Box::new(|| {})).is_ok();
                tx.send((first, second)).unwrap();
            })
            .unwrap();
        let (first, second) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(first);
        assert!(!second);
    }

    #[test]
    fn test_panic_message_formats() {
        let payload: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(payload.as_ref()), "static");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
        let payload: Box<dyn Any + Send> = Box::new(7u32);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }
}
