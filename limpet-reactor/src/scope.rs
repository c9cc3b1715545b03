use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::queue::SegQueue;

// Task runtimes are driven by the owning context's thread only.
//
pub(crate) type TaskRuntime = Pin<Box<dyn Future<Output = ()>>>;

type ExternalTask = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A task nursery.
///
/// Tasks spawned into the scope are driven by the owning context's
/// reactor loop. The live count includes tasks parked on socket
/// readiness, so the scope is empty exactly when no spawned work remains.
/// The scope also carries the context's cooperative stop token.
pub struct Scope {
    active: RefCell<VecDeque<TaskRuntime>>,
    // Tasks handed over from other threads; drained by the reactor loop.
    //
    external: SegQueue<ExternalTask>,
    live: AtomicUsize,
    stop: Arc<AtomicBool>,
}

/// A cloneable handle observing the scope's stop request.
#[derive(Clone)]
pub struct StopToken {
    stop: Arc<AtomicBool>,
}

impl StopToken {
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

impl Scope {
    pub(crate) fn new() -> Self {
        Scope {
            active: RefCell::new(VecDeque::new()),
            external: SegQueue::new(),
            live: AtomicUsize::new(0),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawns a task. Only the thread driving the context may call this.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + 'static,
    {
        self.live.fetch_add(1, Ordering::AcqRel);
        self.active.borrow_mut().push_back(Box::pin(future));
    }

    // The cross-thread spawn entry; the context wraps this with a wake.
    //
    pub(crate) fn spawn_external<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.live.fetch_add(1, Ordering::AcqRel);
        self.external.push(Box::pin(future));
    }

    /// True when no spawned task remains. This is the scope's on-empty
    /// completion signal, observed directly.
    pub fn is_empty(&self) -> bool {
        self.live.load(Ordering::Acquire) == 0
    }

    pub fn stop_token(&self) -> StopToken {
        StopToken {
            stop: Arc::clone(&self.stop),
        }
    }

    /// Asks cooperative operations to unwind. Advisory: in-flight parked
    /// operations are cancelled by shutting down their socket instead.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub(crate) fn pop_active(&self) -> Option<TaskRuntime> {
        self.active.borrow_mut().pop_front()
    }

    pub(crate) fn push_active(&self, task: TaskRuntime) {
        self.active.borrow_mut().push_back(task);
    }

    pub(crate) fn drain_external(&self) {
        while let Some(task) = self.external.pop() {
            let task: TaskRuntime = task;
            self.active.borrow_mut().push_back(task);
        }
    }

    // A task leaves the scope when it completes, panics, or can never be
    // requeued.
    //
    pub(crate) fn finalize_task(&self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}
