use std::cell::{Cell, UnsafeCell};
use std::future::Future;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Condvar, Mutex};
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};
use std::time::Duration;

use log::{debug, warn};

use limpet_timers::{SocketPairInterrupt, Timers};

use crate::multiplexer::{Interest, Multiplexer, SocketDialog};
use crate::scope::Scope;
use crate::socket_io;

// Per-wake drain capacity of the signal ISR; enough to coalesce a burst
// of interrupt bytes into one routine invocation.
//
const ISR_DRAIN_LEN: usize = 1024;

/// The context signals.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Signal {
    Terminate = 0,
    User1 = 1,
}

impl Signal {
    pub const ALL: [Signal; 2] = [Signal::Terminate, Signal::User1];

    pub(crate) fn bit(self) -> u64 {
        1 << self as u32
    }
}

/// The context lifecycle states.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[repr(u8)]
pub enum ContextStates {
    Pending = 0,
    Started = 1,
    Stopped = 2,
}

/// An observable context state: lock-free loads plus condvar wait/notify.
pub struct ContextState {
    value: AtomicU8,
    lock: Mutex<()>,
    cond: Condvar,
}

impl ContextState {
    fn new() -> Self {
        ContextState {
            value: AtomicU8::new(ContextStates::Pending as u8),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    pub fn load(&self) -> ContextStates {
        match self.value.load(Ordering::Acquire) {
            0 => ContextStates::Pending,
            1 => ContextStates::Started,
            _ => ContextStates::Stopped,
        }
    }

    pub fn store_notify(&self, state: ContextStates) {
        let _guard = self.lock.lock().unwrap();
        self.value.store(state as u8, Ordering::Release);
        self.cond.notify_all();
    }

    pub fn wait_while(&self, pred: impl Fn(ContextStates) -> bool) {
        let mut guard = self.lock.lock().unwrap();
        while pred(self.load()) {
            guard = self.cond.wait(guard).unwrap();
        }
    }
}

// How a pending task should be rescheduled, reported through the context
// by the future that suspended it.
//
#[derive(Clone, Copy, Default)]
pub(crate) enum ScheduleReason {
    #[default]
    None,
    IoWait {
        key: usize,
        interest: Interest,
    },
}

/// An asynchronous execution context: the per-thread owner of a reactor,
/// scope, timer set and signal mask.
pub struct AsyncContext {
    /// The event loop timers.
    pub timers: Timers<SocketPairInterrupt>,
    /// The asynchronous scope.
    pub scope: Scope,
    /// The readiness multiplexer.
    pub poller: Multiplexer,
    /// The active signal mask.
    pub sigmask: AtomicU64,
    /// The context lifecycle state.
    pub state: ContextState,

    schedule_reason: Cell<ScheduleReason>,
}

impl AsyncContext {
    pub fn new() -> io::Result<Self> {
        Ok(AsyncContext {
            timers: Timers::new(),
            scope: Scope::new(),
            poller: Multiplexer::new()?,
            sigmask: AtomicU64::new(0),
            state: ContextState::new(),
            schedule_reason: Cell::new(ScheduleReason::None),
        })
    }

    /// Sets the signal bit, then interrupts the context. Safe from any
    /// thread.
    pub fn signal(&self, signal: Signal) {
        self.sigmask.fetch_or(signal.bit(), Ordering::Release);
        self.interrupt();
    }

    /// Fires the timer set's interrupt source.
    pub fn interrupt(&self) {
        self.timers.interrupt();
    }

    /// Spawns a task from another thread and wakes the reactor.
    pub fn spawn_external<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.scope.spawn_external(future);
        self.poller.notify();
        self.interrupt();
    }

    /// Installs a self-restarting interrupt service routine on `dialog`.
    ///
    /// `routine` runs once immediately; if it returns `false` the ISR is
    /// not armed. Otherwise it runs again on every readiness notification
    /// of the dialog until it returns `false` or the receive fails.
    pub fn isr<F>(&self, dialog: SocketDialog, mut routine: F)
    where
        F: FnMut() -> bool + 'static,
    {
        if !routine() {
            return;
        }

        self.scope.spawn(async move {
            // The drain buffer belongs to this ISR instance; contexts
            // running in parallel never share it.
            //
            let mut drain = [0u8; ISR_DRAIN_LEN];
            loop {
                match socket_io::recv(&dialog, &mut drain).await {
                    Ok(_) => {
                        if !routine() {
                            return;
                        }
                    }
                    Err(_) => return,
                }
            }
        });
    }

    /// Runs the reactor loop until no events are processed and the scope
    /// is empty.
    pub fn run(&self) -> io::Result<()> {
        debug!("starting context loop");

        while self.wait_for(to_millis(self.timers.resolve()))? > 0 || !self.scope.is_empty() {}

        debug!("context loop drained");
        Ok(())
    }

    /// One reactor iteration: drive ready tasks, poll for readiness with
    /// the given timeout (`None` blocks until an event), dispatch, and
    /// drive again. Returns tasks run plus events dispatched.
    pub fn wait_for(&self, timeout: Option<Duration>) -> io::Result<usize> {
        self.set_local_instance();
        let result = self.wait_for_(timeout);
        Self::reset_local_instance();
        result
    }

    fn wait_for_(&self, timeout: Option<Duration>) -> io::Result<usize> {
        let mut processed = self.run_ready();

        // An unbounded wait over an empty scope would sleep forever.
        //
        let timeout = if timeout.is_none() && self.scope.is_empty() {
            Some(Duration::ZERO)
        } else {
            timeout
        };

        let mut woken = Vec::new();
        let count = self.poller.wait(timeout, &mut woken)?;
        for task in woken {
            self.scope.push_active(task);
        }

        processed += self.run_ready();
        Ok(processed + count)
    }

    // Drives the ready queue to exhaustion, parking tasks that suspend on
    // socket readiness. Returns the number of task polls.
    //
    fn run_ready(&self) -> usize {
        self.scope.drain_external();

        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        let mut ran = 0;
        while let Some(mut task) = self.scope.pop_active() {
            ran += 1;
            self.schedule_reason.set(ScheduleReason::None);

            match catch_unwind(AssertUnwindSafe(|| task.as_mut().poll(&mut cx))) {
                Ok(Poll::Ready(())) => self.scope.finalize_task(),
                Ok(Poll::Pending) => match self.schedule_reason.take() {
                    ScheduleReason::IoWait { key, interest } => {
                        if let Err(task) = self.poller.park(key, interest, task) {
                            // Arming failed; rerun so the operation
                            // observes the recorded error.
                            //
                            self.scope.push_active(task);
                        }
                    }
                    ScheduleReason::None => {
                        // Nothing would ever requeue this task.
                        //
                        warn!("task suspended outside a framework suspension point; finalizing it");
                        self.scope.finalize_task();
                    }
                },
                Err(_) => {
                    warn!("task panicked; finalizing it as unrecoverable");
                    self.scope.finalize_task();
                }
            }
        }

        ran
    }

    pub(crate) fn set_schedule_reason(&self, reason: ScheduleReason) {
        self.schedule_reason.set(reason);
    }

    pub(crate) fn set_local_instance(&self) {
        CONTEXT_INSTANCE.with(|cell| unsafe {
            *cell.get() = self;
        });
    }

    pub(crate) fn reset_local_instance() {
        CONTEXT_INSTANCE.with(|cell| unsafe {
            *cell.get() = ptr::null();
        });
    }

    pub fn has_local_instance() -> bool {
        !CONTEXT_INSTANCE.with(|cell| unsafe { *cell.get() }).is_null()
    }

    /// The context currently driven on this thread.
    ///
    /// # Panics
    ///
    /// If no context is being driven on this thread.
    pub fn local_instance<'a>() -> &'a AsyncContext {
        let context = CONTEXT_INSTANCE.with(|cell| unsafe { *cell.get() });
        assert!(!context.is_null(), "no context is running on this thread");

        unsafe { &*context }
    }
}

// The context instance driven on this thread, set around each wait_for
// pass and on a context thread's worker for the service setup phase.
//
thread_local! {
    static CONTEXT_INSTANCE: UnsafeCell<*const AsyncContext> =
        const { UnsafeCell::new(ptr::null()) };
}

/// Truncates a timer wait hint to whole milliseconds for the multiplexer.
/// `None` means there is no armed timer and the poll may block freely.
pub fn to_millis(hint: Option<Duration>) -> Option<Duration> {
    hint.map(|duration| Duration::from_millis(duration.as_millis() as u64))
}

// Parked tasks are requeued through the schedule reason channel, so wakers
// have nothing to do.
//
fn noop_waker() -> Waker {
    const VTABLE: RawWakerVTable = RawWakerVTable::new(
        |_| RawWaker::new(ptr::null(), &VTABLE),
        |_| {},
        |_| {},
        |_| {},
    );
    unsafe { Waker::from_raw(RawWaker::new(ptr::null(), &VTABLE)) }
}
