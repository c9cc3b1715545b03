use std::io;
use std::marker::PhantomData;
use std::ops::Deref;
use std::os::fd::{AsRawFd, IntoRawFd};
use std::rc::Rc;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::debug;
use socket2::{Domain, Socket, Type};

use limpet_timers::INVALID_SOCKET;

use crate::context::{AsyncContext, ContextStates, Signal};
use crate::service::Service;

// Timer handlers must be Send to live in the shared timer set, but the
// terminate escalation handler only ever runs on the worker thread that
// owns the service: resolve is reactor-only and the worker keeps the
// service alive for the whole reactor run.
//
struct WorkerRef<T> {
    value: *const T,
}

unsafe impl<T> Send for WorkerRef<T> {}

impl<T> WorkerRef<T> {
    fn new(value: &T) -> Self {
        WorkerRef { value }
    }

    fn get(&self) -> &T {
        unsafe { &*self.value }
    }
}

/// Hosts one service `S` on a dedicated worker thread with its own
/// asynchronous context. Dereferences to the context, whose `signal`,
/// `timers` and `state` form the cross-thread surface.
pub struct ContextThread<S: Service> {
    ctx: Box<AsyncContext>,
    worker: Mutex<Option<JoinHandle<()>>>,
    // Guards the one-shot start invariant.
    //
    started: Mutex<bool>,
    _service: PhantomData<fn() -> S>,
}

impl<S: Service> ContextThread<S> {
    pub fn new() -> io::Result<Self> {
        Ok(ContextThread {
            ctx: Box::new(AsyncContext::new()?),
            worker: Mutex::new(None),
            started: Mutex::new(false),
            _service: PhantomData,
        })
    }

    /// Starts the worker thread hosting the service built by
    /// `make_service`, which runs on the worker: services are
    /// single-threaded objects and never cross threads.
    ///
    /// Blocks until the context leaves the pending state and propagates a
    /// start-up error reported by the service. Must be called at most
    /// once; further calls fail with `InvalidInput`.
    pub fn start<F>(&self, make_service: F) -> io::Result<()>
    where
        F: FnOnce() -> S + Send + 'static,
    {
        let mut started = self.started.lock().unwrap();
        if *started {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "context thread already started",
            ));
        }

        let (read_end, write_end) = Socket::pair(Domain::UNIX, Type::STREAM, None)?;
        read_end.set_nonblocking(true)?;
        write_end.set_nonblocking(true)?;
        self.ctx
            .timers
            .source()
            .install(read_end.as_raw_fd(), write_end.into_raw_fd());

        let ctx_ptr = Arc::new(AtomicPtr::new(
            &*self.ctx as *const AsyncContext as *mut AsyncContext,
        ));
        let start_error = Arc::new(Mutex::new(None::<io::Error>));

        let worker_error = Arc::clone(&start_error);
        let handle = thread::Builder::new()
            .name("limpet-context".into())
            .spawn(move || {
                // SAFETY: the owning ContextThread joins this thread
                // before dropping the context, and cross-thread entry
                // points touch only atomics, the timer mutex and the
                // interrupt socket.
                //
                let ctx = unsafe { &*ctx_ptr.load(Ordering::Acquire) };

                ctx.set_local_instance();
                run_worker(ctx, make_service, &worker_error, read_end);
                AsyncContext::reset_local_instance();
            })?;

        *self.worker.lock().unwrap() = Some(handle);
        *started = true;
        drop(started);

        self.ctx
            .state
            .wait_while(|state| state == ContextStates::Pending);

        if let Some(error) = start_error.lock().unwrap().take() {
            return Err(error);
        }
        Ok(())
    }
}

fn run_worker<S: Service>(
    ctx: &AsyncContext,
    make_service: impl FnOnce() -> S,
    start_error: &Mutex<Option<io::Error>>,
    read_end: Socket,
) {
    let service = Rc::new(make_service());

    // Without the signal ISR a started service could never be told to
    // terminate, so a failed registration skips the service start and
    // falls through to an immediate drain.
    //
    let signals_armed = match ctx.poller.emplace(read_end) {
        Ok(dialog) => {
            let routine_service = Rc::clone(&service);
            let token = ctx.scope.stop_token();

            ctx.isr(dialog, move || {
                let ctx = AsyncContext::local_instance();
                let pending = ctx.sigmask.swap(0, Ordering::AcqRel);

                for signal in Signal::ALL {
                    if pending & signal.bit() != 0 {
                        routine_service.signal_handler(signal);
                    }
                }

                if pending & Signal::Terminate.bit() != 0 {
                    ctx.scope.request_stop();

                    // Re-deliver terminate once a second until the drain
                    // completes; the service may be slow to observe the
                    // stop token.
                    //
                    let escalate = WorkerRef::new(&*routine_service);
                    ctx.timers
                        .add(Duration::from_secs(1), Duration::from_secs(1), move |_| {
                            escalate.get().signal_handler(Signal::Terminate);
                        });
                }

                !token.stop_requested()
            });
            true
        }
        Err(error) => {
            record_error(start_error, error);
            false
        }
    };

    if signals_armed {
        match Rc::clone(&service).start(ctx) {
            Err(error) => {
                record_error(start_error, error);
                ctx.signal(Signal::Terminate);
            }
            Ok(()) => {
                ctx.state.store_notify(ContextStates::Started);
            }
        }
    }

    if let Err(error) = ctx.run() {
        debug!("context loop ended with {error}");
    }

    drop(service);

    // The interrupt write end is closed exactly once.
    //
    let write_end = ctx.timers.source().take_write();
    if write_end != INVALID_SOCKET {
        let _ = unsafe { libc::close(write_end) };
    }

    ctx.state.store_notify(ContextStates::Stopped);
}

fn record_error(slot: &Mutex<Option<io::Error>>, error: io::Error) {
    let mut slot = slot.lock().unwrap();
    if slot.is_none() {
        *slot = Some(error);
    }
}

impl<S: Service> Deref for ContextThread<S> {
    type Target = AsyncContext;

    fn deref(&self) -> &AsyncContext {
        &self.ctx
    }
}

impl<S: Service> Drop for ContextThread<S> {
    fn drop(&mut self) {
        if self.ctx.state.load() > ContextStates::Pending {
            self.ctx.signal(Signal::Terminate);
            if let Some(handle) = self.worker.lock().unwrap().take() {
                let _ = handle.join();
            }
        }
    }
}
