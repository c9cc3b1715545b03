use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::rc::Rc;
use std::time::Duration;

use polling::{Event, Events, PollMode, Poller};
use slab::Slab;
use socket2::Socket;

use crate::context::AsyncContext;
use crate::scope::TaskRuntime;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Interest {
    Read,
    Write,
}

impl Interest {
    fn index(self) -> usize {
        match self {
            Interest::Read => 0,
            Interest::Write => 1,
        }
    }
}

// Per-registration state. Parked task runtimes wait here until the poll
// engine reports readiness for their direction.
//
struct DialogState {
    socket: Socket,
    parked: [VecDeque<TaskRuntime>; 2],
    ready: [bool; 2],
    // A failed interest registration, delivered to the next readiness
    // query on this dialog.
    //
    error: Option<io::Error>,
}

/// The readiness multiplexer: a poll engine plus the per-socket
/// registrations ("dialogs") it watches.
///
/// Registrations use oneshot interests: an interest is armed when an
/// operation parks and is consumed by the next readiness event.
pub struct Multiplexer {
    poller: Poller,
    dialogs: RefCell<Slab<DialogState>>,
    events: RefCell<Events>,
}

/// An opaque registration of a socket with the multiplexer; the handle by
/// which asynchronous I/O is issued. Cloning is cheap. The socket is
/// deregistered and closed when the last handle is dropped.
#[derive(Clone)]
pub struct SocketDialog {
    inner: Rc<DialogHandle>,
}

struct DialogHandle {
    key: usize,
}

impl SocketDialog {
    pub(crate) fn key(&self) -> usize {
        self.inner.key
    }
}

impl Drop for DialogHandle {
    fn drop(&mut self) {
        // Without a running context the multiplexer itself is being torn
        // down and closes the socket.
        //
        if AsyncContext::has_local_instance() {
            AsyncContext::local_instance().poller.remove(self.key);
        }
    }
}

impl Multiplexer {
    pub(crate) fn new() -> io::Result<Self> {
        Ok(Multiplexer {
            poller: Poller::new()?,
            dialogs: RefCell::new(Slab::new()),
            events: RefCell::new(Events::new()),
        })
    }

    /// Registers a socket and returns its dialog. The socket is switched
    /// to non-blocking mode.
    pub fn emplace(&self, socket: Socket) -> io::Result<SocketDialog> {
        socket.set_nonblocking(true)?;

        let mut dialogs = self.dialogs.borrow_mut();
        let entry = dialogs.vacant_entry();
        let key = entry.key();

        // SAFETY: the fd stays open until the dialog state is removed,
        // which deletes the registration first.
        //
        unsafe {
            self.poller
                .add_with_mode(socket.as_raw_fd(), Event::none(key), PollMode::Oneshot)?;
        }

        entry.insert(DialogState {
            socket,
            parked: [VecDeque::new(), VecDeque::new()],
            ready: [false, false],
            error: None,
        });

        Ok(SocketDialog {
            inner: Rc::new(DialogHandle { key }),
        })
    }

    pub(crate) fn with_socket<R>(&self, key: usize, f: impl FnOnce(&Socket) -> R) -> R {
        let dialogs = self.dialogs.borrow();
        f(&dialogs[key].socket)
    }

    // Consumes a pending readiness or error for the dialog, if any.
    //
    pub(crate) fn consume_ready(&self, key: usize, interest: Interest) -> Option<io::Result<()>> {
        let mut dialogs = self.dialogs.borrow_mut();
        let state = &mut dialogs[key];

        if let Some(error) = state.error.take() {
            return Some(Err(error));
        }

        if state.ready[interest.index()] {
            state.ready[interest.index()] = false;
            return Some(Ok(()));
        }

        None
    }

    // Parks a task runtime on the dialog and arms the oneshot interest.
    // On a registration failure the task is handed back so the driver can
    // rerun it against the recorded error.
    //
    pub(crate) fn park(
        &self,
        key: usize,
        interest: Interest,
        task: TaskRuntime,
    ) -> Result<(), TaskRuntime> {
        let mut dialogs = self.dialogs.borrow_mut();
        let state = &mut dialogs[key];

        // Oneshot re-arming replaces the whole interest set, so keep the
        // opposite direction armed while it has waiters.
        //
        let other = 1 - interest.index();
        let event = if state.parked[other].is_empty() {
            match interest {
                Interest::Read => Event::readable(key),
                Interest::Write => Event::writable(key),
            }
        } else {
            Event::all(key)
        };

        // SAFETY: the fd is owned by the dialog state and outlives the
        // registration.
        //
        let fd = unsafe { BorrowedFd::borrow_raw(state.socket.as_raw_fd()) };

        match self.poller.modify_with_mode(&fd, event, PollMode::Oneshot) {
            Ok(()) => {
                state.parked[interest.index()].push_back(task);
                Ok(())
            }
            Err(error) => {
                state.error = Some(error);
                Err(task)
            }
        }
    }

    // Polls for readiness and moves the woken task runtimes out. Returns
    // the number of readiness events.
    //
    pub(crate) fn wait(
        &self,
        timeout: Option<Duration>,
        woken: &mut Vec<TaskRuntime>,
    ) -> io::Result<usize> {
        let mut events = self.events.borrow_mut();
        events.clear();

        let count = self.poller.wait(&mut events, timeout)?;

        let mut dialogs = self.dialogs.borrow_mut();
        for event in events.iter() {
            let Some(state) = dialogs.get_mut(event.key) else {
                continue;
            };

            if event.readable {
                state.ready[0] = true;
                woken.extend(state.parked[0].drain(..));
            }
            if event.writable {
                state.ready[1] = true;
                woken.extend(state.parked[1].drain(..));
            }

            // A oneshot event disarms the whole registration; re-arm any
            // direction that still has parked waiters.
            //
            let want = [!state.parked[0].is_empty(), !state.parked[1].is_empty()];
            if want[0] || want[1] {
                let interest = match want {
                    [true, true] => Event::all(event.key),
                    [true, false] => Event::readable(event.key),
                    _ => Event::writable(event.key),
                };

                // SAFETY: the fd is owned by the dialog state.
                //
                let fd = unsafe { BorrowedFd::borrow_raw(state.socket.as_raw_fd()) };
                if let Err(error) = self.poller.modify_with_mode(&fd, interest, PollMode::Oneshot) {
                    state.error = Some(error);
                    woken.extend(state.parked[0].drain(..));
                    woken.extend(state.parked[1].drain(..));
                }
            }
        }

        Ok(count)
    }

    pub(crate) fn notify(&self) {
        let _ = self.poller.notify();
    }

    pub(crate) fn remove(&self, key: usize) {
        let state = self.dialogs.borrow_mut().try_remove(key);

        // The state is dropped outside the borrow: parked runtimes may
        // hold dialog handles of their own and re-enter here.
        //
        if let Some(state) = state {
            // SAFETY: the fd is still open; the socket is dropped below.
            //
            let fd = unsafe { BorrowedFd::borrow_raw(state.socket.as_raw_fd()) };
            let _ = self.poller.delete(&fd);
            drop(state);
        }
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        // Parked runtimes are dropped outside the borrow for the same
        // re-entrancy reason as in `remove`.
        //
        let states: Vec<DialogState> = {
            let mut dialogs = self.dialogs.borrow_mut();
            dialogs.drain().collect()
        };
        drop(states);
    }
}
