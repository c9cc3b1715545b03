use std::sync::atomic::{AtomicI32, Ordering};

use libc::c_int;

/// The invalid socket sentinel.
pub const INVALID_SOCKET: c_int = -1;

/// A wakeup primitive for a sleeping event loop.
///
/// The timer set fires the interrupt on every `add` so that a reactor
/// blocked in its multiplexer re-evaluates the wait hint.
pub trait InterruptSource: Default + Send + Sync {
    fn interrupt(&self);
}

/// An interrupt source backed by a connected socket pair.
///
/// `sockets[0]` is the read end, registered with the owning context's
/// multiplexer. `sockets[1]` is the write end. Both start INVALID; the
/// pair is installed by the owning context thread during startup and the
/// write end is closed exactly once at shutdown via `take_write`.
pub struct SocketPairInterrupt {
    pub sockets: [AtomicI32; 2],
}

impl Default for SocketPairInterrupt {
    fn default() -> Self {
        SocketPairInterrupt {
            sockets: [
                AtomicI32::new(INVALID_SOCKET),
                AtomicI32::new(INVALID_SOCKET),
            ],
        }
    }
}

impl SocketPairInterrupt {
    // Both fds must be non-blocking.
    //
    pub fn install(&self, read_end: c_int, write_end: c_int) {
        self.sockets[0].store(read_end, Ordering::Release);
        self.sockets[1].store(write_end, Ordering::Release);
    }

    pub fn read_fd(&self) -> c_int {
        self.sockets[0].load(Ordering::Acquire)
    }

    /// Exchanges the write end with INVALID and returns the previous fd.
    pub fn take_write(&self) -> c_int {
        self.sockets[1].swap(INVALID_SOCKET, Ordering::AcqRel)
    }
}

impl InterruptSource for SocketPairInterrupt {
    fn interrupt(&self) {
        let fd = self.sockets[1].load(Ordering::Acquire);
        if fd == INVALID_SOCKET {
            return;
        }

        // Best effort: an error means either a torn-down pair or a full
        // pipe, and a full pipe already holds a pending wake.
        //
        let buf = [b'x'];
        let _ = unsafe { libc::send(fd, buf.as_ptr().cast(), 1, libc::MSG_NOSIGNAL) };
    }
}

/// No operation interrupt source, for timer sets that no event loop waits on.
#[derive(Default)]
pub struct NullInterrupt;

impl InterruptSource for NullInterrupt {
    fn interrupt(&self) {}
}
