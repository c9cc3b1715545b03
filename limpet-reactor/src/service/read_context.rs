use std::cell::RefCell;
use std::io;
use std::mem::MaybeUninit;
use std::net::SocketAddr;

use socket2::{SockAddr, Socket};

/// The service read buffer size.
pub const READ_BUFFER_LEN: usize = 64 * 1024;

/// Per-connection receive state: a pre-allocated read buffer and the peer
/// address of the most recent receive. The address slot holds either a v4
/// or a v6 peer. Shared between resubmitted reads of one connection.
pub struct ReadContext {
    buffer: RefCell<Box<[MaybeUninit<u8>]>>,
    peer: RefCell<Option<SockAddr>>,
}

impl ReadContext {
    pub fn new() -> Self {
        ReadContext {
            buffer: RefCell::new(Box::new_uninit_slice(READ_BUFFER_LEN)),
            peer: RefCell::new(None),
        }
    }

    // One receive into the buffer, recording the sender.
    //
    pub(crate) fn recv_into(&self, socket: &Socket) -> io::Result<usize> {
        let mut buffer = self.buffer.borrow_mut();
        let (len, peer) = socket.recv_from(&mut buffer[..])?;
        *self.peer.borrow_mut() = Some(peer);
        Ok(len)
    }

    /// The peer address of the most recent receive.
    pub fn peer(&self) -> Option<SockAddr> {
        self.peer.borrow().clone()
    }

    /// The peer address of the most recent receive, as a socket address.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer.borrow().as_ref().and_then(|addr| addr.as_socket())
    }

    pub(crate) fn with_filled<R>(&self, len: usize, f: impl FnOnce(&[u8]) -> R) -> R {
        let buffer = self.buffer.borrow();

        // SAFETY: the preceding receive initialized the first `len` bytes.
        //
        let filled = unsafe { &*(&buffer[..len] as *const [MaybeUninit<u8>] as *const [u8]) };
        f(filled)
    }
}

impl Default for ReadContext {
    fn default() -> Self {
        Self::new()
    }
}
