//! Asynchronous socket operations over multiplexer dialogs.
//!
//! Every operation retries its non-blocking system call and parks the
//! running task on dialog readiness when the call would block.

use std::future::Future;
use std::io;
use std::mem::MaybeUninit;
use std::pin::Pin;
use std::task::{Context, Poll};

use socket2::{SockAddr, Socket};

use crate::context::{AsyncContext, ScheduleReason};
use crate::multiplexer::{Interest, SocketDialog};
use crate::service::read_context::ReadContext;

// Suspends the running task until the dialog reports readiness for the
// interest, or until a recorded registration error is delivered.
//
struct ReadinessFuture<'a> {
    dialog: &'a SocketDialog,
    interest: Interest,
}

impl Future for ReadinessFuture<'_> {
    type Output = io::Result<()>;

    fn poll(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Self::Output> {
        let ctx = AsyncContext::local_instance();

        match ctx.poller.consume_ready(self.dialog.key(), self.interest) {
            Some(result) => Poll::Ready(result),
            None => {
                ctx.set_schedule_reason(ScheduleReason::IoWait {
                    key: self.dialog.key(),
                    interest: self.interest,
                });
                Poll::Pending
            }
        }
    }
}

async fn readable(dialog: &SocketDialog) -> io::Result<()> {
    ReadinessFuture {
        dialog,
        interest: Interest::Read,
    }
    .await
}

async fn writable(dialog: &SocketDialog) -> io::Result<()> {
    ReadinessFuture {
        dialog,
        interest: Interest::Write,
    }
    .await
}

fn with_socket<R>(dialog: &SocketDialog, f: impl FnOnce(&Socket) -> R) -> R {
    AsyncContext::local_instance().poller.with_socket(dialog.key(), f)
}

/// Accepts one connection on a listening dialog.
pub async fn accept(dialog: &SocketDialog) -> io::Result<Socket> {
    loop {
        match with_socket(dialog, |socket| socket.accept()) {
            Ok((socket, _peer)) => return Ok(socket),
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => readable(dialog).await?,
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            Err(error) => return Err(error),
        }
    }
}

/// Receives into `buf`, returning the number of bytes read.
pub async fn recv(dialog: &SocketDialog, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let result = with_socket(dialog, |socket| {
            // SAFETY: u8 and MaybeUninit<u8> share a layout and the
            // receive only writes into the buffer.
            //
            let uninit = unsafe {
                std::slice::from_raw_parts_mut(buf.as_mut_ptr().cast::<MaybeUninit<u8>>(), buf.len())
            };
            socket.recv(uninit)
        });

        match result {
            Ok(len) => return Ok(len),
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => readable(dialog).await?,
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            Err(error) => return Err(error),
        }
    }
}

/// Receives into the read context's buffer, recording the peer address.
/// Returns the number of bytes read.
pub async fn recvmsg(dialog: &SocketDialog, rctx: &ReadContext) -> io::Result<usize> {
    loop {
        match with_socket(dialog, |socket| rctx.recv_into(socket)) {
            Ok(len) => return Ok(len),
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => readable(dialog).await?,
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            Err(error) => return Err(error),
        }
    }
}

/// Sends `buf`, to `addr` when given (datagram reply) or to the connected
/// peer otherwise. Returns the number of bytes sent.
pub async fn sendmsg(
    dialog: &SocketDialog,
    buf: &[u8],
    addr: Option<&SockAddr>,
) -> io::Result<usize> {
    loop {
        let result = with_socket(dialog, |socket| match addr {
            Some(addr) => socket.send_to_with_flags(buf, addr, libc::MSG_NOSIGNAL),
            None => socket.send_with_flags(buf, libc::MSG_NOSIGNAL),
        });

        match result {
            Ok(len) => return Ok(len),
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => writable(dialog).await?,
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            Err(error) => return Err(error),
        }
    }
}

/// Connects the dialog's socket to `addr`.
pub async fn connect(dialog: &SocketDialog, addr: &SockAddr) -> io::Result<()> {
    match with_socket(dialog, |socket| socket.connect(addr)) {
        Ok(()) => return Ok(()),
        Err(error) if connect_in_progress(&error) => {}
        Err(error) => return Err(error),
    }

    // The connection completes when the socket turns writable; the
    // outcome is in SO_ERROR.
    //
    writable(dialog).await?;
    match with_socket(dialog, |socket| socket.take_error())? {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

fn connect_in_progress(error: &io::Error) -> bool {
    error.raw_os_error() == Some(libc::EINPROGRESS)
        || error.kind() == io::ErrorKind::WouldBlock
        || error.kind() == io::ErrorKind::Interrupted
}
