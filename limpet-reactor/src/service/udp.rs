use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicI32, Ordering};

use socket2::{Domain, SockAddr, Socket, Type};

use limpet_timers::INVALID_SOCKET;

use crate::context::{AsyncContext, Signal};
use crate::multiplexer::SocketDialog;
use crate::service::read_context::ReadContext;
use crate::service::Service;
use crate::socket_io;

/// Per-datagram behavior plugged into [`AsyncUdpService`].
pub trait UdpStreamHandler: Sized + 'static {
    /// Consumes one datagram read from `dialog`; the sender is recorded
    /// in the read context. An empty `buf` reports a zero-length
    /// datagram, a read error, or socket shutdown. Calling back into
    /// `service.submit_recv` keeps the socket reading.
    fn service(
        &self,
        ctx: &AsyncContext,
        service: &Rc<AsyncUdpService<Self>>,
        dialog: &SocketDialog,
        rctx: Option<&Rc<ReadContext>>,
        buf: &[u8],
    );

    /// Socket option hook, called after SO_REUSEADDR is set and before
    /// bind.
    fn initialize(&self, _socket: &Socket) -> io::Result<()> {
        Ok(())
    }
}

/// A single datagram socket receive loop skeleton, specialized by a
/// [`UdpStreamHandler`].
pub struct AsyncUdpService<H: UdpStreamHandler> {
    address: RefCell<SocketAddr>,
    server_sockfd: AtomicI32,
    handler: H,
}

impl<H: UdpStreamHandler> AsyncUdpService<H> {
    pub fn new(address: SocketAddr, handler: H) -> Self {
        AsyncUdpService {
            address: RefCell::new(address),
            server_sockfd: AtomicI32::new(INVALID_SOCKET),
            handler,
        }
    }

    /// The bound address; once the service has started this carries the
    /// assigned ephemeral port.
    pub fn local_addr(&self) -> SocketAddr {
        *self.address.borrow()
    }

    fn initialize_(&self, socket: &Socket) -> io::Result<()> {
        socket.set_reuse_address(true)?;
        self.handler.initialize(socket)?;

        let address = SockAddr::from(*self.address.borrow());
        socket.bind(&address)?;

        if let Some(bound) = socket.local_addr()?.as_socket() {
            *self.address.borrow_mut() = bound;
        }

        Ok(())
    }

    /// Submits an asynchronous receive on `dialog`. The handler must
    /// resubmit to keep reading.
    pub fn submit_recv(self: &Rc<Self>, ctx: &AsyncContext, dialog: &SocketDialog, rctx: Rc<ReadContext>) {
        let service = Rc::clone(self);
        let dialog = dialog.clone();

        ctx.scope.spawn(async move {
            let received = socket_io::recvmsg(&dialog, &rctx).await;
            let ctx = AsyncContext::local_instance();

            match received {
                Ok(len) => service.emit(ctx, &dialog, Some(rctx), len),
                Err(_) => service.emit(ctx, &dialog, None, 0),
            }
        });
    }

    fn emit(self: &Rc<Self>, ctx: &AsyncContext, dialog: &SocketDialog, rctx: Option<Rc<ReadContext>>, len: usize) {
        match rctx {
            Some(rctx) => rctx.with_filled(len, |buf| {
                self.handler.service(ctx, self, dialog, Some(&rctx), buf);
            }),
            None => self.handler.service(ctx, self, dialog, None, &[]),
        }
    }

    fn stop_(&self) {
        let sockfd = self.server_sockfd.swap(INVALID_SOCKET, Ordering::AcqRel);
        if sockfd != INVALID_SOCKET {
            // Wakes and fails the pending receive.
            //
            let _ = unsafe { libc::shutdown(sockfd, libc::SHUT_RD) };
        }
    }
}

impl<H: UdpStreamHandler> Service for AsyncUdpService<H> {
    fn start(self: Rc<Self>, ctx: &AsyncContext) -> io::Result<()> {
        let socket = Socket::new(Domain::for_address(*self.address.borrow()), Type::DGRAM, None)?;
        self.initialize_(&socket)?;

        self.server_sockfd
            .store(socket.as_raw_fd(), Ordering::Release);

        let dialog = ctx.poller.emplace(socket)?;
        self.submit_recv(ctx, &dialog, Rc::new(ReadContext::new()));
        Ok(())
    }

    fn signal_handler(&self, signal: Signal) {
        if signal == Signal::Terminate {
            self.stop_();
        }
    }
}
