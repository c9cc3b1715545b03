use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicI32, Ordering};

use log::debug;
use socket2::{Domain, SockAddr, Socket, Type};

use limpet_timers::INVALID_SOCKET;

use crate::context::{AsyncContext, Signal};
use crate::multiplexer::SocketDialog;
use crate::service::read_context::ReadContext;
use crate::service::Service;
use crate::socket_io;

/// Per-connection behavior plugged into [`AsyncTcpService`].
pub trait TcpStreamHandler: Sized + 'static {
    /// Consumes `buf` read from `dialog`. An empty `buf` with no read
    /// context reports end of stream or a read error. Calling back into
    /// `service.submit_recv` keeps the connection reading; not doing so
    /// lets it close.
    fn service(
        &self,
        ctx: &AsyncContext,
        service: &Rc<AsyncTcpService<Self>>,
        dialog: &SocketDialog,
        rctx: Option<&Rc<ReadContext>>,
        buf: &[u8],
    );

    /// Socket option hook, called after SO_REUSEADDR is set and before
    /// bind.
    fn initialize(&self, _socket: &Socket) -> io::Result<()> {
        Ok(())
    }

    /// Called when the terminate signal is received.
    fn stop(&self) {}
}

/// An acceptor loop plus a per-connection read loop skeleton, specialized
/// by a [`TcpStreamHandler`].
pub struct AsyncTcpService<H: TcpStreamHandler> {
    address: RefCell<SocketAddr>,
    acceptor_sockfd: AtomicI32,
    handler: H,
}

impl<H: TcpStreamHandler> AsyncTcpService<H> {
    pub fn new(address: SocketAddr, handler: H) -> Self {
        AsyncTcpService {
            address: RefCell::new(address),
            acceptor_sockfd: AtomicI32::new(INVALID_SOCKET),
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

        // Read back the bound address; a requested port of zero becomes
        // the assigned ephemeral port.
        //
        if let Some(bound) = socket.local_addr()?.as_socket() {
            *self.address.borrow_mut() = bound;
        }

        socket.listen(libc::SOMAXCONN)?;
        Ok(())
    }

    fn start_(self: &Rc<Self>, ctx: &AsyncContext) -> io::Result<()> {
        let socket = Socket::new(Domain::for_address(*self.address.borrow()), Type::STREAM, None)?;
        self.initialize_(&socket)?;

        self.acceptor_sockfd
            .store(socket.as_raw_fd(), Ordering::Release);

        let dialog = ctx.poller.emplace(socket)?;
        self.acceptor(ctx, dialog);
        Ok(())
    }

    // The acceptor restarts itself only after a successful accept; a
    // single failure winds the chain down.
    //
    fn acceptor(self: &Rc<Self>, ctx: &AsyncContext, listen_dialog: SocketDialog) {
        let service = Rc::clone(self);

        ctx.scope.spawn(async move {
            loop {
                match socket_io::accept(&listen_dialog).await {
                    Ok(socket) => {
                        let ctx = AsyncContext::local_instance();
                        match ctx.poller.emplace(socket) {
                            Ok(dialog) => {
                                service.submit_recv(ctx, &dialog, Rc::new(ReadContext::new()));
                            }
                            Err(error) => debug!("dropping accepted connection: {error}"),
                        }
                    }
                    Err(_) => return,
                }
            }
        });
    }

    /// Submits an asynchronous receive on `dialog`. The handler decides
    /// whether to resubmit when the bytes are emitted to it.
    pub fn submit_recv(self: &Rc<Self>, ctx: &AsyncContext, dialog: &SocketDialog, rctx: Rc<ReadContext>) {
        let service = Rc::clone(self);
        let dialog = dialog.clone();

        ctx.scope.spawn(async move {
            let received = socket_io::recvmsg(&dialog, &rctx).await;
            let ctx = AsyncContext::local_instance();

            match received {
                Ok(0) | Err(_) => service.emit(ctx, &dialog, None, 0),
                Ok(len) => service.emit(ctx, &dialog, Some(rctx), len),
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
        let sockfd = self.acceptor_sockfd.swap(INVALID_SOCKET, Ordering::AcqRel);
        if sockfd != INVALID_SOCKET {
            // Fails the pending accept, winding down the acceptor chain.
            //
            let _ = unsafe { libc::shutdown(sockfd, libc::SHUT_RD) };
        }
    }
}

impl<H: TcpStreamHandler> Service for AsyncTcpService<H> {
    fn start(self: Rc<Self>, ctx: &AsyncContext) -> io::Result<()> {
        if let Err(error) = self.start_(ctx) {
            debug!("tcp service failed to start: {error}");

            // Start-up failure turns into a stop request; the interrupt
            // lets a sleeping reactor observe it.
            //
            ctx.scope.request_stop();
            ctx.interrupt();
        }

        Ok(())
    }

    fn signal_handler(&self, signal: Signal) {
        if signal == Signal::Terminate {
            self.handler.stop();
            self.stop_();
        }
    }
}
