use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rstest::rstest;
use socket2::{Domain, SockAddr, Socket, Type};

use limpet_reactor::context::{AsyncContext, ContextStates, Signal};
use limpet_reactor::multiplexer::SocketDialog;
use limpet_reactor::service::context_thread::ContextThread;
use limpet_reactor::service::read_context::ReadContext;
use limpet_reactor::service::tcp::{AsyncTcpService, TcpStreamHandler};
use limpet_reactor::service::{NullService, Service};
use limpet_reactor::socket_io;

struct EchoHandler;

impl TcpStreamHandler for EchoHandler {
    fn service(
        &self,
        ctx: &AsyncContext,
        service: &Rc<AsyncTcpService<Self>>,
        dialog: &SocketDialog,
        rctx: Option<&Rc<ReadContext>>,
        buf: &[u8],
    ) {
        if buf.is_empty() {
            // End of stream; let the connection close.
            //
            return;
        }

        let data = buf.to_vec();
        let reply_dialog = dialog.clone();
        ctx.scope.spawn(async move {
            let _ = socket_io::sendmsg(&reply_dialog, &data, None).await;
        });

        if let Some(rctx) = rctx {
            service.submit_recv(ctx, dialog, Rc::clone(rctx));
        }
    }
}

// Keeps connections open without replying and counts terminate deliveries.
//
struct CountingHandler {
    stops: Arc<AtomicUsize>,
}

impl TcpStreamHandler for CountingHandler {
    fn service(
        &self,
        ctx: &AsyncContext,
        service: &Rc<AsyncTcpService<Self>>,
        dialog: &SocketDialog,
        rctx: Option<&Rc<ReadContext>>,
        buf: &[u8],
    ) {
        if buf.is_empty() {
            return;
        }
        if let Some(rctx) = rctx {
            service.submit_recv(ctx, dialog, Rc::clone(rctx));
        }
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::AcqRel);
    }
}

struct RejectingHandler;

impl TcpStreamHandler for RejectingHandler {
    fn service(
        &self,
        _ctx: &AsyncContext,
        _service: &Rc<AsyncTcpService<Self>>,
        _dialog: &SocketDialog,
        _rctx: Option<&Rc<ReadContext>>,
        _buf: &[u8],
    ) {
    }

    fn initialize(&self, _socket: &Socket) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::InvalidInput, "rejected"))
    }
}

// Wraps a TCP service for thread hosting and reports the bound address
// back to the test thread once the service has started.
//
struct ReportingService<H: TcpStreamHandler> {
    inner: Rc<AsyncTcpService<H>>,
    addr_out: Arc<Mutex<Option<SocketAddr>>>,
}

impl<H: TcpStreamHandler> ReportingService<H> {
    fn new(address: SocketAddr, handler: H, addr_out: Arc<Mutex<Option<SocketAddr>>>) -> Self {
        ReportingService {
            inner: Rc::new(AsyncTcpService::new(address, handler)),
            addr_out,
        }
    }
}

impl<H: TcpStreamHandler> Service for ReportingService<H> {
    fn start(self: Rc<Self>, ctx: &AsyncContext) -> io::Result<()> {
        Rc::clone(&self.inner).start(ctx)?;
        *self.addr_out.lock().unwrap() = Some(self.inner.local_addr());
        Ok(())
    }

    fn signal_handler(&self, signal: Signal) {
        self.inner.signal_handler(signal);
    }
}

fn echo_round_trip(ctx: &AsyncContext, client: &mut TcpStream, letter: u8) {
    client.write_all(&[letter]).unwrap();

    let mut buf = [0u8; 1];
    for _ in 0..100 {
        ctx.wait_for(Some(Duration::from_millis(10))).unwrap();
        match client.read(&mut buf) {
            Ok(1) => {
                assert_eq!(buf[0], letter);
                return;
            }
            Ok(_) => panic!("server closed the connection"),
            Err(error)
                if error.kind() == io::ErrorKind::WouldBlock
                    || error.kind() == io::ErrorKind::TimedOut => {}
            Err(error) => panic!("client read failed: {error}"),
        }
    }
    panic!("no echo for {:?}", letter as char);
}

#[rstest]
#[case("127.0.0.1:0")]
#[case("[::1]:0")]
fn tcp_echo(#[case] address: &str) {
    let ctx = AsyncContext::new().unwrap();
    let service = Rc::new(AsyncTcpService::new(address.parse().unwrap(), EchoHandler));
    Rc::clone(&service).start(&ctx).unwrap();
    assert!(!ctx.scope.stop_requested());

    let bound = service.local_addr();
    assert_ne!(bound.port(), 0);

    let mut client = TcpStream::connect(bound).unwrap();
    client
        .set_read_timeout(Some(Duration::from_millis(10)))
        .unwrap();

    for letter in b'a'..=b'z' {
        echo_round_trip(&ctx, &mut client, letter);
    }

    drop(client);
    service.signal_handler(Signal::Terminate);

    let mut drains = 0;
    while ctx.wait_for(Some(Duration::from_millis(50))).unwrap() > 0 {
        drains += 1;
        assert!(drains <= 4);
    }
    assert!(drains > 0);
    assert!(ctx.scope.is_empty());
}

#[test]
fn terminate_winds_down_acceptor() {
    let ctx = AsyncContext::new().unwrap();
    let service = Rc::new(AsyncTcpService::new(
        "127.0.0.1:0".parse().unwrap(),
        EchoHandler,
    ));
    Rc::clone(&service).start(&ctx).unwrap();

    service.signal_handler(Signal::Terminate);

    let mut drains = 0;
    while ctx.wait_for(Some(Duration::from_millis(50))).unwrap() > 0 {
        drains += 1;
        assert!(drains <= 4);
    }
    assert!(drains > 0);
    assert!(ctx.scope.is_empty());
}

#[test]
fn initialize_error_requests_stop() {
    let ctx = AsyncContext::new().unwrap();
    let service = Rc::new(AsyncTcpService::new(
        "127.0.0.1:0".parse().unwrap(),
        RejectingHandler,
    ));

    Rc::clone(&service).start(&ctx).unwrap();
    assert!(ctx.scope.stop_requested());
    assert!(ctx.scope.is_empty());
}

#[test]
fn server_drain_escalates_terminate() {
    let stops = Arc::new(AtomicUsize::new(0));
    let addr_out = Arc::new(Mutex::new(None));

    let server = ContextThread::<ReportingService<CountingHandler>>::new().unwrap();
    {
        let stops = Arc::clone(&stops);
        let addr_out = Arc::clone(&addr_out);
        server
            .start(move || {
                ReportingService::new(
                    "127.0.0.1:0".parse().unwrap(),
                    CountingHandler { stops },
                    addr_out,
                )
            })
            .unwrap();
    }
    assert_eq!(server.state.load(), ContextStates::Started);

    let address = addr_out.lock().unwrap().expect("service reported address");
    let client = TcpStream::connect(address).unwrap();

    // A server timer drops the client mid-drain; until then the open
    // connection keeps the scope busy.
    //
    let mut client = Some(client);
    server
        .timers
        .add(Duration::from_millis(3500), Duration::ZERO, move |_| {
            let _ = client.take();
        });
    thread::sleep(Duration::from_millis(10));

    server.signal(Signal::Terminate);
    server.state.wait_while(|state| state == ContextStates::Started);
    assert_eq!(server.state.load(), ContextStates::Stopped);

    // The initial terminate plus at least two escalation ticks.
    //
    assert!(stops.load(Ordering::Acquire) >= 3, "stops = {}", stops.load(Ordering::Acquire));
}

#[test]
fn null_service_client_round_trip() {
    let addr_out = Arc::new(Mutex::new(None));
    let server = ContextThread::<ReportingService<EchoHandler>>::new().unwrap();
    {
        let addr_out = Arc::clone(&addr_out);
        server
            .start(move || {
                ReportingService::new("127.0.0.1:0".parse().unwrap(), EchoHandler, addr_out)
            })
            .unwrap();
    }
    let address = addr_out.lock().unwrap().expect("service reported address");

    let client = ContextThread::<NullService>::new().unwrap();
    client.start(|| NullService).unwrap();

    let done = Arc::new(AtomicBool::new(false));
    {
        let done = Arc::clone(&done);
        client.spawn_external(async move {
            let ctx = AsyncContext::local_instance();
            ctx.scope.spawn(async move {
                let exchange = async {
                    let ctx = AsyncContext::local_instance();
                    let socket = Socket::new(Domain::for_address(address), Type::STREAM, None)?;
                    let dialog = ctx.poller.emplace(socket)?;

                    socket_io::connect(&dialog, &SockAddr::from(address)).await?;
                    socket_io::sendmsg(&dialog, b"x", None).await?;

                    let mut buf = [0u8; 1];
                    let len = socket_io::recv(&dialog, &mut buf).await?;
                    Ok::<bool, io::Error>(len == 1 && buf[0] == b'x')
                };

                if let Ok(true) = exchange.await {
                    done.store(true, Ordering::Release);
                }
            });
        });
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while !done.load(Ordering::Acquire) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(done.load(Ordering::Acquire));
}
