pub mod context_thread;
pub mod read_context;
pub mod tcp;
pub mod udp;

use std::io;
use std::rc::Rc;

use crate::context::{AsyncContext, Signal};

/// A service hosted by a context thread.
pub trait Service: 'static {
    /// Starts the service. Runs on the context's worker thread before the
    /// reactor loop.
    fn start(self: Rc<Self>, ctx: &AsyncContext) -> io::Result<()>;

    /// Handles one drained signal.
    fn signal_handler(&self, signal: Signal);
}

/// A service with no behavior: the standard way to obtain a bare context
/// thread for async clients that spawn their own work.
pub struct NullService;

impl Service for NullService {
    fn start(self: Rc<Self>, _ctx: &AsyncContext) -> io::Result<()> {
        Ok(())
    }

    fn signal_handler(&self, _signal: Signal) {}
}
