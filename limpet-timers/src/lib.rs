//! Event-loop timers with a cross-thread interrupt channel.

pub mod interrupt;
pub mod timers;

pub use interrupt::{InterruptSource, NullInterrupt, SocketPairInterrupt, INVALID_SOCKET};
pub use timers::{TimerHandler, TimerId, Timers, INVALID_TIMER};
