use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use binary_heap_plus::{BinaryHeap, MinComparator};

use crate::interrupt::{InterruptSource, SocketPairInterrupt};

/// The timer id type.
pub type TimerId = usize;

/// The invalid timer id.
pub const INVALID_TIMER: TimerId = TimerId::MAX;

/// The timer handler type. Handlers run on the thread that calls `resolve`.
pub type TimerHandler = Box<dyn FnMut(TimerId) + Send>;

struct TimerEvent {
    // Empty while the handler is out being fired and once the id is
    // reclaimed.
    //
    handler: Option<TimerHandler>,
    period: Duration,
    // Shared with in-flight firings so a removal from another thread
    // cancels a fire that has not happened yet.
    //
    armed: Arc<AtomicBool>,
}

// Ordering is expires_at first, then id; entries that expire together may
// resolve in any order.
//
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct EventRef {
    expires_at: Instant,
    id: TimerId,
}

struct TimersState {
    // Indexed by id; grows monotonically, never shrinks. `events.len()` is
    // the smallest unused fresh id.
    //
    events: Vec<TimerEvent>,
    eventq: BinaryHeap<EventRef, MinComparator>,
    free_ids: Vec<TimerId>,
}

impl TimersState {
    fn new() -> Self {
        TimersState {
            events: Vec::new(),
            eventq: BinaryHeap::new_min(),
            free_ids: Vec::new(),
        }
    }
}

// A due entry with its handler taken out so it can fire outside the lock.
//
struct Firing {
    id: TimerId,
    expires_at: Instant,
    period: Duration,
    armed: Arc<AtomicBool>,
    handler: TimerHandler,
}

/// A concurrent min-ordered timer set.
///
/// `add` and `remove` are safe from any thread and every `add` fires the
/// interrupt source so a sleeping event loop re-evaluates its wait hint.
/// `resolve` must only be called from the owning event loop; it runs due
/// handlers with the internal lock released, so handlers may call back
/// into `add` and `remove`.
///
/// Cancellation is lazy: `remove` only disarms the event, and the id is
/// recycled once its queue entry reaches the top of the heap. Callers are
/// expected to use the self-assignment idiom to avoid cancelling twice:
///
/// ```ignore
/// let mut timer = timers.add(Duration::from_millis(10), Duration::ZERO, |_| {});
/// timer = timers.remove(timer);
/// ```
pub struct Timers<I: InterruptSource = SocketPairInterrupt> {
    interrupt: I,
    state: Mutex<TimersState>,
}

impl<I: InterruptSource> Default for Timers<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: InterruptSource> Timers<I> {
    pub fn new() -> Self {
        Timers {
            interrupt: I::default(),
            state: Mutex::new(TimersState::new()),
        }
    }

    /// The underlying interrupt source.
    pub fn source(&self) -> &I {
        &self.interrupt
    }

    /// Fires the interrupt source.
    pub fn interrupt(&self) {
        self.interrupt.interrupt();
    }

    /// Adds a timer that first fires at `when` and then every `period`.
    /// A zero `period` means one-shot. Returns the id of the new timer.
    pub fn add_at<F>(&self, when: Instant, period: Duration, handler: F) -> TimerId
    where
        F: FnMut(TimerId) + Send + 'static,
    {
        let tid;
        {
            let mut state = self.state.lock().unwrap();

            // Prefer a recycled id over a fresh one.
            //
            tid = state.free_ids.pop().unwrap_or(state.events.len());

            let event = TimerEvent {
                handler: Some(Box::new(handler)),
                period,
                armed: Arc::new(AtomicBool::new(true)),
            };

            if tid == state.events.len() {
                state.events.push(event);
            } else {
                state.events[tid] = event;
            }

            state.eventq.push(EventRef {
                expires_at: when,
                id: tid,
            });
        }

        // Notify the interrupt sink of the new event.
        //
        self.interrupt.interrupt();

        tid
    }

    /// Adds a timer relative to now.
    pub fn add<F>(&self, after: Duration, period: Duration, handler: F) -> TimerId
    where
        F: FnMut(TimerId) + Send + 'static,
    {
        self.add_at(Instant::now() + after, period, handler)
    }

    /// Adds a timer from microsecond counts.
    pub fn add_micros<F>(&self, after_us: u64, period_us: u64, handler: F) -> TimerId
    where
        F: FnMut(TimerId) + Send + 'static,
    {
        self.add(
            Duration::from_micros(after_us),
            Duration::from_micros(period_us),
            handler,
        )
    }

    /// Removes the timer with the given id.
    ///
    /// Returns `tid` unchanged when it does not name a slot, otherwise
    /// disarms the event and returns `INVALID_TIMER`. The id itself is
    /// reclaimed later, when its entry propagates out of the event queue.
    pub fn remove(&self, tid: TimerId) -> TimerId {
        let state = self.state.lock().unwrap();
        if tid >= state.events.len() {
            return tid;
        }

        state.events[tid].armed.store(false, Ordering::Release);
        INVALID_TIMER
    }

    /// Resolves all armed and expired events.
    ///
    /// Returns the duration until the next armed event times out, or
    /// `None` when no armed events remain.
    pub fn resolve(&self) -> Option<Duration> {
        let mut due = {
            let mut state = self.state.lock().unwrap();
            dequeue_due(&mut state)
        };

        // Fire with the lock released; a concurrent remove that lands
        // before the armed check cancels the fire. One-shot events are
        // disarmed once they have had their chance to run.
        //
        for firing in &mut due {
            if firing.armed.load(Ordering::Acquire) {
                (firing.handler)(firing.id);
            }

            if firing.period.is_zero() {
                firing.armed.store(false, Ordering::Release);
            }
        }

        let mut state = self.state.lock().unwrap();
        update_timers(&mut state, due)
    }

    /// Swaps the contents of two timer sets. Self-swap is a no-op and the
    /// interrupt sources stay put: the wake channel belongs to the owning
    /// context, not to the timer contents.
    pub fn swap(&self, other: &Self) {
        if ptr::eq(self, other) {
            return;
        }

        // Lock in address order.
        //
        let (first, second) = if (self as *const Self) < (other as *const Self) {
            (self, other)
        } else {
            (other, self)
        };

        let mut lhs = first.state.lock().unwrap();
        let mut rhs = second.state.lock().unwrap();
        mem::swap(&mut *lhs, &mut *rhs);
    }
}

// Pops every due entry off the heap top. Disarmed entries are reclaimed in
// place; armed due entries come back with their handlers taken out, ready
// to fire outside the lock.
//
fn dequeue_due(state: &mut TimersState) -> Vec<Firing> {
    let now = Instant::now();
    let mut due = Vec::new();

    while let Some(next) = state.eventq.peek().copied() {
        let event = &mut state.events[next.id];

        if !event.armed.load(Ordering::Acquire) {
            event.handler = None;
            state.free_ids.push(next.id);
            state.eventq.pop();
            continue;
        }

        if now < next.expires_at {
            break;
        }

        let Some(handler) = event.handler.take() else {
            state.eventq.pop();
            continue;
        };

        due.push(Firing {
            id: next.id,
            expires_at: next.expires_at,
            period: event.period,
            armed: Arc::clone(&event.armed),
            handler,
        });
        state.eventq.pop();
    }

    due
}

// Re-inserts still-armed events at `expires_at + period` and reclaims the
// rest, then computes the wait hint from the first armed entry.
//
fn update_timers(state: &mut TimersState, due: Vec<Firing>) -> Option<Duration> {
    for firing in due {
        if firing.armed.load(Ordering::Acquire) {
            state.events[firing.id].handler = Some(firing.handler);
            state.eventq.push(EventRef {
                expires_at: firing.expires_at + firing.period,
                id: firing.id,
            });
        } else {
            state.free_ids.push(firing.id);
        }
    }

    let now = Instant::now();
    loop {
        let next = state.eventq.peek().copied()?;

        if state.events[next.id].armed.load(Ordering::Acquire) {
            return Some(next.expires_at.saturating_duration_since(now));
        }

        state.events[next.id].handler = None;
        state.free_ids.push(next.id);
        state.eventq.pop();
    }
}
