//! Scheduler-queue membership tokens
//!
//! An `Event` is the unit the loop schedules: a node that wants to act on
//! readiness registers one event, and arming inserts it into one of the
//! loop's three queues. Events hold only a weak reference to their fire
//! target, so destroying the owning node promptly silences any armed
//! event that has not fired yet.

use crate::exec::event_loop::LoopCore;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// Which queue an event is armed into.
///
/// Depth-first events jump the line: during a fire they are inserted at
/// the front, in arm order, so straight-line continuation chains run
/// without interleaving other work. Breadth-first appends at the tail
/// (explicit yields). Last-queue events run only once both other queues
/// are empty.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum QueueKind {
    DepthFirst,
    BreadthFirst,
    Last,
}

/// What an event does when it fires.
///
/// Implementors are the shared cores of active nodes; `fire` must not be
/// re-entered for the same target while it is running, which the loop's
/// single-threaded dispatch guarantees.
pub(crate) trait Fire: Send + Sync {
    fn fire(&self);
}

#[derive(Debug)]
enum EventState {
    /// Not in any queue.
    Idle,
    /// Linked into exactly one queue; the sequence number validates the
    /// queue entry (stale entries from a disarm are skipped at pop).
    Armed { seq: u64 },
    /// Popped and currently running its target's `fire`.
    Firing,
}

/// A single schedulable event.
///
/// Arming an already-armed event is a no-op that preserves the existing
/// queue position. Disarming is an O(1) state flip; the stale queue
/// entry is discarded when the loop reaches it.
pub(crate) struct Event {
    self_ref: Weak<Event>,
    owner: Arc<LoopCore>,
    target: Weak<dyn Fire>,
    state: Mutex<EventState>,
}

pub(crate) type EventRef = Arc<Event>;

impl Event {
    pub(crate) fn new(owner: &Arc<LoopCore>, target: Weak<dyn Fire>) -> EventRef {
        Arc::new_cyclic(|self_ref| Event {
            self_ref: self_ref.clone(),
            owner: owner.clone(),
            target,
            state: Mutex::new(EventState::Idle),
        })
    }

    /// Insert into the given queue, waking the owning loop if it is
    /// parked. No-op when already armed.
    pub(crate) fn arm(&self, kind: QueueKind) {
        let seq = {
            let mut state = self.state.lock();
            match *state {
                EventState::Armed { .. } => return,
                EventState::Idle | EventState::Firing => {}
            }
            let seq = self.owner.next_seq();
            *state = EventState::Armed { seq };
            seq
        };
        let this = self.self_ref.upgrade().expect("event queued while alive");
        self.owner.enqueue(this, seq, kind);
    }

    /// Cancel a pending arm. Safe to call in any state.
    pub(crate) fn disarm(&self) {
        let mut state = self.state.lock();
        if let EventState::Armed { .. } = *state {
            *state = EventState::Idle;
        }
    }

    /// Validate a popped queue entry and claim it for firing. Returns
    /// false for stale entries (disarmed or re-armed since enqueue).
    pub(crate) fn begin_fire(&self, seq: u64) -> bool {
        let mut state = self.state.lock();
        match *state {
            EventState::Armed { seq: armed } if armed == seq => {
                *state = EventState::Firing;
                true
            }
            _ => false,
        }
    }

    /// Return to idle after a fire, unless the target re-armed itself
    /// from inside its own fire.
    pub(crate) fn end_fire(&self) {
        let mut state = self.state.lock();
        if let EventState::Firing = *state {
            *state = EventState::Idle;
        }
    }

    pub(crate) fn target(&self) -> Option<Arc<dyn Fire>> {
        self.target.upgrade()
    }
}

/// Helper implementing the one-consumer-event readiness protocol shared
/// by every node that signals readiness itself.
///
/// Protocol: the most recent `register` wins; registering `None`
/// detaches; `set_ready` arms the registered event exactly once; a
/// `register` arriving after readiness arms the new event immediately.
///
/// Methods return the event to arm rather than arming it, so callers can
/// release their core lock first. `register`'s return is armed
/// breadth-first (late registration), `set_ready`'s depth-first
/// (continuation of the current callback).
pub(crate) struct OnReadyCell {
    state: CellState,
}

enum CellState {
    Empty,
    Waiting(EventRef),
    Ready,
}

impl OnReadyCell {
    pub(crate) fn new() -> Self {
        Self {
            state: CellState::Empty,
        }
    }

    #[must_use]
    pub(crate) fn register(&mut self, event: Option<EventRef>) -> Option<EventRef> {
        match self.state {
            CellState::Ready => event,
            _ => {
                self.state = match event {
                    Some(ev) => CellState::Waiting(ev),
                    None => CellState::Empty,
                };
                None
            }
        }
    }

    #[must_use]
    pub(crate) fn set_ready(&mut self) -> Option<EventRef> {
        match std::mem::replace(&mut self.state, CellState::Ready) {
            CellState::Waiting(ev) => Some(ev),
            _ => None,
        }
    }

    /// Take a pending registration without marking readiness (used when a
    /// node hands its consumer over to a replacement dependency).
    #[must_use]
    pub(crate) fn take_registration(&mut self) -> Option<EventRef> {
        match std::mem::replace(&mut self.state, CellState::Empty) {
            CellState::Waiting(ev) => Some(ev),
            CellState::Ready => {
                self.state = CellState::Ready;
                None
            }
            CellState::Empty => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::event_loop::EventLoop;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTarget {
        fired: AtomicUsize,
    }

    impl Fire for CountingTarget {
        fn fire(&self) {
            self.fired.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting_event(el: &EventLoop) -> (EventRef, Arc<CountingTarget>) {
        let target = Arc::new(CountingTarget {
            fired: AtomicUsize::new(0),
        });
        let weak: Weak<dyn Fire> = Arc::downgrade(&target) as Weak<dyn Fire>;
        (Event::new(el.core(), weak), target)
    }

    #[test]
    fn test_armed_event_fires_once() {
        let el = EventLoop::new();
        let (ev, target) = counting_event(&el);

        ev.arm(QueueKind::BreadthFirst);
        ev.arm(QueueKind::BreadthFirst); // no-op: already armed

        while el.core().turn() {}
        assert_eq!(target.fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_disarm_prevents_fire() {
        let el = EventLoop::new();
        let (ev, target) = counting_event(&el);

        ev.arm(QueueKind::BreadthFirst);
        ev.disarm();

        while el.core().turn() {}
        assert_eq!(target.fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_rearm_after_disarm_fires_once() {
        let el = EventLoop::new();
        let (ev, target) = counting_event(&el);

        ev.arm(QueueKind::BreadthFirst);
        ev.disarm();
        ev.arm(QueueKind::BreadthFirst);

        while el.core().turn() {}
        assert_eq!(target.fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dead_target_is_skipped() {
        let el = EventLoop::new();
        let (ev, target) = counting_event(&el);

        ev.arm(QueueKind::BreadthFirst);
        drop(target);

        while el.core().turn() {}
        // Nothing to observe beyond not crashing: the weak upgrade fails
        // and the entry is discarded.
    }

    #[test]
    fn test_queue_precedence() {
        // Depth-first runs before breadth-first, breadth before last.
        let el = EventLoop::new();

        struct OrderTarget {
            order: Mutex<Vec<&'static str>>,
        }
        let order = Arc::new(OrderTarget {
            order: Mutex::new(Vec::new()),
        });

        struct Tag {
            name: &'static str,
            sink: Arc<OrderTarget>,
        }
        impl Fire for Tag {
            fn fire(&self) {
                self.sink.order.lock().push(self.name);
            }
        }

        let tags: Vec<Arc<Tag>> = ["last", "breadth", "depth"]
            .into_iter()
            .map(|name| {
                Arc::new(Tag {
                    name,
                    sink: order.clone(),
                })
            })
            .collect();

        let events: Vec<EventRef> = tags
            .iter()
            .map(|t| Event::new(el.core(), Arc::downgrade(t) as Weak<dyn Fire>))
            .collect();

        events[0].arm(QueueKind::Last);
        events[1].arm(QueueKind::BreadthFirst);
        events[2].arm(QueueKind::DepthFirst);

        while el.core().turn() {}
        assert_eq!(*order.order.lock(), vec!["depth", "breadth", "last"]);
    }

    #[test]
    fn test_on_ready_cell_protocol() {
        let el = EventLoop::new();
        let (ev1, _t1) = counting_event(&el);
        let (ev2, t2) = counting_event(&el);

        let mut cell = OnReadyCell::new();

        // Replacement before readiness discards the old event.
        assert!(cell.register(Some(ev1)).is_none());
        assert!(cell.register(Some(ev2)).is_none());

        let armed = cell.set_ready().expect("event to arm");
        armed.arm(QueueKind::DepthFirst);
        while el.core().turn() {}
        assert_eq!(t2.fired.load(Ordering::SeqCst), 1);

        // Registration after readiness arms immediately.
        let (ev3, t3) = counting_event(&el);
        let late = cell.register(Some(ev3)).expect("late registration arms");
        late.arm(QueueKind::BreadthFirst);
        while el.core().turn() {}
        assert_eq!(t3.fired.load(Ordering::SeqCst), 1);
    }
}
