//! External producers: the adapter node and its fulfiller
//!
//! The adapter exposes a `Fulfiller` handle to code outside the graph.
//! The handle is weak in both directions: dropping the promise detaches
//! the fulfiller (its settles become no-ops), and dropping the fulfiller
//! unsettled rejects the promise automatically. Between the promise's
//! strong reference and the fulfiller's weak one, the effective
//! reference count never exceeds two.

use crate::exec::event::{EventRef, OnReadyCell, QueueKind};
use crate::failure::Failure;
use crate::node::PromiseNode;
use crate::outcome::Outcome;
use crate::promise::Promise;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

struct AdapterCore<T> {
    waiting: bool,
    outcome: Option<Outcome<T>>,
    consumer: OnReadyCell,
}

struct AdapterNode<T> {
    core: Arc<Mutex<AdapterCore<T>>>,
}

impl<T: Send + 'static> PromiseNode<T> for AdapterNode<T> {
    fn on_ready(&mut self, event: Option<EventRef>) {
        let armed = self.core.lock().consumer.register(event);
        if let Some(event) = armed {
            event.arm(QueueKind::BreadthFirst);
        }
    }

    fn get(&mut self) -> Outcome<T> {
        let mut core = self.core.lock();
        assert!(!core.waiting, "adapter consumed before settlement");
        core.outcome
            .take()
            .expect("adapter consumed twice")
    }
}

/// External capability to settle a promise. The first settle wins;
/// every later call is a no-op.
pub struct Fulfiller<T> {
    core: Weak<Mutex<AdapterCore<T>>>,
}

impl<T: Send + 'static> Fulfiller<T> {
    /// Settle with a value.
    pub fn fulfill(&self, value: T) {
        self.settle(Outcome::from_value(value));
    }

    /// Settle with a failure.
    pub fn reject(&self, failure: Failure) {
        self.settle(Outcome::from_failure(failure));
    }

    /// Fulfill on `Ok`, reject on `Err`. Returns true when the result
    /// was a value.
    pub fn reject_if_err(&self, result: Result<T, Failure>) -> bool {
        match result {
            Ok(value) => {
                self.fulfill(value);
                true
            }
            Err(failure) => {
                self.reject(failure);
                false
            }
        }
    }

    /// True while the promise is alive and unsettled. A false return
    /// means further work on behalf of this fulfiller is wasted.
    pub fn is_waiting(&self) -> bool {
        match self.core.upgrade() {
            Some(core) => core.lock().waiting,
            None => false,
        }
    }

    fn settle(&self, outcome: Outcome<T>) {
        let Some(core) = self.core.upgrade() else {
            return;
        };
        let armed = {
            let mut core = core.lock();
            if !core.waiting {
                return;
            }
            core.waiting = false;
            core.outcome = Some(outcome);
            core.consumer.set_ready()
        };
        if let Some(event) = armed {
            event.arm(QueueKind::DepthFirst);
        }
    }
}

impl<T> Drop for Fulfiller<T> {
    fn drop(&mut self) {
        let Some(core) = self.core.upgrade() else {
            return;
        };
        let armed = {
            let mut core = core.lock();
            if !core.waiting {
                return;
            }
            core.waiting = false;
            core.outcome = Some(Outcome::from_failure(Failure::broken_fulfiller()));
            core.consumer.set_ready()
        };
        if let Some(event) = armed {
            event.arm(QueueKind::DepthFirst);
        }
    }
}

/// A promise settled from outside the graph, plus its settling handle.
pub fn promise_and_fulfiller<T: Send + 'static>() -> (Promise<T>, Fulfiller<T>) {
    let core = Arc::new(Mutex::new(AdapterCore {
        waiting: true,
        outcome: None,
        consumer: OnReadyCell::new(),
    }));
    let fulfiller = Fulfiller {
        core: Arc::downgrade(&core),
    };
    (Promise::from_node(Box::new(AdapterNode { core })), fulfiller)
}
