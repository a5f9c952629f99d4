//! Leaf nodes: already-settled values, failures, and yields

use crate::exec::event::{EventRef, QueueKind};
use crate::failure::Failure;
use crate::node::PromiseNode;
use crate::outcome::Outcome;

/// A node that is ready from construction with a stored value.
///
/// Registration arms the consumer's event through the breadth-first
/// queue, so an already-settled promise still defers its continuation to
/// the loop rather than running it on the registrant's stack.
pub(crate) struct ImmediateNode<T> {
    outcome: Option<Outcome<T>>,
}

impl<T> ImmediateNode<T> {
    pub(crate) fn new(value: T) -> Self {
        Self {
            outcome: Some(Outcome::from_value(value)),
        }
    }
}

impl<T: Send + 'static> PromiseNode<T> for ImmediateNode<T> {
    fn on_ready(&mut self, event: Option<EventRef>) {
        if let Some(event) = event {
            event.arm(QueueKind::BreadthFirst);
        }
    }

    fn get(&mut self) -> Outcome<T> {
        self.outcome.take().expect("immediate node consumed twice")
    }
}

/// A node that is ready from construction with a stored failure.
pub(crate) struct BrokenNode {
    failure: Option<Failure>,
}

impl BrokenNode {
    pub(crate) fn new(failure: Failure) -> Self {
        Self {
            failure: Some(failure),
        }
    }
}

impl<T: Send + 'static> PromiseNode<T> for BrokenNode {
    fn on_ready(&mut self, event: Option<EventRef>) {
        if let Some(event) = event {
            event.arm(QueueKind::BreadthFirst);
        }
    }

    fn get(&mut self) -> Outcome<T> {
        Outcome::from_failure(self.failure.take().expect("broken node consumed twice"))
    }
}

/// A node that never becomes ready. Waiting on it parks forever;
/// useful as the quiet half of an exclusive join.
pub(crate) struct NeverNode;

impl<T: Send + 'static> PromiseNode<T> for NeverNode {
    fn on_ready(&mut self, _event: Option<EventRef>) {}

    fn get(&mut self) -> Outcome<T> {
        unreachable!("a never-done node cannot become ready")
    }
}

/// Ready immediately, but arms through the breadth-first tail (or the
/// last queue), letting everything already scheduled run first. This is
/// the primitive behind explicit yields and `eval_later` / `eval_last`.
pub(crate) struct YieldNode {
    queue: QueueKind,
}

impl YieldNode {
    pub(crate) fn breadth() -> Self {
        Self {
            queue: QueueKind::BreadthFirst,
        }
    }

    pub(crate) fn last() -> Self {
        Self {
            queue: QueueKind::Last,
        }
    }
}

impl PromiseNode<()> for YieldNode {
    fn on_ready(&mut self, event: Option<EventRef>) {
        if let Some(event) = event {
            event.arm(self.queue);
        }
    }

    fn get(&mut self) -> Outcome<()> {
        Outcome::from_value(())
    }
}
