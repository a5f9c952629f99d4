//! Passive pass-through nodes: transform and attachment
//!
//! Neither owns an event. Registration forwards to the dependency, so
//! the consumer's event ends up armed by whichever leaf actually settles;
//! the continuation then runs inside `get`, on the loop with no user code
//! below it on the stack.

use crate::exec::event::EventRef;
use crate::node::{NodeBox, PromiseNode};
use crate::outcome::Outcome;

/// Applies a continuation to the dependency's settled outcome.
///
/// One node type backs every `then`-family combinator: the caller wraps
/// its success / error continuations into a single
/// `Outcome<T> -> Outcome<U>` closure.
///
/// Field order matters: the dependency must drop before the continuation,
/// because continuations commonly own objects the dependency still
/// references.
pub(crate) struct TransformNode<T, U, F>
where
    F: FnOnce(Outcome<T>) -> Outcome<U>,
{
    dep: NodeBox<T>,
    op: Option<F>,
}

impl<T, U, F> TransformNode<T, U, F>
where
    F: FnOnce(Outcome<T>) -> Outcome<U>,
{
    pub(crate) fn new(dep: NodeBox<T>, op: F) -> Self {
        Self { dep, op: Some(op) }
    }
}

impl<T, U, F> PromiseNode<U> for TransformNode<T, U, F>
where
    T: Send + 'static,
    U: Send + 'static,
    F: FnOnce(Outcome<T>) -> Outcome<U> + Send + 'static,
{
    fn on_ready(&mut self, event: Option<EventRef>) {
        self.dep.on_ready(event);
    }

    fn get(&mut self) -> Outcome<U> {
        let input = self.dep.get();
        let op = self.op.take().expect("transform consumed twice");
        op(input)
    }
}

/// Keeps an auxiliary value alive for as long as the dependency runs,
/// forwarding readiness and result untouched.
///
/// The dependency field precedes the attachment so it drops first: work
/// still in flight during cancellation may reference the attachment.
pub(crate) struct AttachmentNode<T, A> {
    dep: NodeBox<T>,
    _attachment: A,
}

impl<T, A> AttachmentNode<T, A> {
    pub(crate) fn new(dep: NodeBox<T>, attachment: A) -> Self {
        Self {
            dep,
            _attachment: attachment,
        }
    }
}

impl<T, A> PromiseNode<T> for AttachmentNode<T, A>
where
    T: Send + 'static,
    A: Send + 'static,
{
    fn on_ready(&mut self, event: Option<EventRef>) {
        self.dep.on_ready(event);
    }

    fn get(&mut self) -> Outcome<T> {
        self.dep.get()
    }
}
