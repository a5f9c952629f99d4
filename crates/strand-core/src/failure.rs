//! Failure values carried through the promise graph

use std::fmt;

/// Broad classification of a failure, used by callers to decide how to
/// react (retry, surface, give up).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// Ordinary failure; something went wrong in application logic.
    Failed,

    /// The other side of a connection, or the target event loop, went away.
    Disconnected,

    /// The system is too busy to take on the work.
    Overloaded,

    /// The requested operation is not implemented.
    Unimplemented,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::Failed => "failed",
            FailureKind::Disconnected => "disconnected",
            FailureKind::Overloaded => "overloaded",
            FailureKind::Unimplemented => "unimplemented",
        };
        f.write_str(name)
    }
}

/// A failure flowing through the promise graph.
///
/// Failures propagate from a failed dependency into every consumer's
/// result until an error continuation recovers them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Failure {
    /// Classification of the failure.
    pub kind: FailureKind,

    /// Human-readable description.
    pub message: String,
}

impl Failure {
    /// Create a failure with an explicit kind.
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Ordinary failure.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Failed, message)
    }

    /// The peer (or target loop) went away.
    pub fn disconnected(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Disconnected, message)
    }

    /// The system is overloaded.
    pub fn overloaded(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Overloaded, message)
    }

    /// The operation is not implemented.
    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Unimplemented, message)
    }

    /// True if this failure carries the `Disconnected` kind.
    pub fn is_disconnected(&self) -> bool {
        self.kind == FailureKind::Disconnected
    }

    /// Failure raised when a fulfiller is dropped without settling its
    /// promise.
    pub(crate) fn broken_fulfiller() -> Self {
        Self::failed("fulfiller was dropped without settling the promise")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_display() {
        let f = Failure::failed("boom");
        assert_eq!(f.to_string(), "failed: boom");

        let f = Failure::disconnected("loop exited");
        assert_eq!(f.to_string(), "disconnected: loop exited");
    }

    #[test]
    fn test_failure_kind_predicates() {
        assert!(Failure::disconnected("x").is_disconnected());
        assert!(!Failure::failed("x").is_disconnected());
        assert!(!Failure::overloaded("x").is_disconnected());
        assert!(!Failure::unimplemented("x").is_disconnected());
    }

    #[test]
    fn test_broken_fulfiller_kind() {
        let f = Failure::broken_fulfiller();
        assert_eq!(f.kind, FailureKind::Failed);
        assert!(f.message.contains("without settling"));
    }
}
