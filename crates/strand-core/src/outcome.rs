//! Result carrier moved through the promise graph

use crate::failure::Failure;

/// The settled result of a node: a value, a failure, or both.
///
/// Both slots may be occupied when a stage partially succeeded — a
/// continuation produced a value and a later step failed. In that case
/// the value is still delivered and the failure rides along on the
/// recoverable channel (`Promise::wait_outcome` exposes it). An outcome
/// with neither slot occupied must never reach a consumer.
#[derive(Debug, Clone)]
pub struct Outcome<T> {
    value: Option<T>,
    failure: Option<Failure>,
}

impl<T> Outcome<T> {
    /// Successful outcome.
    pub fn from_value(value: T) -> Self {
        Self {
            value: Some(value),
            failure: None,
        }
    }

    /// Failed outcome.
    pub fn from_failure(failure: Failure) -> Self {
        Self {
            value: None,
            failure: Some(failure),
        }
    }

    /// Partial success: a value plus a failure on the recoverable channel.
    pub fn from_parts(value: T, failure: Failure) -> Self {
        Self {
            value: Some(value),
            failure: Some(failure),
        }
    }

    /// Reassemble from raw slots. Internal: producers must not build the
    /// empty-empty combination.
    pub(crate) fn from_slots(value: Option<T>, failure: Option<Failure>) -> Self {
        Self { value, failure }
    }

    /// Attach a failure unless one is already present (the first failure
    /// wins). An existing value is left in place.
    pub fn add_failure(&mut self, failure: Failure) {
        if self.failure.is_none() {
            self.failure = Some(failure);
        }
    }

    /// The value slot.
    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    /// The failure slot.
    pub fn failure(&self) -> Option<&Failure> {
        self.failure.as_ref()
    }

    /// Split into both slots.
    pub fn into_parts(self) -> (Option<T>, Option<Failure>) {
        (self.value, self.failure)
    }

    /// Collapse to a `Result`, failure taking precedence.
    ///
    /// A partial-success outcome maps to `Err`; callers that want the
    /// delivered value alongside the recoverable failure use
    /// `into_parts` instead.
    ///
    /// # Panics
    ///
    /// Panics if neither slot is occupied. An empty outcome reaching a
    /// consumer means the graph's readiness protocol was violated.
    pub fn into_result(self) -> Result<T, Failure> {
        match (self.value, self.failure) {
            (_, Some(failure)) => Err(failure),
            (Some(value), None) => Ok(value),
            (None, None) => panic!("promise settled with neither value nor failure"),
        }
    }

    /// Map the value slot, leaving any failure untouched.
    pub fn map_value<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        Outcome {
            value: self.value.map(f),
            failure: self.failure,
        }
    }
}

impl<T> From<Result<T, Failure>> for Outcome<T> {
    fn from(result: Result<T, Failure>) -> Self {
        match result {
            Ok(value) => Outcome::from_value(value),
            Err(failure) => Outcome::from_failure(failure),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_outcome() {
        let out = Outcome::from_value(42);
        assert_eq!(out.value(), Some(&42));
        assert!(out.failure().is_none());
        assert_eq!(out.into_result().unwrap(), 42);
    }

    #[test]
    fn test_failure_outcome() {
        let out: Outcome<i32> = Outcome::from_failure(Failure::failed("boom"));
        assert!(out.value().is_none());
        let err = out.into_result().unwrap_err();
        assert_eq!(err.message, "boom");
    }

    #[test]
    fn test_first_failure_wins() {
        let mut out: Outcome<i32> = Outcome::from_failure(Failure::failed("first"));
        out.add_failure(Failure::failed("second"));
        assert_eq!(out.failure().unwrap().message, "first");
    }

    #[test]
    fn test_partial_success() {
        let out = Outcome::from_parts(7, Failure::failed("late"));
        let (value, failure) = out.into_parts();
        assert_eq!(value, Some(7));
        assert_eq!(failure.unwrap().message, "late");
    }

    #[test]
    fn test_partial_success_result_prefers_failure() {
        let out = Outcome::from_parts(7, Failure::failed("late"));
        assert!(out.into_result().is_err());
    }

    #[test]
    #[should_panic(expected = "neither value nor failure")]
    fn test_empty_outcome_panics() {
        let out: Outcome<i32> = Outcome {
            value: None,
            failure: None,
        };
        let _ = out.into_result();
    }
}
