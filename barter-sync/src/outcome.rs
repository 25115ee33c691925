use crate::error::SyncError;

/// Settlement of a coordinated load. Exactly one is delivered per
/// [`RequestCoordinator::issue`](crate::coordinator::RequestCoordinator::issue) call.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Success(T),
    /// Superseded by a newer request in the same scope, or explicitly cancelled.
    Cancelled,
    /// Did not settle before the scope timeout.
    Timeout,
    Failure(SyncError),
}

impl<T> Outcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled)
    }

    /// Timeout and Failure count against the circuit breaker, Cancelled never does.
    pub fn counts_as_failure(&self) -> bool {
        matches!(self, Outcome::Timeout | Outcome::Failure(_))
    }

    pub fn success(self) -> Option<T> {
        match self {
            Outcome::Success(value) => Some(value),
            _ => None,
        }
    }

    pub fn map<U, F>(self, op: F) -> Outcome<U>
    where
        F: FnOnce(T) -> U,
    {
        match self {
            Outcome::Success(value) => Outcome::Success(op(value)),
            Outcome::Cancelled => Outcome::Cancelled,
            Outcome::Timeout => Outcome::Timeout,
            Outcome::Failure(error) => Outcome::Failure(error),
        }
    }

    /// Short label used in log fields.
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success(_) => "success",
            Outcome::Cancelled => "cancelled",
            Outcome::Timeout => "timeout",
            Outcome::Failure(_) => "failure",
        }
    }
}

impl<T> From<Result<T, SyncError>> for Outcome<T> {
    fn from(value: Result<T, SyncError>) -> Self {
        match value {
            Ok(value) => Outcome::Success(value),
            Err(error) => Outcome::Failure(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_as_failure() {
        assert!(!Outcome::Success(1).counts_as_failure());
        assert!(!Outcome::<u8>::Cancelled.counts_as_failure());
        assert!(Outcome::<u8>::Timeout.counts_as_failure());
        assert!(Outcome::<u8>::Failure(SyncError::Parse("eof".to_string())).counts_as_failure());
    }

    #[test]
    fn test_map_preserves_non_success() {
        assert_eq!(Outcome::Success(2).map(|v| v * 10), Outcome::Success(20));
        assert_eq!(Outcome::<i32>::Timeout.map(|v| v * 10), Outcome::Timeout);
        assert_eq!(Outcome::<i32>::Cancelled.map(|v| v * 10), Outcome::Cancelled);
    }
}
