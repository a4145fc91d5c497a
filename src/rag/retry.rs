//! Retry policies for calls whose failures may be transient.
//!
//! A policy only decides; the caller owns the loop. Attempts are counted
//! from 1, so `attempt` is the number of calls already made.

use crate::error::RagError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    GiveUp,
}

pub trait RetryPolicy: Send + Sync {
    fn decide(&self, attempt: u32, error: &RagError) -> RetryDecision;

    /// Upper bound on calls, for log messages.
    fn max_attempts(&self) -> u32;
}

/// Retries malformed model output until `max_attempts` calls have been
/// made. Every other error gives up immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MalformedOutputRetry {
    max_attempts: u32,
}

impl MalformedOutputRetry {
    /// `max_attempts` below 1 is raised to 1: the call is always made once.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }
}

impl RetryPolicy for MalformedOutputRetry {
    fn decide(&self, attempt: u32, error: &RagError) -> RetryDecision {
        match error {
            RagError::MalformedExpansionOutput { .. } if attempt < self.max_attempts => {
                RetryDecision::Retry
            }
            _ => RetryDecision::GiveUp,
        }
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn malformed() -> RagError {
        RagError::MalformedExpansionOutput {
            message: "expected value at line 1".to_string(),
        }
    }

    #[test]
    fn test_retries_malformed_until_bound() {
        let policy = MalformedOutputRetry::new(3);
        assert_eq!(policy.decide(1, &malformed()), RetryDecision::Retry);
        assert_eq!(policy.decide(2, &malformed()), RetryDecision::Retry);
        assert_eq!(policy.decide(3, &malformed()), RetryDecision::GiveUp);
    }

    #[test]
    fn test_remote_errors_are_not_retried() {
        let policy = MalformedOutputRetry::new(5);
        let err = RagError::inference("AccessDeniedException");
        assert_eq!(policy.decide(1, &err), RetryDecision::GiveUp);
    }

    #[test]
    fn test_zero_bound_means_single_attempt() {
        let policy = MalformedOutputRetry::new(0);
        assert_eq!(policy.max_attempts(), 1);
        assert_eq!(policy.decide(1, &malformed()), RetryDecision::GiveUp);
    }
}
