use guard_core::{secs_to_ms, BackoffPolicy, EpochMs, RetrySchedule, TransportError};

/// Outcome of one failed delivery attempt.
/// This stays pure and testable; the worker applies it to storage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfterSecs(u64),
    Fail { reason: String },
}

/// `attempts_after` is the attempt count including the one that just failed.
///
/// - Rejected: fail now, resending cannot help
/// - Unreachable: back off until more than `max_attempts` tries have failed
pub fn decide_retry(
    err: &TransportError,
    attempts_after: u32,
    max_attempts: u32,
    policy: &BackoffPolicy,
) -> RetryDecision {
    match err {
        TransportError::Rejected(msg) => RetryDecision::Fail { reason: format!("rejected by remote: {msg}") },
        TransportError::Unreachable(msg) if attempts_after > max_attempts => RetryDecision::Fail {
            reason: format!("gave up after {attempts_after} attempts: {msg}"),
        },
        TransportError::Unreachable(_) => RetryDecision::RetryAfterSecs(policy.delay_secs(attempts_after)),
    }
}

pub fn retry_schedule(attempts_after: u32, delay_secs: u64, now: EpochMs) -> RetrySchedule {
    RetrySchedule { attempts: attempts_after, last_attempt_at: now, next_attempt_at: now + secs_to_ms(delay_secs) }
}
