//! Retry and backoff policy applied after every agent attempt.
//!
//! Four cases are kept apart: finished work, a rate-limit notice (always waited
//! out, never counted), a clean exit with unfinished work (`retry_count`), and a
//! nonzero exit (`error_retry_count`). The two ceilings are independent.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::core::types::{ExitCode, FailureReason, RateLimitHit};

/// Ceilings and rate-limit timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Work-incomplete ceiling; 0 means unlimited.
    pub max_retries: u32,
    /// Agent-error ceiling; 0 means no retry.
    pub max_error_retries: u32,
    /// Extra wait past a parsed reset time.
    pub rate_limit_margin: Duration,
    /// Wait used when the reset time could not be parsed.
    pub rate_limit_fallback: Duration,
}

/// Counters persisted with the active job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryCounters {
    pub retry_count: u32,
    pub error_retry_count: u32,
}

/// What the supervisor observed about one finished attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    pub exit: ExitCode,
    /// The attempt achieved what it was started for.
    pub finished: bool,
    pub rate_limit: Option<RateLimitHit>,
    /// A clean exit without `finished` ends the job instead of retrying.
    pub unfinished_is_final: Option<FailureReason>,
}

/// Next step after an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Attempt succeeded; advance to the next pass or finalize as success.
    Advance,
    /// Sleep until the instant, then rerun the same attempt (counters untouched).
    WaitUntil(DateTime<Utc>),
    /// Rerun the same attempt now (a counter was incremented).
    Retry,
    /// Finalize as failure.
    Fail(FailureReason),
}

impl RetryPolicy {
    /// Classify an attempt, updating `counters` when a retry is charged.
    pub fn decide(
        &self,
        attempt: &Attempt,
        counters: &mut RetryCounters,
        now: DateTime<Utc>,
    ) -> Decision {
        if attempt.exit == ExitCode::Success && attempt.finished {
            return Decision::Advance;
        }
        if let Some(hit) = attempt.rate_limit {
            return Decision::WaitUntil(self.resume_at(hit, now));
        }
        match attempt.exit {
            ExitCode::Success => {
                if let Some(reason) = attempt.unfinished_is_final {
                    return Decision::Fail(reason);
                }
                counters.retry_count += 1;
                if self.max_retries == 0 || counters.retry_count <= self.max_retries {
                    Decision::Retry
                } else {
                    Decision::Fail(FailureReason::MaxRetriesReached)
                }
            }
            ExitCode::Failure(_) => {
                counters.error_retry_count += 1;
                if counters.error_retry_count <= self.max_error_retries {
                    Decision::Retry
                } else {
                    Decision::Fail(FailureReason::Errored)
                }
            }
        }
    }

    /// Instant at which a rate-limited attempt may be rerun.
    pub fn resume_at(&self, hit: RateLimitHit, now: DateTime<Utc>) -> DateTime<Utc> {
        match hit.reset_at {
            Some(reset) => (reset + to_chrono(self.rate_limit_margin)).max(now),
            None => now + to_chrono(self.rate_limit_fallback),
        }
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn policy(max_retries: u32, max_error_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            max_error_retries,
            rate_limit_margin: Duration::from_secs(60),
            rate_limit_fallback: Duration::from_secs(1800),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, 3, 0, 0).single().expect("time")
    }

    fn attempt(exit: ExitCode, finished: bool) -> Attempt {
        Attempt {
            exit,
            finished,
            rate_limit: None,
            unfinished_is_final: None,
        }
    }

    #[test]
    fn finished_clean_exit_advances() {
        let mut counters = RetryCounters::default();
        let decision = policy(3, 2).decide(&attempt(ExitCode::Success, true), &mut counters, now());
        assert_eq!(decision, Decision::Advance);
        assert_eq!(counters, RetryCounters::default());
    }

    #[test]
    fn error_ceiling_allows_exactly_that_many_restarts() {
        let policy = policy(3, 3);
        let mut counters = RetryCounters::default();
        let errored = attempt(ExitCode::Failure(Some(1)), false);
        let decisions: Vec<Decision> = (0..4)
            .map(|_| policy.decide(&errored, &mut counters, now()))
            .collect();
        assert_eq!(
            decisions,
            vec![
                Decision::Retry,
                Decision::Retry,
                Decision::Retry,
                Decision::Fail(FailureReason::Errored)
            ]
        );
        assert_eq!(counters.error_retry_count, 4);
        assert_eq!(counters.retry_count, 0);
    }

    #[test]
    fn zero_error_ceiling_means_no_retry() {
        let mut counters = RetryCounters::default();
        let decision = policy(3, 0).decide(
            &attempt(ExitCode::Failure(Some(2)), false),
            &mut counters,
            now(),
        );
        assert_eq!(decision, Decision::Fail(FailureReason::Errored));
    }

    #[test]
    fn zero_retry_ceiling_means_unlimited() {
        let policy = policy(0, 0);
        let mut counters = RetryCounters::default();
        for _ in 0..50 {
            let decision = policy.decide(&attempt(ExitCode::Success, false), &mut counters, now());
            assert_eq!(decision, Decision::Retry);
        }
        assert_eq!(counters.retry_count, 50);
    }

    #[test]
    fn incomplete_ceiling_fails_with_max_retries() {
        let policy = policy(1, 0);
        let mut counters = RetryCounters::default();
        let incomplete = attempt(ExitCode::Success, false);
        assert_eq!(policy.decide(&incomplete, &mut counters, now()), Decision::Retry);
        assert_eq!(
            policy.decide(&incomplete, &mut counters, now()),
            Decision::Fail(FailureReason::MaxRetriesReached)
        );
    }

    #[test]
    fn rate_limit_waits_past_reset_without_counting() {
        let reset = now() + chrono::Duration::hours(2);
        let mut counters = RetryCounters::default();
        let mut limited = attempt(ExitCode::Failure(Some(1)), false);
        limited.rate_limit = Some(RateLimitHit {
            reset_at: Some(reset),
        });
        let decision = policy(3, 0).decide(&limited, &mut counters, now());
        assert_eq!(
            decision,
            Decision::WaitUntil(reset + chrono::Duration::seconds(60))
        );
        assert_eq!(counters, RetryCounters::default());
    }

    #[test]
    fn rate_limit_without_reset_uses_fallback() {
        let mut counters = RetryCounters::default();
        let mut limited = attempt(ExitCode::Success, false);
        limited.rate_limit = Some(RateLimitHit { reset_at: None });
        let decision = policy(3, 2).decide(&limited, &mut counters, now());
        assert_eq!(
            decision,
            Decision::WaitUntil(now() + chrono::Duration::seconds(1800))
        );
    }

    #[test]
    fn unfinished_final_attempt_fails_without_retry() {
        let mut counters = RetryCounters::default();
        let mut last_pass = attempt(ExitCode::Success, false);
        last_pass.unfinished_is_final = Some(FailureReason::MarkerMissing);
        let decision = policy(3, 2).decide(&last_pass, &mut counters, now());
        assert_eq!(decision, Decision::Fail(FailureReason::MarkerMissing));
        assert_eq!(counters.retry_count, 0);
    }
}
