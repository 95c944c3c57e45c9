//! Backoff policy for inline delivery retries.
//!
//! A rule's `retryCount` bounds the retries after the first attempt and its
//! `retryStrategy` shapes the delay. A `Retry-After` hint from the target
//! replaces the computed delay but is still capped.

use std::time::Duration;

use conduit_core::models::{IntegrationRule, RetryStrategy};
use rand::Rng;

use crate::error::DeliveryError;

/// Backoff settings shared by every rule; the strategy and budget come from
/// the rule itself.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    /// Delay unit for all strategies.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Jitter fraction in `[0, 1]`.
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            jitter_factor: 0.2,
        }
    }
}

/// Retry policy for one rule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay curve.
    pub strategy: RetryStrategy,
    /// Delay bounds and jitter.
    pub backoff: BackoffConfig,
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep, then try again.
    Retry {
        /// Delay before the next attempt
        delay: Duration,
    },
    /// The error is permanent.
    Fail,
    /// Retryable, but the budget is spent.
    Exhausted,
}

impl RetryPolicy {
    /// Policy for `rule` under the shared backoff settings.
    pub fn for_rule(rule: &IntegrationRule, backoff: BackoffConfig) -> Self {
        Self { max_retries: rule.retry_count, strategy: rule.retry_strategy, backoff }
    }

    /// Decides after `attempt` (1-based) failed with `error`.
    pub fn decide(&self, attempt: u32, error: &DeliveryError) -> RetryDecision {
        if !error.is_retryable() {
            return RetryDecision::Fail;
        }
        if attempt > self.max_retries {
            return RetryDecision::Exhausted;
        }

        let delay = match error.retry_after() {
            Some(hint) => hint.min(self.backoff.max_delay),
            None => self.delay_for(attempt),
        };
        RetryDecision::Retry { delay }
    }

    /// Jittered delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let capped = self.base_delay_for(retry).min(self.backoff.max_delay);
        apply_jitter(capped, self.backoff.jitter_factor).min(self.backoff.max_delay)
    }

    /// Delay before jitter and cap.
    ///
    /// FIXED is `base`, LINEAR is `base * retry`, EXPONENTIAL is
    /// `base * 2^(retry - 1)`.
    fn base_delay_for(&self, retry: u32) -> Duration {
        let base = self.backoff.base_delay;
        let retry = retry.max(1);
        match self.strategy {
            RetryStrategy::Fixed => base,
            RetryStrategy::Linear => base.saturating_mul(retry),
            RetryStrategy::Exponential => {
                let exponent = (retry - 1).min(20);
                base.saturating_mul(2_u32.saturating_pow(exponent))
            },
        }
    }
}

/// Randomizes `duration` by up to `±jitter_factor`.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 || duration.is_zero() {
        return duration;
    }

    let range = duration.as_secs_f64() * jitter_factor.clamp(0.0, 1.0);
    let offset = rand::rng().random_range(-range..=range);
    Duration::from_secs_f64((duration.as_secs_f64() + offset).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(strategy: RetryStrategy) -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            strategy,
            backoff: BackoffConfig {
                base_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(60),
                jitter_factor: 0.0,
            },
        }
    }

    fn timeout() -> DeliveryError {
        DeliveryError::Timeout { timeout_ms: 100 }
    }

    #[test]
    fn exponential_doubles() {
        let p = policy(RetryStrategy::Exponential);
        let delays: Vec<_> = (1..=4).map(|r| p.delay_for(r).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16]);
    }

    #[test]
    fn linear_grows_by_base() {
        let p = policy(RetryStrategy::Linear);
        let delays: Vec<_> = (1..=4).map(|r| p.delay_for(r).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 6, 8]);
    }

    #[test]
    fn fixed_stays_constant() {
        let p = policy(RetryStrategy::Fixed);
        assert!((1..=4).all(|r| p.delay_for(r) == Duration::from_secs(2)));
    }

    #[test]
    fn delays_are_capped() {
        let p = policy(RetryStrategy::Exponential);
        assert_eq!(p.delay_for(30), Duration::from_secs(60));
    }

    #[test]
    fn budget_counts_retries_after_the_first_attempt() {
        let p = policy(RetryStrategy::Fixed);

        assert!(matches!(p.decide(1, &timeout()), RetryDecision::Retry { .. }));
        assert!(matches!(p.decide(3, &timeout()), RetryDecision::Retry { .. }));
        assert_eq!(p.decide(4, &timeout()), RetryDecision::Exhausted);
    }

    #[test]
    fn permanent_errors_fail_immediately() {
        let p = policy(RetryStrategy::Fixed);
        let err = DeliveryError::Client { status_code: 400, body: String::new() };

        assert_eq!(p.decide(1, &err), RetryDecision::Fail);
    }

    #[test]
    fn retry_after_overrides_backoff() {
        let p = policy(RetryStrategy::Exponential);
        let hinted = DeliveryError::RateLimited {
            retry_after: Some(Duration::from_secs(7)),
            body: String::new(),
        };
        let huge = DeliveryError::RateLimited {
            retry_after: Some(Duration::from_secs(3600)),
            body: String::new(),
        };

        assert_eq!(p.decide(1, &hinted), RetryDecision::Retry { delay: Duration::from_secs(7) });
        assert_eq!(p.decide(1, &huge), RetryDecision::Retry { delay: Duration::from_secs(60) });
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let base = Duration::from_secs(10);
        let mut seen = std::collections::HashSet::new();

        for _ in 0..20 {
            let jittered = apply_jitter(base, 0.5);
            assert!(jittered >= Duration::from_secs(5));
            assert!(jittered <= Duration::from_secs(15));
            seen.insert(jittered.as_millis());
        }

        assert!(seen.len() > 1, "jitter should create variation");
    }
}
