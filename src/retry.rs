use std::time::Duration;

/// Upstream `Retry-After` hints are honoured up to this multiple of the cap.
const RETRY_AFTER_CEILING: u32 = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl RetryPolicy {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(*self)
    }
}

/// Exponential backoff as an explicit state machine: each call to
/// [`Backoff::next_delay`] consumes one retry and yields the delay to wait
/// before it, until the policy's retry budget is spent.
#[derive(Clone, Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    retries: u32,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, retries: 0 }
    }

    /// `retry_after` is the upstream's own hint (e.g. from a 429); it is
    /// honoured when longer than the computed delay, up to four times the cap.
    pub fn next_delay(&mut self, retry_after: Option<Duration>) -> Option<Duration> {
        if self.retries >= self.policy.max_retries {
            return None;
        }
        let factor = 2u32.saturating_pow(self.retries);
        let delay = self.policy.base.saturating_mul(factor).min(self.policy.cap);
        self.retries += 1;
        Some(match retry_after {
            Some(hint) => hint
                .min(self.policy.cap.saturating_mul(RETRY_AFTER_CEILING))
                .max(delay),
            None => delay,
        })
    }

    /// Attempts made so far, counting the initial one.
    pub fn attempts(&self) -> u32 {
        self.retries + 1
    }
}
