use std::time::Duration;

/// How the transport paces connection attempts.
///
/// The first attempt after an open channel closes is immediate, provided the
/// channel stayed open for at least `min_uptime`. Shorter sessions count as
/// failed attempts. Failed attempts back off exponentially; once
/// `max_attempts` consecutive attempts have failed the transport waits out
/// `cooldown` and starts counting again, so a closed channel is always
/// eventually retried.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// `None` disables the cooldown.
    pub max_attempts: Option<u32>,
    pub cooldown: Duration,
    pub min_uptime: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            max_attempts: Some(5),
            cooldown: Duration::from_secs(30),
            min_uptime: Duration::from_secs(1),
        }
    }
}

impl ReconnectPolicy {
    /// Retry straight away forever.
    pub fn immediate() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            max_attempts: None,
            cooldown: Duration::ZERO,
            min_uptime: Duration::ZERO,
        }
    }

    /// Delay after the `failures`-th consecutive failed attempt (1-based).
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(failures - 1).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[derive(Debug)]
pub(crate) struct Backoff {
    policy: ReconnectPolicy,
    failures: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Wait {
    Retry(Duration),
    Cooldown(Duration),
}

impl Wait {
    pub(crate) fn duration(self) -> Duration {
        match self {
            Wait::Retry(delay) | Wait::Cooldown(delay) => delay,
        }
    }
}

impl Backoff {
    pub(crate) fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.failures = 0;
    }

    pub(crate) fn on_failure(&mut self) -> Wait {
        self.failures = self.failures.saturating_add(1);
        if let Some(max) = self.policy.max_attempts {
            if self.failures >= max {
                self.failures = 0;
                return Wait::Cooldown(self.policy.cooldown);
            }
        }
        Wait::Retry(self.policy.delay_for(self.failures))
    }

    /// Settles a session that was open for `uptime`. `None` means reconnect
    /// immediately.
    pub(crate) fn on_session_end(&mut self, uptime: Duration) -> Option<Wait> {
        if uptime >= self.policy.min_uptime {
            self.reset();
            None
        } else {
            Some(self.on_failure())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn delays_double_and_cap() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u64> = (1..=7)
            .map(|n| policy.delay_for(n).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![250, 500, 1000, 2000, 4000, 5000, 5000]);
        assert_eq!(policy.delay_for(64), Duration::from_secs(5));
    }

    #[test_timeout::timeout]
    fn cooldown_after_consecutive_failures() {
        let mut backoff = Backoff::new(ReconnectPolicy::default());
        let waits: Vec<Wait> = (0..6).map(|_| backoff.on_failure()).collect();
        assert_eq!(
            waits,
            vec![
                Wait::Retry(Duration::from_millis(250)),
                Wait::Retry(Duration::from_millis(500)),
                Wait::Retry(Duration::from_secs(1)),
                Wait::Retry(Duration::from_secs(2)),
                Wait::Cooldown(Duration::from_secs(30)),
                Wait::Retry(Duration::from_millis(250)),
            ]
        );
    }

    #[test_timeout::timeout]
    fn reset_restarts_sequence() {
        let mut backoff = Backoff::new(ReconnectPolicy::default());
        backoff.on_failure();
        backoff.on_failure();
        backoff.reset();
        assert_eq!(backoff.on_failure(), Wait::Retry(Duration::from_millis(250)));
    }

    #[test_timeout::timeout]
    fn short_sessions_count_as_failures() {
        let mut backoff = Backoff::new(ReconnectPolicy::default());
        assert_eq!(
            backoff.on_session_end(Duration::from_millis(5)),
            Some(Wait::Retry(Duration::from_millis(250)))
        );
        assert_eq!(
            backoff.on_session_end(Duration::ZERO),
            Some(Wait::Retry(Duration::from_millis(500)))
        );
        assert_eq!(backoff.on_session_end(Duration::from_secs(10)), None);
        assert_eq!(backoff.on_failure(), Wait::Retry(Duration::from_millis(250)));
    }

    #[test_timeout::timeout]
    fn immediate_never_waits() {
        let mut backoff = Backoff::new(ReconnectPolicy::immediate());
        for _ in 0..20 {
            assert_eq!(backoff.on_failure().duration(), Duration::ZERO);
            assert_eq!(backoff.on_session_end(Duration::ZERO), None);
        }
    }
}
