//! Reconnect backoff policy.
//!
//! Exponential delay with a cap, plus a rolling attempt budget: at most
//! `budget` attempts per `window`, where the window resets once the
//! account has sat idle (no attempt) longer than the window. Exhausting
//! the budget is terminal — the account stops with status `error`.

use {std::time::Duration, tokio::time::Instant};

/// What to do about the next reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Wait this long, then attempt.
    Retry(Duration),
    /// Budget exhausted; stop the account.
    GiveUp,
}

/// Policy constants. The defaults are the production values.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub budget: u32,
    pub window: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(30),
            budget: 10,
            window: Duration::from_secs(300),
        }
    }
}

/// Mutable per-account reconnect bookkeeping.
#[derive(Debug, Default)]
pub struct ReconnectState {
    delay: Option<Duration>,
    attempts: u32,
    last_attempt: Option<Instant>,
}

impl ReconnectPolicy {
    /// Account for one reconnect attempt at `now` and decide its delay.
    pub fn next(&self, state: &mut ReconnectState, now: Instant) -> ReconnectDecision {
        // Idle long enough: the rolling window starts fresh.
        if let Some(last) = state.last_attempt
            && now.duration_since(last) > self.window
        {
            state.attempts = 0;
        }

        if state.attempts >= self.budget {
            return ReconnectDecision::GiveUp;
        }

        state.attempts += 1;
        state.last_attempt = Some(now);

        let delay = state.delay.unwrap_or(self.initial_delay);
        state.delay = Some((delay * 2).min(self.max_delay));
        ReconnectDecision::Retry(delay)
    }

    /// Successful login: counter and delay start over.
    pub fn reset(&self, state: &mut ReconnectState) {
        state.delay = None;
        state.attempts = 0;
        state.last_attempt = None;
    }
}
