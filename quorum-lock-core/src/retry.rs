//! Retry scheduling for lock acquisition.
//!
//! ```text
//!            begin_attempt            on_acquired
//!   Idle ─────────────────▶ Attempting ───────────▶ Holding
//!                            │  ▲    │                 │
//!        on_attempt_failed   │  │    │ attempts == max │ on_released
//!        (attempts < max)    ▼  │    ▼                 ▼
//!                          Backoff  Failed            Idle
//!                           begin_attempt
//! ```

use rand::SeedableRng;
use rand::rngs::StdRng;
use std::fmt;
use std::time::Duration;
use tracing::debug;

use crate::acquire::AttemptFailure;
use crate::config::{BackoffConfig, LockConfig};
use crate::error::{LockError, Result};

/// Lifecycle of one `acquire` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Idle,
    Attempting,
    Holding,
    Backoff,
    /// Terminal: the attempt limit was reached.
    Failed,
}

impl LockState {
    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: LockState) -> bool {
        use LockState::*;
        matches!(
            (self, next),
            (Idle, Attempting)
                | (Attempting, Holding)
                | (Attempting, Backoff)
                | (Attempting, Failed)
                | (Backoff, Attempting)
                | (Holding, Idle)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LockState::Idle => "idle",
            LockState::Attempting => "attempting",
            LockState::Holding => "holding",
            LockState::Backoff => "backoff",
            LockState::Failed => "failed",
        }
    }
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep for `delay`, then call `begin_attempt` again.
    Retry { delay: Duration },
    /// The attempt limit is reached.
    GiveUp {
        attempts: u32,
        last_failure: AttemptFailure,
    },
}

/// Bounded, jittered retry state machine.
///
/// The random source is owned by the scheduler and can be seeded, so a
/// sequence of backoff delays is reproducible in tests.
pub struct RetryScheduler {
    max_attempts: u32,
    backoff: BackoffConfig,
    rng: StdRng,
    state: LockState,
    attempts: u32,
}

impl RetryScheduler {
    /// Create a scheduler seeded from the operating system.
    pub fn new(max_attempts: u32, backoff: BackoffConfig) -> Self {
        Self {
            max_attempts,
            backoff,
            rng: StdRng::from_os_rng(),
            state: LockState::Idle,
            attempts: 0,
        }
    }

    pub fn from_config(config: &LockConfig) -> Self {
        Self::new(config.max_attempts, config.backoff.clone())
    }

    /// Use a deterministic random source.
    pub fn with_seed(self, seed: u64) -> Self {
        self.with_rng(StdRng::seed_from_u64(seed))
    }

    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    pub fn state(&self) -> LockState {
        self.state
    }

    /// Attempts started so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Enter `Attempting`. Returns the 1-based attempt number.
    pub fn begin_attempt(&mut self) -> Result<u32> {
        self.transition(LockState::Attempting)?;
        self.attempts += 1;
        Ok(self.attempts)
    }

    /// The current attempt reached quorum.
    pub fn on_acquired(&mut self) -> Result<()> {
        self.transition(LockState::Holding)
    }

    /// The current attempt failed and its partial writes were rolled back.
    pub fn on_attempt_failed(&mut self, failure: AttemptFailure) -> Result<RetryDecision> {
        if self.attempts >= self.max_attempts {
            self.transition(LockState::Failed)?;
            return Ok(RetryDecision::GiveUp {
                attempts: self.attempts,
                last_failure: failure,
            });
        }

        self.transition(LockState::Backoff)?;
        Ok(RetryDecision::Retry {
            delay: self.next_delay(),
        })
    }

    /// The held lock was released.
    pub fn on_released(&mut self) -> Result<()> {
        self.transition(LockState::Idle)?;
        self.attempts = 0;
        Ok(())
    }

    /// Draw the next backoff delay.
    pub fn next_delay(&mut self) -> Duration {
        self.backoff.sample(&mut self.rng)
    }

    fn transition(&mut self, next: LockState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(LockError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        debug!(from = %self.state, to = %next, attempt = self.attempts, "lock state transition");
        self.state = next;
        Ok(())
    }
}

impl fmt::Debug for RetryScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryScheduler")
            .field("state", &self.state)
            .field("attempts", &self.attempts)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}
