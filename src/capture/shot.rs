//! One capture attempt and its per-unit state machine.
//!
//! ```text
//! Pending ──arm──▶ Armed ──▶ Triggered ──▶ Complete
//!    │               │            │
//!    └───────────────┴────────────┴──▶ Timeout | Error
//! ```
//!
//! `Armed → Complete` is allowed directly: a short capture can finish between two
//! polls. Terminal states never change.

use chrono::{DateTime, Utc};
use std::fmt;
use std::time::{Duration, Instant};

use super::config::CaptureConfig;
use crate::error::AcqError;
use crate::uut::UutId;

/// Per-unit state within one shot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UutShotState {
    /// Configured (or being configured), not yet armed
    Pending,
    /// Reported armed
    Armed,
    /// Reported triggered
    Triggered,
    /// Returned to idle after the trigger
    Complete,
    /// Did not finish before the deadline
    Timeout,
    /// A command failed
    Error(String),
}

impl UutShotState {
    /// True for `Complete`, `Timeout` and `Error`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Timeout | Self::Error(_))
    }

    /// True for `Timeout` and `Error`.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Timeout | Self::Error(_))
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Armed => 1,
            Self::Triggered => 2,
            Self::Complete | Self::Timeout | Self::Error(_) => 3,
        }
    }

    /// Whether moving to `next` is a legal transition.
    pub fn can_advance_to(&self, next: &UutShotState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Self::Pending => false,
            Self::Complete => matches!(self, Self::Armed | Self::Triggered),
            Self::Timeout | Self::Error(_) => true,
            _ => next.rank() > self.rank(),
        }
    }
}

impl fmt::Display for UutShotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Armed => write!(f, "armed"),
            Self::Triggered => write!(f, "triggered"),
            Self::Complete => write!(f, "complete"),
            Self::Timeout => write!(f, "timeout"),
            Self::Error(why) => write!(f, "error: {why}"),
        }
    }
}

/// Shot-level classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShotOutcome {
    /// Every unit completed
    Complete,
    /// Some completed, some failed
    Partial,
    /// None completed and every failure was a timeout
    TimedOut,
    /// None completed, at least one command error
    Failed,
    /// Cancelled before every unit reached a terminal state
    Cancelled,
}

impl fmt::Display for ShotOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Complete => "complete",
            Self::Partial => "partial",
            Self::TimedOut => "timeout",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        })
    }
}

/// A shot in progress.
#[derive(Debug)]
pub struct Shot {
    index: u64,
    pre: u64,
    post: u64,
    started: DateTime<Utc>,
    clock: Instant,
    states: Vec<(UutId, UutShotState)>,
}

impl Shot {
    /// Start a shot over `ids`, all `Pending`.
    pub fn new(index: u64, config: &CaptureConfig, ids: &[UutId]) -> Self {
        Self {
            index,
            pre: config.pre(),
            post: config.post(),
            started: Utc::now(),
            clock: Instant::now(),
            states: ids
                .iter()
                .map(|id| (id.clone(), UutShotState::Pending))
                .collect(),
        }
    }

    /// Shot index.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Current state of `id`.
    pub fn state(&self, id: &UutId) -> Option<&UutShotState> {
        self.states.iter().find(|(u, _)| u == id).map(|(_, s)| s)
    }

    /// Move `id` to `next` if the transition is legal. Returns whether it moved.
    pub fn advance(&mut self, id: &UutId, next: UutShotState) -> bool {
        let Some((_, state)) = self.states.iter_mut().find(|(u, _)| u == id) else {
            return false;
        };
        if !state.can_advance_to(&next) {
            return false;
        }
        tracing::trace!(shot = self.index, uut = %id, from = %state, to = %next, "transition");
        *state = next;
        true
    }

    /// Units not yet in a terminal state.
    pub fn unfinished(&self) -> Vec<UutId> {
        self.states
            .iter()
            .filter(|(_, s)| !s.is_terminal())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Units in any of the given non-terminal states.
    pub fn in_state(&self, wanted: &[UutShotState]) -> Vec<UutId> {
        self.states
            .iter()
            .filter(|(_, s)| wanted.contains(s))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// True once every unit is terminal.
    pub fn is_finished(&self) -> bool {
        self.states.iter().all(|(_, s)| s.is_terminal())
    }

    /// Mark every unfinished unit with `state`, returning the ids it applied to.
    pub fn fail_unfinished(&mut self, state: UutShotState) -> Vec<UutId> {
        let ids = self.unfinished();
        for id in &ids {
            self.advance(id, state.clone());
        }
        ids
    }

    /// Mark units currently in one of `from` with `state`.
    pub fn fail_unfinished_in(&mut self, from: &[UutShotState], state: UutShotState) -> Vec<UutId> {
        let ids = self.in_state(from);
        for id in &ids {
            self.advance(id, state.clone());
        }
        ids
    }

    /// Record terminal states and classify.
    pub fn finish(self, cancelled: bool) -> ShotReport {
        let outcome = classify(&self.states, cancelled);
        ShotReport {
            index: self.index,
            pre: self.pre,
            post: self.post,
            started: self.started,
            elapsed: self.clock.elapsed(),
            outcome,
            states: self.states,
        }
    }
}

fn classify(states: &[(UutId, UutShotState)], cancelled: bool) -> ShotOutcome {
    let complete = states
        .iter()
        .filter(|(_, s)| *s == UutShotState::Complete)
        .count();
    if cancelled && states.iter().any(|(_, s)| !s.is_terminal()) {
        return ShotOutcome::Cancelled;
    }
    if complete == states.len() {
        ShotOutcome::Complete
    } else if complete > 0 {
        ShotOutcome::Partial
    } else if states
        .iter()
        .all(|(_, s)| matches!(s, UutShotState::Timeout))
    {
        ShotOutcome::TimedOut
    } else if cancelled {
        ShotOutcome::Cancelled
    } else {
        ShotOutcome::Failed
    }
}

/// Result of one shot.
#[derive(Debug, Clone)]
pub struct ShotReport {
    /// Shot index
    pub index: u64,
    /// Pre-trigger samples
    pub pre: u64,
    /// Post-trigger samples
    pub post: u64,
    /// Wall-clock start
    pub started: DateTime<Utc>,
    /// Duration from start to classification
    pub elapsed: Duration,
    /// Classification
    pub outcome: ShotOutcome,
    /// Terminal state per unit, in chain order
    pub states: Vec<(UutId, UutShotState)>,
}

impl ShotReport {
    /// True when every unit completed.
    pub fn is_complete(&self) -> bool {
        self.outcome == ShotOutcome::Complete
    }

    /// Units that completed.
    pub fn completed(&self) -> Vec<UutId> {
        self.states
            .iter()
            .filter(|(_, s)| *s == UutShotState::Complete)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Units that did not complete.
    pub fn failed(&self) -> Vec<UutId> {
        self.states
            .iter()
            .filter(|(_, s)| *s != UutShotState::Complete)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// The shot-level error for a non-complete shot.
    pub fn to_error(&self) -> Option<AcqError> {
        match self.outcome {
            ShotOutcome::Complete => None,
            ShotOutcome::Partial => Some(AcqError::CapturePartial {
                shot: self.index,
                complete: self.completed(),
                failed: self.failed(),
            }),
            ShotOutcome::TimedOut => Some(AcqError::CaptureTimeout {
                shot: self.index,
                uuts: self.failed(),
            }),
            ShotOutcome::Failed => Some(AcqError::GroupFailed {
                phase: format!("shot {}", self.index),
                failures: self
                    .states
                    .iter()
                    .map(|(id, s)| (id.clone(), s.to_string()))
                    .collect(),
            }),
            ShotOutcome::Cancelled => Some(AcqError::Cancelled),
        }
    }
}

impl fmt::Display for ShotReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "shot {:>5} {:<9} {:>8.3}s",
            self.index,
            self.outcome.to_string(),
            self.elapsed.as_secs_f64()
        )?;
        for (id, state) in &self.states {
            write!(f, "  {id}={state}")?;
        }
        Ok(())
    }
}
