//! Custom error types for the crate.
//!
//! This module defines the primary error type, `AcqError`, used by every component.
//! Using the `thiserror` crate, it provides one place where the failure taxonomy of the
//! control plane (command channel, trigger chain, capture loop) and of the data plane
//! (streaming ingestion, storage) is spelled out.
//!
//! ## Error Hierarchy
//!
//! - **Channel errors**: `Connection`, `Protocol`, `Timeout`. Raised by the command
//!   channel and surfaced per UUT.
//! - **Topology errors**: `InvalidTopology`, `ChainVerification`, `ChainLocked`,
//!   `ChainNotBuilt`. A failed verification is fatal to the session.
//! - **Shot errors**: `CaptureTimeout`, `CapturePartial`, `GroupFailed`. Only raised
//!   when the loop is configured to stop on error, otherwise reported per shot.
//! - **Stream errors**: `Overrun`, `StreamStalled`, `SequenceGap`. Always terminal for
//!   the streaming session and never retried.
//!
//! Every UUT-facing variant names the UUT, the operation and, where one exists, the
//! last protocol exchange, so a failure can be diagnosed from the message alone.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::stream::framing::ChannelTag;
use crate::uut::UutId;

/// Convenience alias for results using the crate error type.
pub type AcqResult<T> = std::result::Result<T, AcqError>;

/// One request/reply pair on a command channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Exchange {
    /// Command line as sent (without terminator)
    pub command: String,
    /// Reply body as received (prompt stripped), possibly partial
    pub reply: String,
}

impl Exchange {
    /// Build an exchange record.
    pub fn new(command: impl Into<String>, reply: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            reply: reply.into(),
        }
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "> {:?} < {:?}", self.command, self.reply)
    }
}

/// Renders an optional exchange for error messages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LastExchange(pub Option<Exchange>);

impl fmt::Display for LastExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(exchange) => write!(f, "{exchange}"),
            None => write!(f, "none"),
        }
    }
}

/// Primary error type.
#[derive(Error, Debug)]
pub enum AcqError {
    /// The UUT could not be reached, or the connection dropped.
    #[error("{uut}: connection error during {operation}: {source} (last exchange: {last})")]
    Connection {
        uut: UutId,
        operation: String,
        #[source]
        source: std::io::Error,
        last: LastExchange,
    },

    /// A reply did not match the grammar, or the device rejected the command.
    #[error("{uut}: protocol error during {operation}: {detail} (exchange: {exchange})")]
    Protocol {
        uut: UutId,
        operation: String,
        detail: String,
        exchange: Exchange,
    },

    /// No complete reply arrived within the bounded read window.
    #[error("{uut}: no reply during {operation} within {after:?} (last exchange: {last})")]
    Timeout {
        uut: UutId,
        operation: String,
        after: Duration,
        last: LastExchange,
    },

    /// The requested topology cannot be built (cycles, missing or extra roots).
    #[error("invalid trigger topology: {0}")]
    InvalidTopology(String),

    /// A unit's routing read back differently from what was written.
    #[error("{uut}: trigger chain verification failed on {parameter}: expected {expected:?}, read back {actual:?}")]
    ChainVerification {
        uut: UutId,
        parameter: String,
        expected: String,
        actual: String,
    },

    /// The chain was asked to rebuild while a capture loop holds it.
    #[error("trigger chain is in use by an active capture loop and cannot be rebuilt")]
    ChainLocked,

    /// A capture loop was started before any chain was built.
    #[error("no trigger chain has been built for this session")]
    ChainNotBuilt,

    /// Capture or stream parameters were rejected before any network I/O.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Every member of the group failed the same phase.
    #[error("all units failed during {phase}: {}", format_failures(.failures))]
    GroupFailed {
        phase: String,
        failures: Vec<(UutId, String)>,
    },

    /// No member completed a shot before the deadline.
    #[error("shot {shot}: capture timed out on {}", format_ids(.uuts))]
    CaptureTimeout { shot: u64, uuts: Vec<UutId> },

    /// Some members completed a shot and others did not.
    #[error("shot {shot}: partial capture, complete on {}, failed on {}", format_ids(.complete), format_ids(.failed))]
    CapturePartial {
        shot: u64,
        complete: Vec<UutId>,
        failed: Vec<UutId>,
    },

    /// The bounded block queue overflowed; `lost_sequence` was not stored.
    #[error("{uut}: stream overrun, block {lost_sequence} on {channel} lost with {buffered} blocks queued")]
    Overrun {
        uut: UutId,
        channel: ChannelTag,
        lost_sequence: u64,
        buffered: usize,
    },

    /// The data socket went quiet for longer than the inactivity window.
    #[error("{uut}: stream stalled, no data for {idle:?} after {bytes} bytes")]
    StreamStalled { uut: UutId, idle: Duration, bytes: u64 },

    /// Blocks for a channel arrived out of sequence.
    #[error("sequence fault on {channel}: expected block {expected}, got {got}")]
    SequenceGap {
        channel: ChannelTag,
        expected: u64,
        got: u64,
    },

    /// No UUT with this id is registered.
    #[error("unknown UUT '{0}'")]
    UnknownUut(UutId),

    /// The storage sink failed to persist a block.
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    /// Configuration file or environment could not be parsed.
    #[error("configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// The operation observed the cancellation token.
    #[error("operation cancelled")]
    Cancelled,
}

impl AcqError {
    /// True for the error kinds that indicate the UUT itself could not be reached.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }

    /// UUT named by the error, if any.
    pub fn uut(&self) -> Option<&UutId> {
        match self {
            Self::Connection { uut, .. }
            | Self::Protocol { uut, .. }
            | Self::Timeout { uut, .. }
            | Self::ChainVerification { uut, .. }
            | Self::Overrun { uut, .. }
            | Self::StreamStalled { uut, .. }
            | Self::UnknownUut(uut) => Some(uut),
            _ => None,
        }
    }
}

impl From<figment::Error> for AcqError {
    fn from(value: figment::Error) -> Self {
        Self::Config(Box::new(value))
    }
}

fn format_ids(ids: &[UutId]) -> String {
    if ids.is_empty() {
        return "none".to_string();
    }
    ids.iter()
        .map(UutId::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_failures(failures: &[(UutId, String)]) -> String {
    failures
        .iter()
        .map(|(id, why)| format!("{id}: {why}"))
        .collect::<Vec<_>>()
        .join("; ")
}
