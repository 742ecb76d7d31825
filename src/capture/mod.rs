//! Capture loop: per-shot config, shot state machine, the driver and the shot ledger.

pub mod config;
pub mod driver;
pub mod ledger;
pub mod shot;

pub use config::{CaptureConfig, TriggerMode};
pub use driver::{
    CaptureLoopDriver, ExternalTrigger, LoopCount, LoopSettings, LoopSummary, UutSoftTrigger,
};
pub use ledger::ShotLedger;
pub use shot::{Shot, ShotOutcome, ShotReport, UutShotState};
