//! # acq_shot
//!
//! Multi-unit shot-based capture and streaming for networked acquisition units
//! (UUTs). The library is shared by the `acq-shot` CLI and the integration tests.
//!
//! ## Crate Structure
//!
//! - **`protocol`**: line-oriented command channel, reply grammar and the versioned
//!   firmware vocabulary. No firmware strings are hard-coded anywhere else.
//! - **`uut`**: per-unit handle (tagged role, connection state, cached parameters)
//!   and the registry that owns them.
//! - **`chain`**: trigger/clock topology description, the builder that writes and
//!   verifies routing, and the session slot guarding the built chain.
//! - **`capture`**: capture configuration, per-shot state machine, shot ledger and
//!   the capture-loop driver.
//! - **`stream`**: framing and demux of raw sample streams, storage sinks, and the
//!   bounded-queue ingestion session.
//! - **`orchestrator`**: the facade composing the above into workflows. The only
//!   consumer of process configuration.
//! - **`config`**: figment-based configuration (TOML plus `ACQ_SHOT_` env vars).
//! - **`logging`**: tracing-subscriber initialisation.
//! - **`sim`**: simulated units for tests and the `sim` command.
//! - **`error`**: the crate-wide `AcqError`.

pub mod capture;
pub mod chain;
pub mod config;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod protocol;
pub mod sim;
pub mod stream;
pub mod uut;

pub use error::{AcqError, AcqResult};
pub use orchestrator::{LayoutRequest, LoopOptions, Orchestrator, StreamOutput};
