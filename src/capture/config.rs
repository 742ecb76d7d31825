//! Per-shot capture parameters.

use serde::{Deserialize, Serialize};

use crate::error::{AcqError, AcqResult};
use crate::protocol::{Setting, Vocabulary};
use crate::uut::UutHandle;

/// Where the trigger comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerMode {
    /// Driver soft-triggers the chain root
    #[default]
    Soft,
    /// Trigger is fired outside the driver; the driver only waits
    External,
}

/// Immutable, validated capture parameters.
///
/// Construction is the only validation point, so a `CaptureConfig` in hand is
/// always safe to send to a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConfig {
    pre: u64,
    post: u64,
    trigger: TriggerMode,
    simulate: bool,
}

impl CaptureConfig {
    /// Validate and build.
    pub fn new(pre: u64, post: u64, trigger: TriggerMode, simulate: bool) -> AcqResult<Self> {
        if post == 0 {
            return Err(AcqError::InvalidConfig(format!(
                "post-trigger sample count must be non-zero ({trigger:?} trigger)"
            )));
        }
        Ok(Self {
            pre,
            post,
            trigger,
            simulate,
        })
    }

    /// Pre-trigger samples.
    pub fn pre(&self) -> u64 {
        self.pre
    }

    /// Post-trigger samples.
    pub fn post(&self) -> u64 {
        self.post
    }

    /// Trigger source.
    pub fn trigger(&self) -> TriggerMode {
        self.trigger
    }

    /// The same config with its trigger source replaced.
    #[must_use]
    pub fn with_trigger(mut self, trigger: TriggerMode) -> Self {
        self.trigger = trigger;
        self
    }

    /// Simulated data requested.
    pub fn simulate(&self) -> bool {
        self.simulate
    }

    /// Writes that apply this config, in wire order.
    ///
    /// Every write is emitted on every application, so applying the same config
    /// twice produces the same command sequence.
    pub fn settings(&self, vocab: &Vocabulary) -> AcqResult<Vec<Setting>> {
        let transient = vocab
            .render_transient(self.pre, self.post, self.trigger == TriggerMode::Soft)
            .map_err(AcqError::InvalidConfig)?;
        let mut out = vec![Setting::new(vocab.transient_param.clone(), transient)];
        if let Some(param) = &vocab.simulate_param {
            out.push(Setting::new(
                param.clone(),
                if self.simulate { "1" } else { "0" },
            ));
        }
        Ok(out)
    }

    /// Write this config to one unit.
    pub async fn apply(&self, handle: &UutHandle) -> AcqResult<()> {
        for setting in self.settings(handle.vocabulary())? {
            handle.apply(&setting).await?;
        }
        Ok(())
    }
}
