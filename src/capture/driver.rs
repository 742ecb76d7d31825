//! Capture-loop driver.
//!
//! Runs shots over a built trigger chain. Each shot goes through:
//!
//! 1. **configure**: the capture config is written to every member concurrently
//! 2. **arm**: every configured member is armed, then polled until it reports armed
//! 3. **trigger**: soft trigger on the chain root, or an external trigger the
//!    driver either fires through an [`ExternalTrigger`] or simply waits for
//! 4. **poll**: every member is polled on a fixed interval until all are terminal
//!    or the shot deadline passes
//!
//! Per-unit failures are recorded on the shot and the loop moves on. Only a phase
//! in which *every* member fails aborts the loop, with [`AcqError::GroupFailed`].
//! Shots are strictly sequential: shot *n + 1* starts after shot *n* is classified.
//!
//! Cancellation is checked at the top of each shot and at every polling tick.

use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::{CaptureConfig, TriggerMode};
use super::ledger::ShotLedger;
use super::shot::{Shot, ShotOutcome, ShotReport, UutShotState};
use crate::chain::TriggerChain;
use crate::error::{AcqError, AcqResult};
use crate::uut::{DeviceState, UutHandle, UutId};

/// Number of shots to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopCount {
    /// Exactly this many shots
    Finite(u64),
    /// Until cancelled
    Forever,
}

/// Explicit loop parameters. Nothing here is read from process state.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    /// How many shots
    pub count: LoopCount,
    /// Interval between status polls
    pub poll_interval: Duration,
    /// Bound on a single status poll
    pub status_timeout: Duration,
    /// Time allowed for every member to report armed
    pub arm_timeout: Duration,
    /// Time allowed from the trigger to completion
    pub shot_timeout: Duration,
    /// Return the first non-complete shot as an error
    pub stop_on_error: bool,
    /// Send abort to members that time out or are cancelled mid-shot
    pub abort_incomplete: bool,
    /// Index of the first shot
    pub first_shot_index: u64,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            count: LoopCount::Finite(1),
            poll_interval: Duration::from_millis(500),
            status_timeout: Duration::from_secs(2),
            arm_timeout: Duration::from_secs(10),
            shot_timeout: Duration::from_secs(60),
            stop_on_error: false,
            abort_incomplete: true,
            first_shot_index: 0,
        }
    }
}

impl LoopSettings {
    fn validate(&self) -> AcqResult<()> {
        if self.poll_interval.is_zero() {
            return Err(AcqError::InvalidConfig("poll interval must be non-zero".into()));
        }
        if self.status_timeout.is_zero() || self.shot_timeout.is_zero() {
            return Err(AcqError::InvalidConfig(
                "status and shot timeouts must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Fires the trigger for shots whose config uses [`TriggerMode::External`].
#[async_trait]
pub trait ExternalTrigger: Send + Sync {
    /// Fire the trigger for `shot`. Called once every member is armed.
    async fn fire(&self, shot: u64) -> AcqResult<()>;
}

/// Soft-triggers a separate unit that drives the chain's external trigger input.
#[derive(Debug, Clone)]
pub struct UutSoftTrigger {
    handle: Arc<UutHandle>,
}

impl UutSoftTrigger {
    /// Trigger through `handle`.
    pub fn new(handle: Arc<UutHandle>) -> Self {
        Self { handle }
    }
}

#[async_trait]
impl ExternalTrigger for UutSoftTrigger {
    async fn fire(&self, shot: u64) -> AcqResult<()> {
        debug!(shot, uut = %self.handle.id(), "firing remote trigger");
        self.handle.soft_trigger().await
    }
}

/// Aggregate result of a loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopSummary {
    /// Shots run to classification
    pub shots: u64,
    /// Shots where every member completed
    pub complete: u64,
    /// Shots with some members complete
    pub partial: u64,
    /// Shots where nothing completed
    pub failed: u64,
    /// Loop ended on cancellation
    pub cancelled: bool,
    /// Index of the last shot run
    pub last_index: Option<u64>,
}

impl LoopSummary {
    fn record(&mut self, report: &ShotReport) {
        self.shots += 1;
        self.last_index = Some(report.index);
        match report.outcome {
            ShotOutcome::Complete => self.complete += 1,
            ShotOutcome::Partial => self.partial += 1,
            ShotOutcome::TimedOut | ShotOutcome::Failed => self.failed += 1,
            ShotOutcome::Cancelled => self.cancelled = true,
        }
    }

    /// True when every shot run completed on every member and nothing was cancelled.
    pub fn all_complete(&self) -> bool {
        !self.cancelled && self.complete == self.shots
    }
}

/// Drives sequential shots over a trigger chain.
pub struct CaptureLoopDriver {
    settings: LoopSettings,
    cancel: CancellationToken,
    external: Option<Arc<dyn ExternalTrigger>>,
    ledger: Option<ShotLedger>,
}

impl CaptureLoopDriver {
    /// Create a driver observing `cancel`.
    pub fn new(settings: LoopSettings, cancel: CancellationToken) -> Self {
        Self {
            settings,
            cancel,
            external: None,
            ledger: None,
        }
    }

    /// Fire external-trigger shots through `trigger`.
    #[must_use]
    pub fn with_external_trigger(mut self, trigger: Arc<dyn ExternalTrigger>) -> Self {
        self.external = Some(trigger);
        self
    }

    /// Record every finished shot in `ledger`.
    #[must_use]
    pub fn with_ledger(mut self, ledger: ShotLedger) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Loop parameters.
    pub fn settings(&self) -> &LoopSettings {
        &self.settings
    }

    /// Run the loop, calling `on_shot` after each shot is classified.
    pub async fn run<F>(
        &self,
        chain: &TriggerChain,
        config: &CaptureConfig,
        mut on_shot: F,
    ) -> AcqResult<LoopSummary>
    where
        F: FnMut(&ShotReport) + Send,
    {
        self.settings.validate()?;
        let run_id = Uuid::new_v4();
        let mut summary = LoopSummary::default();
        let mut index = self.settings.first_shot_index;
        let mut remaining = match self.settings.count {
            LoopCount::Finite(n) => Some(n),
            LoopCount::Forever => None,
        };
        info!(
            %run_id,
            units = chain.len(),
            count = ?self.settings.count,
            pre = config.pre(),
            post = config.post(),
            trigger = ?config.trigger(),
            "capture loop starting"
        );

        loop {
            if remaining == Some(0) {
                break;
            }
            if self.cancel.is_cancelled() {
                info!(%run_id, shot = index, "capture loop cancelled between shots");
                summary.cancelled = true;
                break;
            }

            let report = self.run_shot(chain, config, index).await?;
            summary.record(&report);
            if let Some(ledger) = &self.ledger {
                ledger.record(report.index).await?;
            }
            on_shot(&report);

            if report.outcome == ShotOutcome::Cancelled {
                break;
            }
            if self.settings.stop_on_error {
                if let Some(err) = report.to_error() {
                    warn!(%run_id, shot = index, "stopping loop: {}", err);
                    return Err(err);
                }
            }

            index += 1;
            remaining = remaining.map(|n| n - 1);
        }

        info!(
            %run_id,
            shots = summary.shots,
            complete = summary.complete,
            partial = summary.partial,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "capture loop finished"
        );
        Ok(summary)
    }

    /// Run one shot with index `index`.
    pub async fn run_shot(
        &self,
        chain: &TriggerChain,
        config: &CaptureConfig,
        index: u64,
    ) -> AcqResult<ShotReport> {
        self.settings.validate()?;
        let handles = chain.handles();
        let ids = chain.ids();
        let mut shot = Shot::new(index, config, &ids);
        info!(shot = index, units = handles.len(), "shot starting");

        // configure
        let results = join_all(handles.iter().map(|h| config.apply(h))).await;
        record_phase(&mut shot, "configure", &handles, results)?;

        // arm
        let live = live_handles(&shot, &handles);
        let results = join_all(live.iter().map(|h| h.arm())).await;
        record_phase(&mut shot, "arm", &live, results)?;

        let arm_deadline = Instant::now() + self.settings.arm_timeout;
        let cancelled = self.poll_until(&mut shot, &handles, arm_deadline, Phase::Arm).await;
        if cancelled {
            return Ok(self.close_shot(shot, &handles, true).await);
        }
        let unarmed = shot.fail_unfinished_in(&[UutShotState::Pending], UutShotState::Timeout);
        if !unarmed.is_empty() {
            warn!(shot = index, uuts = ?unarmed, "units did not arm in time");
        }
        if shot.in_state(&[UutShotState::Armed, UutShotState::Triggered]).is_empty() {
            warn!(shot = index, "no unit armed, skipping trigger");
            return Ok(self.close_shot(shot, &handles, false).await);
        }

        // trigger
        if let Err(e) = self.trigger(chain, config, index).await {
            warn!(shot = index, "trigger failed: {}", e);
            shot.fail_unfinished(UutShotState::Error(format!("trigger: {e}")));
            return Ok(self.close_shot(shot, &handles, false).await);
        }

        // poll
        let deadline = Instant::now() + self.settings.shot_timeout;
        let cancelled = self.poll_until(&mut shot, &handles, deadline, Phase::Capture).await;
        if !cancelled {
            let late = shot.fail_unfinished(UutShotState::Timeout);
            if !late.is_empty() {
                warn!(shot = index, uuts = ?late, "capture timed out");
            }
        }
        Ok(self.close_shot(shot, &handles, cancelled).await)
    }

    async fn trigger(&self, chain: &TriggerChain, config: &CaptureConfig, index: u64) -> AcqResult<()> {
        match config.trigger() {
            TriggerMode::Soft => {
                debug!(shot = index, root = %chain.root().id(), "soft trigger");
                chain.root().soft_trigger().await
            }
            TriggerMode::External => match &self.external {
                Some(trigger) => trigger.fire(index).await,
                None => {
                    info!(shot = index, "armed, waiting for external trigger");
                    Ok(())
                }
            },
        }
    }

    /// Poll unfinished members until the phase goal is met, the deadline passes or
    /// the loop is cancelled. Returns true on cancellation.
    async fn poll_until(
        &self,
        shot: &mut Shot,
        handles: &[Arc<UutHandle>],
        deadline: Instant,
        phase: Phase,
    ) -> bool {
        let mut ticker = interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!(shot = shot.index(), "shot cancelled mid-poll");
                    return true;
                }
                _ = ticker.tick() => {}
            }

            let pending = phase.pending(shot);
            if pending.is_empty() {
                return false;
            }
            let polled: Vec<Arc<UutHandle>> = handles
                .iter()
                .filter(|h| pending.contains(h.id()))
                .cloned()
                .collect();
            let window = self.settings.status_timeout;
            let reports = join_all(polled.iter().map(|h| h.poll_status(window))).await;

            for (handle, report) in polled.iter().zip(reports) {
                let id = handle.id();
                match report {
                    Ok(report) if report.stale => {
                        debug!(shot = shot.index(), uut = %id, fault = ?report.fault, "stale status");
                    }
                    Ok(report) => match (phase, report.state) {
                        (_, Some(DeviceState::Armed)) => {
                            shot.advance(id, UutShotState::Armed);
                        }
                        (_, Some(DeviceState::Triggered)) => {
                            shot.advance(id, UutShotState::Triggered);
                        }
                        (Phase::Capture, Some(DeviceState::Idle)) => {
                            shot.advance(id, UutShotState::Complete);
                        }
                        _ => {}
                    },
                    Err(e) => {
                        warn!(shot = shot.index(), uut = %id, "status poll failed: {}", e);
                        shot.advance(id, UutShotState::Error(e.to_string()));
                    }
                }
            }

            if phase.pending(shot).is_empty() {
                return false;
            }
            if Instant::now() >= deadline {
                return false;
            }
        }
    }

    async fn close_shot(&self, mut shot: Shot, handles: &[Arc<UutHandle>], cancelled: bool) -> ShotReport {
        if self.settings.abort_incomplete {
            let mut targets = shot.in_state(&[
                UutShotState::Timeout,
                UutShotState::Armed,
                UutShotState::Triggered,
            ]);
            if !cancelled {
                targets.retain(|id| shot.state(id) == Some(&UutShotState::Timeout));
            }
            let aborting: Vec<&Arc<UutHandle>> =
                handles.iter().filter(|h| targets.contains(h.id())).collect();
            let results = join_all(aborting.iter().map(|h| h.abort())).await;
            for (handle, result) in aborting.iter().zip(results) {
                match result {
                    Ok(()) => debug!(shot = shot.index(), uut = %handle.id(), "aborted"),
                    Err(e) => warn!(shot = shot.index(), uut = %handle.id(), "abort failed: {}", e),
                }
            }
        }
        let report = shot.finish(cancelled);
        info!(
            shot = report.index,
            outcome = %report.outcome,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "shot finished"
        );
        report
    }
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Arm,
    Capture,
}

impl Phase {
    fn pending(self, shot: &Shot) -> Vec<UutId> {
        match self {
            Phase::Arm => shot.in_state(&[UutShotState::Pending]),
            Phase::Capture => shot.unfinished(),
        }
    }
}

fn live_handles(shot: &Shot, handles: &[Arc<UutHandle>]) -> Vec<Arc<UutHandle>> {
    handles
        .iter()
        .filter(|h| shot.state(h.id()).is_some_and(|s| !s.is_terminal()))
        .cloned()
        .collect()
}

/// Record per-unit failures of one fan-out phase. All members failing is fatal.
fn record_phase(
    shot: &mut Shot,
    phase: &str,
    handles: &[Arc<UutHandle>],
    results: Vec<AcqResult<()>>,
) -> AcqResult<()> {
    let mut failures = Vec::new();
    for (handle, result) in handles.iter().zip(results) {
        if let Err(e) = result {
            warn!(shot = shot.index(), uut = %handle.id(), phase, "{}", e);
            shot.advance(handle.id(), UutShotState::Error(format!("{phase}: {e}")));
            failures.push((handle.id().clone(), e.to_string()));
        }
    }
    if !handles.is_empty() && failures.len() == handles.len() {
        return Err(AcqError::GroupFailed {
            phase: phase.to_string(),
            failures,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_accounting() {
        let mut summary = LoopSummary::default();
        assert!(summary.all_complete(), "zero shots is vacuously complete");
        let cfg = CaptureConfig::new(0, 8, TriggerMode::Soft, false).unwrap();
        let id = UutId::new("a");
        let mut shot = Shot::new(3, &cfg, std::slice::from_ref(&id));
        shot.advance(&id, UutShotState::Armed);
        shot.advance(&id, UutShotState::Complete);
        summary.record(&shot.finish(false));
        assert_eq!(summary.last_index, Some(3));
        assert!(summary.all_complete());

        let mut shot = Shot::new(4, &cfg, std::slice::from_ref(&id));
        shot.fail_unfinished(UutShotState::Timeout);
        summary.record(&shot.finish(false));
        assert_eq!(summary.failed, 1);
        assert!(!summary.all_complete());
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let settings = LoopSettings {
            poll_interval: Duration::ZERO,
            ..LoopSettings::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(AcqError::InvalidConfig(_))
        ));
        assert!(LoopSettings::default().validate().is_ok());
    }

    #[test]
    fn test_default_settings() {
        let s = LoopSettings::default();
        assert_eq!(s.count, LoopCount::Finite(1));
        assert!(s.abort_incomplete);
        assert!(s.poll_interval >= Duration::from_millis(100));
        assert!(s.poll_interval <= Duration::from_secs(1));
    }
}
