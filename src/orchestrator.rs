//! Orchestration facade.
//!
//! Composes the channel, chain, capture and stream components into named
//! workflows: chain setup, single shot, looped capture, continuous stream from one
//! unit or a group, and a loop with a concurrent stream. This is the only component that reads
//! [`AppConfig`] and the only one that retries connections; it hands every core
//! component explicit parameters.

use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::capture::{
    CaptureConfig, CaptureLoopDriver, LoopCount, LoopSummary, ShotLedger, ShotReport,
    TriggerMode, UutSoftTrigger,
};
use crate::chain::{ChainSlot, RootClock, RootTrigger, Topology, TopologySpec, TriggerChain};
use crate::config::AppConfig;
use crate::error::{AcqError, AcqResult};
use crate::protocol::Vocabulary;
use crate::stream::{
    BlockSink, DataType, DirectorySink, DiscardSink, StreamLayout, StreamSession, StreamSummary,
};
use crate::uut::{Endpoint, UutHandle, UutId, UutRegistry};

/// Extra knobs for a looped capture.
#[derive(Debug, Clone, Default)]
pub struct LoopOptions {
    /// Unit soft-triggered to fire the chain's external trigger. Setting it puts
    /// the loop in external-trigger mode; the chain root must take a front-panel
    /// trigger.
    pub trigger_uut: Option<UutId>,
    /// Directory holding the `SHOT` ledger; numbering resumes from it
    pub shot_dir: Option<PathBuf>,
    /// Stop at the first non-complete shot, on top of the configured policy
    pub stop_on_error: bool,
}

/// Stream geometry requested by the caller; unset fields are probed or defaulted.
#[derive(Debug, Clone, Default)]
pub struct LayoutRequest {
    /// Channel count; probed when unset
    pub channels: Option<u16>,
    /// 32-bit samples; probed when unset
    pub data32: Option<bool>,
    /// Frames per block; config default when unset
    pub frames_per_block: Option<usize>,
    /// One file per channel; config default when unset
    pub demux: Option<bool>,
}

/// Where streamed blocks go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutput {
    /// `ROOT/<uut>/...` files under this root, or the configured output directory
    Directory(Option<PathBuf>),
    /// Count and drop every block
    Discard,
}

/// Result of a loop run with a concurrent stream.
#[derive(Debug)]
pub struct LoopWithStream {
    /// Capture loop result
    pub capture: AcqResult<LoopSummary>,
    /// Stream result
    pub stream: AcqResult<StreamSummary>,
}

/// Session facade owning the unit registry and the trigger chain.
pub struct Orchestrator {
    config: AppConfig,
    vocab: Arc<Vocabulary>,
    registry: UutRegistry,
    chain: ChainSlot,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Validate `config` and create an empty session.
    pub fn new(config: AppConfig, cancel: CancellationToken) -> AcqResult<Self> {
        config.validate().map_err(AcqError::InvalidConfig)?;
        let vocab = Arc::new(config.firmware.clone());
        Ok(Self {
            config,
            vocab,
            registry: UutRegistry::new(),
            chain: ChainSlot::new(),
            cancel,
        })
    }

    /// Session configuration.
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Cancellation token observed by every workflow.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Unit registry.
    pub fn registry(&self) -> &UutRegistry {
        &self.registry
    }

    /// The chain slot, for callers that need to hold a lease.
    pub fn chain_slot(&self) -> &ChainSlot {
        &self.chain
    }

    /// Register `id` using its configured endpoint (or its name as hostname).
    pub fn add_uut(&mut self, id: &UutId) -> AcqResult<Arc<UutHandle>> {
        let endpoint = self.config.uut(id).endpoint();
        self.add_endpoint(id.clone(), endpoint)
    }

    /// Register `id` at an explicit endpoint. Re-registering returns the existing handle.
    pub fn add_endpoint(&mut self, id: UutId, endpoint: Endpoint) -> AcqResult<Arc<UutHandle>> {
        if self.registry.contains(&id) {
            return self.registry.get(&id);
        }
        self.registry.register(UutHandle::new(
            id,
            endpoint,
            Arc::clone(&self.vocab),
            self.config.network.channel_timeouts(),
        ))
    }

    /// Connect every unit in `ids` concurrently, retrying unreachable units.
    pub async fn connect_all(&self, ids: &[UutId]) -> AcqResult<Vec<Arc<UutHandle>>> {
        let handles = self.registry.resolve(ids)?;
        let results =
            futures::future::join_all(handles.iter().map(|h| self.connect_with_retry(h))).await;
        results.into_iter().collect::<AcqResult<Vec<()>>>()?;
        Ok(handles)
    }

    async fn connect_with_retry(&self, handle: &UutHandle) -> AcqResult<()> {
        let attempts = self.config.network.connect_retries.max(1);
        let mut attempt = 1;
        loop {
            match handle.connect().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_unreachable() && attempt < attempts => {
                    warn!(
                        uut = %handle.id(),
                        attempt,
                        attempts,
                        "connect failed, retrying: {}",
                        e
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(AcqError::Cancelled),
                        _ = tokio::time::sleep(self.config.network.retry_backoff) => {}
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Connect, configure and verify a trigger chain over `ids` (first id is the root).
    /// The root runs on its internal clock.
    pub async fn setup_chain(
        &self,
        ids: &[UutId],
        topology: Topology,
        trigger: RootTrigger,
    ) -> AcqResult<Arc<TriggerChain>> {
        self.setup_chain_with_clock(ids, topology, trigger, RootClock::default())
            .await
    }

    /// [`setup_chain`](Self::setup_chain) with an explicit root clock source.
    pub async fn setup_chain_with_clock(
        &self,
        ids: &[UutId],
        topology: Topology,
        trigger: RootTrigger,
        clock: RootClock,
    ) -> AcqResult<Arc<TriggerChain>> {
        let spec = TopologySpec::new(topology, ids, trigger)?.with_root_clock(clock);
        let handles = self.connect_all(ids).await?;
        let chain = self.chain.install(&handles, &spec).await?;
        info!(
            topology = %topology,
            units = chain.len(),
            root = %chain.root().id(),
            clock = %clock,
            "chain ready"
        );
        Ok(chain)
    }

    /// One shot over the built chain.
    pub async fn single_shot(&self, config: &CaptureConfig) -> AcqResult<ShotReport> {
        let chain = self.chain.lease().await?;
        let settings = self.config.capture.loop_settings(LoopCount::Finite(1), 0);
        CaptureLoopDriver::new(settings, self.cancel.clone())
            .run_shot(&chain, config, 0)
            .await
    }

    /// Looped capture over the built chain. The chain cannot be rebuilt while this runs.
    ///
    /// With a `trigger_uut` the loop runs in external-trigger mode whatever
    /// `config` says, and fails with [`AcqError::InvalidConfig`] unless the chain
    /// root takes its trigger from the front panel.
    pub async fn capture_loop<F>(
        &self,
        config: &CaptureConfig,
        count: LoopCount,
        options: &LoopOptions,
        on_shot: F,
    ) -> AcqResult<LoopSummary>
    where
        F: FnMut(&ShotReport) + Send,
    {
        let chain = self.chain.lease().await?;

        let ledger = match &options.shot_dir {
            Some(dir) => Some(ShotLedger::open(dir).await?),
            None => None,
        };
        let first = match &ledger {
            Some(ledger) => ledger.next_index().await?,
            None => 0,
        };

        let mut settings = self.config.capture.loop_settings(count, first);
        settings.stop_on_error |= options.stop_on_error;
        let mut driver = CaptureLoopDriver::new(settings, self.cancel.clone());
        if let Some(ledger) = ledger {
            driver = driver.with_ledger(ledger);
        }
        let mut config = *config;
        if let Some(id) = &options.trigger_uut {
            if chain.spec().root_trigger() != RootTrigger::FrontPanel {
                return Err(AcqError::InvalidConfig(format!(
                    "trigger unit {id} needs a front-panel trigger on chain root {}",
                    chain.root().id()
                )));
            }
            let handle = self.registry.get(id)?;
            self.connect_with_retry(&handle).await?;
            driver = driver.with_external_trigger(Arc::new(UutSoftTrigger::new(handle)));
            config = config.with_trigger(TriggerMode::External);
        }

        driver.run(&chain, &config, on_shot).await
    }

    /// Resolve the stream layout, reading channel count and sample width from the
    /// unit when the request leaves them unset.
    pub async fn probe_layout(&self, id: &UutId, request: &LayoutRequest) -> AcqResult<StreamLayout> {
        let handle = self.registry.get(id)?;
        let needs_probe = request.channels.is_none() || request.data32.is_none();
        if needs_probe {
            self.connect_with_retry(&handle).await?;
        }

        let channels = match request.channels {
            Some(channels) => channels,
            None => {
                let param = &self.vocab.channel_count_param;
                let raw = handle.get_parameter(param).await?;
                raw.trim().parse::<u16>().map_err(|e| AcqError::Protocol {
                    uut: id.clone(),
                    operation: "probe_layout".into(),
                    detail: format!("{param} is not a channel count: {e}"),
                    exchange: handle.last_exchange().unwrap_or_default(),
                })?
            }
        };
        let data32 = match request.data32 {
            Some(data32) => data32,
            None => handle.get_parameter(&self.vocab.data32_param).await?.trim() == "1",
        };

        let layout = StreamLayout::new(
            channels,
            if data32 { DataType::I32 } else { DataType::I16 },
            request
                .frames_per_block
                .unwrap_or(self.config.stream.frames_per_block),
            request.demux.unwrap_or(self.config.stream.demux),
        )?;
        info!(
            uut = %id,
            channels,
            datatype = %layout.datatype(),
            probed = needs_probe,
            "stream layout"
        );
        Ok(layout)
    }

    /// Stream from `id` into the directory sink under `out_dir` (or the configured
    /// output directory).
    pub async fn stream(
        &self,
        id: &UutId,
        request: &LayoutRequest,
        out_dir: Option<PathBuf>,
    ) -> AcqResult<StreamSummary> {
        let root = out_dir.unwrap_or_else(|| self.config.application.output_dir.clone());
        let sink = DirectorySink::new(root, id.as_str());
        self.stream_into(id, request, sink, self.cancel.clone()).await
    }

    /// Stream from `id` into `sink`, observing `cancel`.
    pub async fn stream_into<S>(
        &self,
        id: &UutId,
        request: &LayoutRequest,
        sink: S,
        cancel: CancellationToken,
    ) -> AcqResult<StreamSummary>
    where
        S: BlockSink + 'static,
    {
        let layout = self.probe_layout(id, request).await?;
        let handle = self.registry.get(id)?;
        let settings = self
            .config
            .stream
            .settings(layout, self.config.network.connect_timeout);
        StreamSession::new(id.clone(), handle.endpoint().clone(), settings, cancel)
            .run(sink)
            .await
    }

    /// Stream from every unit in `ids` at once, one session per unit.
    ///
    /// The sessions share a child of the session token: the first to fail cancels
    /// the rest, which drain and end as [`StreamEnd::Cancelled`](crate::stream::StreamEnd).
    /// Results come back in `ids` order.
    pub async fn stream_many(
        &self,
        ids: &[UutId],
        request: &LayoutRequest,
        output: &StreamOutput,
    ) -> AcqResult<Vec<(UutId, AcqResult<StreamSummary>)>> {
        self.registry.resolve(ids)?;
        let group = self.cancel.child_token();
        info!(units = ids.len(), ?output, "group stream starting");

        let sessions = ids.iter().map(|id| {
            let group = group.clone();
            async move {
                let result = match output {
                    StreamOutput::Directory(root) => {
                        let root = root
                            .clone()
                            .unwrap_or_else(|| self.config.application.output_dir.clone());
                        let sink = DirectorySink::new(root, id.as_str());
                        self.stream_into(id, request, sink, group.clone()).await
                    }
                    StreamOutput::Discard => {
                        self.stream_into(id, request, DiscardSink::new(), group.clone())
                            .await
                    }
                };
                if let Err(e) = &result {
                    if !group.is_cancelled() {
                        warn!(uut = %id, "stream failed, stopping the group: {}", e);
                        group.cancel();
                    }
                }
                (id.clone(), result)
            }
        });
        Ok(futures::future::join_all(sessions).await)
    }

    /// Looped capture with a stream from `stream_uut` running alongside. The stream
    /// is cancelled, and drained, once the loop ends.
    pub async fn loop_with_stream<F>(
        &self,
        config: &CaptureConfig,
        count: LoopCount,
        options: &LoopOptions,
        stream_uut: &UutId,
        request: &LayoutRequest,
        out_dir: Option<PathBuf>,
        on_shot: F,
    ) -> LoopWithStream
    where
        F: FnMut(&ShotReport) + Send,
    {
        let stream_cancel = self.cancel.child_token();
        let root = out_dir.unwrap_or_else(|| self.config.application.output_dir.clone());
        let sink = DirectorySink::new(root, stream_uut.as_str());

        let stream = self.stream_into(stream_uut, request, sink, stream_cancel.clone());
        let capture = async {
            let result = self.capture_loop(config, count, options, on_shot).await;
            stream_cancel.cancel();
            result
        };
        let (capture, stream) = tokio::join!(capture, stream);
        LoopWithStream { capture, stream }
    }

    /// Close every command channel.
    pub async fn shutdown(&self) {
        self.registry.close_all().await;
    }
}
