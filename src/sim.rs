//! Simulated UUTs
//!
//! Local TCP servers speaking the control protocol and emitting a ramp on a data
//! port, for tests and for `acq-shot sim`. All timing uses `tokio::time`.
//!
//! Units in one [`SimCluster`] share a trigger bus: a soft trigger on any unit
//! triggers every unit currently armed, which is how a wired chain behaves.
//!
//! # Behaviour
//!
//! - `NAME=VALUE` stores the value; `NAME` reads it back as `NAME VALUE`
//! - arm moves to the armed state, abort back to idle
//! - after a trigger a unit reports the triggered state for `capture_time`, then idle
//! - every received line is logged so tests can compare wire sequences
//!
//! Faults can be injected per unit, see [`SimFault`].

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::protocol::Vocabulary;
use crate::uut::{Endpoint, UutId};

// =============================================================================
// Configuration
// =============================================================================

/// Simulation parameters
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Number of units
    pub count: usize,
    /// Bind address
    pub host: String,
    /// First port; unit *i* uses `base + 2i` (control) and `base + 2i + 1` (data).
    /// Zero binds ephemeral ports.
    pub base_port: u16,
    /// Time from trigger to capture complete
    pub capture_time: Duration,
    /// Channel count reported as `NCHAN`
    pub channels: u16,
    /// 32-bit samples (`data32=1`)
    pub data32: bool,
    /// Bytes written per data connection before closing; `None` streams until
    /// the client disconnects
    pub stream_bytes: Option<u64>,
    /// Bytes per data write
    pub stream_chunk: usize,
    /// Pause between data writes
    pub stream_interval: Duration,
    /// Vocabulary the units answer to
    pub vocabulary: Vocabulary,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            count: 1,
            host: "127.0.0.1".into(),
            base_port: 0,
            capture_time: Duration::from_millis(200),
            channels: 4,
            data32: false,
            stream_bytes: None,
            stream_chunk: 4096,
            stream_interval: Duration::from_millis(1),
            vocabulary: Vocabulary::default(),
        }
    }
}

/// Injected misbehaviour
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimFault {
    /// Once triggered, never returns to idle
    Stuck,
    /// Never arms; arm is acknowledged but the state stays idle
    WontArm,
    /// Reads of `name` return `value` regardless of what was written
    ReadbackOverride {
        /// Parameter name
        name: String,
        /// Value reported
        value: String,
    },
    /// Accepts commands but never replies
    Silent,
    /// Replies with a line outside the grammar
    Malformed,
}

// =============================================================================
// Unit state
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Armed,
    Triggered,
}

#[derive(Debug)]
struct UnitState {
    phase: Phase,
    /// bumps on every arm so a stale completion timer cannot finish a newer shot
    generation: u64,
    params: HashMap<String, String>,
    commands: Vec<String>,
    faults: Vec<SimFault>,
    triggers: u64,
}

/// One simulated unit
#[derive(Debug, Clone)]
pub struct SimUnit {
    id: UutId,
    endpoint: Endpoint,
    state: Arc<Mutex<UnitState>>,
}

impl SimUnit {
    /// Unit id
    pub fn id(&self) -> &UutId {
        &self.id
    }

    /// Address clients connect to
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Every line received on the control port, in order
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().commands.clone()
    }

    /// Forget logged commands
    pub fn clear_commands(&self) {
        self.state.lock().commands.clear();
    }

    /// Current value of a parameter
    pub fn param(&self, name: &str) -> Option<String> {
        self.state.lock().params.get(name).cloned()
    }

    /// Number of triggers this unit has acted on
    pub fn triggers(&self) -> u64 {
        self.state.lock().triggers
    }

    /// Inject a fault
    pub fn inject(&self, fault: SimFault) {
        info!(uut = %self.id, ?fault, "sim fault injected");
        self.state.lock().faults.push(fault);
    }

    /// Remove every injected fault
    pub fn clear_faults(&self) {
        self.state.lock().faults.clear();
    }

    fn has_fault(&self, wanted: impl Fn(&SimFault) -> bool) -> bool {
        self.state.lock().faults.iter().any(wanted)
    }
}

// =============================================================================
// Cluster
// =============================================================================

/// A running group of simulated units sharing one trigger bus
#[derive(Debug)]
pub struct SimCluster {
    units: Vec<SimUnit>,
    cancel: CancellationToken,
}

impl SimCluster {
    /// Bind and start every unit
    pub async fn start(config: SimConfig) -> std::io::Result<Self> {
        let cancel = CancellationToken::new();
        let (bus, _) = broadcast::channel::<u64>(16);
        let config = Arc::new(config);
        let mut units = Vec::with_capacity(config.count);

        for idx in 0..config.count {
            let (control_port, data_port) = match config.base_port {
                0 => (0, 0),
                base => {
                    let control = u16::try_from(idx * 2)
                        .ok()
                        .and_then(|offset| base.checked_add(offset))
                        .filter(|port| *port < u16::MAX)
                        .ok_or_else(|| {
                            std::io::Error::other(format!("no port for sim unit {idx} from {base}"))
                        })?;
                    (control, control + 1)
                }
            };
            let control = TcpListener::bind((config.host.as_str(), control_port)).await?;
            let data = TcpListener::bind((config.host.as_str(), data_port)).await?;

            let mut params = HashMap::new();
            params.insert(
                config.vocabulary.channel_count_param.clone(),
                config.channels.to_string(),
            );
            params.insert(
                config.vocabulary.data32_param.clone(),
                if config.data32 { "1" } else { "0" }.to_string(),
            );

            let unit = SimUnit {
                id: UutId::new(format!("sim{idx}")),
                endpoint: Endpoint::new(
                    config.host.clone(),
                    control.local_addr()?.port(),
                    data.local_addr()?.port(),
                ),
                state: Arc::new(Mutex::new(UnitState {
                    phase: Phase::Idle,
                    generation: 0,
                    params,
                    commands: Vec::new(),
                    faults: Vec::new(),
                    triggers: 0,
                })),
            };

            tokio::spawn(serve_control(
                unit.clone(),
                control,
                Arc::clone(&config),
                bus.clone(),
                cancel.clone(),
            ));
            tokio::spawn(listen_trigger_bus(
                unit.clone(),
                bus.subscribe(),
                Arc::clone(&config),
                cancel.clone(),
            ));
            tokio::spawn(serve_data(unit.clone(), data, Arc::clone(&config), cancel.clone()));

            info!(
                uut = %unit.id,
                control = %unit.endpoint.control_addr(),
                data = %unit.endpoint.data_addr(),
                "sim unit listening"
            );
            units.push(unit);
        }

        Ok(Self { units, cancel })
    }

    /// Units in creation order
    pub fn units(&self) -> &[SimUnit] {
        &self.units
    }

    /// Unit by index
    pub fn unit(&self, idx: usize) -> Option<&SimUnit> {
        self.units.get(idx)
    }

    /// Ids in creation order
    pub fn ids(&self) -> Vec<UutId> {
        self.units.iter().map(|u| u.id.clone()).collect()
    }

    /// Stop every server task
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Wait until shut down
    pub async fn wait(&self) {
        self.cancel.cancelled().await;
    }
}

impl Drop for SimCluster {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// =============================================================================
// Control port
// =============================================================================

async fn serve_control(
    unit: SimUnit,
    listener: TcpListener,
    config: Arc<SimConfig>,
    bus: broadcast::Sender<u64>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((socket, peer)) => {
                debug!(uut = %unit.id, %peer, "sim control connection");
                tokio::spawn(control_session(
                    unit.clone(),
                    socket,
                    Arc::clone(&config),
                    bus.clone(),
                    cancel.clone(),
                ));
            }
            Err(e) => debug!(uut = %unit.id, "sim accept failed: {}", e),
        }
    }
}

async fn control_session(
    unit: SimUnit,
    socket: TcpStream,
    config: Arc<SimConfig>,
    bus: broadcast::Sender<u64>,
    cancel: CancellationToken,
) {
    let (rd, mut wr) = socket.into_split();
    let mut lines = BufReader::new(rd).lines();
    let mut counter: u64 = 0;

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => return,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line.trim().to_string(),
            _ => return,
        };
        unit.state.lock().commands.push(line.clone());
        trace!(uut = %unit.id, "sim < {:?}", line);

        if unit.has_fault(|f| *f == SimFault::Silent) {
            continue;
        }
        let body = if unit.has_fault(|f| *f == SimFault::Malformed) {
            "\u{1}\u{2} garbage".to_string()
        } else {
            respond(&unit, &line, &config, &bus)
        };

        counter += 1;
        let out = if body.is_empty() {
            format!("acq400.0 {counter} >")
        } else {
            format!("{body}\nacq400.0 {counter} >")
        };
        if wr.write_all(out.as_bytes()).await.is_err() {
            return;
        }
    }
}

fn respond(
    unit: &SimUnit,
    line: &str,
    config: &SimConfig,
    bus: &broadcast::Sender<u64>,
) -> String {
    let vocab = &config.vocabulary;
    if line.is_empty() || vocab.handshake.iter().any(|h| h == line) {
        return String::new();
    }

    if line == vocab.arm {
        let mut state = unit.state.lock();
        let wont_arm = state.faults.contains(&SimFault::WontArm);
        if !wont_arm {
            state.phase = Phase::Armed;
            state.generation += 1;
        }
        return String::new();
    }
    if line == vocab.soft_trigger {
        let _ = bus.send(unit.state.lock().generation);
        return String::new();
    }
    if line == vocab.abort {
        let mut state = unit.state.lock();
        state.phase = Phase::Idle;
        state.generation += 1;
        return String::new();
    }
    if line == vocab.state_query {
        let phase = unit.state.lock().phase;
        let names = match phase {
            Phase::Idle => &vocab.states.idle,
            Phase::Armed => &vocab.states.armed,
            Phase::Triggered => &vocab.states.triggered,
        };
        let name = names.first().map(String::as_str).unwrap_or("UNKNOWN");
        return format!("{line} {name}");
    }

    if let Some((name, value)) = line.split_once('=') {
        unit.state
            .lock()
            .params
            .insert(name.trim().to_string(), value.trim().to_string());
        return String::new();
    }

    let state = unit.state.lock();
    let overridden = state.faults.iter().find_map(|f| match f {
        SimFault::ReadbackOverride { name, value } if name == line => Some(value.clone()),
        _ => None,
    });
    match overridden.or_else(|| state.params.get(line).cloned()) {
        Some(value) => format!("{line} {value}"),
        None => format!("ERROR: no such parameter {line}"),
    }
}

async fn listen_trigger_bus(
    unit: SimUnit,
    mut bus: broadcast::Receiver<u64>,
    config: Arc<SimConfig>,
    cancel: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => return,
            received = bus.recv() => received,
        };
        if let Err(broadcast::error::RecvError::Closed) = received {
            return;
        }

        let generation = {
            let mut state = unit.state.lock();
            if state.phase != Phase::Armed {
                continue;
            }
            state.phase = Phase::Triggered;
            state.triggers += 1;
            state.generation
        };
        debug!(uut = %unit.id, "sim triggered");
        if unit.has_fault(|f| *f == SimFault::Stuck) {
            continue;
        }

        let unit = unit.clone();
        let capture_time = config.capture_time;
        tokio::spawn(async move {
            tokio::time::sleep(capture_time).await;
            let mut state = unit.state.lock();
            if state.generation == generation && state.phase == Phase::Triggered {
                state.phase = Phase::Idle;
            }
        });
    }
}

// =============================================================================
// Data port
// =============================================================================

async fn serve_data(
    unit: SimUnit,
    listener: TcpListener,
    config: Arc<SimConfig>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        if let Ok((socket, peer)) = accepted {
            debug!(uut = %unit.id, %peer, "sim data connection");
            tokio::spawn(stream_ramp(socket, Arc::clone(&config), cancel.clone()));
        }
    }
}

/// Interleaved ramp: channel `c` of frame `n` carries `n + c`.
fn ramp_chunk(start_frame: u64, frames: usize, channels: u16, data32: bool) -> Vec<u8> {
    let width = if data32 { 4 } else { 2 };
    let mut out = Vec::with_capacity(frames * usize::from(channels) * width);
    for frame in start_frame..start_frame + frames as u64 {
        for ch in 0..u64::from(channels) {
            let v = frame + ch;
            if data32 {
                out.extend_from_slice(&(v as i32).to_le_bytes());
            } else {
                out.extend_from_slice(&(v as i16).to_le_bytes());
            }
        }
    }
    out
}

async fn stream_ramp(mut socket: TcpStream, config: Arc<SimConfig>, cancel: CancellationToken) {
    let width = if config.data32 { 4 } else { 2 };
    let frame_bytes = (usize::from(config.channels) * width).max(1);
    let frames_per_chunk = (config.stream_chunk / frame_bytes).max(1);
    let mut frame: u64 = 0;
    let mut sent: u64 = 0;

    loop {
        if cancel.is_cancelled() {
            break;
        }
        let mut chunk = ramp_chunk(frame, frames_per_chunk, config.channels, config.data32);
        if let Some(limit) = config.stream_bytes {
            let left = limit.saturating_sub(sent);
            if left == 0 {
                break;
            }
            chunk.truncate(usize::try_from(left).unwrap_or(usize::MAX));
        }
        if socket.write_all(&chunk).await.is_err() {
            return;
        }
        sent += chunk.len() as u64;
        frame += frames_per_chunk as u64;
        if !config.stream_interval.is_zero() {
            tokio::time::sleep(config.stream_interval).await;
        }
    }
    let _ = socket.shutdown().await;
}
