//! UUT identity, role and the typed handle wrapping one command channel.
//!
//! A [`UutHandle`] owns the single command channel of its unit. Commands are
//! serialized through an async mutex so no two exchanges ever interleave on the
//! same socket, while different units proceed concurrently.
//!
//! When an exchange leaves the channel desynchronised (timeout, dropped socket)
//! the handle discards it, marks itself `Faulted` and reconnects on the next
//! operation. Retry policy stays with the caller.

pub mod registry;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;

use crate::chain::{RootTrigger, RouteMode};
use crate::error::{AcqError, AcqResult, Exchange, LastExchange};
use crate::protocol::{ChannelTimeouts, CommandChannel, Reply, Setting, Vocabulary};

pub use registry::UutRegistry;

/// Default acq400 control port
pub const DEFAULT_CONTROL_PORT: u16 = 4220;
/// Default acq400 streaming port
pub const DEFAULT_DATA_PORT: u16 = 4210;

/// Unique identifier for a UUT (usually its hostname).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UutId(String);

impl UutId {
    /// Wrap an identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identifier text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UutId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UutId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Network address of a UUT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Hostname or IP address
    pub host: String,
    /// Command (control) port
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    /// Raw data streaming port
    #[serde(default = "default_data_port")]
    pub data_port: u16,
}

fn default_control_port() -> u16 {
    DEFAULT_CONTROL_PORT
}

fn default_data_port() -> u16 {
    DEFAULT_DATA_PORT
}

impl Endpoint {
    /// Build an endpoint.
    pub fn new(host: impl Into<String>, control_port: u16, data_port: u16) -> Self {
        Self {
            host: host.into(),
            control_port,
            data_port,
        }
    }

    /// Endpoint on the default acq400 ports.
    pub fn with_default_ports(host: impl Into<String>) -> Self {
        Self::new(host, DEFAULT_CONTROL_PORT, DEFAULT_DATA_PORT)
    }

    /// `host:port` for the command channel.
    pub fn control_addr(&self) -> String {
        format!("{}:{}", self.host, self.control_port)
    }

    /// `host:port` for the data socket.
    pub fn data_addr(&self) -> String {
        format!("{}:{}", self.host, self.data_port)
    }
}

/// Position of a unit in the trigger chain.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Role {
    /// Not part of a chain, or a chain of one
    #[default]
    Standalone,
    /// Chain root, the single trigger source
    Master {
        /// How the root itself is triggered
        trigger: RootTrigger,
    },
    /// Chain member sourcing clock/trigger from `upstream`
    Slave {
        /// Unit this member's trigger input resolves to
        upstream: UutId,
        /// Routing mode of the link
        mode: RouteMode,
    },
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Standalone => write!(f, "standalone"),
            Role::Master { .. } => write!(f, "master"),
            Role::Slave { upstream, mode } => write!(f, "slave of {upstream} ({mode})"),
        }
    }
}

/// Command channel state as seen by the handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never connected, or closed
    Disconnected,
    /// Channel open and in sync
    Connected,
    /// Last exchange failed at transport level; reconnect pending
    Faulted,
}

/// Capture state reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Not armed; also the state a unit returns to once a capture completes
    Idle,
    /// Armed and waiting for a trigger
    Armed,
    /// Triggered, capture or post-processing in progress
    Triggered,
}

/// Result of a bounded status poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    /// Reported state; the last known one when `stale`
    pub state: Option<DeviceState>,
    /// True when the unit could not be reached within the window
    pub stale: bool,
    /// Why the poll was stale
    pub fault: Option<String>,
}

/// Typed operations on one UUT.
pub struct UutHandle {
    id: UutId,
    endpoint: Endpoint,
    vocab: Arc<Vocabulary>,
    timeouts: ChannelTimeouts,
    channel: tokio::sync::Mutex<Option<CommandChannel>>,
    connection: RwLock<ConnectionState>,
    role: RwLock<Role>,
    snapshot: RwLock<BTreeMap<String, String>>,
    last_state: RwLock<Option<DeviceState>>,
    last_exchange: Mutex<Option<Exchange>>,
}

impl fmt::Debug for UutHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UutHandle")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("connection", &*self.connection.read())
            .field("role", &*self.role.read())
            .finish()
    }
}

impl UutHandle {
    /// Create a disconnected handle.
    pub fn new(
        id: UutId,
        endpoint: Endpoint,
        vocab: Arc<Vocabulary>,
        timeouts: ChannelTimeouts,
    ) -> Self {
        Self {
            id,
            endpoint,
            vocab,
            timeouts,
            channel: tokio::sync::Mutex::new(None),
            connection: RwLock::new(ConnectionState::Disconnected),
            role: RwLock::new(Role::Standalone),
            snapshot: RwLock::new(BTreeMap::new()),
            last_state: RwLock::new(None),
            last_exchange: Mutex::new(None),
        }
    }

    /// Unit identifier.
    pub fn id(&self) -> &UutId {
        &self.id
    }

    /// Network address.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Firmware vocabulary used for this unit.
    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocab
    }

    /// Current chain role.
    pub fn role(&self) -> Role {
        self.role.read().clone()
    }

    pub(crate) fn set_role(&self, role: Role) {
        *self.role.write() = role;
    }

    /// Connection state.
    pub fn connection_state(&self) -> ConnectionState {
        *self.connection.read()
    }

    /// Parameters last written or read on this unit.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.snapshot.read().clone()
    }

    /// Last protocol exchange on this unit.
    pub fn last_exchange(&self) -> Option<Exchange> {
        self.last_exchange.lock().clone()
    }

    /// Open the command channel if it is not already open.
    pub async fn connect(&self) -> AcqResult<()> {
        let mut guard = self.channel.lock().await;
        if guard.as_ref().is_some_and(CommandChannel::is_usable) {
            return Ok(());
        }
        let channel = self.open(self.timeouts).await?;
        *guard = Some(channel);
        Ok(())
    }

    /// Write `name=value`.
    pub async fn set_parameter(&self, name: &str, value: &str) -> AcqResult<()> {
        self.apply(&Setting::new(name, value)).await
    }

    /// Write one setting.
    pub async fn apply(&self, setting: &Setting) -> AcqResult<()> {
        self.exchange(&setting.command(), None).await?;
        self.snapshot
            .write()
            .insert(setting.name.clone(), setting.value.clone());
        Ok(())
    }

    /// Read one parameter.
    pub async fn get_parameter(&self, name: &str) -> AcqResult<String> {
        let reply = self.exchange(name, None).await?;
        let value = self.expect_value(name, &reply, "get_parameter")?;
        self.snapshot.write().insert(name.to_string(), value.clone());
        Ok(value)
    }

    /// Arm for the next trigger.
    pub async fn arm(&self) -> AcqResult<()> {
        let command = self.vocab.arm.clone();
        self.exchange(&command, None).await.map(drop)
    }

    /// Issue a soft trigger.
    pub async fn soft_trigger(&self) -> AcqResult<()> {
        let command = self.vocab.soft_trigger.clone();
        self.exchange(&command, None).await.map(drop)
    }

    /// Abort an armed or running capture.
    pub async fn abort(&self) -> AcqResult<()> {
        let command = self.vocab.abort.clone();
        self.exchange(&command, None).await.map(drop)
    }

    /// Query the capture state, bounded by `window` end to end.
    ///
    /// If the unit cannot be reached in time the last known state is returned with
    /// `stale` set. Replies that cannot be understood are errors.
    pub async fn poll_status(&self, window: Duration) -> AcqResult<StatusReport> {
        let query = self.vocab.state_query.clone();
        match self.exchange(&query, Some(window)).await {
            Ok(reply) => {
                let name = self.expect_value(&query, &reply, "poll_status")?;
                let state = self.vocab.classify_state(&name).ok_or_else(|| {
                    self.protocol_error("poll_status", format!("unknown device state {name:?}"))
                })?;
                *self.last_state.write() = Some(state);
                Ok(StatusReport {
                    state: Some(state),
                    stale: false,
                    fault: None,
                })
            }
            Err(e) if e.is_unreachable() => {
                tracing::debug!(uut = %self.id, "status poll stale: {}", e);
                Ok(StatusReport {
                    state: *self.last_state.read(),
                    stale: true,
                    fault: Some(e.to_string()),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Close the command channel.
    pub async fn close(&self) {
        let mut guard = self.channel.lock().await;
        if let Some(channel) = guard.take() {
            channel.close().await;
        }
        *self.connection.write() = ConnectionState::Disconnected;
    }

    async fn open(&self, timeouts: ChannelTimeouts) -> AcqResult<CommandChannel> {
        match CommandChannel::connect(self.id.clone(), &self.endpoint, &self.vocab, timeouts).await
        {
            Ok(channel) => {
                *self.connection.write() = ConnectionState::Connected;
                Ok(channel)
            }
            Err(e) => {
                tracing::warn!(uut = %self.id, "connect failed: {}", e);
                *self.connection.write() = ConnectionState::Faulted;
                Err(e)
            }
        }
    }

    /// One serialized exchange. With `bound`, lock wait, reconnect and reply all
    /// share that budget.
    async fn exchange(&self, command: &str, bound: Option<Duration>) -> AcqResult<Reply> {
        let started = Instant::now();
        let mut guard = match bound {
            Some(limit) => timeout(limit, self.channel.lock())
                .await
                .map_err(|_| self.timeout_error(command, limit))?,
            None => self.channel.lock().await,
        };

        let remaining = |limit: Duration| limit.saturating_sub(started.elapsed());

        let mut channel = match guard.take() {
            Some(channel) if channel.is_usable() => channel,
            stale => {
                if let Some(old) = stale {
                    old.close().await;
                }
                let mut timeouts = self.timeouts;
                if let Some(limit) = bound {
                    timeouts.connect = timeouts.connect.min(remaining(limit));
                    timeouts.reply = timeouts.reply.min(remaining(limit));
                }
                tracing::debug!(uut = %self.id, "opening command channel");
                self.open(timeouts).await?
            }
        };

        let window = match bound {
            Some(limit) => self.timeouts.reply.min(remaining(limit)),
            None => self.timeouts.reply,
        };
        let result = channel.send_within(command, window).await;
        *self.last_exchange.lock() = channel.last_exchange().cloned();

        if channel.is_usable() {
            *guard = Some(channel);
        } else {
            tracing::warn!(uut = %self.id, command, "command channel faulted, will reconnect");
            *self.connection.write() = ConnectionState::Faulted;
            channel.close().await;
        }
        result
    }

    fn expect_value(&self, name: &str, reply: &Reply, operation: &str) -> AcqResult<String> {
        reply
            .value_for(name)
            .map(str::to_string)
            .ok_or_else(|| self.protocol_error(operation, format!("reply carries no value for {name}")))
    }

    fn protocol_error(&self, operation: &str, detail: String) -> AcqError {
        AcqError::Protocol {
            uut: self.id.clone(),
            operation: operation.to_string(),
            detail,
            exchange: self.last_exchange().unwrap_or_default(),
        }
    }

    fn timeout_error(&self, command: &str, after: Duration) -> AcqError {
        AcqError::Timeout {
            uut: self.id.clone(),
            operation: format!("send {command:?}"),
            after,
            last: LastExchange(self.last_exchange()),
        }
    }
}
