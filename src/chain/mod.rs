//! Trigger-chain builder.
//!
//! Configures clock and trigger routing over an ordered group of UUTs so that a
//! single trigger at the root reaches every member, then reads each routing value
//! back and compares it against what was written.
//!
//! # Topologies
//!
//! | Topology | Root | Members |
//! |---|---|---|
//! | `standalone` | the only unit | none |
//! | `master-slaves` | first unit | every other unit sources from the root's HDMI master line |
//! | `hdmi-daisy` | first unit | unit *i* sources from unit *i-1* and re-drives downstream |
//!
//! The built chain lives in a [`ChainSlot`]. Capture loops hold a read lease on
//! the slot for their whole run, so an attempt to rebuild while a loop is active
//! fails immediately with [`AcqError::ChainLocked`].

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::Deref;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{OwnedRwLockReadGuard, RwLock};

use crate::error::{AcqError, AcqResult};
use crate::protocol::{Setting, Vocabulary};
use crate::uut::{Role, UutHandle, UutId};

/// Routing mode of one link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RouteMode {
    /// Internal clock, the chain root
    IntClk,
    /// Sources from the predecessor and re-drives the sync output
    DaisySync,
    /// Sources from the root's dedicated HDMI master line
    HdmiMaster,
}

impl fmt::Display for RouteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RouteMode::IntClk => "intclk",
            RouteMode::DaisySync => "daisy-sync",
            RouteMode::HdmiMaster => "hdmi-master",
        })
    }
}

/// How the chain root receives its trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RootTrigger {
    /// Command-issued soft trigger
    #[default]
    Soft,
    /// Externally wired front-panel trigger
    FrontPanel,
}

/// Where the chain root takes its sample clock from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RootClock {
    /// Internal clock, optionally programmed to a rate in Hz
    Internal(Option<u64>),
    /// Clock wired into the root's front panel
    FrontPanel,
}

impl Default for RootClock {
    fn default() -> Self {
        RootClock::Internal(None)
    }
}

impl fmt::Display for RootClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RootClock::Internal(None) => f.write_str("int"),
            RootClock::Internal(Some(hz)) => write!(f, "{hz}"),
            RootClock::FrontPanel => f.write_str("fp"),
        }
    }
}

/// Parses `fp` (or `0`), `int`, or an internal rate in Hz.
impl FromStr for RootClock {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "fp" | "front-panel" | "0" => Ok(RootClock::FrontPanel),
            "int" | "internal" => Ok(RootClock::Internal(None)),
            other => other
                .parse::<u64>()
                .map(|hz| RootClock::Internal(Some(hz)))
                .map_err(|_| format!("expected fp, int or a rate in Hz, got {other:?}")),
        }
    }
}

/// Named topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topology {
    /// One unit, no links
    Standalone,
    /// Root plus members on the HDMI master line
    MasterSlaves,
    /// Daisy chain, each member sourcing from its predecessor
    HdmiDaisy,
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Topology::Standalone => "standalone",
            Topology::MasterSlaves => "master-slaves",
            Topology::HdmiDaisy => "hdmi-daisy",
        })
    }
}

/// One node of the intended routing graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSpec {
    /// Unit being routed
    pub uut: UutId,
    /// Unit it sources clock/trigger from; `None` for the root
    pub source: Option<UutId>,
    /// Link mode
    pub mode: RouteMode,
}

/// Intended routing graph for a group of units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologySpec {
    links: Vec<LinkSpec>,
    root_trigger: RootTrigger,
    root_clock: RootClock,
}

impl TopologySpec {
    /// Graph for a named topology over `ids`, first id as root.
    pub fn new(topology: Topology, ids: &[UutId], root_trigger: RootTrigger) -> AcqResult<Self> {
        let Some((root, rest)) = ids.split_first() else {
            return Err(AcqError::InvalidTopology("no units given".into()));
        };
        let mut links = vec![LinkSpec {
            uut: root.clone(),
            source: None,
            mode: RouteMode::IntClk,
        }];
        match topology {
            Topology::Standalone if !rest.is_empty() => {
                return Err(AcqError::InvalidTopology(format!(
                    "standalone topology takes one unit, got {}",
                    ids.len()
                )))
            }
            Topology::Standalone => {}
            Topology::MasterSlaves => links.extend(rest.iter().map(|id| LinkSpec {
                uut: id.clone(),
                source: Some(root.clone()),
                mode: RouteMode::HdmiMaster,
            })),
            Topology::HdmiDaisy => links.extend(ids.windows(2).map(|pair| LinkSpec {
                uut: pair[1].clone(),
                source: Some(pair[0].clone()),
                mode: RouteMode::DaisySync,
            })),
        }
        Self::from_links(links, root_trigger)
    }

    /// Graph from explicit links. Validated before it is returned.
    pub fn from_links(links: Vec<LinkSpec>, root_trigger: RootTrigger) -> AcqResult<Self> {
        let spec = Self {
            links,
            root_trigger,
            root_clock: RootClock::default(),
        };
        spec.validate()?;
        Ok(spec)
    }

    /// Take the root clock from `clock` instead of the internal default.
    #[must_use]
    pub fn with_root_clock(mut self, clock: RootClock) -> Self {
        self.root_clock = clock;
        self
    }

    /// Links in chain order.
    pub fn links(&self) -> &[LinkSpec] {
        &self.links
    }

    /// How the root is triggered.
    pub fn root_trigger(&self) -> RootTrigger {
        self.root_trigger
    }

    /// Where the root takes its clock from.
    pub fn root_clock(&self) -> RootClock {
        self.root_clock
    }

    /// Ids in chain order.
    pub fn ids(&self) -> Vec<UutId> {
        self.links.iter().map(|l| l.uut.clone()).collect()
    }

    fn validate(&self) -> AcqResult<()> {
        let invalid = |msg: String| Err(AcqError::InvalidTopology(msg));
        if self.links.is_empty() {
            return invalid("no units given".into());
        }

        let mut by_id: HashMap<&UutId, &LinkSpec> = HashMap::new();
        for link in &self.links {
            if by_id.insert(&link.uut, link).is_some() {
                return invalid(format!("unit '{}' appears twice", link.uut));
            }
        }

        let roots: Vec<&LinkSpec> = self.links.iter().filter(|l| l.source.is_none()).collect();
        let root = match roots.as_slice() {
            [root] => *root,
            [] => return invalid("no trigger source: every unit has an upstream".into()),
            many => {
                let names: Vec<&str> = many.iter().map(|l| l.uut.as_str()).collect();
                return invalid(format!(
                    "exactly one trigger source allowed, found {}",
                    names.join(", ")
                ));
            }
        };
        if root.mode != RouteMode::IntClk {
            return invalid(format!("root '{}' must use intclk, not {}", root.uut, root.mode));
        }

        for link in &self.links {
            let Some(source) = &link.source else { continue };
            if link.mode == RouteMode::IntClk {
                return invalid(format!("member '{}' cannot use intclk", link.uut));
            }
            if !by_id.contains_key(source) {
                return invalid(format!(
                    "'{}' sources from '{}', which is not in the chain",
                    link.uut, source
                ));
            }
            if link.mode == RouteMode::HdmiMaster && source != &root.uut {
                return invalid(format!(
                    "'{}' uses hdmi-master but sources from '{}' rather than the root",
                    link.uut, source
                ));
            }
        }

        // every member must resolve to the root without revisiting a unit
        for link in &self.links {
            let mut seen = HashSet::new();
            let mut current = link;
            while let Some(source) = &current.source {
                if !seen.insert(&current.uut) {
                    return invalid(format!("cycle through '{}'", link.uut));
                }
                match by_id.get(source) {
                    Some(next) => current = *next,
                    None => return invalid(format!("'{}' has a dangling source", current.uut)),
                }
            }
        }
        Ok(())
    }

    fn routing_for(&self, link: &LinkSpec, vocab: &Vocabulary) -> Vec<Setting> {
        let table = &vocab.routing;
        match link.mode {
            RouteMode::IntClk => {
                let mut routing = match self.root_clock {
                    RootClock::Internal(_) => table.root_clock_internal.clone(),
                    RootClock::FrontPanel => table.root_clock_front_panel.clone(),
                };
                routing.extend_from_slice(match self.root_trigger {
                    RootTrigger::Soft => &table.root_soft,
                    RootTrigger::FrontPanel => &table.root_front_panel,
                });
                match (self.root_clock, &table.clock_rate_param) {
                    (RootClock::Internal(Some(hz)), Some(param)) if hz > 0 => {
                        routing.push(Setting::new(param.clone(), hz.to_string()));
                    }
                    _ => {}
                }
                routing
            }
            RouteMode::DaisySync => table.daisy_member.clone(),
            RouteMode::HdmiMaster => table.hdmi_member.clone(),
        }
    }

    fn role_for(&self, link: &LinkSpec) -> Role {
        match &link.source {
            None if self.links.len() == 1 => Role::Standalone,
            None => Role::Master {
                trigger: self.root_trigger,
            },
            Some(upstream) => Role::Slave {
                upstream: upstream.clone(),
                mode: link.mode,
            },
        }
    }
}

/// One verified chain member.
#[derive(Debug, Clone)]
pub struct ChainMember {
    /// Unit handle
    pub handle: Arc<UutHandle>,
    /// Role assigned by the chain
    pub role: Role,
    /// Routing written and verified
    pub routing: Vec<Setting>,
}

/// A built and verified trigger chain.
#[derive(Debug)]
pub struct TriggerChain {
    spec: TopologySpec,
    members: Vec<ChainMember>,
}

impl TriggerChain {
    /// Members in chain order, root first.
    pub fn members(&self) -> &[ChainMember] {
        &self.members
    }

    /// Handles in chain order.
    pub fn handles(&self) -> Vec<Arc<UutHandle>> {
        self.members.iter().map(|m| Arc::clone(&m.handle)).collect()
    }

    /// The single trigger source.
    pub fn root(&self) -> &Arc<UutHandle> {
        &self.members[0].handle
    }

    /// Ids in chain order.
    pub fn ids(&self) -> Vec<UutId> {
        self.spec.ids()
    }

    /// The graph this chain was built from.
    pub fn spec(&self) -> &TopologySpec {
        &self.spec
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Always false for a built chain.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Configure and verify routing on `handles` according to `spec`.
///
/// The root is written first, then members concurrently. Verification reads every
/// written parameter back; the first mismatch in chain order fails the build.
pub async fn build_chain(
    handles: &[Arc<UutHandle>],
    spec: &TopologySpec,
) -> AcqResult<TriggerChain> {
    let by_id: HashMap<&UutId, &Arc<UutHandle>> = handles.iter().map(|h| (h.id(), h)).collect();
    let mut members = Vec::with_capacity(spec.links.len());
    for link in &spec.links {
        let handle = by_id
            .get(&link.uut)
            .ok_or_else(|| AcqError::UnknownUut(link.uut.clone()))?;
        members.push(ChainMember {
            handle: Arc::clone(handle),
            role: spec.role_for(link),
            routing: spec.routing_for(link, handle.vocabulary()),
        });
    }

    tracing::info!(
        units = members.len(),
        root = %members[0].handle.id(),
        trigger = ?spec.root_trigger,
        clock = %spec.root_clock,
        "building trigger chain"
    );

    write_routing(&members[0]).await?;
    let results = join_all(members[1..].iter().map(write_routing)).await;
    results.into_iter().collect::<AcqResult<Vec<()>>>()?;

    let readbacks = join_all(members.iter().map(read_routing)).await;
    for (member, readback) in members.iter().zip(readbacks) {
        for (setting, actual) in member.routing.iter().zip(readback?) {
            if actual.trim() != setting.value {
                tracing::error!(
                    uut = %member.handle.id(),
                    parameter = %setting.name,
                    expected = %setting.value,
                    actual = %actual,
                    "routing read-back mismatch"
                );
                return Err(AcqError::ChainVerification {
                    uut: member.handle.id().clone(),
                    parameter: setting.name.clone(),
                    expected: setting.value.clone(),
                    actual,
                });
            }
        }
    }

    for member in &members {
        member.handle.set_role(member.role.clone());
        tracing::debug!(uut = %member.handle.id(), role = %member.role, "chain member verified");
    }
    tracing::info!(units = members.len(), "trigger chain verified");

    Ok(TriggerChain {
        spec: spec.clone(),
        members,
    })
}

async fn write_routing(member: &ChainMember) -> AcqResult<()> {
    for setting in &member.routing {
        member.handle.apply(setting).await?;
    }
    Ok(())
}

async fn read_routing(member: &ChainMember) -> AcqResult<Vec<String>> {
    let mut values = Vec::with_capacity(member.routing.len());
    for setting in &member.routing {
        values.push(member.handle.get_parameter(&setting.name).await?);
    }
    Ok(values)
}

/// Session-scoped holder of the built chain.
#[derive(Debug, Clone, Default)]
pub struct ChainSlot {
    inner: Arc<RwLock<Option<Arc<TriggerChain>>>>,
}

impl ChainSlot {
    /// Create an empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a chain and store it, replacing any previous one.
    ///
    /// Fails with [`AcqError::ChainLocked`] while any capture loop holds a lease.
    pub async fn install(
        &self,
        handles: &[Arc<UutHandle>],
        spec: &TopologySpec,
    ) -> AcqResult<Arc<TriggerChain>> {
        let mut guard = self.inner.try_write().map_err(|_| AcqError::ChainLocked)?;
        let chain = Arc::new(build_chain(handles, spec).await?);
        *guard = Some(Arc::clone(&chain));
        Ok(chain)
    }

    /// Hold the chain for the duration of a capture loop.
    pub async fn lease(&self) -> AcqResult<ChainLease> {
        let guard = Arc::clone(&self.inner).read_owned().await;
        let chain = guard.as_ref().cloned().ok_or(AcqError::ChainNotBuilt)?;
        Ok(ChainLease {
            _guard: guard,
            chain,
        })
    }

    /// The current chain, if built and not being rebuilt.
    pub fn current(&self) -> Option<Arc<TriggerChain>> {
        self.inner.try_read().ok().and_then(|g| g.as_ref().cloned())
    }
}

/// Read lease on a built chain. While any lease is alive the chain cannot be rebuilt.
#[derive(Debug)]
pub struct ChainLease {
    _guard: OwnedRwLockReadGuard<Option<Arc<TriggerChain>>>,
    chain: Arc<TriggerChain>,
}

impl Deref for ChainLease {
    type Target = TriggerChain;

    fn deref(&self) -> &Self::Target {
        &self.chain
    }
}
