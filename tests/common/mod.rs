//! Shared helpers for integration tests: simulated clusters with short timings.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use acq_shot::capture::{LoopCount, LoopSettings};
use acq_shot::config::{AppConfig, UutDefinition};
use acq_shot::protocol::{ChannelTimeouts, Vocabulary};
use acq_shot::sim::{SimCluster, SimConfig, SimUnit};
use acq_shot::uut::UutHandle;

/// Cluster of `count` units capturing in 50 ms.
pub async fn cluster(count: usize) -> SimCluster {
    cluster_with(SimConfig {
        count,
        capture_time: Duration::from_millis(50),
        ..SimConfig::default()
    })
    .await
}

pub async fn cluster_with(config: SimConfig) -> SimCluster {
    SimCluster::start(config)
        .await
        .expect("Failed to start simulated units")
}

pub fn timeouts() -> ChannelTimeouts {
    ChannelTimeouts {
        connect: Duration::from_secs(1),
        reply: Duration::from_millis(300),
    }
}

/// Standalone handle on one simulated unit.
pub fn handle(unit: &SimUnit) -> Arc<UutHandle> {
    Arc::new(UutHandle::new(
        unit.id().clone(),
        unit.endpoint().clone(),
        Arc::new(Vocabulary::default()),
        timeouts(),
    ))
}

pub fn handles(cluster: &SimCluster) -> Vec<Arc<UutHandle>> {
    cluster.units().iter().map(handle).collect()
}

/// Loop settings scaled for simulated units.
pub fn fast_loop(count: LoopCount) -> LoopSettings {
    LoopSettings {
        count,
        poll_interval: Duration::from_millis(20),
        status_timeout: Duration::from_millis(300),
        arm_timeout: Duration::from_millis(500),
        shot_timeout: Duration::from_millis(800),
        ..LoopSettings::default()
    }
}

/// Application config pointing at every unit in `cluster`.
pub fn app_config(cluster: &SimCluster) -> AppConfig {
    let mut config = AppConfig::default();
    config.network.connect_timeout = Duration::from_secs(1);
    config.network.reply_timeout = Duration::from_millis(300);
    config.network.retry_backoff = Duration::from_millis(20);
    config.capture.poll_interval = Duration::from_millis(20);
    config.capture.status_timeout = Duration::from_millis(300);
    config.capture.arm_timeout = Duration::from_millis(500);
    config.capture.shot_timeout = Duration::from_millis(800);
    config.stream.stall_timeout = Duration::from_secs(2);
    config.uuts = cluster
        .units()
        .iter()
        .map(|u| UutDefinition {
            id: u.id().clone(),
            host: Some(u.endpoint().host.clone()),
            control_port: u.endpoint().control_port,
            data_port: u.endpoint().data_port,
        })
        .collect();
    config
}
