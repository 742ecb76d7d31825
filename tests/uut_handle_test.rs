//! Command channel and UUT handle behaviour against simulated units.

mod common;

use std::time::Duration;

use acq_shot::capture::{CaptureConfig, TriggerMode};
use acq_shot::sim::SimFault;
use acq_shot::uut::{ConnectionState, DeviceState, Endpoint, UutHandle, UutId};
use acq_shot::AcqError;

#[tokio::test]
async fn test_same_config_twice_gives_same_wire_sequence() {
    let cluster = common::cluster(1).await;
    let unit = cluster.unit(0).unwrap();
    let handle = common::handle(unit);
    handle.connect().await.unwrap();

    let cfg = CaptureConfig::new(0, 1024, TriggerMode::Soft, false).unwrap();

    unit.clear_commands();
    cfg.apply(&handle).await.unwrap();
    let first = unit.commands();
    let readback_first = handle.get_parameter("transient").await.unwrap();

    unit.clear_commands();
    cfg.apply(&handle).await.unwrap();
    let second = unit.commands();
    let readback_second = handle.get_parameter("transient").await.unwrap();

    assert_eq!(first, second);
    assert_eq!(
        first,
        vec![
            "transient=PRE=0 POST=1024 SOFT_TRIGGER=1".to_string(),
            "simulate=0".to_string()
        ]
    );
    assert_eq!(readback_first, readback_second);
    assert_eq!(readback_second, "PRE=0 POST=1024 SOFT_TRIGGER=1");
    assert_eq!(
        handle.snapshot().get("transient").map(String::as_str),
        Some("PRE=0 POST=1024 SOFT_TRIGGER=1")
    );
}

#[tokio::test]
async fn test_handshake_sent_on_connect() {
    let cluster = common::cluster(1).await;
    let unit = cluster.unit(0).unwrap();
    let handle = common::handle(unit);

    handle.connect().await.unwrap();
    assert_eq!(handle.connection_state(), ConnectionState::Connected);
    // connect is a no-op on a live channel
    handle.connect().await.unwrap();
    assert_eq!(unit.commands(), vec!["prompt on".to_string()]);
}

#[tokio::test]
async fn test_arm_and_status() {
    let cluster = common::cluster(1).await;
    let handle = common::handle(cluster.unit(0).unwrap());

    let idle = handle.poll_status(Duration::from_millis(300)).await.unwrap();
    assert_eq!(idle.state, Some(DeviceState::Idle));
    assert!(!idle.stale);

    handle.arm().await.unwrap();
    let armed = handle.poll_status(Duration::from_millis(300)).await.unwrap();
    assert_eq!(armed.state, Some(DeviceState::Armed));

    handle.abort().await.unwrap();
    let aborted = handle.poll_status(Duration::from_millis(300)).await.unwrap();
    assert_eq!(aborted.state, Some(DeviceState::Idle));
}

#[tokio::test]
async fn test_unknown_parameter_is_protocol_error() {
    let cluster = common::cluster(1).await;
    let handle = common::handle(cluster.unit(0).unwrap());

    let err = handle.get_parameter("NO_SUCH_KNOB").await.unwrap_err();
    match &err {
        AcqError::Protocol {
            uut,
            operation,
            exchange,
            ..
        } => {
            assert_eq!(uut.as_str(), "sim0");
            assert!(operation.contains("NO_SUCH_KNOB") || operation == "get_parameter");
            assert_eq!(exchange.command, "NO_SUCH_KNOB");
        }
        other => panic!("expected protocol error, got {other:?}"),
    }
    assert!(err.to_string().contains("sim0"));

    // a rejection does not poison the channel
    assert_eq!(handle.get_parameter("NCHAN").await.unwrap(), "4");
    assert_eq!(handle.connection_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_malformed_reply_is_protocol_error() {
    let cluster = common::cluster(1).await;
    let unit = cluster.unit(0).unwrap();
    let handle = common::handle(unit);
    handle.connect().await.unwrap();

    unit.inject(SimFault::Malformed);
    let err = handle.get_parameter("NCHAN").await.unwrap_err();
    assert!(matches!(err, AcqError::Protocol { .. }), "got {err:?}");

    unit.clear_faults();
    assert_eq!(handle.get_parameter("NCHAN").await.unwrap(), "4");
}

#[tokio::test]
async fn test_silent_unit_gives_stale_status_then_recovers() {
    let cluster = common::cluster(1).await;
    let unit = cluster.unit(0).unwrap();
    let handle = common::handle(unit);

    let first = handle.poll_status(Duration::from_millis(300)).await.unwrap();
    assert_eq!(first.state, Some(DeviceState::Idle));

    unit.inject(SimFault::Silent);
    let started = std::time::Instant::now();
    let stale = handle.poll_status(Duration::from_millis(150)).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(stale.stale);
    assert_eq!(stale.state, Some(DeviceState::Idle), "last known state is kept");
    assert!(stale.fault.is_some());
    assert_eq!(handle.connection_state(), ConnectionState::Faulted);

    unit.clear_faults();
    let fresh = handle.poll_status(Duration::from_millis(300)).await.unwrap();
    assert!(!fresh.stale);
    assert_eq!(handle.connection_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_silent_unit_times_out_plain_commands() {
    let cluster = common::cluster(1).await;
    let unit = cluster.unit(0).unwrap();
    let handle = common::handle(unit);
    handle.connect().await.unwrap();

    unit.inject(SimFault::Silent);
    let err = handle.arm().await.unwrap_err();
    match err {
        AcqError::Timeout { uut, after, .. } => {
            assert_eq!(uut.as_str(), "sim0");
            assert_eq!(after, common::timeouts().reply);
        }
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn test_unreachable_unit() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let handle = UutHandle::new(
        UutId::new("gone"),
        Endpoint::new("127.0.0.1", port, 0),
        std::sync::Arc::new(Default::default()),
        common::timeouts(),
    );
    let err = handle.connect().await.unwrap_err();
    assert!(err.is_unreachable());
    assert_eq!(err.uut().map(UutId::as_str), Some("gone"));
    assert_eq!(handle.connection_state(), ConnectionState::Faulted);
}
