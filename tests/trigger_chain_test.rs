//! Trigger-chain construction and verification against simulated units.

mod common;

use acq_shot::chain::{
    build_chain, ChainSlot, RootClock, RootTrigger, RouteMode, Topology, TopologySpec,
};
use acq_shot::sim::SimFault;
use acq_shot::uut::Role;
use acq_shot::AcqError;

#[tokio::test]
async fn test_daisy_chain_builds_and_assigns_roles() {
    let cluster = common::cluster(3).await;
    let handles = common::handles(&cluster);
    let spec = TopologySpec::new(Topology::HdmiDaisy, &cluster.ids(), RootTrigger::Soft).unwrap();

    let chain = build_chain(&handles, &spec).await.unwrap();
    assert_eq!(chain.len(), 3);
    assert_eq!(chain.root().id().as_str(), "sim0");
    assert!(matches!(handles[0].role(), Role::Master { trigger: RootTrigger::Soft }));
    match handles[2].role() {
        Role::Slave { upstream, mode } => {
            assert_eq!(upstream.as_str(), "sim1");
            assert_eq!(mode, RouteMode::DaisySync);
        }
        other => panic!("expected slave, got {other:?}"),
    }

    let root = cluster.unit(0).unwrap();
    assert_eq!(root.param("SIG:SRC:TRG:1").as_deref(), Some("STRIG"));
    let member = cluster.unit(1).unwrap();
    assert_eq!(member.param("SIG:SRC:CLK:1").as_deref(), Some("HDMI"));
    assert_eq!(member.param("SIG:SYNC_OUT:TRG").as_deref(), Some("TRG"));
}

#[tokio::test]
async fn test_master_slaves_front_panel_routing() {
    let cluster = common::cluster(2).await;
    let handles = common::handles(&cluster);
    let spec =
        TopologySpec::new(Topology::MasterSlaves, &cluster.ids(), RootTrigger::FrontPanel).unwrap();
    build_chain(&handles, &spec).await.unwrap();

    let root_cmds = cluster.unit(0).unwrap().commands();
    assert!(root_cmds.contains(&"SIG:SRC:TRG:0=EXT".to_string()));
    // the member only learns hdmi routing, never the root's sync-out drive
    let member_cmds = cluster.unit(1).unwrap().commands();
    assert!(member_cmds.contains(&"SIG:SRC:TRG:0=HDMI".to_string()));
    assert!(!member_cmds.iter().any(|c| c.starts_with("SIG:SYNC_OUT")));
}

#[tokio::test]
async fn test_front_panel_clock_on_root() {
    let cluster = common::cluster(2).await;
    let handles = common::handles(&cluster);
    let spec = TopologySpec::new(Topology::HdmiDaisy, &cluster.ids(), RootTrigger::FrontPanel)
        .unwrap()
        .with_root_clock(RootClock::FrontPanel);
    let chain = build_chain(&handles, &spec).await.unwrap();
    assert_eq!(chain.spec().root_clock(), RootClock::FrontPanel);

    let root = cluster.unit(0).unwrap();
    assert_eq!(root.param("SYS:CLK:FPMUX").as_deref(), Some("FPCLK"));
    assert_eq!(root.param("SIG:SYNC_OUT:CLK:DX").as_deref(), Some("d0"));
    assert_eq!(root.param("SIG:SRC:TRG:0").as_deref(), Some("EXT"));
    assert!(root.param("SIG:CLK_MB:SET").is_none());
    // members are routed the same whatever the root's clock source
    let member = cluster.unit(1).unwrap();
    assert!(member.param("SYS:CLK:FPMUX").is_none());
    assert_eq!(member.param("SIG:SRC:CLK:1").as_deref(), Some("HDMI"));
}

#[tokio::test]
async fn test_internal_clock_rate_is_verified() {
    let cluster = common::cluster(1).await;
    cluster.unit(0).unwrap().inject(SimFault::ReadbackOverride {
        name: "SIG:CLK_MB:SET".into(),
        value: "1000000".into(),
    });
    let handles = common::handles(&cluster);
    let spec = TopologySpec::new(Topology::Standalone, &cluster.ids(), RootTrigger::Soft)
        .unwrap()
        .with_root_clock(RootClock::Internal(Some(2_000_000)));

    let err = build_chain(&handles, &spec).await.unwrap_err();
    match err {
        AcqError::ChainVerification {
            parameter,
            expected,
            actual,
            ..
        } => {
            assert_eq!(parameter, "SIG:CLK_MB:SET");
            assert_eq!(expected, "2000000");
            assert_eq!(actual, "1000000");
        }
        other => panic!("expected verification failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_mismatched_readback_names_the_unit() {
    let cluster = common::cluster(3).await;
    cluster.unit(2).unwrap().inject(SimFault::ReadbackOverride {
        name: "SIG:SRC:TRG:0".into(),
        value: "EXT".into(),
    });
    let handles = common::handles(&cluster);
    let spec = TopologySpec::new(Topology::HdmiDaisy, &cluster.ids(), RootTrigger::Soft).unwrap();

    for _ in 0..3 {
        let err = build_chain(&handles, &spec).await.unwrap_err();
        match err {
            AcqError::ChainVerification {
                uut,
                parameter,
                expected,
                actual,
            } => {
                assert_eq!(uut.as_str(), "sim2");
                assert_eq!(parameter, "SIG:SRC:TRG:0");
                assert_eq!(expected, "HDMI");
                assert_eq!(actual, "EXT");
            }
            other => panic!("expected chain verification failure, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_standalone_rejects_extra_units() {
    let cluster = common::cluster(2).await;
    let err = TopologySpec::new(Topology::Standalone, &cluster.ids(), RootTrigger::Soft).unwrap_err();
    assert!(matches!(err, AcqError::InvalidTopology(_)));
}

#[tokio::test]
async fn test_rebuild_refused_while_leased() {
    let cluster = common::cluster(2).await;
    let handles = common::handles(&cluster);
    let spec = TopologySpec::new(Topology::HdmiDaisy, &cluster.ids(), RootTrigger::Soft).unwrap();
    let slot = ChainSlot::new();

    assert!(matches!(slot.lease().await, Err(AcqError::ChainNotBuilt)));
    slot.install(&handles, &spec).await.unwrap();

    let lease = slot.lease().await.unwrap();
    assert_eq!(lease.len(), 2);
    assert!(matches!(
        slot.install(&handles, &spec).await,
        Err(AcqError::ChainLocked)
    ));

    drop(lease);
    slot.install(&handles, &spec).await.unwrap();
    assert!(slot.current().is_some());
}
