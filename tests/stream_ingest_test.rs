//! Streaming ingestion from simulated data ports.

mod common;

use std::time::Duration;
use tokio_util::sync::CancellationToken;

use acq_shot::sim::{SimCluster, SimConfig};
use acq_shot::stream::{
    ChannelTag, DataType, DirectorySink, MemorySink, StreamEnd, StreamLayout, StreamSession,
    StreamSettings,
};
use acq_shot::AcqError;

async fn ramp_cluster(channels: u16, stream_bytes: Option<u64>) -> SimCluster {
    common::cluster_with(SimConfig {
        channels,
        stream_bytes,
        ..SimConfig::default()
    })
    .await
}

fn session(cluster: &SimCluster, settings: StreamSettings, cancel: CancellationToken) -> StreamSession {
    let unit = cluster.unit(0).unwrap();
    StreamSession::new(unit.id().clone(), unit.endpoint().clone(), settings, cancel)
}

fn samples(data: &[u8]) -> Vec<i16> {
    data.chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}

#[tokio::test]
async fn test_ramp_arrives_in_order_with_short_tail() {
    // 10 blocks of 16 frames, one spare frame and 3 stray bytes
    let cluster = ramp_cluster(4, Some(10 * 128 + 8 + 3)).await;
    let layout = StreamLayout::new(4, DataType::I16, 16, false).unwrap();
    let sink = MemorySink::new();

    let summary = session(&cluster, StreamSettings::new(layout), CancellationToken::new())
        .run(sink.clone())
        .await
        .unwrap();

    assert_eq!(summary.end, StreamEnd::RemoteClosed);
    assert_eq!(summary.bytes, 1291);
    assert_eq!(summary.blocks, 11);
    assert_eq!(summary.discarded_tail_bytes, 3);

    let blocks = sink.blocks();
    let sequences: Vec<u64> = blocks.iter().map(|b| b.sequence).collect();
    assert_eq!(sequences, (0..11).collect::<Vec<u64>>());
    assert!(blocks.iter().all(|b| b.channel == ChannelTag::Interleaved));
    assert_eq!(blocks[10].len(), 8);

    // frame n, channel c carries n + c
    assert_eq!(samples(&blocks[0].data)[..4].to_vec(), vec![0, 1, 2, 3]);
    assert_eq!(samples(&blocks[1].data)[..4].to_vec(), vec![16, 17, 18, 19]);
    assert_eq!(samples(&blocks[10].data), vec![160, 161, 162, 163]);
}

#[tokio::test]
async fn test_slow_storage_overruns_and_reports_lost_block() {
    let cluster = ramp_cluster(4, None).await;
    let layout = StreamLayout::new(4, DataType::I16, 4, false).unwrap();
    let mut settings = StreamSettings::new(layout);
    settings.queue_depth = 2;
    let sink = MemorySink::new().with_commit_delay(Duration::from_millis(50));

    let err = session(&cluster, settings, CancellationToken::new())
        .run(sink.clone())
        .await
        .unwrap_err();

    let (lost, buffered) = match err {
        AcqError::Overrun {
            uut,
            channel,
            lost_sequence,
            buffered,
        } => {
            assert_eq!(uut.as_str(), "sim0");
            assert_eq!(channel, ChannelTag::Interleaved);
            (lost_sequence, buffered)
        }
        other => panic!("expected overrun, got {other:?}"),
    };
    assert!(buffered <= 2);

    // everything queued before the lost block was still stored, in order
    let stored: Vec<u64> = sink.blocks().iter().map(|b| b.sequence).collect();
    assert_eq!(stored, (0..lost).collect::<Vec<u64>>());
}

#[tokio::test]
async fn test_demux_writes_one_file_per_channel() {
    let dir = tempfile::tempdir().unwrap();
    // 3 blocks of 8 frames, 2 channels of int16
    let cluster = ramp_cluster(2, Some(3 * 32)).await;
    let layout = StreamLayout::new(2, DataType::I16, 8, true).unwrap();
    let sink = DirectorySink::new(dir.path(), "sim0");

    let summary = session(&cluster, StreamSettings::new(layout), CancellationToken::new())
        .run(sink)
        .await
        .unwrap();
    assert_eq!(summary.blocks, 6);

    let base = dir.path().join("sim0").join("000001");
    let ch1 = std::fs::read(base.join("0000.01")).unwrap();
    let ch2 = std::fs::read(base.join("0000.02")).unwrap();
    assert_eq!(samples(&ch1), (0..8).collect::<Vec<i16>>());
    assert_eq!(samples(&ch2), (1..9).collect::<Vec<i16>>());

    let last = std::fs::read(base.join("0002.02")).unwrap();
    assert_eq!(samples(&last), (17..25).collect::<Vec<i16>>());
    assert!(!base.join("0003.01").exists());
}

#[tokio::test]
async fn test_runtime_limit_ends_cleanly() {
    let cluster = ramp_cluster(4, None).await;
    let layout = StreamLayout::new(4, DataType::I16, 64, false).unwrap();
    let mut settings = StreamSettings::new(layout);
    settings.runtime = Some(Duration::from_millis(200));
    let sink = MemorySink::new();

    let summary = session(&cluster, settings, CancellationToken::new())
        .run(sink.clone())
        .await
        .unwrap();

    assert_eq!(summary.end, StreamEnd::LimitReached);
    assert!(summary.bytes > 0);
    assert_eq!(summary.blocks as usize, sink.blocks().len());
}

#[tokio::test]
async fn test_cancel_drains_queue() {
    let cluster = ramp_cluster(4, None).await;
    let layout = StreamLayout::new(4, DataType::I16, 64, false).unwrap();
    let cancel = CancellationToken::new();
    let sink = MemorySink::new();

    let trip = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        trip.cancel();
    });
    let summary = session(&cluster, StreamSettings::new(layout), cancel)
        .run(sink.clone())
        .await
        .unwrap();

    assert_eq!(summary.end, StreamEnd::Cancelled);
    let sequences: Vec<u64> = sink.blocks().iter().map(|b| b.sequence).collect();
    assert_eq!(sequences, (0..summary.blocks).collect::<Vec<u64>>());
}

#[tokio::test]
async fn test_stream_to_missing_port_is_connection_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let layout = StreamLayout::new(4, DataType::I16, 64, false).unwrap();
    let err = StreamSession::new(
        "gone".into(),
        acq_shot::uut::Endpoint::new("127.0.0.1", 0, port),
        StreamSettings::new(layout),
        CancellationToken::new(),
    )
    .run(MemorySink::new())
    .await
    .unwrap_err();
    assert!(matches!(err, AcqError::Connection { .. }));
}
