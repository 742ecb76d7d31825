//! Storage sinks for stream blocks.
//!
//! A sink accepts `(channel, sequence, bytes)` and guarantees durable, ordered
//! append. Naming is the sink's business. [`GuardedSink`] wraps any sink with the
//! per-channel sequence check so a gap or duplicate fails instead of being stored.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use super::framing::{ChannelTag, StreamBlock};
use crate::error::{AcqError, AcqResult};

/// Files per cycle directory.
pub const FILES_PER_CYCLE: u64 = 100;

/// Destination for stream blocks.
#[async_trait]
pub trait BlockSink: Send {
    /// Persist one block. Returns once the block is durable.
    async fn commit(&mut self, block: StreamBlock) -> AcqResult<()>;

    /// Flush anything held; called once after the last block.
    async fn finish(&mut self) -> AcqResult<()> {
        Ok(())
    }
}

/// Per-channel sequence expectations.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    expected: HashMap<ChannelTag, u64>,
}

impl SequenceTracker {
    /// Every channel starts at sequence 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `block` if it is the next in its channel; a gap or duplicate is an error.
    pub fn check(&mut self, block: &StreamBlock) -> AcqResult<()> {
        let expected = self.expected.entry(block.channel).or_insert(0);
        if block.sequence != *expected {
            return Err(AcqError::SequenceGap {
                channel: block.channel,
                expected: *expected,
                got: block.sequence,
            });
        }
        *expected += 1;
        Ok(())
    }

    /// Next expected sequence for `channel`.
    pub fn expected(&self, channel: ChannelTag) -> u64 {
        self.expected.get(&channel).copied().unwrap_or(0)
    }
}

/// Sequence-checking wrapper around a sink.
#[derive(Debug)]
pub struct GuardedSink<S> {
    inner: S,
    tracker: SequenceTracker,
}

impl<S: BlockSink> GuardedSink<S> {
    /// Wrap `inner`.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            tracker: SequenceTracker::new(),
        }
    }

    /// Unwrap.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

#[async_trait]
impl<S: BlockSink> BlockSink for GuardedSink<S> {
    async fn commit(&mut self, block: StreamBlock) -> AcqResult<()> {
        self.tracker.check(&block)?;
        self.inner.commit(block).await
    }

    async fn finish(&mut self) -> AcqResult<()> {
        self.inner.finish().await
    }
}

/// Writes each block to its own file under `ROOT/<uut>/<cycle:06>/<file:04>`.
///
/// Cycle directories hold [`FILES_PER_CYCLE`] files and are numbered from 1.
/// Demultiplexed blocks get a `.<channel:02>` suffix. Every session numbers from
/// block 0, so a file left by an earlier session is never overwritten: the commit
/// fails with [`AcqError::Storage`] instead.
#[derive(Debug)]
pub struct DirectorySink {
    base: PathBuf,
    written: u64,
}

impl DirectorySink {
    /// Sink rooted at `root/uut`.
    pub fn new(root: impl AsRef<Path>, uut: &str) -> Self {
        Self {
            base: root.as_ref().join(uut),
            written: 0,
        }
    }

    /// Directory blocks are written under.
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Blocks written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Path a block is stored at.
    pub fn path_for(&self, channel: ChannelTag, sequence: u64) -> PathBuf {
        let cycle = sequence / FILES_PER_CYCLE + 1;
        let file = sequence % FILES_PER_CYCLE;
        let name = match channel {
            ChannelTag::Interleaved => format!("{file:04}"),
            ChannelTag::Channel(ch) => format!("{file:04}.{ch:02}"),
        };
        self.base.join(format!("{cycle:06}")).join(name)
    }
}

#[async_trait]
impl BlockSink for DirectorySink {
    async fn commit(&mut self, block: StreamBlock) -> AcqResult<()> {
        let path = self.path_for(block.channel, block.sequence);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => std::io::Error::new(
                    e.kind(),
                    format!("{} holds an earlier capture, not overwriting it", path.display()),
                ),
                _ => e,
            })?;
        file.write_all(&block.data).await?;
        file.sync_data().await?;
        self.written += 1;
        tracing::trace!(path = %path.display(), bytes = block.len(), "block committed");
        Ok(())
    }
}

/// Counts blocks and drops them, for runs that only exercise the data path.
#[derive(Debug, Clone, Default)]
pub struct DiscardSink {
    blocks: u64,
    bytes: u64,
}

impl DiscardSink {
    /// Empty counter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks dropped so far.
    pub fn blocks(&self) -> u64 {
        self.blocks
    }

    /// Bytes dropped so far.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

#[async_trait]
impl BlockSink for DiscardSink {
    async fn commit(&mut self, block: StreamBlock) -> AcqResult<()> {
        self.blocks += 1;
        self.bytes += block.len() as u64;
        Ok(())
    }
}

/// In-memory sink, optionally slowed down to model a lagging disk.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    blocks: Arc<Mutex<Vec<StreamBlock>>>,
    commit_delay: Option<Duration>,
}

impl MemorySink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep for `delay` inside every commit.
    #[must_use]
    pub fn with_commit_delay(mut self, delay: Duration) -> Self {
        self.commit_delay = Some(delay);
        self
    }

    /// Shared view of committed blocks; clones observe the same storage.
    pub fn blocks(&self) -> Vec<StreamBlock> {
        self.blocks.lock().clone()
    }
}

#[async_trait]
impl BlockSink for MemorySink {
    async fn commit(&mut self, block: StreamBlock) -> AcqResult<()> {
        if let Some(delay) = self.commit_delay {
            tokio::time::sleep(delay).await;
        }
        self.blocks.lock().push(block);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::framing::DataType;
    use bytes::Bytes;

    fn block(channel: ChannelTag, sequence: u64) -> StreamBlock {
        StreamBlock {
            channel,
            datatype: DataType::I16,
            sequence,
            data: Bytes::from_static(&[1, 2, 3, 4]),
        }
    }

    #[test]
    fn test_tracker_is_per_channel() {
        let mut t = SequenceTracker::new();
        t.check(&block(ChannelTag::Channel(1), 0)).unwrap();
        t.check(&block(ChannelTag::Channel(2), 0)).unwrap();
        t.check(&block(ChannelTag::Channel(1), 1)).unwrap();
        assert_eq!(t.expected(ChannelTag::Channel(1)), 2);
        assert_eq!(t.expected(ChannelTag::Channel(2)), 1);
    }

    #[tokio::test]
    async fn test_dropped_block_is_a_gap() {
        let mem = MemorySink::new();
        let mut sink = GuardedSink::new(mem.clone());
        sink.commit(block(ChannelTag::Interleaved, 0)).await.unwrap();
        sink.commit(block(ChannelTag::Interleaved, 1)).await.unwrap();
        let err = sink
            .commit(block(ChannelTag::Interleaved, 3))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AcqError::SequenceGap {
                expected: 2,
                got: 3,
                ..
            }
        ));
        assert_eq!(mem.blocks().len(), 2, "the out-of-order block is not stored");
    }

    #[tokio::test]
    async fn test_duplicate_is_rejected() {
        let mut sink = GuardedSink::new(MemorySink::new());
        sink.commit(block(ChannelTag::Interleaved, 0)).await.unwrap();
        assert!(sink.commit(block(ChannelTag::Interleaved, 0)).await.is_err());
    }

    #[test]
    fn test_directory_naming() {
        let sink = DirectorySink::new("/data", "acq2106_001");
        assert_eq!(
            sink.path_for(ChannelTag::Interleaved, 0),
            PathBuf::from("/data/acq2106_001/000001/0000")
        );
        assert_eq!(
            sink.path_for(ChannelTag::Interleaved, 199),
            PathBuf::from("/data/acq2106_001/000002/0099")
        );
        assert_eq!(
            sink.path_for(ChannelTag::Channel(3), 100),
            PathBuf::from("/data/acq2106_001/000002/0000.03")
        );
    }

    #[tokio::test]
    async fn test_directory_sink_writes_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = DirectorySink::new(dir.path(), "uut");
        sink.commit(block(ChannelTag::Interleaved, 0)).await.unwrap();
        let stored = std::fs::read(dir.path().join("uut/000001/0000")).unwrap();
        assert_eq!(stored, vec![1, 2, 3, 4]);
        assert_eq!(sink.written(), 1);
    }

    #[tokio::test]
    async fn test_second_session_does_not_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = DirectorySink::new(dir.path(), "uut");
        first.commit(block(ChannelTag::Channel(1), 0)).await.unwrap();

        let mut second = DirectorySink::new(dir.path(), "uut");
        let mut clobber = block(ChannelTag::Channel(1), 0);
        clobber.data = Bytes::from_static(&[2, 2, 2, 2]);
        let err = second.commit(clobber).await.unwrap_err();
        match err {
            AcqError::Storage(e) => assert_eq!(e.kind(), std::io::ErrorKind::AlreadyExists),
            other => panic!("expected storage error, got {other:?}"),
        }
        assert_eq!(second.written(), 0);

        let stored = std::fs::read(dir.path().join("uut/000001/0000.01")).unwrap();
        assert_eq!(stored, vec![1, 2, 3, 4], "first session's block survives");
    }

    #[tokio::test]
    async fn test_discard_sink_counts() {
        let mut sink = DiscardSink::new();
        sink.commit(block(ChannelTag::Interleaved, 0)).await.unwrap();
        sink.commit(block(ChannelTag::Interleaved, 1)).await.unwrap();
        assert_eq!(sink.blocks(), 2);
        assert_eq!(sink.bytes(), 8);
    }
}
