//! Data plane: framing, storage sinks and the streaming ingestion session.

pub mod framing;
pub mod ingest;
pub mod sink;

pub use framing::{BlockAssembler, ChannelTag, DataType, StreamBlock, StreamLayout};
pub use ingest::{StreamEnd, StreamSession, StreamSettings, StreamSummary};
pub use sink::{
    BlockSink, DirectorySink, DiscardSink, GuardedSink, MemorySink, SequenceTracker,
};
