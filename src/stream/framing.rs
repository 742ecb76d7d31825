//! Stream framing: fixed-size frames reassembled into sequenced blocks.
//!
//! The data socket carries interleaved samples with no in-band framing. One frame
//! is one sample for every channel (`channels × element width` bytes); a block is
//! `frames_per_block` whole frames. Sequence numbers are derived from the byte
//! offset, so they can only be contiguous if no bytes were lost.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{AcqError, AcqResult};

/// Sample element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// 16-bit signed
    #[default]
    I16,
    /// 32-bit signed
    I32,
}

impl DataType {
    /// Element width in bytes.
    pub fn width(self) -> usize {
        match self {
            DataType::I16 => 2,
            DataType::I32 => 4,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DataType::I16 => "int16",
            DataType::I32 => "int32",
        })
    }
}

/// Stream geometry agreed out of band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamLayout {
    channels: u16,
    datatype: DataType,
    frames_per_block: usize,
    demux: bool,
}

impl StreamLayout {
    /// Validate and build.
    pub fn new(
        channels: u16,
        datatype: DataType,
        frames_per_block: usize,
        demux: bool,
    ) -> AcqResult<Self> {
        if channels == 0 {
            return Err(AcqError::InvalidConfig("channel count must be non-zero".into()));
        }
        if frames_per_block == 0 {
            return Err(AcqError::InvalidConfig(
                "frames per block must be non-zero".into(),
            ));
        }
        Ok(Self {
            channels,
            datatype,
            frames_per_block,
            demux,
        })
    }

    /// Channel count.
    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Element type.
    pub fn datatype(&self) -> DataType {
        self.datatype
    }

    /// Frames per block.
    pub fn frames_per_block(&self) -> usize {
        self.frames_per_block
    }

    /// Whether blocks are split per channel.
    pub fn demux(&self) -> bool {
        self.demux
    }

    /// Bytes per frame.
    pub fn frame_bytes(&self) -> usize {
        usize::from(self.channels) * self.datatype.width()
    }

    /// Bytes per full block.
    pub fn block_bytes(&self) -> usize {
        self.frame_bytes() * self.frames_per_block
    }
}

/// Which channel a block carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelTag {
    /// All channels interleaved, as received
    Interleaved,
    /// One channel, 1-based
    Channel(u16),
}

impl fmt::Display for ChannelTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelTag::Interleaved => write!(f, "interleaved"),
            ChannelTag::Channel(ch) => write!(f, "CH{ch:02}"),
        }
    }
}

/// A sequenced, contiguous byte range for one channel tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamBlock {
    /// Channel tag
    pub channel: ChannelTag,
    /// Element type
    pub datatype: DataType,
    /// Block sequence number
    pub sequence: u64,
    /// Payload
    pub data: Bytes,
}

impl StreamBlock {
    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True for an empty payload.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Reassembles an unframed byte stream into blocks.
#[derive(Debug)]
pub struct BlockAssembler {
    layout: StreamLayout,
    pending: BytesMut,
    next_sequence: u64,
}

impl BlockAssembler {
    /// Start at sequence 0.
    pub fn new(layout: StreamLayout) -> Self {
        Self {
            layout,
            pending: BytesMut::with_capacity(layout.block_bytes()),
            next_sequence: 0,
        }
    }

    /// Layout in use.
    pub fn layout(&self) -> &StreamLayout {
        &self.layout
    }

    /// Bytes held waiting for a full block.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Append received bytes; return every block completed by them.
    pub fn push(&mut self, data: &[u8]) -> Vec<StreamBlock> {
        self.pending.extend_from_slice(data);
        let block_bytes = self.layout.block_bytes();
        let mut out = Vec::with_capacity(self.pending.len() / block_bytes);
        while self.pending.len() >= block_bytes {
            let data = self.pending.split_to(block_bytes).freeze();
            out.push(self.next_block(data));
        }
        out
    }

    /// End of stream: the whole frames still held form a short final block. Returns
    /// it with the byte count of any trailing partial frame, which is discarded.
    pub fn finish(mut self) -> (Option<StreamBlock>, usize) {
        let frame_bytes = self.layout.frame_bytes();
        let whole = self.pending.len() / frame_bytes * frame_bytes;
        let partial = self.pending.len() - whole;
        if whole == 0 {
            return (None, partial);
        }
        let data = self.pending.split_to(whole).freeze();
        (Some(self.next_block(data)), partial)
    }

    fn next_block(&mut self, data: Bytes) -> StreamBlock {
        let block = StreamBlock {
            channel: ChannelTag::Interleaved,
            datatype: self.layout.datatype,
            sequence: self.next_sequence,
            data,
        };
        self.next_sequence += 1;
        block
    }
}

/// Split an interleaved block into one block per channel, same sequence number.
pub fn demux(block: &StreamBlock, layout: &StreamLayout) -> Vec<StreamBlock> {
    let width = layout.datatype.width();
    let channels = usize::from(layout.channels);
    let frame_bytes = layout.frame_bytes();
    let frames = block.data.len() / frame_bytes;

    let mut lanes: Vec<BytesMut> = (0..channels)
        .map(|_| BytesMut::with_capacity(frames * width))
        .collect();
    for frame in block.data.chunks_exact(frame_bytes) {
        for (lane, sample) in lanes.iter_mut().zip(frame.chunks_exact(width)) {
            lane.extend_from_slice(sample);
        }
    }
    lanes
        .into_iter()
        .enumerate()
        .map(|(idx, lane)| StreamBlock {
            channel: ChannelTag::Channel(idx as u16 + 1),
            datatype: block.datatype,
            sequence: block.sequence,
            data: lane.freeze(),
        })
        .collect()
}
