//! Control protocol: reply grammar, firmware vocabulary and the per-UUT command channel.

pub mod channel;
pub mod grammar;
pub mod vocabulary;

pub use channel::{ChannelTimeouts, CommandChannel};
pub use grammar::{Reply, ReplyLine};
pub use vocabulary::{Setting, Vocabulary};
