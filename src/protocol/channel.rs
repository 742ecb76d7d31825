//! Command channel: one persistent request/reply connection to a UUT control port.
//!
//! Requests are single lines (`NAME=VALUE`, `NAME` or a bare verb). The UUT answers
//! with zero or more lines followed by a prompt sentinel that is *not* newline
//! terminated, so replies are read into a buffer and scanned for the prompt rather
//! than read line by line.
//!
//! The channel never retries. A timeout leaves the byte stream in an unknown
//! position, so the channel marks itself desynchronised and refuses further
//! commands; the owner reconnects.

use bytes::BytesMut;
use regex::bytes::Regex as BytesRegex;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::{AcqError, AcqResult, Exchange, LastExchange};
use crate::protocol::grammar::Reply;
use crate::protocol::vocabulary::Vocabulary;
use crate::uut::{Endpoint, UutId};

/// Default command reply timeout in milliseconds
pub const DEFAULT_REPLY_TIMEOUT_MS: u64 = 2000;

/// Default connect timeout in milliseconds
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;

/// Replies larger than this are treated as out of grammar.
const MAX_REPLY_BYTES: usize = 64 * 1024;

/// Timeouts applied by a command channel.
#[derive(Debug, Clone, Copy)]
pub struct ChannelTimeouts {
    /// Bound on establishing the TCP connection
    pub connect: Duration,
    /// Bounded read window for each reply
    pub reply: Duration,
}

impl Default for ChannelTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            reply: Duration::from_millis(DEFAULT_REPLY_TIMEOUT_MS),
        }
    }
}

/// Async command channel for one UUT.
pub struct CommandChannel {
    uut: UutId,
    stream: TcpStream,
    buffer: BytesMut,
    prompt: BytesRegex,
    timeouts: ChannelTimeouts,
    last: Option<Exchange>,
    desynced: bool,
}

impl std::fmt::Debug for CommandChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandChannel")
            .field("uut", &self.uut)
            .field("desynced", &self.desynced)
            .finish()
    }
}

impl CommandChannel {
    /// Connect to the control endpoint and run the vocabulary handshake.
    pub async fn connect(
        uut: UutId,
        endpoint: &Endpoint,
        vocab: &Vocabulary,
        timeouts: ChannelTimeouts,
    ) -> AcqResult<Self> {
        let prompt = vocab
            .prompt_regex()
            .map_err(AcqError::InvalidConfig)?;
        let addr = endpoint.control_addr();

        let stream = match timeout(timeouts.connect, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(AcqError::Connection {
                    uut,
                    operation: "connect".into(),
                    source,
                    last: LastExchange(None),
                })
            }
            Err(_) => {
                return Err(AcqError::Connection {
                    uut,
                    operation: "connect".into(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("no connection to {addr} within {:?}", timeouts.connect),
                    ),
                    last: LastExchange(None),
                })
            }
        };

        // Disable Nagle's algorithm for low latency
        if let Err(source) = stream.set_nodelay(true) {
            return Err(AcqError::Connection {
                uut,
                operation: "connect".into(),
                source,
                last: LastExchange(None),
            });
        }

        tracing::info!(uut = %uut, %addr, firmware = %vocab.version, "command channel connected");

        let mut channel = Self {
            uut,
            stream,
            buffer: BytesMut::with_capacity(4096),
            prompt,
            timeouts,
            last: None,
            desynced: false,
        };
        for command in &vocab.handshake {
            channel.send(command).await?;
        }
        Ok(channel)
    }

    /// UUT this channel talks to.
    pub fn uut(&self) -> &UutId {
        &self.uut
    }

    /// Last exchange completed or attempted on this channel.
    pub fn last_exchange(&self) -> Option<&Exchange> {
        self.last.as_ref()
    }

    /// False once a timeout or framing failure has left the stream position unknown.
    pub fn is_usable(&self) -> bool {
        !self.desynced
    }

    /// Set the reply timeout duration.
    pub fn set_reply_timeout(&mut self, duration: Duration) {
        self.timeouts.reply = duration;
    }

    /// Send one command and read its reply.
    pub async fn send(&mut self, command: &str) -> AcqResult<Reply> {
        self.send_within(command, self.timeouts.reply).await
    }

    /// Send one command, bounding the reply wait by `window`.
    pub async fn send_within(&mut self, command: &str, window: Duration) -> AcqResult<Reply> {
        let operation = format!("send {command:?}");
        if self.desynced {
            return Err(AcqError::Connection {
                uut: self.uut.clone(),
                operation,
                source: std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "channel desynchronised by an earlier failure",
                ),
                last: LastExchange(self.last.clone()),
            });
        }

        tracing::debug!(uut = %self.uut, "cmd > {:?}", command);
        self.last = Some(Exchange::new(command, ""));

        let line = format!("{command}\n");
        if let Err(source) = self.stream.write_all(line.as_bytes()).await {
            self.desynced = true;
            return Err(self.connection_error(operation, source));
        }
        if let Err(source) = self.stream.flush().await {
            self.desynced = true;
            return Err(self.connection_error(operation, source));
        }

        let body = match timeout(window, self.read_until_prompt()).await {
            Ok(Ok(body)) => body,
            Ok(Err(err)) => {
                self.desynced = true;
                return Err(match err {
                    ReadFailure::Io(source) => self.connection_error(operation, source),
                    ReadFailure::Oversized(partial) => AcqError::Protocol {
                        uut: self.uut.clone(),
                        operation,
                        detail: format!("reply exceeded {MAX_REPLY_BYTES} bytes without a prompt"),
                        exchange: Exchange::new(command, partial),
                    },
                });
            }
            Err(_) => {
                self.desynced = true;
                let partial = String::from_utf8_lossy(&self.buffer).into_owned();
                self.last = Some(Exchange::new(command, partial));
                return Err(AcqError::Timeout {
                    uut: self.uut.clone(),
                    operation,
                    after: window,
                    last: LastExchange(self.last.clone()),
                });
            }
        };

        let text = match String::from_utf8(body) {
            Ok(text) => text,
            Err(e) => {
                let lossy = String::from_utf8_lossy(e.as_bytes()).into_owned();
                self.last = Some(Exchange::new(command, lossy.clone()));
                return Err(AcqError::Protocol {
                    uut: self.uut.clone(),
                    operation,
                    detail: "reply is not valid UTF-8".into(),
                    exchange: Exchange::new(command, lossy),
                });
            }
        };
        tracing::debug!(uut = %self.uut, "cmd < {:?}", text);
        self.last = Some(Exchange::new(command, text.clone()));

        Reply::parse(&text).map_err(|e| AcqError::Protocol {
            uut: self.uut.clone(),
            operation,
            detail: e.to_string(),
            exchange: Exchange::new(command, text.clone()),
        })
    }

    /// Close the connection.
    pub async fn close(mut self) {
        if let Err(e) = self.stream.shutdown().await {
            tracing::debug!(uut = %self.uut, "shutdown on close failed: {}", e);
        }
    }

    /// Read until the prompt appears; return the body before it, trailing CR/LF stripped.
    async fn read_until_prompt(&mut self) -> Result<Vec<u8>, ReadFailure> {
        loop {
            if let Some(m) = self.prompt.find(&self.buffer) {
                let (start, end) = (m.start(), m.end());
                let frame = self.buffer.split_to(end);
                let mut body = frame[..start].to_vec();
                while matches!(body.last(), Some(b'\n' | b'\r')) {
                    body.pop();
                }
                // prompt is followed by a single space on some firmware
                while matches!(self.buffer.first(), Some(b' ')) {
                    let _ = self.buffer.split_to(1);
                }
                return Ok(body);
            }
            if self.buffer.len() > MAX_REPLY_BYTES {
                return Err(ReadFailure::Oversized(
                    String::from_utf8_lossy(&self.buffer).into_owned(),
                ));
            }
            let n = self
                .stream
                .read_buf(&mut self.buffer)
                .await
                .map_err(ReadFailure::Io)?;
            if n == 0 {
                return Err(ReadFailure::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed by device",
                )));
            }
        }
    }

    fn connection_error(&self, operation: String, source: std::io::Error) -> AcqError {
        AcqError::Connection {
            uut: self.uut.clone(),
            operation,
            source,
            last: LastExchange(self.last.clone()),
        }
    }
}

enum ReadFailure {
    Io(std::io::Error),
    Oversized(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    /// Minimal scripted peer: answers each request line with the next canned reply.
    async fn scripted_peer(replies: Vec<&'static str>) -> Endpoint {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            let (rd, mut wr) = sock.into_split();
            let mut lines = BufReader::new(rd).lines();
            let mut count = 0;
            for reply in replies {
                if lines.next_line().await.unwrap().is_none() {
                    return;
                }
                count += 1;
                let out = format!("{reply}\nacq400.0 {count} >");
                wr.write_all(out.as_bytes()).await.unwrap();
            }
            // keep the socket open without answering
            let _ = lines.next_line().await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
        Endpoint::new("127.0.0.1", port, 0)
    }

    #[tokio::test]
    async fn test_handshake_and_query() {
        let endpoint = scripted_peer(vec!["", "TRANS_ACT:STATE IDLE"]).await;
        let mut ch = CommandChannel::connect(
            UutId::new("u1"),
            &endpoint,
            &Vocabulary::default(),
            ChannelTimeouts::default(),
        )
        .await
        .unwrap();
        let reply = ch.send("TRANS_ACT:STATE").await.unwrap();
        assert_eq!(reply.value_for("TRANS_ACT:STATE"), Some("IDLE"));
        assert_eq!(
            ch.last_exchange().unwrap().command,
            "TRANS_ACT:STATE".to_string()
        );
    }

    #[tokio::test]
    async fn test_no_reply_is_timeout_and_desyncs() {
        let endpoint = scripted_peer(vec![""]).await;
        let mut ch = CommandChannel::connect(
            UutId::new("u1"),
            &endpoint,
            &Vocabulary::default(),
            ChannelTimeouts {
                connect: Duration::from_secs(1),
                reply: Duration::from_millis(100),
            },
        )
        .await
        .unwrap();
        let err = ch.send("NCHAN").await.unwrap_err();
        assert!(matches!(err, AcqError::Timeout { .. }), "{err}");
        assert!(!ch.is_usable());
        let err = ch.send("NCHAN").await.unwrap_err();
        assert!(matches!(err, AcqError::Connection { .. }));
    }

    #[tokio::test]
    async fn test_out_of_grammar_reply_is_protocol_error() {
        let endpoint = scripted_peer(vec!["", "1 2 3"]).await;
        let mut ch = CommandChannel::connect(
            UutId::new("u1"),
            &endpoint,
            &Vocabulary::default(),
            ChannelTimeouts::default(),
        )
        .await
        .unwrap();
        let err = ch.send("NCHAN").await.unwrap_err();
        match err {
            AcqError::Protocol { exchange, .. } => {
                assert_eq!(exchange.command, "NCHAN");
                assert_eq!(exchange.reply, "1 2 3");
            }
            other => panic!("unexpected {other}"),
        }
        // framing is intact after a grammar failure
        assert!(ch.is_usable());
    }

    #[tokio::test]
    async fn test_refused_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let err = CommandChannel::connect(
            UutId::new("gone"),
            &Endpoint::new("127.0.0.1", port, 0),
            &Vocabulary::default(),
            ChannelTimeouts::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AcqError::Connection { .. }));
        assert_eq!(err.uut().unwrap().as_str(), "gone");
    }
}
