//! Byte-level framing over one meter connection.
//!
//! The link behaves like a 7E1 serial line: outbound bytes carry an even
//! parity bit, inbound bytes are masked to 7 bits before interpretation.
//! Replies have no length prefix — the read loop accumulates chunks and
//! finishes when the expected terminator shows up or the Tr quiescence
//! timer fires with data in hand. A zero-byte Tr expiry is a hard error.
//!
//! A received NAK, or a BCC mismatch on an ETX-terminated reply, buys
//! exactly one retransmission of the last frame; the second occurrence
//! fails the exchange.

use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum FramerError {
    #[error("connect to {0} failed: {1}")]
    ConnectFailed(String, std::io::Error),
    #[error("write failed: {0}")]
    WriteFailed(std::io::Error),
    #[error("no reply within the Tr window")]
    ReadTimeout,
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("reply too short to carry a checksum ({0} bytes)")]
    ShortRead(usize),
    #[error("BCC mismatch on reply")]
    BccMismatch,
    #[error("peer rejected the frame with NAK twice")]
    RemoteNak,
}

// ---------------------------------------------------------------------------
// Terminators and replies
// ---------------------------------------------------------------------------

/// What ends a reply for the current exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminator {
    /// `ETX` followed by the BCC byte (data replies).
    Etx,
    /// Bare `LF` (identification lines).
    Lf,
    /// A single `ACK` (password acknowledgement).
    Ack,
}

impl Terminator {
    fn byte(self) -> u8 {
        match self {
            Terminator::Etx => iec_line::ETX,
            Terminator::Lf => iec_line::LF,
            Terminator::Ack => iec_line::ACK,
        }
    }
}

/// One reply, after parity masking and delimiter stripping.
#[derive(Debug, PartialEq, Eq)]
pub enum Reply {
    Data(Vec<u8>),
    /// The peer answered with a lone NAK.
    Nak,
}

/// How the raw read loop ended.
enum ReadEnd {
    /// Terminator byte observed (for ETX: the trailing BCC arrived too).
    Terminated,
    /// Tr elapsed with data in hand.
    Quiesced,
    Nak,
}

// ---------------------------------------------------------------------------
// Framer
// ---------------------------------------------------------------------------

/// Owns one connection and frames commands/replies over it.
///
/// Generic over the stream so tests can drive it with an in-memory duplex
/// pipe; production uses [`Framer::connect`] for TCP.
pub struct Framer<S> {
    stream: S,
    tr: Duration,
}

impl Framer<TcpStream> {
    /// Open the TCP connection to a meter.
    pub async fn connect(
        host: &str,
        port: u16,
        connect_timeout: Duration,
        tr: Duration,
    ) -> Result<Framer<TcpStream>, FramerError> {
        let target = format!("{host}:{port}");
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(&target))
            .await
            .map_err(|_| {
                FramerError::ConnectFailed(
                    target.clone(),
                    std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
                )
            })?
            .map_err(|e| FramerError::ConnectFailed(target, e))?;
        Ok(Framer { stream, tr })
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> Framer<S> {
    pub fn new(stream: S, tr: Duration) -> Framer<S> {
        Framer { stream, tr }
    }

    /// Send one frame, parity-encoded.
    pub async fn send(&mut self, frame: &[u8]) -> Result<(), FramerError> {
        debug!(frame = %iec_line::printable(frame), "-> meter");
        let wire = iec_line::add_parity(frame);
        self.stream
            .write_all(&wire)
            .await
            .map_err(FramerError::WriteFailed)?;
        self.stream.flush().await.map_err(FramerError::WriteFailed)
    }

    /// Send a frame and read its reply, retransmitting once on NAK or BCC
    /// mismatch.
    pub async fn exchange(
        &mut self,
        frame: &[u8],
        term: Terminator,
        check_bcc: bool,
    ) -> Result<Vec<u8>, FramerError> {
        for attempt in 0..2 {
            self.send(frame).await?;
            match self.read_reply(term, check_bcc).await {
                Ok(Reply::Data(data)) => return Ok(data),
                Ok(Reply::Nak) if attempt == 0 => {
                    warn!("NAK received, retransmitting last frame");
                }
                Ok(Reply::Nak) => return Err(FramerError::RemoteNak),
                Err(FramerError::BccMismatch) if attempt == 0 => {
                    warn!("BCC mismatch, retransmitting last frame");
                }
                Err(e) => return Err(e),
            }
        }
        Err(FramerError::RemoteNak)
    }

    /// Send a frame and read a single reply with no retransmission. The
    /// caller owns the retry budget (password authentication).
    pub async fn exchange_once(
        &mut self,
        frame: &[u8],
        term: Terminator,
        check_bcc: bool,
    ) -> Result<Reply, FramerError> {
        self.send(frame).await?;
        self.read_reply(term, check_bcc).await
    }

    /// Read one reply without sending anything first (streamed data after
    /// an option select).
    pub async fn read_reply(
        &mut self,
        term: Terminator,
        check_bcc: bool,
    ) -> Result<Reply, FramerError> {
        let (raw, end) = self.read_raw(term).await?;
        let mut masked = iec_line::remove_parity(&raw);
        debug!(reply = %iec_line::printable(&masked), "<- meter");

        if matches!(end, ReadEnd::Nak) {
            return Ok(Reply::Nak);
        }

        // BCC covers ETX-terminated replies only; identification lines and
        // Tr-quiesced readouts carry none.
        let etx_terminated = matches!(end, ReadEnd::Terminated)
            && term == Terminator::Etx
            && masked.len() >= 2
            && masked[masked.len() - 2] == iec_line::ETX;
        if etx_terminated && check_bcc {
            if masked.len() < 3 {
                return Err(FramerError::ShortRead(masked.len()));
            }
            if !iec_line::verify_bcc(&masked) {
                return Err(FramerError::BccMismatch);
            }
            masked.pop();
        } else if etx_terminated {
            // Caller opted out of verification; still consume the BCC.
            masked.pop();
        }

        Ok(Reply::Data(iec_line::drop_ctl_bytes(&masked)))
    }

    /// Accumulate chunks, resetting Tr after each, until a completion
    /// condition holds.
    async fn read_raw(&mut self, term: Terminator) -> Result<(Vec<u8>, ReadEnd), FramerError> {
        let term_byte = term.byte();
        let mut buf: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 1024];

        loop {
            match tokio::time::timeout(self.tr, self.stream.read(&mut chunk)).await {
                // Tr quiescence: end of transmission if anything arrived.
                Err(_) => {
                    if buf.is_empty() {
                        return Err(FramerError::ReadTimeout);
                    }
                    return Ok((buf, ReadEnd::Quiesced));
                }
                Ok(Ok(0)) => {
                    if buf.is_empty() {
                        return Err(FramerError::PeerClosed);
                    }
                    return Ok((buf, ReadEnd::Quiesced));
                }
                Ok(Err(_)) => return Err(FramerError::PeerClosed),
                Ok(Ok(n)) => {
                    buf.extend_from_slice(&chunk[..n]);
                    let last = buf[buf.len() - 1] & 0x7f;
                    if buf.len() == 1 && last == iec_line::NAK {
                        return Ok((buf, ReadEnd::Nak));
                    }
                    match term {
                        Terminator::Etx => {
                            // ETX is followed by its BCC; complete once the
                            // byte after ETX is in.
                            if buf.len() >= 2 && buf[buf.len() - 2] & 0x7f == iec_line::ETX {
                                return Ok((buf, ReadEnd::Terminated));
                            }
                        }
                        _ => {
                            if last == term_byte {
                                return Ok((buf, ReadEnd::Terminated));
                            }
                        }
                    }
                }
            }
        }
    }
}
