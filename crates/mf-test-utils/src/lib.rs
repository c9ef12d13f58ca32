//! Shared test utilities for the meter-fleet suite.
//!
//! Provides a scripted TCP meter: a one-connection server that plays a
//! fixed exchange script (wait for a frame, answer with canned bytes) and
//! records everything it received so tests can assert on the emitted
//! frames. Replies are parity-encoded like a real 7E1 link unless a step
//! opts out.

use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

// ---------------------------------------------------------------------------
// Script steps
// ---------------------------------------------------------------------------

/// One exchange step of a scripted meter.
#[derive(Debug, Clone)]
pub struct Step {
    /// How many inbound frames to consume before replying (usually 1; 0
    /// for an unsolicited reply).
    pub expect_frames: usize,
    /// Reply bytes (pre-parity; the mock applies even parity on the wire).
    pub reply: Vec<u8>,
    /// Send the reply verbatim without parity bits (to exercise masking
    /// edge cases).
    pub raw: bool,
}

impl Step {
    /// Consume one frame, answer with `reply`.
    pub fn exchange(reply: impl Into<Vec<u8>>) -> Step {
        Step {
            expect_frames: 1,
            reply: reply.into(),
            raw: false,
        }
    }

    /// Consume one frame, answer with a single NAK.
    pub fn nak() -> Step {
        Step::exchange(vec![iec_line::NAK])
    }

    /// Consume one frame and answer nothing (lets the client run into its
    /// Tr timer).
    pub fn silence() -> Step {
        Step::exchange(Vec::new())
    }
}

/// Build a meter reply frame `STX body ETX BCC` (pre-parity).
pub fn stx_frame(body: &[u8]) -> Vec<u8> {
    let mut inner = Vec::with_capacity(body.len() + 1);
    inner.extend_from_slice(body);
    inner.push(iec_line::ETX);
    let check = iec_line::bcc(&inner);
    let mut frame = Vec::with_capacity(inner.len() + 2);
    frame.push(iec_line::STX);
    frame.append(&mut inner);
    frame.push(check);
    frame
}

/// Build the programming-mode hello `SOH P0 STX (serial) ETX BCC`.
pub fn p0_frame(serial: &str) -> Vec<u8> {
    iec_line::encode_command(b"P0", Some(format!("({serial})").as_bytes()))
}

// ---------------------------------------------------------------------------
// MockMeter
// ---------------------------------------------------------------------------

/// A scripted meter listening on a local TCP port.
///
/// Accepts exactly one connection, plays the script, then keeps the socket
/// open until the peer disconnects. Received frames are split on the
/// client's pacing (one `read` per frame suffices for the short command
/// frames the session sends).
pub struct MockMeter {
    addr: std::net::SocketAddr,
    received: Arc<Mutex<Vec<Vec<u8>>>>,
    handle: JoinHandle<()>,
}

impl MockMeter {
    pub async fn start(script: Vec<Step>) -> std::io::Result<MockMeter> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let received = Arc::new(Mutex::new(Vec::new()));
        let received_task = Arc::clone(&received);

        let handle = tokio::spawn(async move {
            let Ok((mut stream, _peer)) = listener.accept().await else {
                return;
            };
            let mut buf = [0u8; 4096];
            for step in script {
                for _ in 0..step.expect_frames {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            // Store the 7-bit view; parity is a wire detail.
                            let frame: Vec<u8> = buf[..n].iter().map(|b| b & 0x7f).collect();
                            received_task.lock().unwrap().push(frame);
                        }
                    }
                }
                if step.reply.is_empty() {
                    continue;
                }
                let wire = if step.raw {
                    step.reply.clone()
                } else {
                    iec_line::add_parity(&step.reply)
                };
                if stream.write_all(&wire).await.is_err() {
                    return;
                }
            }
            // Script exhausted; drain until the peer hangs up.
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => {
                        let frame: Vec<u8> = buf[..n].iter().map(|b| b & 0x7f).collect();
                        received_task.lock().unwrap().push(frame);
                    }
                }
            }
        });

        Ok(MockMeter {
            addr,
            received,
            handle,
        })
    }

    pub fn addr(&self) -> std::net::SocketAddr {
        self.addr
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// All frames received so far (parity already masked off).
    pub fn received(&self) -> Vec<Vec<u8>> {
        self.received.lock().unwrap().clone()
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

impl Drop for MockMeter {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
