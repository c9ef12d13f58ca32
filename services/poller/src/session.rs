//! Mode C session: the per-meter protocol state machine.
//!
//! One session owns one TCP connection and one meter descriptor, drives the
//! framer through request → identification → option select → (password) →
//! command → sign-off, and hands the raw reply body to the parser. A failed
//! session yields no records; the connection is released on every exit path
//! because the framer (and its socket) is owned by the session value.
//!
//! Vendor quirks are flags on the closed `Vendor` variant: Metcom answers
//! the request with a bare identification line and wants the full
//! option-select handshake, EMH-family meters stream identification and
//! dataset in one reply.

use chrono::{DateTime, Duration as TimeDelta, TimeZone, Utc};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::framer::{Framer, FramerError, Reply, Terminator};
use iec_line::Identification;
use meter_core::{DataKind, MeterDescriptor, ParseError, PasswordKind, timebase};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("framing: {0}")]
    Framing(#[from] FramerError),
    #[error("malformed identification {0:?}")]
    MalformedIdentification(String),
    #[error("meter ended communication (B0)")]
    PeerEnded,
    #[error("meter rejected the password")]
    AuthRejected,
    #[error("unexpected authentication reply {0:?}")]
    AuthUnexpected(String),
    #[error("meter error reply: {0}")]
    MeterError(String),
    #[error("meter context: {0}")]
    Context(#[from] ParseError),
    #[error("data kind {0} cannot be read over this session")]
    UnsupportedKind(DataKind),
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Opening,
    Identified,
    ModeSelected,
    Authenticated,
    Issuing,
    Reading,
    SignedOff,
    Failed,
}

// ---------------------------------------------------------------------------
// From-bound policy
// ---------------------------------------------------------------------------

/// Compute the `from` bound of a profile/log read window.
///
/// `from = max(watermark, now − window)`: the watermark resumes after a
/// failure, the rolling window caps how much a single session may request.
/// The window widens for kinds polled less often than every 15 minutes so
/// a poll always covers at least one full interval.
pub fn from_bound(
    meter: &MeterDescriptor,
    kind: DataKind,
    now: DateTime<Utc>,
    max_window: TimeDelta,
) -> Option<DateTime<Utc>> {
    kind.command_tag()?;

    let mut window = max_window;
    let interval = i64::from(meter.interval(kind));
    if interval > 900 {
        window = window.max(TimeDelta::hours(interval / 900 + 1));
    }
    let floor = now - window;

    let watermark = kind
        .watermark_field()
        .and_then(|field| meter.watermark(field))
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single());

    Some(match watermark {
        Some(mark) => mark.max(floor),
        None => floor,
    })
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

pub struct Session<S> {
    framer: Framer<S>,
    meter: MeterDescriptor,
    state: SessionState,
    identification: Option<Identification>,
}

impl Session<TcpStream> {
    /// Open the TCP connection to the meter. A connect failure is fatal to
    /// the session; the meter is not retried within the same dispatch.
    pub async fn open(
        meter: MeterDescriptor,
        connect_timeout: Duration,
        tr: Duration,
    ) -> Result<Session<TcpStream>, SessionError> {
        debug!(meter_id = %meter.meter_id, endpoint = %meter.endpoint(), "opening session");
        let framer = Framer::connect(&meter.ip_address, meter.port, connect_timeout, tr).await?;
        Ok(Session {
            framer,
            meter,
            state: SessionState::Opening,
            identification: None,
        })
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> Session<S> {
    /// Build a session over an arbitrary stream (tests drive this with an
    /// in-memory pipe).
    pub fn with_stream(stream: S, meter: MeterDescriptor, tr: Duration) -> Session<S> {
        Session {
            framer: Framer::new(stream, tr),
            meter,
            state: SessionState::Opening,
            identification: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn identification(&self) -> Option<&Identification> {
        self.identification.as_ref()
    }

    /// Read one data kind and return the decoded ASCII reply body.
    ///
    /// On any failure the state is `Failed` and no body is returned.
    pub async fn read_kind(
        &mut self,
        kind: DataKind,
        from: Option<DateTime<Utc>>,
    ) -> Result<String, SessionError> {
        let result = if kind.uses_programming_mode() {
            self.programming_read(kind, from).await
        } else {
            self.readout(kind).await
        };
        match result {
            Ok(body) => {
                self.state = SessionState::SignedOff;
                Ok(body)
            }
            Err(e) => {
                self.state = SessionState::Failed;
                Err(e)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Readout mode (list tables)
    // -----------------------------------------------------------------------

    async fn readout(&mut self, kind: DataKind) -> Result<String, SessionError> {
        let selector = kind
            .readout_selector()
            .ok_or(SessionError::UnsupportedKind(kind))?;
        let request = self.request_command(selector);

        let body = if self.meter.vendor().full_readout_handshake() {
            let ident = self
                .framer
                .exchange(&request, Terminator::Lf, false)
                .await?;
            self.note_identification(&ident)?;
            // Option select, data readout mode: the meter streams the
            // dataset terminated by ETX.
            self.state = SessionState::Issuing;
            let body = self
                .framer
                .exchange(&option_select(true), Terminator::Etx, true)
                .await?;
            self.state = SessionState::Reading;
            body
        } else {
            // EMH-family: identification and dataset arrive as one stream.
            let body = self.framer.exchange(&request, Terminator::Etx, true).await?;
            self.state = SessionState::Reading;
            body
        };

        self.check_body(decode_ascii(&body))
    }

    // -----------------------------------------------------------------------
    // Programming mode (profiles, logs, error register)
    // -----------------------------------------------------------------------

    async fn programming_read(
        &mut self,
        kind: DataKind,
        from: Option<DateTime<Utc>>,
    ) -> Result<String, SessionError> {
        let request = self.request_command('?');
        let ident = if self.meter.vendor().full_readout_handshake() {
            self.framer
                .exchange(&request, Terminator::Lf, false)
                .await?
        } else {
            // The identification line carries no ETX; the read quiesces on Tr.
            self.framer
                .exchange(&request, Terminator::Etx, true)
                .await?
        };
        self.note_identification(&ident)?;

        // Option select, programming mode: the meter answers with its
        // serial number frame `P0(nnnnnnnn)`.
        let hello = self
            .framer
            .exchange(&option_select(false), Terminator::Etx, true)
            .await?;
        let hello = decode_ascii(&hello);
        if hello.contains("B0") {
            return Err(SessionError::PeerEnded);
        }
        debug!(meter_id = %self.meter.meter_id, hello = %hello.trim(), "programming mode");
        self.state = SessionState::ModeSelected;

        if let Some(password) = self.meter.password.clone() {
            self.authenticate(&password, self.meter.password_type).await?;
            self.state = SessionState::Authenticated;
        }

        let data = self.command_data(kind, from)?;
        self.state = SessionState::Issuing;
        let frame = iec_line::encode_command(b"R5", Some(data.as_bytes()));
        let body = self.framer.exchange(&frame, Terminator::Etx, true).await?;
        self.state = SessionState::Reading;

        let body = self.check_body(decode_ascii(&body))?;
        self.sign_off().await;
        Ok(body)
    }

    /// Data field of the R5 command for a kind: `<tag>(0YYMMDDhhmm;)`.
    fn command_data(
        &self,
        kind: DataKind,
        from: Option<DateTime<Utc>>,
    ) -> Result<String, SessionError> {
        let tag = kind
            .command_tag()
            .ok_or(SessionError::UnsupportedKind(kind))?;
        let zone = timebase::zone_offset(self.meter.zone_name())?;
        let window = match from {
            Some(from) => timebase::render_from_bound(from, zone),
            None => String::new(),
        };
        Ok(format!("{tag}({window};)"))
    }

    /// Password exchange: expect exactly ACK. A NAK is retried, three
    /// attempts total; B0 means the meter gave up on us.
    async fn authenticate(
        &mut self,
        password: &str,
        kind: PasswordKind,
    ) -> Result<(), SessionError> {
        let frame =
            iec_line::encode_command(kind.command(), Some(format!("({password})").as_bytes()));
        for attempt in 1..=3u8 {
            match self
                .framer
                .exchange_once(&frame, Terminator::Ack, false)
                .await?
            {
                Reply::Nak => {
                    warn!(
                        meter_id = %self.meter.meter_id,
                        attempt,
                        "NAK on password, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                Reply::Data(data) => {
                    if data == [iec_line::ACK] {
                        return Ok(());
                    }
                    let text = decode_ascii(&data);
                    if text.contains("B0") {
                        return Err(SessionError::AuthRejected);
                    }
                    return Err(SessionError::AuthUnexpected(text.trim().to_owned()));
                }
            }
        }
        Err(SessionError::AuthRejected)
    }

    /// Best-effort `B0` close. A session that already read its body is
    /// successful even when the sign-off never makes it out.
    async fn sign_off(&mut self) {
        if let Err(e) = self.framer.send(&iec_line::sign_off_frame()).await {
            debug!(meter_id = %self.meter.meter_id, error = %e, "sign-off not delivered");
        }
    }

    // -----------------------------------------------------------------------
    // Shared checks
    // -----------------------------------------------------------------------

    /// Request message: `/{selector}<meter_id>!` or the anonymous form.
    fn request_command(&self, selector: char) -> Vec<u8> {
        let cmd = if self.meter.use_meter_id {
            format!("/{selector}{}!\r\n", self.meter.meter_id)
        } else {
            format!("/{selector}!\r\n")
        };
        cmd.into_bytes()
    }

    fn note_identification(&mut self, raw: &[u8]) -> Result<(), SessionError> {
        let text = decode_ascii(raw);
        if text.contains("B0") {
            // Busy, password pending, or a previous session never signed off.
            return Err(SessionError::PeerEnded);
        }
        let ident = Identification::parse(&text)
            .map_err(|_| SessionError::MalformedIdentification(text.trim().to_owned()))?;
        info!(
            meter_id = %self.meter.meter_id,
            manufacturer = %ident.manufacturer,
            baud = ident.baud_rate(),
            fast_tr = ident.fast_tr,
            "identified"
        );
        self.identification = Some(ident);
        self.state = SessionState::Identified;
        Ok(())
    }

    fn check_body(&self, body: String) -> Result<String, SessionError> {
        if body.contains("(ERROR") {
            return Err(SessionError::MeterError(body.trim().to_owned()));
        }
        if body.contains("B0") {
            return Err(SessionError::PeerEnded);
        }
        Ok(body)
    }
}

/// Select option message `ACK 0 5 y CR LF`: baud stage 5, y=0 for data
/// readout, y=1 for programming mode.
fn option_select(data_readout: bool) -> Vec<u8> {
    let mode = if data_readout { b'0' } else { b'1' };
    vec![iec_line::ACK, b'0', b'5', mode, b'\r', b'\n']
}

fn decode_ascii(data: &[u8]) -> String {
    String::from_utf8_lossy(data).into_owned()
}

// ---------------------------------------------------------------------------
// Unit tests (duplex-stream scripted peers)
// ---------------------------------------------------------------------------
