//! IEC 62056-21 line-layer primitives.
//!
//! The meters speak a serial line discipline (7E1 at nominally 300 baud)
//! tunneled over TCP, so every byte on the wire carries an even-parity bit
//! in position 7. This crate holds the pure byte-level pieces: control
//! bytes, parity handling, BCC computation, command framing, and the
//! identification message. No I/O happens here — the async framer in the
//! poller service drives these over a socket.

use std::fmt;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Control bytes
// ---------------------------------------------------------------------------

pub const SOH: u8 = 0x01;
pub const STX: u8 = 0x02;
pub const ETX: u8 = 0x03;
pub const EOT: u8 = 0x04;
pub const ACK: u8 = 0x06;
pub const NAK: u8 = 0x15;
pub const CR: u8 = b'\r';
pub const LF: u8 = b'\n';

/// The delimiter bytes stripped from decoded replies. CR/LF are data to the
/// parser and stay.
pub const CTL_BYTES: [u8; 3] = [SOH, STX, ETX];

// ---------------------------------------------------------------------------
// Parity
// ---------------------------------------------------------------------------

/// Set bit 7 of a 7-bit character so the whole byte has even parity.
pub fn apply_even_parity(byte: u8) -> u8 {
    let ch = byte & 0x7f;
    if ch.count_ones() % 2 == 1 {
        ch | 0x80
    } else {
        ch
    }
}

/// Parity-encode a whole frame for transmission.
pub fn add_parity(frame: &[u8]) -> Vec<u8> {
    frame.iter().map(|&b| apply_even_parity(b)).collect()
}

/// Mask every received byte down to its 7 data bits.
pub fn remove_parity(data: &[u8]) -> Vec<u8> {
    data.iter().map(|&b| b & 0x7f).collect()
}

// ---------------------------------------------------------------------------
// BCC
// ---------------------------------------------------------------------------

/// Block check character: XOR over the given bytes.
///
/// For an emitted command frame `SOH cmd STX data ETX BCC` the checksum
/// covers everything after SOH through ETX inclusive. Received frames are
/// checked the same way: everything after the leading SOH (or STX) through
/// ETX.
pub fn bcc(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc ^ b)
}

/// Verify the checksum of a received frame ending in `.. ETX BCC`.
///
/// Returns `false` when the frame has no ETX or the trailing byte does not
/// match the XOR of the covered range.
pub fn verify_bcc(frame: &[u8]) -> bool {
    if frame.len() < 3 {
        return false;
    }
    let (body, tail) = frame.split_at(frame.len() - 1);
    if body[body.len() - 1] != ETX {
        return false;
    }
    let start = match body[0] {
        SOH | STX => 1,
        _ => 0,
    };
    bcc(&body[start..]) == tail[0]
}

// ---------------------------------------------------------------------------
// Command framing
// ---------------------------------------------------------------------------

/// Build the wire form of a command, without parity bits.
///
/// With a data field: `SOH cmd STX data ETX BCC`. Without: the command bytes
/// verbatim (request and ACK/option-select messages are sent as-is).
pub fn encode_command(cmd: &[u8], data: Option<&[u8]>) -> Vec<u8> {
    match data {
        Some(data) => {
            let mut body = Vec::with_capacity(cmd.len() + data.len() + 3);
            body.extend_from_slice(cmd);
            body.push(STX);
            body.extend_from_slice(data);
            body.push(ETX);
            let check = bcc(&body);
            let mut frame = Vec::with_capacity(body.len() + 2);
            frame.push(SOH);
            frame.append(&mut body);
            frame.push(check);
            frame
        }
        None => cmd.to_vec(),
    }
}

/// The standard sign-off frame `SOH B0 ETX BCC` (no data field, so no STX).
pub fn sign_off_frame() -> Vec<u8> {
    let body = [b'B', b'0', ETX];
    let mut frame = vec![SOH];
    frame.extend_from_slice(&body);
    frame.push(bcc(&body));
    frame
}

/// Remove the delimiter bytes {SOH, STX, ETX} from a decoded reply.
pub fn drop_ctl_bytes(data: &[u8]) -> Vec<u8> {
    data.iter()
        .copied()
        .filter(|b| !CTL_BYTES.contains(b))
        .collect()
}

// ---------------------------------------------------------------------------
// Identification message
// ---------------------------------------------------------------------------

/// Baud-stage characters from the identification message, 6.3.2.
///
/// Informative only on this transport: the socket never changes rate, the
/// stage is recorded for logging.
pub const BAUD_RATES: [(char, &str); 10] = [
    ('0', "300"),
    ('1', "600"),
    ('2', "1200"),
    ('3', "2400"),
    ('4', "4800"),
    ('5', "9600"),
    ('6', "19200"),
    ('7', "reserved"),
    ('8', "reserved"),
    ('9', "reserved"),
];

/// Look up the nominal baud rate for an identification stage digit.
pub fn baud_rate(stage: char) -> Option<&'static str> {
    BAUD_RATES
        .iter()
        .find(|(digit, _)| *digit == stage)
        .map(|(_, rate)| *rate)
}

/// A parsed identification message `/XXXy<ident>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identification {
    /// Three-character manufacturer tag.
    pub manufacturer: String,
    /// A lowercase third tag character signals 20 ms Tr support.
    pub fast_tr: bool,
    /// Baud stage digit after the tag.
    pub baud_stage: char,
    /// The communication id (device identification field).
    pub ident: String,
}

impl Identification {
    /// Parse an identification reply. The message must be at least 14
    /// characters; anything shorter is malformed per 6.3.2.
    pub fn parse(message: &str) -> Result<Self, LineError> {
        let trimmed = message.trim_end_matches(['\r', '\n']);
        if message.len() < 14 {
            return Err(LineError::MalformedIdentification(message.to_owned()));
        }
        let chars: Vec<char> = trimmed.chars().collect();
        if chars.first() != Some(&'/') || chars.len() < 6 {
            return Err(LineError::MalformedIdentification(message.to_owned()));
        }
        let manufacturer: String = chars[1..4].iter().collect();
        let fast_tr = chars[3].is_ascii_lowercase();
        let baud_stage = chars[4];
        if !baud_stage.is_ascii_digit() {
            return Err(LineError::MalformedIdentification(message.to_owned()));
        }
        let ident: String = chars[5..].iter().collect();
        Ok(Identification {
            manufacturer,
            fast_tr,
            baud_stage,
            ident,
        })
    }

    /// Nominal baud rate named by the stage digit.
    pub fn baud_rate(&self) -> &'static str {
        baud_rate(self.baud_stage).unwrap_or("reserved")
    }
}

impl fmt::Display for Identification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} baud, fast Tr: {})",
            self.manufacturer,
            self.baud_rate(),
            self.fast_tr
        )
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum LineError {
    #[error("malformed identification message: {0:?}")]
    MalformedIdentification(String),
}

// ---------------------------------------------------------------------------
// Log normalization
// ---------------------------------------------------------------------------

/// Render a raw frame with control bytes spelled out, for debug logging.
///
/// `\x01AB\x02` becomes `<SOH>AB<STX>`; printable ASCII passes through and
/// everything else is hex-escaped.
pub fn printable(frame: &[u8]) -> String {
    let mut out = String::with_capacity(frame.len());
    for &b in frame {
        match b & 0x7f {
            SOH => out.push_str("<SOH>"),
            STX => out.push_str("<STX>"),
            ETX => out.push_str("<ETX>"),
            EOT => out.push_str("<EOT>"),
            ACK => out.push_str("<ACK>"),
            NAK => out.push_str("<NAK>"),
            CR => out.push_str("<CR>"),
            LF => out.push_str("<LF>"),
            c if (0x20..0x7f).contains(&c) => out.push(c as char),
            c => out.push_str(&format!("<{c:02x}>")),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bcc_is_xor() {
        assert_eq!(bcc(&[0x01, 0x02, 0x03]), 0x00);
        assert_eq!(bcc(b"R5"), b'R' ^ b'5');
        assert_eq!(bcc(&[]), 0x00);
    }

    #[test]
    fn encode_with_data_frames_and_checksums() {
        let frame = encode_command(b"R5", Some(b"1.8.1()"));
        assert_eq!(frame[0], SOH);
        assert_eq!(&frame[1..3], b"R5");
        assert_eq!(frame[3], STX);
        assert_eq!(&frame[4..11], b"1.8.1()");
        assert_eq!(frame[11], ETX);
        // Checksum covers everything after SOH through ETX.
        assert_eq!(frame[12], bcc(&frame[1..12]));
    }

    #[test]
    fn encode_without_data_is_verbatim() {
        assert_eq!(encode_command(b"/?!\r\n", None), b"/?!\r\n");
    }

    #[test]
    fn parity_round_trip() {
        let cmd = b"/?12345678!\r\n";
        let on_wire = add_parity(cmd);
        for &b in &on_wire {
            assert_eq!(b.count_ones() % 2, 0, "byte {b:#x} must have even parity");
        }
        assert_eq!(remove_parity(&on_wire), cmd);
    }

    #[test]
    fn strip_restores_payload() {
        let frame = encode_command(b"R5", Some(b"P.01(01808130001;)"));
        let wire = add_parity(&frame);
        let masked = remove_parity(&wire);
        // Drop delimiters and the trailing BCC the framer would consume.
        let stripped = drop_ctl_bytes(&masked[..masked.len() - 1]);
        assert_eq!(stripped, b"R5P.01(01808130001;)");
    }

    #[test]
    fn verify_bcc_accepts_valid_and_rejects_corrupt() {
        let mut frame = encode_command(b"P1", Some(b"(00000000)"));
        assert!(verify_bcc(&frame));
        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        assert!(!verify_bcc(&frame));
    }

    #[test]
    fn sign_off_has_no_stx() {
        let frame = sign_off_frame();
        assert_eq!(&frame[..3], &[SOH, b'B', b'0']);
        assert_eq!(frame[3], ETX);
        assert_eq!(frame[4], bcc(&frame[1..4]));
        assert!(verify_bcc(&frame));
    }

    #[test]
    fn verify_bcc_on_stx_reply() {
        // Meter reply: STX data ETX BCC, checksum over data..ETX.
        let mut frame = vec![STX];
        frame.extend_from_slice(b"F.F(00000000)\r\n");
        frame.push(ETX);
        let check = bcc(&frame[1..]);
        frame.push(check);
        assert!(verify_bcc(&frame));
    }

    #[test]
    fn identification_parses_fields() {
        let id = Identification::parse("/MCS5\\@V0050710000051\r\n").unwrap();
        assert_eq!(id.manufacturer, "MCS");
        assert_eq!(id.baud_stage, '5');
        assert_eq!(id.baud_rate(), "9600");
        assert!(!id.fast_tr);
    }

    #[test]
    fn identification_detects_fast_tr() {
        let id = Identification::parse("/EMh5\\@V0050710000051\r\n").unwrap();
        assert!(id.fast_tr);
    }

    #[test]
    fn short_identification_is_malformed() {
        assert!(matches!(
            Identification::parse("/MCS5\r\n"),
            Err(LineError::MalformedIdentification(_))
        ));
    }

    #[test]
    fn printable_spells_out_control_bytes() {
        let frame = [SOH, b'B', b'0', ETX, 0x61];
        assert_eq!(printable(&frame), "<SOH>B0<ETX>a");
    }
}
