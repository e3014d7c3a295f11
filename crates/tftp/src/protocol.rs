//! TFTP packet codec.
//!
//! Wire-level encoding and decoding for the six TFTP packet shapes
//! (RFC 1350) plus the option extension framing (RFC 2347). All multi-byte
//! integers are network byte order; all strings are NUL-terminated on the
//! wire.
//!
//! Decoding is strict: a packet that is truncated, misses a terminating NUL,
//! carries an unknown mode, or breaks the option key/value pairing is
//! rejected with a [`PacketError`]. Callers on dispatch paths drop such
//! packets without replying.

use std::fmt;
use std::str::FromStr;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Smallest negotiable `blksize` value (RFC 2348).
pub const MIN_BLOCK_SIZE: u16 = 8;

/// Largest negotiable `blksize` value (RFC 2348).
pub const MAX_BLOCK_SIZE: u16 = 65464;

/// Block size used when none is negotiated.
pub const DEFAULT_BLOCK_SIZE: u16 = 512;

/// Opcode and block number prefix of a DATA packet.
pub const DATA_HEADER_LEN: usize = 4;

/// TFTP opcodes.
///
/// Each opcode identifies one packet shape as defined in RFC 1350, with
/// OACK added by RFC 2347.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Read request: `| 1 | filename | 0 | mode | 0 | (opt 0 value 0)* |`
    Rrq = 1,
    /// Write request, same layout as [`Opcode::Rrq`].
    Wrq = 2,
    /// Data block: `| 3 | block# | payload |`
    Data = 3,
    /// Acknowledgment: `| 4 | block# |`
    Ack = 4,
    /// Error report: `| 5 | code | message | 0 |`
    Error = 5,
    /// Option acknowledgment: `| 6 | (opt 0 value 0)* |`
    Oack = 6,
}

impl Opcode {
    /// Convert a wire value to an [`Opcode`].
    ///
    /// # Examples
    /// ```
    /// use tftp::Opcode;
    ///
    /// assert_eq!(Opcode::from_u16(1), Some(Opcode::Rrq));
    /// assert_eq!(Opcode::from_u16(99), None);
    /// ```
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::Rrq),
            2 => Some(Self::Wrq),
            3 => Some(Self::Data),
            4 => Some(Self::Ack),
            5 => Some(Self::Error),
            6 => Some(Self::Oack),
            _ => None,
        }
    }

    /// Wire representation of the opcode.
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Conventional short name, as used in log output.
    pub fn name(self) -> &'static str {
        match self {
            Self::Rrq => "RRQ",
            Self::Wrq => "WRQ",
            Self::Data => "DATA",
            Self::Ack => "ACK",
            Self::Error => "ERROR",
            Self::Oack => "OACK",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// TFTP error codes carried by ERROR packets.
///
/// Codes 0 through 8 are defined by RFC 1350 and the option extension RFCs.
/// Other values seen on the wire are preserved via [`ErrorCode::Unknown`]
/// rather than rejected, so a received ERROR can always be surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Code 0: not defined, see the error message.
    NotDefined,
    /// Code 1: file not found.
    FileNotFound,
    /// Code 2: access violation.
    AccessViolation,
    /// Code 3: disk full or allocation exceeded.
    DiskFull,
    /// Code 4: illegal TFTP operation.
    IllegalOperation,
    /// Code 5: unknown transfer ID.
    UnknownTransferId,
    /// Code 6: file already exists.
    FileAlreadyExists,
    /// Code 7: no such user.
    NoSuchUser,
    /// Code 8: option negotiation failed (RFC 2347).
    OptionNegotiation,
    /// Any other wire value.
    Unknown(u16),
}

impl ErrorCode {
    pub fn from_u16(value: u16) -> Self {
        match value {
            0 => Self::NotDefined,
            1 => Self::FileNotFound,
            2 => Self::AccessViolation,
            3 => Self::DiskFull,
            4 => Self::IllegalOperation,
            5 => Self::UnknownTransferId,
            6 => Self::FileAlreadyExists,
            7 => Self::NoSuchUser,
            8 => Self::OptionNegotiation,
            other => Self::Unknown(other),
        }
    }

    pub fn as_u16(self) -> u16 {
        match self {
            Self::NotDefined => 0,
            Self::FileNotFound => 1,
            Self::AccessViolation => 2,
            Self::DiskFull => 3,
            Self::IllegalOperation => 4,
            Self::UnknownTransferId => 5,
            Self::FileAlreadyExists => 6,
            Self::NoSuchUser => 7,
            Self::OptionNegotiation => 8,
            Self::Unknown(v) => v,
        }
    }

    /// Default human-readable message for the code.
    pub fn default_message(self) -> &'static str {
        match self {
            Self::NotDefined => "Undefined error",
            Self::FileNotFound => "File not found",
            Self::AccessViolation => "Access violation",
            Self::DiskFull => "Disk full or allocation exceeded",
            Self::IllegalOperation => "Illegal TFTP operation",
            Self::UnknownTransferId => "Unknown transfer ID",
            Self::FileAlreadyExists => "File already exists",
            Self::NoSuchUser => "No such user",
            Self::OptionNegotiation => "Option negotiation failed",
            Self::Unknown(_) => "Unknown error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.default_message(), self.as_u16())
    }
}

/// Transfer modes.
///
/// `octet` transfers bytes untouched; `netascii` applies the CR/LF wire
/// translation implemented in [`crate::netascii`]. The historic `mail` mode
/// is not supported and is rejected at decode time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Mode {
    /// Binary mode, wire string `octet`.
    #[default]
    Octet,
    /// Text mode with CR LF line endings on the wire, wire string `netascii`.
    Netascii,
}

impl Mode {
    /// Parse the wire mode string, case-insensitively.
    pub fn from_wire(s: &str) -> Option<Self> {
        if s.eq_ignore_ascii_case("octet") {
            Some(Self::Octet)
        } else if s.eq_ignore_ascii_case("netascii") {
            Some(Self::Netascii)
        } else {
            None
        }
    }

    /// Lowercase wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Octet => "octet",
            Self::Netascii => "netascii",
        }
    }
}

impl FromStr for Mode {
    type Err = String;

    /// Accepts the wire spellings plus `binary` as an alias for octet,
    /// matching the command-line surface.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("binary") {
            return Ok(Self::Octet);
        }
        Self::from_wire(s).ok_or_else(|| format!("unsupported transfer mode: {}", s))
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Body of an RRQ or WRQ packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Requested file name. UTF-8 in memory, opaque NUL-free bytes on the wire.
    pub filename: String,
    /// Requested transfer mode.
    pub mode: Mode,
    /// Requested options in wire order. Keys are matched case-insensitively
    /// by negotiation; values are uninterpreted here.
    pub options: Vec<(String, String)>,
}

impl Request {
    pub fn new(filename: impl Into<String>, mode: Mode) -> Self {
        Self {
            filename: filename.into(),
            mode,
            options: Vec::new(),
        }
    }

    /// Append a requested option.
    pub fn with_option(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.options.push((key.into(), value.to_string()));
        self
    }

    fn decode(body: &[u8]) -> Result<Self, PacketError> {
        let (filename, rest) = take_cstr(body, "filename")?;
        let (mode, rest) = take_cstr(rest, "mode")?;
        let mode = Mode::from_wire(mode).ok_or_else(|| PacketError::UnknownMode(mode.to_string()))?;
        let options = decode_options(rest)?;
        Ok(Self {
            filename: filename.to_string(),
            mode,
            options,
        })
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        put_cstr(buf, &self.filename);
        put_cstr(buf, self.mode.as_str());
        encode_options(buf, &self.options);
    }

    fn encoded_len(&self) -> usize {
        self.filename.len() + 1 + self.mode.as_str().len() + 1 + options_len(&self.options)
    }
}

/// A decoded TFTP packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Rrq(Request),
    Wrq(Request),
    Data { block: u16, payload: Bytes },
    Ack { block: u16 },
    Error { code: ErrorCode, message: String },
    Oack { options: Vec<(String, String)> },
}

/// Reasons a datagram failed to decode as a TFTP packet.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("packet truncated in {0}")]
    Truncated(&'static str),
    #[error("unknown opcode {0}")]
    UnknownOpcode(u16),
    #[error("{0} field is not NUL-terminated")]
    Unterminated(&'static str),
    #[error("{0} field is not valid UTF-8")]
    InvalidUtf8(&'static str),
    #[error("unknown transfer mode {0:?}")]
    UnknownMode(String),
    #[error("option key without a value")]
    DanglingOptionKey,
    #[error("empty option key or value")]
    EmptyOption,
}

impl Packet {
    /// Opcode of this packet.
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::Rrq(_) => Opcode::Rrq,
            Self::Wrq(_) => Opcode::Wrq,
            Self::Data { .. } => Opcode::Data,
            Self::Ack { .. } => Opcode::Ack,
            Self::Error { .. } => Opcode::Error,
            Self::Oack { .. } => Opcode::Oack,
        }
    }

    /// Decode a datagram.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < 2 {
            return Err(PacketError::Truncated("opcode"));
        }
        let raw = u16::from_be_bytes([buf[0], buf[1]]);
        let opcode = Opcode::from_u16(raw).ok_or(PacketError::UnknownOpcode(raw))?;
        let body = &buf[2..];

        match opcode {
            Opcode::Rrq => Request::decode(body).map(Self::Rrq),
            Opcode::Wrq => Request::decode(body).map(Self::Wrq),
            Opcode::Data => {
                if body.len() < 2 {
                    return Err(PacketError::Truncated("block number"));
                }
                Ok(Self::Data {
                    block: u16::from_be_bytes([body[0], body[1]]),
                    payload: Bytes::copy_from_slice(&body[2..]),
                })
            }
            Opcode::Ack => {
                if body.len() < 2 {
                    return Err(PacketError::Truncated("block number"));
                }
                Ok(Self::Ack {
                    block: u16::from_be_bytes([body[0], body[1]]),
                })
            }
            Opcode::Error => {
                if body.len() < 2 {
                    return Err(PacketError::Truncated("error code"));
                }
                let code = ErrorCode::from_u16(u16::from_be_bytes([body[0], body[1]]));
                let (message, _) = take_cstr(&body[2..], "error message")?;
                Ok(Self::Error {
                    code,
                    message: message.to_string(),
                })
            }
            Opcode::Oack => Ok(Self::Oack {
                options: decode_options(body)?,
            }),
        }
    }

    /// Encode into a freshly sized buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(2 + self.body_len());
        buf.put_u16(self.opcode().as_u16());
        match self {
            Self::Rrq(req) | Self::Wrq(req) => req.encode_body(&mut buf),
            Self::Data { block, payload } => {
                debug_assert!(payload.len() <= MAX_BLOCK_SIZE as usize);
                buf.put_u16(*block);
                buf.put_slice(payload);
            }
            Self::Ack { block } => buf.put_u16(*block),
            Self::Error { code, message } => {
                buf.put_u16(code.as_u16());
                put_cstr(&mut buf, message);
            }
            Self::Oack { options } => encode_options(&mut buf, options),
        }
        buf.freeze()
    }

    fn body_len(&self) -> usize {
        match self {
            Self::Rrq(req) | Self::Wrq(req) => req.encoded_len(),
            Self::Data { payload, .. } => 2 + payload.len(),
            Self::Ack { .. } => 2,
            Self::Error { message, .. } => 2 + message.len() + 1,
            Self::Oack { options } => options_len(options),
        }
    }
}

/// Build an ERROR packet with the code's default message.
pub fn error_packet(code: ErrorCode) -> Packet {
    Packet::Error {
        code,
        message: code.default_message().to_string(),
    }
}

fn take_cstr<'a>(buf: &'a [u8], field: &'static str) -> Result<(&'a str, &'a [u8]), PacketError> {
    let nul = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or(PacketError::Unterminated(field))?;
    let s = std::str::from_utf8(&buf[..nul]).map_err(|_| PacketError::InvalidUtf8(field))?;
    Ok((s, &buf[nul + 1..]))
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

fn decode_options(mut rest: &[u8]) -> Result<Vec<(String, String)>, PacketError> {
    let mut options = Vec::new();
    while !rest.is_empty() {
        let (key, after_key) = take_cstr(rest, "option key")?;
        if after_key.is_empty() {
            return Err(PacketError::DanglingOptionKey);
        }
        let (value, after_value) = take_cstr(after_key, "option value")?;
        if key.is_empty() || value.is_empty() {
            return Err(PacketError::EmptyOption);
        }
        options.push((key.to_string(), value.to_string()));
        rest = after_value;
    }
    Ok(options)
}

fn encode_options(buf: &mut BytesMut, options: &[(String, String)]) {
    for (key, value) in options {
        put_cstr(buf, key);
        put_cstr(buf, value);
    }
}

fn options_len(options: &[(String, String)]) -> usize {
    options.iter().map(|(k, v)| k.len() + v.len() + 2).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(packet: Packet) {
        let wire = packet.encode();
        assert_eq!(Packet::decode(&wire).unwrap(), packet);
    }

    #[test]
    fn opcode_conversion() {
        assert_eq!(Opcode::from_u16(1), Some(Opcode::Rrq));
        assert_eq!(Opcode::from_u16(6), Some(Opcode::Oack));
        assert_eq!(Opcode::from_u16(7), None);
        assert_eq!(Opcode::Data.as_u16(), 3);
        assert_eq!(Opcode::Wrq.name(), "WRQ");
    }

    #[test]
    fn error_code_conversion() {
        assert_eq!(ErrorCode::from_u16(5), ErrorCode::UnknownTransferId);
        assert_eq!(ErrorCode::from_u16(42), ErrorCode::Unknown(42));
        assert_eq!(ErrorCode::Unknown(42).as_u16(), 42);
        assert_eq!(ErrorCode::OptionNegotiation.as_u16(), 8);
    }

    #[test]
    fn mode_parsing() {
        assert_eq!(Mode::from_wire("octet"), Some(Mode::Octet));
        assert_eq!(Mode::from_wire("NETASCII"), Some(Mode::Netascii));
        assert_eq!(Mode::from_wire("mail"), None);
        assert_eq!("binary".parse::<Mode>(), Ok(Mode::Octet));
        assert!("mail".parse::<Mode>().is_err());
    }

    #[test]
    fn request_roundtrip() {
        roundtrip(Packet::Rrq(Request::new("boot/kernel.img", Mode::Octet)));
        roundtrip(Packet::Wrq(
            Request::new("log.txt", Mode::Netascii)
                .with_option("blksize", 1468)
                .with_option("windowsize", 16)
                .with_option("tsize", 0),
        ));
    }

    #[test]
    fn request_wire_layout() {
        let wire = Packet::Rrq(Request::new("a", Mode::Octet).with_option("tsize", 0)).encode();
        assert_eq!(wire[..], b"\x00\x01a\x00octet\x00tsize\x000\x00"[..]);
    }

    #[test]
    fn data_roundtrip() {
        roundtrip(Packet::Data {
            block: 1,
            payload: Bytes::new(),
        });
        roundtrip(Packet::Data {
            block: u16::MAX,
            payload: Bytes::from(vec![0xA5; MAX_BLOCK_SIZE as usize]),
        });
    }

    #[test]
    fn data_encode_exact_size() {
        let packet = Packet::Data {
            block: 7,
            payload: Bytes::from_static(b"hello"),
        };
        let wire = packet.encode();
        assert_eq!(wire.len(), DATA_HEADER_LEN + 5);
        assert_eq!(wire[..4], [0, 3, 0, 7]);
    }

    #[test]
    fn ack_roundtrip() {
        roundtrip(Packet::Ack { block: 0 });
        roundtrip(Packet::Ack { block: 0xFFFF });
    }

    #[test]
    fn error_roundtrip_non_ascii() {
        roundtrip(Packet::Error {
            code: ErrorCode::AccessViolation,
            message: "zugriff verweigert: größe überschritten".to_string(),
        });
    }

    #[test]
    fn oack_roundtrip() {
        roundtrip(Packet::Oack { options: vec![] });
        roundtrip(Packet::Oack {
            options: vec![
                ("blksize".to_string(), "1024".to_string()),
                ("tsize".to_string(), "2048".to_string()),
            ],
        });
    }

    #[test]
    fn decode_rejects_truncated() {
        assert_eq!(Packet::decode(&[]), Err(PacketError::Truncated("opcode")));
        assert_eq!(Packet::decode(&[0]), Err(PacketError::Truncated("opcode")));
        assert_eq!(Packet::decode(&[0, 4, 1]), Err(PacketError::Truncated("block number")));
        assert_eq!(Packet::decode(&[0, 5, 0]), Err(PacketError::Truncated("error code")));
    }

    #[test]
    fn decode_rejects_unknown_opcode() {
        assert_eq!(Packet::decode(&[0, 9, 0, 0]), Err(PacketError::UnknownOpcode(9)));
    }

    #[test]
    fn decode_rejects_missing_nul() {
        assert_eq!(
            Packet::decode(b"\x00\x01file.txt"),
            Err(PacketError::Unterminated("filename"))
        );
        assert_eq!(
            Packet::decode(b"\x00\x01file.txt\x00octet"),
            Err(PacketError::Unterminated("mode"))
        );
        assert_eq!(
            Packet::decode(b"\x00\x05\x00\x01oops"),
            Err(PacketError::Unterminated("error message"))
        );
    }

    #[test]
    fn decode_rejects_bad_mode() {
        assert_eq!(
            Packet::decode(b"\x00\x02file\x00mail\x00"),
            Err(PacketError::UnknownMode("mail".to_string()))
        );
    }

    #[test]
    fn decode_rejects_broken_options() {
        assert_eq!(
            Packet::decode(b"\x00\x01f\x00octet\x00blksize\x00"),
            Err(PacketError::DanglingOptionKey)
        );
        assert_eq!(
            Packet::decode(b"\x00\x06blksize\x00\x00"),
            Err(PacketError::EmptyOption)
        );
    }

    #[test]
    fn mode_decodes_case_insensitively() {
        let packet = Packet::decode(b"\x00\x01f\x00OcTeT\x00").unwrap();
        match packet {
            Packet::Rrq(req) => assert_eq!(req.mode, Mode::Octet),
            other => panic!("unexpected packet {:?}", other),
        }
    }
}
