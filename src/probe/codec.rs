//! Probe wire format
//!
//! ```text
//! ping:  "send <micros>"
//! echo:  "recv <seq:5> <x:+4> <y:+4> <echoed timestamp text>"
//!        "recv 00007 +0120 +0240 1000000"
//!        "recv 00000 ----- ----- 0"          no entry / no target
//! ```
//!
//! The echoed timestamp is copied byte for byte from the ping, so the issuer
//! gets back exactly the text it sent.

use crate::dispatch::{Position, PositionSample};
use crate::error::{AppError, Result};

pub const PING_PREFIX: &str = "send ";
pub const ECHO_PREFIX: &str = "recv ";

/// Sequence numbers are carried modulo this
pub const SEQUENCE_MODULUS: u64 = 100_000;
/// Largest encodable coordinate magnitude
pub const MAX_COORDINATE: i32 = 9_999;

const ABSENT_FIELD: &str = "-----";
/// `SSSSS XXXXX YYYYY`
const BLOCK_LEN: usize = 17;

/// Ping send time: microseconds since the probe epoch, with the exact text
/// that carried it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTimestamp {
    text: String,
    micros: u64,
}

impl ProbeTimestamp {
    pub fn from_micros(micros: u64) -> Self {
        Self {
            text: micros.to_string(),
            micros,
        }
    }

    /// Parse a non-empty run of ASCII digits, keeping the text verbatim
    pub fn parse(text: &str) -> Result<Self> {
        if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
            return Err(AppError::ProbeDecode(format!(
                "Invalid timestamp {:?}",
                text
            )));
        }
        let micros = text.parse::<u64>().map_err(|_| {
            AppError::ProbeDecode(format!("Timestamp out of range: {}", text))
        })?;
        Ok(Self {
            text: text.to_string(),
            micros,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn micros(&self) -> u64 {
        self.micros
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingMessage {
    pub timestamp: ProbeTimestamp,
}

impl PingMessage {
    pub fn new(micros: u64) -> Self {
        Self {
            timestamp: ProbeTimestamp::from_micros(micros),
        }
    }

    pub fn encode(&self) -> String {
        format!("{}{}", PING_PREFIX, self.timestamp.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoMessage {
    /// Most recent ledger entry at echo time; `None` if the ledger was empty
    pub sample: Option<PositionSample>,
    pub timestamp: ProbeTimestamp,
}

impl EchoMessage {
    /// Build the reply to `ping`
    pub fn reply(ping: &PingMessage, sample: Option<PositionSample>) -> Self {
        Self {
            sample,
            timestamp: ping.timestamp.clone(),
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(format!(
            "{}{} {}",
            ECHO_PREFIX,
            encode_block(self.sample.as_ref())?,
            self.timestamp.as_str()
        ))
    }
}

/// Fixed-width position block
pub fn encode_block(sample: Option<&PositionSample>) -> Result<String> {
    let Some(sample) = sample else {
        return Ok(format!("{:05} {} {}", 0, ABSENT_FIELD, ABSENT_FIELD));
    };
    let sequence = sample.sequence % SEQUENCE_MODULUS;

    match sample.position {
        None => Ok(format!("{:05} {} {}", sequence, ABSENT_FIELD, ABSENT_FIELD)),
        Some(Position { x, y }) => {
            let range = -MAX_COORDINATE..=MAX_COORDINATE;
            if !range.contains(&x) || !range.contains(&y) {
                return Err(AppError::ProbeDecode(format!(
                    "Position ({}, {}) of frame #{} does not fit the echo block",
                    x, y, sample.sequence
                )));
            }
            Ok(format!("{:05} {:+05} {:+05}", sequence, x, y))
        }
    }
}

pub fn decode_block(block: &str) -> Result<Option<PositionSample>> {
    let malformed = || AppError::ProbeDecode(format!("Malformed position block {:?}", block));

    if block.len() != BLOCK_LEN || !block.is_ascii() {
        return Err(malformed());
    }
    let (seq, x, y) = (&block[0..5], &block[6..11], &block[12..17]);
    if &block[5..6] != " " || &block[11..12] != " " {
        return Err(malformed());
    }
    if !seq.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed());
    }
    let sequence: u64 = seq.parse().map_err(|_| malformed())?;

    match (x == ABSENT_FIELD, y == ABSENT_FIELD) {
        (true, true) if sequence == 0 => Ok(None),
        (true, true) => Ok(Some(PositionSample::absent(sequence))),
        (false, false) => {
            let x = decode_coordinate(x).ok_or_else(malformed)?;
            let y = decode_coordinate(y).ok_or_else(malformed)?;
            Ok(Some(PositionSample::found(sequence, (x, y))))
        }
        _ => Err(malformed()),
    }
}

fn decode_coordinate(field: &str) -> Option<i32> {
    let (sign, digits) = field.split_at(1);
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let magnitude: i32 = digits.parse().ok()?;
    match sign {
        "+" => Some(magnitude),
        "-" => Some(-magnitude),
        _ => None,
    }
}

/// Any message seen on the probe channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeMessage {
    Ping(PingMessage),
    Echo(EchoMessage),
}

impl ProbeMessage {
    pub fn decode(raw: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(raw)
            .map_err(|_| AppError::ProbeDecode("Probe message is not UTF-8".into()))?;

        if let Some(rest) = text.strip_prefix(PING_PREFIX) {
            return Ok(ProbeMessage::Ping(PingMessage {
                timestamp: ProbeTimestamp::parse(rest)?,
            }));
        }

        if let Some(rest) = text.strip_prefix(ECHO_PREFIX) {
            if rest.len() < BLOCK_LEN + 2 || !rest.is_char_boundary(BLOCK_LEN) {
                return Err(AppError::ProbeDecode(format!("Truncated echo {:?}", text)));
            }
            let (block, tail) = rest.split_at(BLOCK_LEN);
            let timestamp = tail
                .strip_prefix(' ')
                .ok_or_else(|| AppError::ProbeDecode(format!("Malformed echo {:?}", text)))?;
            return Ok(ProbeMessage::Echo(EchoMessage {
                sample: decode_block(block)?,
                timestamp: ProbeTimestamp::parse(timestamp)?,
            }));
        }

        Err(AppError::ProbeDecode(format!(
            "Unknown probe message {:?}",
            text
        )))
    }

    pub fn encode(&self) -> Result<String> {
        match self {
            ProbeMessage::Ping(ping) => Ok(ping.encode()),
            ProbeMessage::Echo(echo) => echo.encode(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo(sample: Option<PositionSample>, ts: &str) -> EchoMessage {
        EchoMessage {
            sample,
            timestamp: ProbeTimestamp::parse(ts).unwrap(),
        }
    }

    #[test]
    fn test_ping_encoding() {
        assert_eq!(PingMessage::new(0).encode(), "send 0");
        assert_eq!(PingMessage::new(1_000_000).encode(), "send 1000000");
        assert_eq!(
            ProbeMessage::decode(b"send 1000000").unwrap(),
            ProbeMessage::Ping(PingMessage::new(1_000_000))
        );
    }

    #[test]
    fn test_echo_block_layout() {
        let msg = echo(Some(PositionSample::found(7, (120, 240))), "1000000");
        assert_eq!(msg.encode().unwrap(), "recv 00007 +0120 +0240 1000000");

        let msg = echo(Some(PositionSample::found(42, (-5, 0))), "12");
        assert_eq!(msg.encode().unwrap(), "recv 00042 -0005 +0000 12");

        let msg = echo(Some(PositionSample::absent(3)), "12");
        assert_eq!(msg.encode().unwrap(), "recv 00003 ----- ----- 12");

        let msg = echo(None, "0");
        assert_eq!(msg.encode().unwrap(), "recv 00000 ----- ----- 0");
    }

    #[test]
    fn test_decode_inverts_encode() {
        let samples = [
            None,
            Some(PositionSample::absent(1)),
            Some(PositionSample::absent(99_999)),
            Some(PositionSample::found(7, (120, 240))),
            Some(PositionSample::found(12_345, (-9_999, 9_999))),
            Some(PositionSample::found(1, (0, -1))),
        ];
        for sample in samples {
            let msg = echo(sample, "424242");
            let encoded = msg.encode().unwrap();
            match ProbeMessage::decode(encoded.as_bytes()).unwrap() {
                ProbeMessage::Echo(decoded) => assert_eq!(decoded, msg, "{}", encoded),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_timestamp_text_is_verbatim() {
        let ping = match ProbeMessage::decode(b"send 000123").unwrap() {
            ProbeMessage::Ping(p) => p,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(ping.timestamp.micros(), 123);

        let reply = EchoMessage::reply(&ping, None);
        assert_eq!(reply.encode().unwrap(), "recv 00000 ----- ----- 000123");
    }

    #[test]
    fn test_sequence_wraps() {
        let block = encode_block(Some(&PositionSample::found(100_007, (1, 2)))).unwrap();
        assert_eq!(block, "00007 +0001 +0002");
    }

    #[test]
    fn test_out_of_range_coordinate() {
        for position in [(10_000, 0), (0, -10_000), (i32::MIN, 0), (5, i32::MAX)] {
            let err = encode_block(Some(&PositionSample::found(1, position))).unwrap_err();
            assert!(matches!(err, AppError::ProbeDecode(_)), "{:?}", position);
        }
        assert!(encode_block(Some(&PositionSample::found(1, (-9_999, 9_999)))).is_ok());
    }

    #[test]
    fn test_malformed_messages() {
        for raw in [
            &b""[..],
            b"send ",
            b"send -5",
            b"send 12a",
            b"send 99999999999999999999999",
            b"ping 5",
            b"recv 00007 +0120 +0240",
            b"recv 00007 +0120 +0240 ",
            b"recv 00007 +0120 -----  5",
            b"recv 0000a +0120 +0240 5",
            b"recv 00007 *0120 +0240 5",
            b"recv 00007 +0120+ +024 5",
            b"recv 00007 +0120 +0240 5x",
            b"\xff\xfe",
        ] {
            let err = ProbeMessage::decode(raw).unwrap_err();
            assert!(matches!(err, AppError::ProbeDecode(_)), "{:?}", raw);
        }
    }
}
