//! iperf3 control protocol: state codes, transfer modes and framing.
//!
//! The control connection carries three kinds of units:
//! - the session cookie: 37 raw ASCII bytes, sent once by the client
//! - state signals: a single signed byte (see [`ProtocolState`])
//! - structured payloads: `[u32 big-endian length][UTF-8 JSON body]`

use bytes::{Buf, BufMut, BytesMut};
use mio::Interest;
use serde::Deserialize;
use tracing::warn;

/// Size of the session cookie, including the trailing NUL.
pub const COOKIE_SIZE: usize = 37;

/// Size of the length prefix on structured payloads.
pub const FRAME_HEADER_LEN: usize = 4;

/// Largest structured payload we are willing to buffer.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Default size of the transfer buffers when the client sends no `len`.
pub const DEFAULT_BLOCK_LEN: usize = 128 * 1024;

/// Largest `len` a client may ask for.
pub const MAX_BLOCK_LEN: usize = 1024 * 1024;

/// Protocol state, shared by both peers and signalled with one-byte codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolState {
    TestStart,
    TestRunning,
    TestEnd,
    ParamExchange,
    CreateStreams,
    ServerTerminate,
    ClientTerminate,
    ExchangeResults,
    DisplayResults,
    IperfStart,
    IperfDone,
    AccessDenied,
    ServerError,
}

impl ProtocolState {
    const TABLE: [(ProtocolState, i8); 13] = [
        (ProtocolState::TestStart, 1),
        (ProtocolState::TestRunning, 2),
        (ProtocolState::TestEnd, 4),
        (ProtocolState::ParamExchange, 9),
        (ProtocolState::CreateStreams, 10),
        (ProtocolState::ServerTerminate, 11),
        (ProtocolState::ClientTerminate, 12),
        (ProtocolState::ExchangeResults, 13),
        (ProtocolState::DisplayResults, 14),
        (ProtocolState::IperfStart, 15),
        (ProtocolState::IperfDone, 16),
        (ProtocolState::AccessDenied, -1),
        (ProtocolState::ServerError, -2),
    ];

    /// Wire code for this state.
    pub fn code(self) -> i8 {
        Self::TABLE
            .iter()
            .find(|(state, _)| *state == self)
            .map(|(_, code)| *code)
            .unwrap_or_default()
    }

    /// Decode a wire code. Returns `None` for codes outside the table.
    pub fn from_code(code: i8) -> Option<Self> {
        Self::TABLE
            .iter()
            .find(|(_, c)| *c == code)
            .map(|(state, _)| *state)
    }

    /// The code as it travels on the wire.
    pub fn to_byte(self) -> u8 {
        self.code() as u8
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        Self::from_code(byte as i8)
    }

    /// States after which the session is torn down.
    pub fn is_terminal(self) -> bool {
        matches!(self, ProtocolState::IperfDone | ProtocolState::ClientTerminate)
    }
}

/// Direction of data flow on the test streams, seen from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferMode {
    /// Client sends, server reads.
    #[default]
    Forward,
    /// Server sends, client reads.
    Reverse,
    /// Both directions at once.
    Bidirectional,
}

impl TransferMode {
    /// Readiness interest a data stream registers for in this mode.
    pub fn interest(self) -> Interest {
        match self {
            TransferMode::Forward => Interest::READABLE,
            TransferMode::Reverse => Interest::WRITABLE,
            TransferMode::Bidirectional => Interest::READABLE | Interest::WRITABLE,
        }
    }

    pub fn reads(self) -> bool {
        !matches!(self, TransferMode::Reverse)
    }

    pub fn writes(self) -> bool {
        !matches!(self, TransferMode::Forward)
    }
}

/// Test parameters sent by the client during PARAM_EXCHANGE.
///
/// Every field is optional; unknown keys are ignored. Only `tcp`,
/// `parallel`, `reverse`, `bidirectional` and `len` drive the session,
/// the rest are kept for logging.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TestParams {
    pub tcp: Option<bool>,
    pub parallel: Option<i64>,
    pub reverse: Option<bool>,
    pub bidirectional: Option<bool>,
    pub len: Option<i64>,
    pub omit: Option<i64>,
    pub time: Option<i64>,
    pub num: Option<i64>,
    pub blockcount: Option<i64>,
    pub pacing_timer: Option<i64>,
    pub client_version: Option<String>,
}

impl TestParams {
    /// Decode the parameter JSON. Malformed input yields all defaults.
    pub fn parse(body: &[u8]) -> Self {
        match serde_json::from_slice(body) {
            Ok(params) => params,
            Err(e) => {
                warn!(error = %e, "Malformed test parameters, using defaults");
                TestParams::default()
            }
        }
    }

    /// `bidirectional` wins over `reverse`; neither means forward.
    pub fn mode(&self) -> TransferMode {
        if self.bidirectional.unwrap_or(false) {
            TransferMode::Bidirectional
        } else if self.reverse.unwrap_or(false) {
            TransferMode::Reverse
        } else {
            TransferMode::Forward
        }
    }

    /// Number of data streams the client will open (at least one).
    pub fn stream_count(&self) -> usize {
        match self.parallel {
            Some(n) if n >= 1 => n as usize,
            _ => 1,
        }
    }

    /// Size of the transfer buffers, never above [`MAX_BLOCK_LEN`].
    pub fn block_len(&self) -> usize {
        match self.len {
            Some(n) if n >= 1 && n <= MAX_BLOCK_LEN as i64 => n as usize,
            Some(n) if n >= 1 => {
                warn!(
                    len = n,
                    max = MAX_BLOCK_LEN,
                    "Requested block length too large, using default"
                );
                DEFAULT_BLOCK_LEN
            }
            _ => DEFAULT_BLOCK_LEN,
        }
    }
}

/// Result of looking for a complete frame in the inbound buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum FrameResult {
    /// A whole frame body was removed from the buffer.
    Complete(BytesMut),
    /// Need more data.
    Incomplete,
    /// Declared length exceeds [`MAX_FRAME_LEN`].
    TooLarge(usize),
}

/// Take one length-prefixed frame off the front of `buf`.
///
/// Nothing is consumed unless the whole frame is present.
pub fn take_frame(buf: &mut BytesMut) -> FrameResult {
    if buf.len() < FRAME_HEADER_LEN {
        return FrameResult::Incomplete;
    }

    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_FRAME_LEN {
        return FrameResult::TooLarge(len);
    }
    if buf.len() < FRAME_HEADER_LEN + len {
        return FrameResult::Incomplete;
    }

    buf.advance(FRAME_HEADER_LEN);
    FrameResult::Complete(buf.split_to(len))
}

/// Append `body` to `out` with its big-endian length prefix.
pub fn put_frame(body: &[u8], out: &mut BytesMut) {
    out.reserve(FRAME_HEADER_LEN + body.len());
    out.put_u32(body.len() as u32);
    out.put_slice(body);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_codes() {
        assert_eq!(ProtocolState::TestStart.code(), 1);
        assert_eq!(ProtocolState::TestRunning.code(), 2);
        assert_eq!(ProtocolState::TestEnd.code(), 4);
        assert_eq!(ProtocolState::ParamExchange.code(), 9);
        assert_eq!(ProtocolState::CreateStreams.code(), 10);
        assert_eq!(ProtocolState::ServerTerminate.code(), 11);
        assert_eq!(ProtocolState::ClientTerminate.code(), 12);
        assert_eq!(ProtocolState::ExchangeResults.code(), 13);
        assert_eq!(ProtocolState::DisplayResults.code(), 14);
        assert_eq!(ProtocolState::IperfStart.code(), 15);
        assert_eq!(ProtocolState::IperfDone.code(), 16);
        assert_eq!(ProtocolState::AccessDenied.code(), -1);
        assert_eq!(ProtocolState::ServerError.code(), -2);

        // Negative codes travel as two's complement
        assert_eq!(ProtocolState::AccessDenied.to_byte(), 0xff);
        assert_eq!(ProtocolState::from_byte(0xfe), Some(ProtocolState::ServerError));
    }

    #[test]
    fn test_state_decode_unknown() {
        assert_eq!(ProtocolState::from_code(3), None);
        assert_eq!(ProtocolState::from_code(0), None);
        assert_eq!(ProtocolState::from_code(17), None);
        assert_eq!(ProtocolState::from_byte(16), Some(ProtocolState::IperfDone));
    }

    #[test]
    fn test_terminal_states() {
        assert!(ProtocolState::IperfDone.is_terminal());
        assert!(ProtocolState::ClientTerminate.is_terminal());
        assert!(!ProtocolState::DisplayResults.is_terminal());
        assert!(!ProtocolState::ServerTerminate.is_terminal());
    }

    #[test]
    fn test_mode_interest() {
        assert_eq!(TransferMode::Forward.interest(), Interest::READABLE);
        assert_eq!(TransferMode::Reverse.interest(), Interest::WRITABLE);

        let both = TransferMode::Bidirectional.interest();
        assert!(both.is_readable());
        assert!(both.is_writable());

        assert!(TransferMode::Forward.reads() && !TransferMode::Forward.writes());
        assert!(!TransferMode::Reverse.reads() && TransferMode::Reverse.writes());
    }

    #[test]
    fn test_params_recognized_keys() {
        let params = TestParams::parse(br#"{"tcp":true,"parallel":2,"len":1024}"#);
        assert_eq!(params.tcp, Some(true));
        assert_eq!(params.stream_count(), 2);
        assert_eq!(params.block_len(), 1024);
        assert_eq!(params.mode(), TransferMode::Forward);
    }

    #[test]
    fn test_params_mode_priority() {
        let params = TestParams::parse(br#"{"reverse":true,"bidirectional":true}"#);
        assert_eq!(params.mode(), TransferMode::Bidirectional);

        let params = TestParams::parse(br#"{"reverse":true,"bidirectional":false}"#);
        assert_eq!(params.mode(), TransferMode::Reverse);

        let params = TestParams::parse(br#"{"reverse":false}"#);
        assert_eq!(params.mode(), TransferMode::Forward);
    }

    #[test]
    fn test_params_defaults() {
        let params =
            TestParams::parse(br#"{"omit":0,"time":10,"client_version":"3.9","extra":[1,2]}"#);
        assert_eq!(params.stream_count(), 1);
        assert_eq!(params.block_len(), DEFAULT_BLOCK_LEN);
        assert_eq!(params.time, Some(10));
        assert_eq!(params.client_version.as_deref(), Some("3.9"));

        let params = TestParams::parse(b"not json");
        assert_eq!(params.tcp, None);
        assert_eq!(params.block_len(), 128 * 1024);

        let params = TestParams::parse(br#"{"parallel":0,"len":-5}"#);
        assert_eq!(params.stream_count(), 1);
        assert_eq!(params.block_len(), DEFAULT_BLOCK_LEN);

        // Oversized lengths fall back instead of being allocated
        let params = TestParams::parse(br#"{"len":9223372036854775807}"#);
        assert_eq!(params.block_len(), DEFAULT_BLOCK_LEN);

        let params = TestParams::parse(br#"{"len":1048577}"#);
        assert_eq!(params.block_len(), DEFAULT_BLOCK_LEN);

        let params = TestParams::parse(br#"{"len":1048576}"#);
        assert_eq!(params.block_len(), MAX_BLOCK_LEN);
    }

    #[test]
    fn test_frame_length_matches_body() {
        let body = "{\"name\":\"caf\u{e9}\"}".as_bytes();
        let mut out = BytesMut::new();
        put_frame(body, &mut out);

        let declared = u32::from_be_bytes([out[0], out[1], out[2], out[3]]) as usize;
        assert_eq!(declared, body.len());
        assert_eq!(&out[FRAME_HEADER_LEN..], body);
    }

    #[test]
    fn test_take_frame_partial() {
        let mut out = BytesMut::new();
        put_frame(b"{\"a\":1}", &mut out);
        let full = out.clone();

        // Header only
        let mut buf = BytesMut::from(&full[..3]);
        assert_eq!(take_frame(&mut buf), FrameResult::Incomplete);
        assert_eq!(buf.len(), 3);

        // Header plus part of the body
        let mut buf = BytesMut::from(&full[..6]);
        assert_eq!(take_frame(&mut buf), FrameResult::Incomplete);
        assert_eq!(buf.len(), 6);

        // Whole frame followed by a state byte
        let mut buf = full.clone();
        buf.put_u8(ProtocolState::IperfDone.to_byte());
        match take_frame(&mut buf) {
            FrameResult::Complete(body) => assert_eq!(&body[..], b"{\"a\":1}"),
            other => panic!("expected frame, got {:?}", other),
        }
        assert_eq!(&buf[..], &[16]);
    }

    #[test]
    fn test_take_frame_too_large() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_LEN + 1) as u32);
        assert_eq!(take_frame(&mut buf), FrameResult::TooLarge(MAX_FRAME_LEN + 1));
    }
}
