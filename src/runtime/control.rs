//! Control channel state machine.
//!
//! The control connection drives a session through the iperf3 protocol:
//!
//! ```text
//! IPERF_START --cookie--> PARAM_EXCHANGE --params--> CREATE_STREAMS
//!   --(all streams admitted)--> TEST_START --> TEST_RUNNING
//!   --TEST_END--> EXCHANGE_RESULTS --results--> DISPLAY_RESULTS
//!   --IPERF_DONE / CLIENT_TERMINATE--> done
//! ```
//!
//! Reads accumulate in `inbound` until a whole unit (cookie, frame or state
//! byte) is available; nothing is consumed early, so a unit split across
//! several readiness events is picked up where it left off. Writes go
//! through `outbound` and finish on writable readiness if the socket pushes
//! back. Every server-side transition the peer must see is written before
//! the session moves to it.

use crate::protocol::{
    put_frame, take_frame, FrameResult, ProtocolState, TestParams, TransferMode, COOKIE_SIZE,
};
use crate::runtime::{DataStream, Ready, TransferBuffers};
use crate::session::Session;
use bytes::{Buf, BytesMut};
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use std::io::{self, Read, Write};
use tracing::{debug, info, warn};

/// Chunk size for draining the control socket.
const READ_CHUNK: usize = 4096;

/// Failure while admitting a data stream.
#[derive(Debug)]
pub enum AdmitError {
    /// The data connection could not be registered; only it is dropped.
    Stream(io::Error),
    /// Announcing the test start on the control connection failed.
    Control(io::Error),
}

impl std::fmt::Display for AdmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdmitError::Stream(e) => write!(f, "Failed to register data stream: {}", e),
            AdmitError::Control(e) => write!(f, "Failed to signal test start: {}", e),
        }
    }
}

impl std::error::Error for AdmitError {}

pub struct ControlChannel {
    conn: TcpStream,
    token: Token,
    /// Received bytes not yet consumed by the state machine.
    inbound: BytesMut,
    /// Queued bytes not yet accepted by the socket.
    outbound: BytesMut,
    /// Whether writable interest is currently registered.
    write_interest: bool,
    /// Admitted data streams, indexed like `Session::info.streams`.
    streams: Vec<DataStream>,
    /// Allocated once the parameters are known.
    buffers: Option<TransferBuffers>,
}

impl ControlChannel {
    /// Take ownership of a freshly accepted control connection.
    pub fn open(mut conn: TcpStream, token: Token, registry: &Registry) -> io::Result<Self> {
        // State codes are single bytes; don't let Nagle hold them back.
        conn.set_nodelay(true)?;
        registry.register(&mut conn, token, Interest::READABLE)?;

        Ok(Self {
            conn,
            token,
            inbound: BytesMut::with_capacity(READ_CHUNK),
            outbound: BytesMut::new(),
            write_interest: false,
            streams: Vec::new(),
            buffers: None,
        })
    }

    pub fn token(&self) -> Token {
        self.token
    }

    /// Size of the negotiated transfer buffers, once allocated.
    pub fn block_len(&self) -> Option<usize> {
        self.buffers.as_ref().map(TransferBuffers::len)
    }

    /// Number of admitted streams that are still open.
    pub fn open_streams(&self) -> usize {
        self.streams.iter().filter(|s| s.is_open()).count()
    }

    /// Whether the session still has room for another stream.
    pub fn can_create_streams(&self, session: &Session) -> bool {
        self.streams.len() < session.target_stream_count
    }

    /// Admit `conn` as the next data stream.
    ///
    /// Admitting the last expected stream starts the test: TEST_START and
    /// TEST_RUNNING are written before this returns. Returns the stream's
    /// index.
    pub fn create_stream(
        &mut self,
        conn: TcpStream,
        token: Token,
        registry: &Registry,
        session: &mut Session,
    ) -> Result<usize, AdmitError> {
        let payload = self
            .buffers
            .get_or_insert_with(TransferBuffers::default)
            .payload();
        let stream = DataStream::open(conn, token, session.mode, payload, registry)
            .map_err(AdmitError::Stream)?;

        let index = session.admit_stream();
        self.streams.push(stream);

        debug!(
            id = session.info.streams[index].id,
            token = token.0,
            admitted = session.admitted(),
            target = session.target_stream_count,
            "Stream admitted"
        );

        if self.streams.len() == session.target_stream_count {
            self.change_state(ProtocolState::TestStart, registry, session)
                .map_err(AdmitError::Control)?;
            self.change_state(ProtocolState::TestRunning, registry, session)
                .map_err(AdmitError::Control)?;
        }

        Ok(index)
    }

    /// Handle readiness on the control connection.
    ///
    /// An error means the control connection is unusable; the caller ends
    /// the session.
    pub fn on_ready(
        &mut self,
        ready: Ready,
        registry: &Registry,
        session: &mut Session,
    ) -> io::Result<()> {
        if ready.writable {
            self.flush(registry)?;
        }

        if ready.readable {
            let peer_closed = match self.fill_inbound() {
                Ok(closed) => closed,
                Err(e) => {
                    debug!(error = %e, "Control read failed");
                    true
                }
            };

            self.advance(registry, session)?;

            if peer_closed && !session.state().is_terminal() {
                debug!(state = ?session.state(), "Control connection closed by peer");
                session.set_state(ProtocolState::ClientTerminate);
                self.on_state_change(registry, session)?;
            }
        }

        Ok(())
    }

    /// Forward readiness to data stream `index`. Returns whether it is still open.
    pub fn on_stream_ready(
        &mut self,
        index: usize,
        ready: Ready,
        registry: &Registry,
        session: &mut Session,
    ) -> bool {
        let stream = match self.streams.get_mut(index) {
            Some(stream) => stream,
            None => return false,
        };
        let info = match session.info.streams.get_mut(index) {
            Some(info) => info,
            None => return false,
        };
        let scratch = match self.buffers.as_mut() {
            Some(buffers) => buffers.scratch_mut(),
            None => return false,
        };

        stream.on_ready(ready, info, scratch, registry)
    }

    /// Close the control connection and every stream it admitted.
    pub fn close(mut self, registry: &Registry) {
        self.close_streams(registry);
        let _ = registry.deregister(&mut self.conn);
    }

    /// Run the state machine over everything buffered.
    fn advance(&mut self, registry: &Registry, session: &mut Session) -> io::Result<()> {
        while !session.state().is_terminal() {
            let progressed = match session.state() {
                ProtocolState::IperfStart => self.read_cookie(registry, session)?,
                ProtocolState::ParamExchange => self.exchange_params(registry, session)?,
                ProtocolState::ExchangeResults => self.exchange_results(registry, session)?,
                _ => self.read_state(registry, session)?,
            };

            if !progressed {
                break;
            }
        }
        Ok(())
    }

    fn read_cookie(&mut self, registry: &Registry, session: &mut Session) -> io::Result<bool> {
        let raw = match self.read_exactly(COOKIE_SIZE) {
            Some(raw) => raw,
            None => return Ok(false),
        };

        if !raw.is_ascii() {
            warn!("Session cookie is not ASCII");
        }
        session.cookie = String::from_utf8_lossy(&raw)
            .trim_end_matches('\0')
            .to_string();
        info!(cookie = %session.cookie, "Session cookie received");

        self.change_state(ProtocolState::ParamExchange, registry, session)?;
        Ok(true)
    }

    fn exchange_params(&mut self, registry: &Registry, session: &mut Session) -> io::Result<bool> {
        let body = match self.read_frame()? {
            Some(body) => body,
            None => return Ok(false),
        };

        let params = TestParams::parse(&body);
        session.configure(&params);
        self.buffers = Some(TransferBuffers::new(params.block_len()));

        info!(
            cookie = %session.cookie,
            protocol = session.protocol.as_deref().unwrap_or("unspecified"),
            mode = ?session.mode,
            streams = session.target_stream_count,
            len = self.block_len().unwrap_or_default(),
            time = ?params.time,
            client_version = ?params.client_version,
            "Test parameters received"
        );
        debug!(
            omit = ?params.omit,
            num = ?params.num,
            blockcount = ?params.blockcount,
            pacing_timer = ?params.pacing_timer,
            "Informational test parameters"
        );

        self.change_state(ProtocolState::CreateStreams, registry, session)?;
        Ok(true)
    }

    fn exchange_results(&mut self, registry: &Registry, session: &mut Session) -> io::Result<bool> {
        let theirs = match self.read_frame()? {
            Some(body) => body,
            None => return Ok(false),
        };
        debug!(len = theirs.len(), "Client results received");

        let body = session.info.to_json()?;
        let mut frame = BytesMut::new();
        put_frame(&body, &mut frame);
        self.write_fully(&frame, registry)?;

        self.change_state(ProtocolState::DisplayResults, registry, session)?;
        Ok(true)
    }

    /// Apply one state byte from the peer.
    fn read_state(&mut self, registry: &Registry, session: &mut Session) -> io::Result<bool> {
        let byte = match self.read_exactly(1) {
            Some(raw) => raw[0],
            None => return Ok(false),
        };

        match ProtocolState::from_byte(byte) {
            Some(state) => {
                session.set_state(state);
                self.on_state_change(registry, session)?;
            }
            None => warn!(code = byte as i8, "Ignoring unknown state code"),
        }
        Ok(true)
    }

    /// React to a state the peer moved us into.
    fn on_state_change(&mut self, registry: &Registry, session: &mut Session) -> io::Result<()> {
        match session.state() {
            ProtocolState::TestStart | ProtocolState::IperfDone => {}
            ProtocolState::TestEnd => {
                if session.mode == TransferMode::Forward {
                    self.close_streams(registry);
                }
                debug!(open_streams = self.open_streams(), "Test ended");
                self.change_state(ProtocolState::ExchangeResults, registry, session)?;
            }
            ProtocolState::ClientTerminate => {
                self.close_streams(registry);
                session.set_state(ProtocolState::IperfDone);
            }
            other => debug!(state = ?other, "Ignoring unexpected state"),
        }
        Ok(())
    }

    /// Announce `state` to the peer, then enter it.
    fn change_state(
        &mut self,
        state: ProtocolState,
        registry: &Registry,
        session: &mut Session,
    ) -> io::Result<()> {
        self.write_fully(&[state.to_byte()], registry)?;
        session.set_state(state);
        Ok(())
    }

    fn close_streams(&mut self, registry: &Registry) {
        for stream in &mut self.streams {
            stream.close(registry);
        }
    }

    /// Take exactly `n` buffered bytes, or nothing if fewer have arrived.
    fn read_exactly(&mut self, n: usize) -> Option<BytesMut> {
        if self.inbound.len() < n {
            return None;
        }
        Some(self.inbound.split_to(n))
    }

    /// Take one length-prefixed payload if it has fully arrived.
    fn read_frame(&mut self) -> io::Result<Option<BytesMut>> {
        match take_frame(&mut self.inbound) {
            FrameResult::Complete(body) => Ok(Some(body)),
            FrameResult::Incomplete => Ok(None),
            FrameResult::TooLarge(len) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("control frame too large: {} bytes", len),
            )),
        }
    }

    /// Read everything the socket has. Returns true if the peer closed.
    fn fill_inbound(&mut self) -> io::Result<bool> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.conn.read(&mut chunk) {
                Ok(0) => return Ok(true),
                Ok(n) => self.inbound.extend_from_slice(&chunk[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Queue `bytes` behind anything already pending and push as much as
    /// the socket accepts.
    fn write_fully(&mut self, bytes: &[u8], registry: &Registry) -> io::Result<()> {
        self.outbound.extend_from_slice(bytes);
        self.flush(registry)
    }

    fn flush(&mut self, registry: &Registry) -> io::Result<()> {
        while !self.outbound.is_empty() {
            match self.conn.write(&self.outbound) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => self.outbound.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if !self.write_interest {
                        registry.reregister(
                            &mut self.conn,
                            self.token,
                            Interest::READABLE | Interest::WRITABLE,
                        )?;
                        self.write_interest = true;
                    }
                    return Ok(());
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }

        if self.write_interest {
            registry.reregister(&mut self.conn, self.token, Interest::READABLE)?;
            self.write_interest = false;
        }
        Ok(())
    }
}
