//! Data stream transfer loop.
//!
//! A data stream only moves bytes: reads are counted and thrown away, writes
//! come from the session's shared payload. Once closed, a stream is
//! deregistered and never serviced again.

use crate::protocol::TransferMode;
use crate::runtime::Ready;
use crate::session::StreamInfo;
use bytes::{Buf, Bytes};
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use std::io::{self, Read, Write};
use tracing::debug;

/// Syscalls per direction before yielding to other connections.
const MAX_PASSES_PER_EVENT: usize = 16;

/// Outcome of one direction's transfer pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Progress {
    /// Socket reported `WouldBlock`; wait for the next edge.
    Drained,
    /// Budget spent with data still moving; readiness must be re-armed.
    Yielded,
    /// Peer closed the connection.
    Closed,
}

pub struct DataStream {
    conn: Option<TcpStream>,
    token: Token,
    interest: Interest,
    mode: TransferMode,
    /// Unwritten remainder of the current block.
    pending: Bytes,
    payload: Bytes,
}

impl DataStream {
    /// Register `conn` for the interests `mode` implies.
    pub fn open(
        mut conn: TcpStream,
        token: Token,
        mode: TransferMode,
        payload: Bytes,
        registry: &Registry,
    ) -> io::Result<Self> {
        let interest = mode.interest();
        registry.register(&mut conn, token, interest)?;

        Ok(Self {
            conn: Some(conn),
            token,
            interest,
            mode,
            pending: payload.clone(),
            payload,
        })
    }

    pub fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    /// Service a readiness event. Returns whether the stream is still open.
    pub fn on_ready(
        &mut self,
        ready: Ready,
        info: &mut StreamInfo,
        scratch: &mut [u8],
        registry: &Registry,
    ) -> bool {
        if !self.is_open() {
            return false;
        }

        match self.transfer(ready, info, scratch, registry) {
            Ok(true) => true,
            Ok(false) => {
                debug!(
                    id = info.id,
                    token = self.token.0,
                    bytes = info.bytes,
                    "Stream closed by peer"
                );
                self.close(registry);
                false
            }
            Err(e) => {
                debug!(id = info.id, token = self.token.0, error = %e, "Stream I/O error");
                self.close(registry);
                false
            }
        }
    }

    fn transfer(
        &mut self,
        ready: Ready,
        info: &mut StreamInfo,
        scratch: &mut [u8],
        registry: &Registry,
    ) -> io::Result<bool> {
        let conn = match self.conn.as_mut() {
            Some(conn) => conn,
            None => return Ok(false),
        };

        let mut rearm = false;

        if ready.readable && self.mode.reads() {
            match read_pass(conn, info, scratch)? {
                Progress::Closed => return Ok(false),
                Progress::Yielded => rearm = true,
                Progress::Drained => {}
            }
        }

        if ready.writable && self.mode.writes() {
            match write_pass(conn, info, &mut self.pending, &self.payload)? {
                Progress::Closed => return Ok(false),
                Progress::Yielded => rearm = true,
                Progress::Drained => {}
            }
        }

        if rearm {
            registry.reregister(conn, self.token, self.interest)?;
        }

        Ok(true)
    }

    /// Deregister and drop the connection.
    pub fn close(&mut self, registry: &Registry) {
        if let Some(mut conn) = self.conn.take() {
            let _ = registry.deregister(&mut conn);
        }
    }
}

/// Read and discard until the socket drains, counting every byte.
fn read_pass(
    conn: &mut TcpStream,
    info: &mut StreamInfo,
    scratch: &mut [u8],
) -> io::Result<Progress> {
    for _ in 0..MAX_PASSES_PER_EVENT {
        match conn.read(scratch) {
            Ok(0) => return Ok(Progress::Closed),
            Ok(n) => info.bytes += n as u64,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Progress::Drained),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(Progress::Yielded)
}

/// Write payload blocks until the socket pushes back.
///
/// A block counts once its last byte is written; the cursor then restarts
/// at the top of the shared payload.
fn write_pass(
    conn: &mut TcpStream,
    info: &mut StreamInfo,
    pending: &mut Bytes,
    payload: &Bytes,
) -> io::Result<Progress> {
    for _ in 0..MAX_PASSES_PER_EVENT {
        match conn.write(&pending[..]) {
            Ok(0) => return Ok(Progress::Closed),
            Ok(n) => {
                info.bytes += n as u64;
                pending.advance(n);
                if !pending.has_remaining() {
                    info.blocks += 1;
                    *pending = payload.clone();
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Progress::Drained),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(Progress::Yielded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testutil::{pump, socket_pair};
    use crate::runtime::TransferBuffers;
    use mio::Poll;

    fn step(
        stream: &mut DataStream,
        ready: Ready,
        info: &mut StreamInfo,
        buffers: &mut TransferBuffers,
        poll: &Poll,
    ) -> bool {
        stream.on_ready(ready, info, buffers.scratch_mut(), poll.registry())
    }

    #[test]
    fn test_forward_counts_bytes() {
        let poll = Poll::new().unwrap();
        let (mut client, server) = socket_pair();
        let mut buffers = TransferBuffers::new(1024);
        let mut stream = DataStream::open(
            server,
            Token(1),
            TransferMode::Forward,
            buffers.payload(),
            poll.registry(),
        )
        .unwrap();
        let mut info = StreamInfo::new(1);

        client.write_all(&[7u8; 5000]).unwrap();

        pump(|| {
            assert!(step(&mut stream, Ready::READABLE, &mut info, &mut buffers, &poll));
            info.bytes == 5000
        });

        // Writable readiness does nothing in forward mode
        assert!(step(&mut stream, Ready::WRITABLE, &mut info, &mut buffers, &poll));
        assert_eq!(info.bytes, 5000);
        assert_eq!(info.blocks, 0);
    }

    #[test]
    fn test_peer_close_closes_stream() {
        let poll = Poll::new().unwrap();
        let (mut client, server) = socket_pair();
        let mut buffers = TransferBuffers::new(256);
        let mut stream = DataStream::open(
            server,
            Token(1),
            TransferMode::Forward,
            buffers.payload(),
            poll.registry(),
        )
        .unwrap();
        let mut info = StreamInfo::new(3);

        client.write_all(&[1u8; 100]).unwrap();
        drop(client);

        pump(|| !step(&mut stream, Ready::READABLE, &mut info, &mut buffers, &poll));

        assert!(!stream.is_open());
        assert_eq!(info.bytes, 100);

        // A closed stream ignores further events
        assert!(!step(&mut stream, Ready::BOTH, &mut info, &mut buffers, &poll));
        assert_eq!(info.bytes, 100);
    }

    #[test]
    fn test_reverse_counts_blocks() {
        let poll = Poll::new().unwrap();
        let (mut client, server) = socket_pair();
        let mut buffers = TransferBuffers::new(100);
        let mut stream = DataStream::open(
            server,
            Token(2),
            TransferMode::Reverse,
            buffers.payload(),
            poll.registry(),
        )
        .unwrap();
        let mut info = StreamInfo::new(1);

        assert!(step(&mut stream, Ready::WRITABLE, &mut info, &mut buffers, &poll));

        // One pass writes whole blocks into an empty socket buffer
        assert!(info.bytes > 0);
        assert_eq!(info.blocks, info.bytes / 100);

        let mut received = vec![0u8; info.bytes as usize];
        client.read_exact(&mut received).unwrap();
        assert!(received.iter().all(|b| *b == 0));

        // Readable readiness does nothing in reverse mode
        let before = info.bytes;
        assert!(step(&mut stream, Ready::READABLE, &mut info, &mut buffers, &poll));
        assert_eq!(info.bytes, before);
    }

    #[test]
    fn test_bidirectional_reads_and_writes() {
        let poll = Poll::new().unwrap();
        let (mut client, server) = socket_pair();
        let mut buffers = TransferBuffers::new(4096);

        // Make sure all inbound bytes are queued before the single event
        client.write_all(&[9u8; 3000]).unwrap();
        let mut peek = [0u8; 4096];
        pump(|| matches!(server.peek(&mut peek), Ok(3000)));

        let mut stream = DataStream::open(
            server,
            Token(3),
            TransferMode::Bidirectional,
            buffers.payload(),
            poll.registry(),
        )
        .unwrap();
        let mut info = StreamInfo::new(1);

        assert!(step(&mut stream, Ready::BOTH, &mut info, &mut buffers, &poll));

        // Everything beyond the 3000 inbound bytes was written to the peer
        assert!(info.bytes > 3000);
        let written = info.bytes - 3000;
        assert!(info.blocks > 0);
        assert_eq!(info.blocks, written / 4096);

        let mut received = vec![0u8; written as usize];
        client.read_exact(&mut received).unwrap();
        assert!(received.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_close_is_idempotent() {
        let poll = Poll::new().unwrap();
        let (_client, server) = socket_pair();
        let buffers = TransferBuffers::new(64);
        let mut stream = DataStream::open(
            server,
            Token(4),
            TransferMode::Bidirectional,
            buffers.payload(),
            poll.registry(),
        )
        .unwrap();

        assert!(stream.is_open());
        stream.close(poll.registry());
        stream.close(poll.registry());
        assert!(!stream.is_open());
    }
}
