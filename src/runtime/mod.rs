//! Single-threaded readiness runtime.
//!
//! One thread owns the poller, the current `Session`, its control channel
//! and every data stream:
//! - `Reactor`: listener, poll loop, accept routing, session recycling
//! - `ControlChannel`: control protocol state machine
//! - `DataStream`: per-stream transfer loop and counters
//! - `HandlerRegistry`: token to handler mapping used for dispatch

mod buffer;
mod control;
mod handler;
mod reactor;
mod stream;

pub(crate) use buffer::TransferBuffers;
pub(crate) use control::{AdmitError, ControlChannel};
pub(crate) use handler::{Handler, HandlerRegistry, LISTENER_TOKEN};
pub(crate) use reactor::Reactor;
pub(crate) use stream::DataStream;

use crate::config::Config;
use mio::event::Event;
use std::io;
use std::net::SocketAddr;
use tracing::info;

/// Serve tests on `addr` until the poller fails, or after the first
/// completed test in one-off mode.
pub fn run(config: &Config, addr: SocketAddr) -> io::Result<()> {
    let mut reactor = Reactor::bind(addr, config.poll_timeout, config.max_events)?;

    info!(
        addr = %reactor.local_addr()?,
        poll_timeout_ms = config.poll_timeout.as_millis() as u64,
        one_off = config.one_off,
        "Server listening"
    );

    loop {
        reactor.process()?;

        if config.one_off && reactor.completed_sessions() > 0 {
            info!("One-off test complete, shutting down");
            return Ok(());
        }
    }
}

/// Readiness reported for one connection in a poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ready {
    pub readable: bool,
    pub writable: bool,
}

#[cfg(test)]
impl Ready {
    pub const READABLE: Ready = Ready {
        readable: true,
        writable: false,
    };

    pub const WRITABLE: Ready = Ready {
        readable: false,
        writable: true,
    };

    pub const BOTH: Ready = Ready {
        readable: true,
        writable: true,
    };
}

impl From<&Event> for Ready {
    fn from(event: &Event) -> Self {
        // Errors and hang-ups surface through the next read or write.
        let failed = event.is_error();
        Ready {
            readable: event.is_readable() || event.is_read_closed() || failed,
            writable: event.is_writable() || event.is_write_closed() || failed,
        }
    }
}
