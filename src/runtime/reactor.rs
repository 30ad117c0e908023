//! mio reactor.
//!
//! Readiness-based model: poll tells us which sockets are ready, then the
//! owning handler performs non-blocking reads and writes. Uses epoll on
//! Linux, kqueue on macOS.
//!
//! Connection routing on accept:
//! 1. no control channel yet: the connection becomes the control channel
//! 2. the session is admitting streams: it becomes the next data stream
//! 3. anything else is closed straight away

use crate::protocol::ProtocolState;
use crate::runtime::{AdmitError, ControlChannel, Handler, HandlerRegistry, Ready, LISTENER_TOKEN};
use crate::session::Session;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Listen backlog for the server socket.
const LISTEN_BACKLOG: i32 = 1024;

pub struct Reactor {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    handlers: HandlerRegistry,
    session: Session,
    control: Option<ControlChannel>,
    poll_timeout: Duration,
    completed: u64,
}

impl Reactor {
    /// Bind the listening socket and register it for accept readiness.
    ///
    /// Failures here are the only fatal ones; everything after startup is
    /// contained to the connection it happens on.
    pub fn bind(addr: SocketAddr, poll_timeout: Duration, max_events: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::from_std(create_listener(addr)?);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        Ok(Self {
            poll,
            events: Events::with_capacity(max_events),
            listener,
            handlers: HandlerRegistry::new(16),
            session: Session::new(),
            control: None,
            poll_timeout,
            completed: 0,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Number of sessions that have run to a terminal state.
    pub fn completed_sessions(&self) -> u64 {
        self.completed
    }

    /// Wait once for readiness and dispatch every ready connection.
    ///
    /// A session that reached a terminal state is torn down afterwards and
    /// replaced by a fresh one, so the next connection starts a new test.
    pub fn process(&mut self) -> io::Result<()> {
        match self.poll.poll(&mut self.events, Some(self.poll_timeout)) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        let registry = self.poll.registry();

        for event in self.events.iter() {
            match event.token() {
                LISTENER_TOKEN => accept_connections(
                    &self.listener,
                    registry,
                    &mut self.handlers,
                    &mut self.control,
                    &mut self.session,
                ),
                token => dispatch(
                    token,
                    Ready::from(event),
                    registry,
                    &mut self.handlers,
                    &mut self.control,
                    &mut self.session,
                ),
            }
        }

        if self.session.state().is_terminal() {
            self.recycle();
        }

        Ok(())
    }

    /// Close the finished session's connections and install a new session.
    fn recycle(&mut self) {
        if let Some(control) = self.control.take() {
            control.close(self.poll.registry());
        }
        debug!(handlers = self.handlers.len(), "Releasing session handlers");
        self.handlers.clear();

        let finished = std::mem::take(&mut self.session);
        finished.log_summary();

        self.completed += 1;
        info!(completed = self.completed, "Session finished, waiting for next test");
    }
}

fn accept_connections(
    listener: &TcpListener,
    registry: &Registry,
    handlers: &mut HandlerRegistry,
    control: &mut Option<ControlChannel>,
    session: &mut Session,
) {
    loop {
        match listener.accept() {
            Ok((conn, peer)) => route_connection(conn, peer, registry, handlers, control, session),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                error!(error = %e, "Accept error");
                break;
            }
        }
    }
}

fn route_connection(
    conn: TcpStream,
    peer: SocketAddr,
    registry: &Registry,
    handlers: &mut HandlerRegistry,
    control: &mut Option<ControlChannel>,
    session: &mut Session,
) {
    match control {
        None => {
            let token = handlers.next_token();
            match ControlChannel::open(conn, token, registry) {
                Ok(channel) => {
                    handlers.insert(Handler::Control);
                    *control = Some(channel);
                    info!(peer = %peer, token = token.0, "Control connection opened");
                }
                Err(e) => warn!(peer = %peer, error = %e, "Failed to set up control connection"),
            }
        }
        Some(channel) if session.admission_open() && channel.can_create_streams(session) => {
            let token = handlers.next_token();
            match channel.create_stream(conn, token, registry, session) {
                Ok(index) => {
                    handlers.insert(Handler::Stream(index));
                    debug!(peer = %peer, token = token.0, index, "Data connection admitted");
                }
                Err(AdmitError::Stream(e)) => {
                    warn!(peer = %peer, error = %e, "Dropping data connection");
                }
                Err(e @ AdmitError::Control(_)) => {
                    warn!(error = %e, "Control connection failed");
                    fail_session(session);
                }
            }
        }
        Some(channel) => {
            debug!(
                peer = %peer,
                state = ?session.state(),
                control = channel.token().0,
                "Rejecting connection"
            );
            drop(conn);
        }
    }
}

fn dispatch(
    token: Token,
    ready: Ready,
    registry: &Registry,
    handlers: &mut HandlerRegistry,
    control: &mut Option<ControlChannel>,
    session: &mut Session,
) {
    match handlers.get(token) {
        Some(Handler::Control) => {
            if let Some(channel) = control.as_mut() {
                if let Err(e) = channel.on_ready(ready, registry, session) {
                    warn!(error = %e, "Control connection failed");
                    fail_session(session);
                }
            }
        }
        Some(Handler::Stream(index)) => {
            let open = match control.as_mut() {
                Some(channel) => channel.on_stream_ready(index, ready, registry, session),
                None => false,
            };
            if !open {
                handlers.remove(token);
            }
        }
        None => trace!(token = token.0, "Event for unknown token"),
    }
}

/// End the session without notifying the peer.
fn fail_session(session: &mut Session) {
    if !session.state().is_terminal() {
        session.set_state(ProtocolState::ClientTerminate);
    }
}

/// Create a non-blocking TCP listener with SO_REUSEADDR.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}

#[cfg(test)]
impl Reactor {
    /// The session currently being served (or awaited).
    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn has_control(&self) -> bool {
        self.control.is_some()
    }
}
