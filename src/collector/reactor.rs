use super::{
    connection::{Connection, ReadOutcome, State, WriteOutcome},
    handlers::RequestHandler,
    sweeper::{DEFAULT_SWEEP_INTERVAL, Sweeper},
};
use crate::{error::MetricsError, frame::DEFAULT_MAX_FRAME_LEN};
use mio::{
    Events, Interest, Poll, Registry, Token, Waker,
    event::Event,
    net::{TcpListener, TcpStream},
};
use std::{
    collections::HashMap,
    io::ErrorKind,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_CONNECTION: usize = 2;
const EVENT_CAPACITY: usize = 1024;

pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Tunables for a single reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReactorConfig {
    /// How long a connection may sit in `Read` before the sweep closes it.
    pub read_timeout: Duration,
    pub sweep_interval: Duration,
    /// Largest request payload accepted; bigger headers close the connection.
    pub max_frame_len: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            read_timeout: DEFAULT_READ_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

/// Stops a running reactor from another thread.
#[derive(Debug, Clone)]
pub struct ReactorHandle {
    waker: Arc<Waker>,
    shutdown: Arc<AtomicBool>,
}

impl ReactorHandle {
    /// Asks the reactor to close every connection and return from [`Reactor::run`].
    ///
    /// # Errors
    /// Returns an error if the reactor cannot be woken.
    pub fn shutdown(&self) -> Result<(), MetricsError> {
        self.shutdown.store(true, Ordering::SeqCst);
        self.waker.wake().map_err(Into::into)
    }
}

/// Single-threaded event loop serving one listening socket.
///
/// Owns the connection table. Connection ids are handed out monotonically and
/// never reused, so a stale event can never reach a newer connection.
pub struct Reactor<H> {
    poll: Poll,
    listener: TcpListener,
    connections: HashMap<Token, Connection<TcpStream>>,
    next_id: usize,
    handler: H,
    config: ReactorConfig,
    waker: Arc<Waker>,
    shutdown: Arc<AtomicBool>,
}

impl<H: RequestHandler> Reactor<H> {
    /// Takes over an already bound listener.
    ///
    /// # Errors
    /// Returns an error if the poll instance cannot be created or the listener registered.
    pub fn new(
        listener: std::net::TcpListener,
        handler: H,
        config: ReactorConfig,
    ) -> Result<Self, MetricsError> {
        listener.set_nonblocking(true)?;
        let mut listener = TcpListener::from_std(listener);
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);

        Ok(Self {
            poll,
            listener,
            connections: HashMap::new(),
            next_id: FIRST_CONNECTION,
            handler,
            config,
            waker,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle {
            waker: self.waker.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    /// # Errors
    /// Returns an error if the listener has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr, MetricsError> {
        self.listener.local_addr().map_err(Into::into)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Runs the loop until [`ReactorHandle::shutdown`] is called.
    ///
    /// Without a handle the loop only ends with the process.
    ///
    /// # Errors
    /// Returns an error if polling fails; connection errors never escape.
    pub fn run(&mut self) -> Result<(), MetricsError> {
        let _sweeper = Sweeper::spawn(self.waker.clone(), self.config.sweep_interval)?;
        let mut events = Events::with_capacity(EVENT_CAPACITY);
        log::debug!("reactor listening on {:?}", self.listener.local_addr());

        loop {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                return Err(e.into());
            }

            for event in &events {
                match event.token() {
                    LISTENER => self.accept(),
                    WAKER => {
                        if self.shutdown.load(Ordering::SeqCst) {
                            self.close_all();
                            return Ok(());
                        }
                        self.tick(Instant::now());
                    }
                    token => self.dispatch(token, event),
                }
            }
        }
    }

    /// Closes every connection that has waited in `Read` past its timeout.
    ///
    /// Returns how many were closed.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let expired: Vec<Token> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.is_expired(now))
            .map(|(token, _)| *token)
            .collect();
        for token in &expired {
            log::debug!("connection {token:?} idle for too long");
            self.close(*token);
        }
        expired.len()
    }

    /// Periodic housekeeping: sweep, then drain the backlog.
    ///
    /// Readiness is edge-triggered, so connections left queued after an
    /// accept failure (such as running out of descriptors) get no new
    /// listener event. The sweep may have freed descriptors for them.
    fn tick(&mut self, now: Instant) {
        self.sweep(now);
        self.accept();
    }

    fn next_token(&mut self) -> Token {
        let token = Token(self.next_id);
        self.next_id += 1;
        token
    }

    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    let token = self.next_token();
                    if let Err(e) =
                        self.poll
                            .registry()
                            .register(&mut stream, token, Interest::READABLE)
                    {
                        log::warn!("failed to register connection from {peer}: {e}");
                        continue;
                    }
                    log::debug!("accepted {peer} as {token:?}");
                    let conn = Connection::new(
                        stream,
                        Some(peer),
                        self.config.read_timeout,
                        self.config.max_frame_len,
                    );
                    self.connections.insert(token, conn);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::ConnectionAborted | ErrorKind::Interrupted
                    ) => {}
                Err(e) => {
                    log::warn!("accept failed: {e}");
                    break;
                }
            }
        }
    }

    fn dispatch(&mut self, token: Token, event: &Event) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        if event.is_error() || (event.is_read_closed() && event.is_write_closed()) {
            log::debug!("{token:?} hung up");
            conn.force_closing();
        }

        let registry = self.poll.registry();
        match conn.state() {
            State::Read => drive_read(conn, &mut self.handler, registry, token),
            State::Process => enter_write(conn, &mut self.handler, registry, token),
            State::Write => drive_write(conn, registry, token),
            State::Accept => {
                log::error!("{token:?} is a connection in the accept state");
                conn.force_closing();
            }
            State::Closing => {}
        }

        if conn.state() == State::Closing {
            self.close(token);
        }
    }

    fn close(&mut self, token: Token) {
        if let Some(conn) = self.connections.remove(&token) {
            conn.close(self.poll.registry());
        }
    }

    fn close_all(&mut self) {
        let registry = self.poll.registry();
        for (_, conn) in self.connections.drain() {
            conn.close(registry);
        }
    }
}

fn drive_read<H: RequestHandler>(
    conn: &mut Connection<TcpStream>,
    handler: &mut H,
    registry: &Registry,
    token: Token,
) {
    loop {
        match conn.read_step() {
            ReadOutcome::ReadMore | ReadOutcome::ReadContent => {}
            ReadOutcome::Retry | ReadOutcome::Closing => return,
            ReadOutcome::Process => {
                enter_write(conn, handler, registry, token);
                return;
            }
        }
    }
}

fn enter_write<H: RequestHandler>(
    conn: &mut Connection<TcpStream>,
    handler: &mut H,
    registry: &Registry,
    token: Token,
) {
    if conn.process(handler) != State::Write {
        return;
    }
    if let Err(e) = registry.reregister(conn.stream_mut(), token, Interest::WRITABLE) {
        log::warn!("{token:?}: cannot switch to write interest: {e}");
        conn.force_closing();
    }
}

fn drive_write(conn: &mut Connection<TcpStream>, registry: &Registry, token: Token) {
    loop {
        match conn.write_step() {
            WriteOutcome::WriteMore => {}
            WriteOutcome::Retry | WriteOutcome::Closing => return,
            WriteOutcome::WriteComplete => {
                if let Err(e) = registry.reregister(conn.stream_mut(), token, Interest::READABLE) {
                    log::warn!("{token:?}: cannot switch to read interest: {e}");
                    conn.force_closing();
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::handlers::HandlerError;
    use std::{
        io::{Read, Write},
        net::TcpStream as StdStream,
        thread,
    };

    type Echo = fn(&[u8]) -> Result<Vec<u8>, HandlerError>;

    fn echo(request: &[u8]) -> Result<Vec<u8>, HandlerError> {
        Ok(request.to_vec())
    }

    fn reactor(config: ReactorConfig) -> Reactor<Echo> {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        Reactor::new(listener, echo as Echo, config).unwrap()
    }

    /// One pass of the event loop, without the sweeper thread.
    fn pump(reactor: &mut Reactor<Echo>, events: &mut Events) {
        reactor
            .poll
            .poll(events, Some(Duration::from_millis(50)))
            .unwrap();
        for event in events.iter() {
            match event.token() {
                LISTENER => reactor.accept(),
                WAKER => {}
                token => reactor.dispatch(token, event),
            }
        }
    }

    fn pump_until(reactor: &mut Reactor<Echo>, done: impl Fn(&Reactor<Echo>) -> bool) {
        let mut events = Events::with_capacity(8);
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done(reactor) {
            assert!(Instant::now() < deadline, "reactor made no progress");
            pump(reactor, &mut events);
        }
    }

    #[test]
    fn sweep_closes_idle_connections() {
        let mut reactor = reactor(ReactorConfig {
            read_timeout: Duration::from_secs(5),
            ..ReactorConfig::default()
        });
        let _client = StdStream::connect(reactor.local_addr().unwrap()).unwrap();
        pump_until(&mut reactor, |r| r.connection_count() == 1);

        assert_eq!(reactor.sweep(Instant::now()), 0);
        let closed = reactor.sweep(Instant::now() + Duration::from_secs(10));
        assert_eq!(closed, 1);
        assert_eq!(reactor.connection_count(), 0);
    }

    #[test]
    fn reset_by_peer_closes_a_reading_connection() {
        use nix::{
            libc::linger,
            sys::socket::{setsockopt, sockopt::Linger},
        };

        let mut reactor = reactor(ReactorConfig::default());
        let mut client = StdStream::connect(reactor.local_addr().unwrap()).unwrap();
        pump_until(&mut reactor, |r| r.connection_count() == 1);

        client.write_all(b"00000").unwrap();
        let mut events = Events::with_capacity(8);
        pump(&mut reactor, &mut events);
        assert_eq!(reactor.connection_count(), 1);

        // A zero linger turns close into a reset.
        let abort = linger {
            l_onoff: 1,
            l_linger: 0,
        };
        setsockopt(&client, Linger, &abort).unwrap();
        drop(client);

        pump_until(&mut reactor, |r| r.connection_count() == 0);
    }

    #[test]
    fn tick_accepts_connections_waiting_in_the_backlog() {
        let mut reactor = reactor(ReactorConfig::default());
        let _client = StdStream::connect(reactor.local_addr().unwrap()).unwrap();
        assert_eq!(reactor.connection_count(), 0);

        // No listener event is consumed here, only the periodic tick.
        let deadline = Instant::now() + Duration::from_secs(5);
        while reactor.connection_count() == 0 && Instant::now() < deadline {
            reactor.tick(Instant::now());
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(reactor.connection_count(), 1);
    }

    #[test]
    fn connection_ids_are_never_reused() {
        let mut reactor = reactor(ReactorConfig::default());
        let first = reactor.next_token();
        let second = reactor.next_token();
        assert_eq!(first, Token(FIRST_CONNECTION));
        assert!(second > first);
        assert_ne!(first, LISTENER);
        assert_ne!(first, WAKER);
    }

    #[test]
    fn serves_until_shutdown() {
        let mut reactor = reactor(ReactorConfig::default());
        let addr = reactor.local_addr().unwrap();
        let handle = reactor.handle();
        let server = thread::spawn(move || reactor.run());

        let mut client = StdStream::connect(addr).unwrap();
        for payload in [&b"first"[..], b"second"] {
            client.write_all(&crate::frame::encode(payload).unwrap()).unwrap();
            let mut response = vec![0; 10 + payload.len()];
            client.read_exact(&mut response).unwrap();
            assert_eq!(&response[10..], payload);
        }

        handle.shutdown().unwrap();
        server.join().unwrap().unwrap();

        // The server side of the connection is gone.
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).unwrap_or(0), 0);
    }
}
