use super::handlers::RequestHandler;
use crate::frame::{self, HEADER_LEN};
use std::{
    io::{self, ErrorKind, Read, Write},
    net::SocketAddr,
    panic::{self, AssertUnwindSafe},
    time::{Duration, Instant},
};

/// Upper bound on a single `recv`, so a large announced payload is not
/// allocated before it actually arrives.
const READ_CHUNK: usize = 64 * 1024;

/// Where a socket is in its request/response cycle.
///
/// Only the listening socket is ever in `Accept`; accepted connections start
/// in `Read` and end in `Closing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Accept,
    Read,
    Process,
    Write,
    Closing,
}

/// Result of one non-blocking receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The socket would block; wait for the next readiness event.
    Retry,
    /// Progress was made but the current header or payload is incomplete.
    ReadMore,
    /// The header was validated; the payload is now being read.
    ReadContent,
    /// The full request is buffered.
    Process,
    Closing,
}

/// Result of one non-blocking send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Retry,
    WriteMore,
    /// The whole response went out and the connection is back in `Read`.
    WriteComplete,
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadPhase {
    Header,
    Payload,
}

/// Removes a stream from the readiness facility.
pub trait Deregister<S> {
    /// # Errors
    /// Whatever the facility reports; the stream is closed regardless.
    fn deregister(&self, stream: &mut S) -> io::Result<()>;
}

impl<S: mio::event::Source> Deregister<S> for mio::Registry {
    fn deregister(&self, stream: &mut S) -> io::Result<()> {
        Self::deregister(self, stream)
    }
}

/// Per-socket state owned by the reactor.
#[derive(Debug)]
pub struct Connection<S> {
    stream: S,
    peer: Option<SocketAddr>,
    state: State,
    phase: ReadPhase,
    read_buf: Vec<u8>,
    need_read: usize,
    write_buf: Vec<u8>,
    written: usize,
    read_started: Option<Instant>,
    read_timeout: Duration,
    max_frame_len: usize,
}

impl<S> Connection<S> {
    /// Wraps a freshly accepted stream; the connection starts in `Read`.
    pub fn new(
        stream: S,
        peer: Option<SocketAddr>,
        read_timeout: Duration,
        max_frame_len: usize,
    ) -> Self {
        let mut conn = Self {
            stream,
            peer,
            state: State::Read,
            phase: ReadPhase::Header,
            read_buf: Vec::with_capacity(HEADER_LEN),
            need_read: HEADER_LEN,
            write_buf: Vec::new(),
            written: 0,
            read_started: None,
            read_timeout,
            max_frame_len,
        };
        conn.enter_read(Instant::now());
        conn
    }

    pub const fn state(&self) -> State {
        self.state
    }

    pub const fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// The buffered request, complete once the connection reaches `Process`.
    #[cfg(test)]
    pub fn request(&self) -> &[u8] {
        &self.read_buf
    }

    pub const fn force_closing(&mut self) {
        self.state = State::Closing;
    }

    /// True when the connection has waited in `Read` for longer than its timeout.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.state == State::Read
            && self
                .read_started
                .is_some_and(|started| now.saturating_duration_since(started) >= self.read_timeout)
    }

    fn enter_read(&mut self, now: Instant) {
        self.state = State::Read;
        self.phase = ReadPhase::Header;
        self.need_read = HEADER_LEN;
        self.read_buf.clear();
        self.write_buf.clear();
        self.written = 0;
        self.read_started = Some(now);
    }

    fn closing(&mut self) -> ReadOutcome {
        self.state = State::Closing;
        ReadOutcome::Closing
    }

    fn on_received(&mut self) -> ReadOutcome {
        if self.need_read > 0 {
            return ReadOutcome::ReadMore;
        }
        match self.phase {
            ReadPhase::Header => {
                let Some(header) = self.read_buf.first_chunk::<HEADER_LEN>() else {
                    return self.closing();
                };
                match frame::decode_header_bounded(header, self.max_frame_len) {
                    Ok(len) => {
                        log::trace!("{:?}: header announces {len} bytes", self.peer);
                        self.phase = ReadPhase::Payload;
                        self.need_read = len;
                        self.read_buf.clear();
                        ReadOutcome::ReadContent
                    }
                    Err(e) => {
                        log::warn!("{:?}: rejecting frame: {e}", self.peer);
                        self.closing()
                    }
                }
            }
            ReadPhase::Payload => {
                self.state = State::Process;
                ReadOutcome::Process
            }
        }
    }

    /// Runs the request through `handler` and frames the response for writing.
    ///
    /// A handler error, panic or empty response closes the connection instead.
    pub fn process<H: RequestHandler>(&mut self, handler: &mut H) -> State {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.handle(&self.read_buf)));
        let response = match outcome {
            Ok(Ok(response)) if !response.is_empty() => response,
            Ok(Ok(_)) => {
                log::warn!("{:?}: handler produced an empty response", self.peer);
                self.state = State::Closing;
                return self.state;
            }
            Ok(Err(e)) => {
                log::warn!("{:?}: handler failed: {e}", self.peer);
                self.state = State::Closing;
                return self.state;
            }
            Err(_) => {
                log::error!("{:?}: handler panicked", self.peer);
                self.state = State::Closing;
                return self.state;
            }
        };

        self.write_buf.clear();
        if let Err(e) = frame::encode_into(&response, &mut self.write_buf) {
            log::warn!("{:?}: cannot frame response: {e}", self.peer);
            self.state = State::Closing;
            return self.state;
        }
        self.read_buf.clear();
        self.written = 0;
        self.read_started = None;
        self.state = State::Write;
        self.state
    }

    /// Deregisters the stream, then closes it by dropping it.
    pub fn close<R: Deregister<S>>(mut self, registry: &R) {
        if let Err(e) = registry.deregister(&mut self.stream) {
            log::debug!("{:?}: deregister failed: {e}", self.peer);
        }
        log::debug!("{:?}: connection closed", self.peer);
        drop(self.stream);
    }
}

impl<S: Read> Connection<S> {
    /// Performs one receive of at most the bytes still needed.
    pub fn read_step(&mut self) -> ReadOutcome {
        debug_assert_eq!(self.state, State::Read);
        let start = self.read_buf.len();
        let want = self.need_read.min(READ_CHUNK);
        self.read_buf.resize(start + want, 0);

        match self.stream.read(&mut self.read_buf[start..]) {
            Ok(0) => {
                self.read_buf.truncate(start);
                log::debug!("{:?}: peer closed", self.peer);
                self.closing()
            }
            Ok(n) => {
                self.read_buf.truncate(start + n);
                self.need_read -= n;
                self.on_received()
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                self.read_buf.truncate(start);
                ReadOutcome::Retry
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {
                self.read_buf.truncate(start);
                ReadOutcome::ReadMore
            }
            Err(e) => {
                self.read_buf.truncate(start);
                log::warn!("{:?}: read failed: {e}", self.peer);
                self.closing()
            }
        }
    }
}

impl<S: Write> Connection<S> {
    /// Performs one send of the unwritten part of the response.
    pub fn write_step(&mut self) -> WriteOutcome {
        debug_assert_eq!(self.state, State::Write);
        match self.stream.write(&self.write_buf[self.written..]) {
            Ok(0) => {
                log::warn!("{:?}: peer stopped accepting data", self.peer);
                self.state = State::Closing;
                WriteOutcome::Closing
            }
            Ok(n) => {
                self.written += n;
                if self.written == self.write_buf.len() {
                    self.enter_read(Instant::now());
                    WriteOutcome::WriteComplete
                } else {
                    WriteOutcome::WriteMore
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => WriteOutcome::Retry,
            Err(e) if e.kind() == ErrorKind::Interrupted => WriteOutcome::WriteMore,
            Err(e) => {
                log::warn!("{:?}: write failed: {e}", self.peer);
                self.state = State::Closing;
                WriteOutcome::Closing
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::handlers::HandlerError;
    use proptest::prelude::*;
    use std::{cell::RefCell, collections::VecDeque, rc::Rc};

    const TIMEOUT: Duration = Duration::from_secs(30);
    const MAX: usize = 1024;

    /// Hands out scripted chunks, then reports `WouldBlock`.
    #[derive(Default)]
    struct Scripted {
        chunks: VecDeque<Vec<u8>>,
        eof: bool,
        written: Vec<u8>,
        write_limit: Option<usize>,
    }

    impl Scripted {
        fn chunks<I: IntoIterator<Item = Vec<u8>>>(chunks: I) -> Self {
            Self {
                chunks: chunks.into_iter().collect(),
                ..Self::default()
            }
        }
    }

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let Some(mut chunk) = self.chunks.pop_front() else {
                return if self.eof {
                    Ok(0)
                } else {
                    Err(ErrorKind::WouldBlock.into())
                };
            };
            let n = chunk.len().min(buf.len());
            buf[..n].copy_from_slice(&chunk[..n]);
            if n < chunk.len() {
                self.chunks.push_front(chunk.split_off(n));
            }
            Ok(n)
        }
    }

    impl Write for Scripted {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = self.write_limit.map_or(buf.len(), |limit| limit.min(buf.len()));
            self.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn connection(stream: Scripted) -> Connection<Scripted> {
        Connection::new(stream, None, TIMEOUT, MAX)
    }

    fn drain(conn: &mut Connection<Scripted>) -> ReadOutcome {
        loop {
            match conn.read_step() {
                ReadOutcome::ReadMore | ReadOutcome::ReadContent => {}
                outcome => return outcome,
            }
        }
    }

    fn reverse(request: &[u8]) -> Result<Vec<u8>, HandlerError> {
        Ok(request.iter().rev().copied().collect())
    }

    #[test]
    fn reads_header_then_payload() {
        let mut conn = connection(Scripted::chunks([b"0000000002hi".to_vec()]));
        assert_eq!(conn.read_step(), ReadOutcome::ReadContent);
        assert_eq!(conn.read_step(), ReadOutcome::Process);
        assert_eq!(conn.state(), State::Process);
        assert_eq!(conn.request(), b"hi");
    }

    #[test]
    fn partial_reads_ask_for_more() {
        let mut conn = connection(Scripted::chunks([b"00000".to_vec()]));
        assert_eq!(conn.read_step(), ReadOutcome::ReadMore);
        assert_eq!(conn.read_step(), ReadOutcome::Retry);
        assert_eq!(conn.state(), State::Read);
    }

    #[test]
    fn malformed_and_zero_headers_close() {
        for header in [&b"A000000005"[..], b"0000000000", b"0000002000"] {
            let mut conn = connection(Scripted::chunks([header.to_vec()]));
            assert_eq!(conn.read_step(), ReadOutcome::Closing);
            assert_eq!(conn.state(), State::Closing);
        }
    }

    #[test]
    fn peer_close_moves_to_closing() {
        let mut stream = Scripted::chunks([b"0000".to_vec()]);
        stream.eof = true;
        let mut conn = connection(stream);
        assert_eq!(drain(&mut conn), ReadOutcome::Closing);
    }

    #[test]
    fn full_cycle_returns_to_read() {
        let mut conn = connection(Scripted::chunks([b"0000000002hi".to_vec()]));
        assert_eq!(drain(&mut conn), ReadOutcome::Process);
        assert_eq!(conn.process(&mut reverse), State::Write);

        conn.stream_mut().write_limit = Some(5);
        assert_eq!(conn.write_step(), WriteOutcome::WriteMore);
        assert_eq!(conn.write_step(), WriteOutcome::WriteMore);
        assert_eq!(conn.write_step(), WriteOutcome::WriteComplete);
        assert_eq!(conn.state(), State::Read);
        assert_eq!(conn.stream_mut().written, b"0000000002ih");
    }

    #[test]
    fn handler_failures_close() {
        let mut failing = |_: &[u8]| -> Result<Vec<u8>, HandlerError> { Err("boom".into()) };
        let mut empty = |_: &[u8]| -> Result<Vec<u8>, HandlerError> { Ok(Vec::new()) };
        let mut panicking = |_: &[u8]| -> Result<Vec<u8>, HandlerError> { panic!("handler bug") };

        let mut conn = connection(Scripted::chunks([b"0000000001x".to_vec()]));
        drain(&mut conn);
        assert_eq!(conn.process(&mut failing), State::Closing);

        let mut conn = connection(Scripted::chunks([b"0000000001x".to_vec()]));
        drain(&mut conn);
        assert_eq!(conn.process(&mut empty), State::Closing);

        let mut conn = connection(Scripted::chunks([b"0000000001x".to_vec()]));
        drain(&mut conn);
        assert_eq!(conn.process(&mut panicking), State::Closing);
    }

    #[test]
    fn expires_only_while_reading() {
        let mut conn = connection(Scripted::default());
        let later = Instant::now() + TIMEOUT + Duration::from_secs(1);
        assert!(conn.is_expired(later));
        assert!(!conn.is_expired(Instant::now()));

        conn.force_closing();
        assert!(!conn.is_expired(later));
    }

    #[derive(Clone, Default)]
    struct Journal(Rc<RefCell<Vec<&'static str>>>);

    struct Tracked(Journal);

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.0.borrow_mut().push("close");
        }
    }

    impl Deregister<Tracked> for Journal {
        fn deregister(&self, _: &mut Tracked) -> io::Result<()> {
            self.0.borrow_mut().push("deregister");
            Ok(())
        }
    }

    #[test]
    fn close_deregisters_before_closing_the_handle() {
        let journal = Journal::default();
        let conn = Connection::new(Tracked(journal.clone()), None, TIMEOUT, MAX);
        conn.close(&journal);
        assert_eq!(*journal.0.borrow(), ["deregister", "close"]);
    }

    proptest! {
        #[test]
        fn chunking_does_not_change_the_request(
            payload in proptest::collection::vec(any::<u8>(), 1..512),
            cuts in proptest::collection::vec(1usize..32, 1..64),
        ) {
            let framed = frame::encode(&payload).unwrap();

            let mut chunks = Vec::new();
            let mut rest = framed.as_slice();
            for cut in cuts.iter().cycle() {
                if rest.is_empty() {
                    break;
                }
                let (head, tail) = rest.split_at((*cut).min(rest.len()));
                chunks.push(head.to_vec());
                rest = tail;
            }

            let mut whole = connection(Scripted::chunks([framed.clone()]));
            let mut pieces = connection(Scripted::chunks(chunks));
            let mut bytewise = connection(Scripted::chunks(framed.iter().map(|b| vec![*b])));

            prop_assert_eq!(drain(&mut whole), ReadOutcome::Process);
            prop_assert_eq!(drain(&mut pieces), ReadOutcome::Process);
            prop_assert_eq!(drain(&mut bytewise), ReadOutcome::Process);
            prop_assert_eq!(whole.request(), &payload[..]);
            prop_assert_eq!(pieces.request(), whole.request());
            prop_assert_eq!(bytewise.request(), whole.request());
        }
    }
}
