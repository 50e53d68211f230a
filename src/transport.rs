#[cfg(feature = "tokio")]
mod asynchronous;

#[cfg(feature = "tokio")]
pub use asynchronous::AsyncTransport;

use crate::{
    error::MetricsError,
    events::Record,
    frame::{self, ACK, DEFAULT_MAX_FRAME_LEN, HEADER_LEN},
};
use std::{
    io::{self, ErrorKind, Read, Write},
    net::{TcpStream, ToSocketAddrs},
    str::FromStr,
    time::Duration,
};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_RETRIES_PER_HOST: usize = 2;

/// Ordered `host:port` entries to try, parsed from `"a:1;b:2"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostList(Vec<String>);

impl HostList {
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromStr for HostList {
    type Err = MetricsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hosts = s
            .split(';')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| match entry.rsplit_once(':') {
                Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                    Ok(entry.to_string())
                }
                _ => Err(MetricsError::InvalidHost(entry.to_string())),
            })
            .collect::<Result<Vec<_>, _>>()?;
        if hosts.is_empty() {
            return Err(MetricsError::InvalidHost(s.to_string()));
        }
        Ok(Self(hosts))
    }
}

pub(crate) fn check_ack(response: &[u8]) -> Result<(), MetricsError> {
    if response == ACK {
        Ok(())
    } else {
        Err(MetricsError::Rejected(
            String::from_utf8_lossy(response).into_owned(),
        ))
    }
}

pub(crate) fn map_read_error(e: io::Error) -> MetricsError {
    if e.kind() == ErrorKind::UnexpectedEof {
        MetricsError::PeerClosed
    } else {
        e.into()
    }
}

/// Blocking sender with per-host retries and failover across hosts.
///
/// Owns at most one live connection, reused across calls after a successful
/// exchange and dropped after any failure. Not meant to be shared between
/// threads; give each sending thread its own transport.
#[derive(Debug)]
pub struct Transport {
    hosts: HostList,
    retries_per_host: usize,
    connect_timeout: Duration,
    io_timeout: Option<Duration>,
    max_frame_len: usize,
    conn: Option<TcpStream>,
}

impl Transport {
    pub const fn new(hosts: HostList) -> Self {
        Self {
            hosts,
            retries_per_host: DEFAULT_RETRIES_PER_HOST,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            io_timeout: None,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            conn: None,
        }
    }

    /// Sets how many attempts each host gets before moving to the next one.
    #[must_use]
    pub fn retries_per_host(mut self, retries: usize) -> Self {
        self.retries_per_host = retries.max(1);
        self
    }

    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Bounds each send and receive once connected; `None` blocks indefinitely.
    #[must_use]
    pub const fn io_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.io_timeout = timeout;
        self
    }

    /// Sets the largest response payload accepted.
    #[must_use]
    pub const fn max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    pub const fn hosts(&self) -> &HostList {
        &self.hosts
    }

    pub const fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Serializes and sends `record`, see [`Transport::send`].
    ///
    /// # Errors
    /// Returns a serialization error or whatever [`Transport::send`] returns.
    pub fn send_record(&mut self, record: &Record) -> Result<(), MetricsError> {
        let payload: Vec<u8> = record.try_into()?;
        self.send(&payload)
    }

    /// Delivers `payload` and requires an `OK` acknowledgement.
    ///
    /// # Example
    /// ```no_run
    /// use metrics_tcp_collector::Transport;
    /// let mut transport = Transport::new("127.0.0.1:9000;127.0.0.1:9001".parse().unwrap());
    /// if let Err(e) = transport.send(b"payload") {
    ///     eprintln!("Failed to deliver: {}", e);
    /// }
    /// ```
    ///
    /// # Errors
    /// [`MetricsError::Frame`] without connecting if `payload` is empty,
    /// [`MetricsError::TransportExhausted`] once every host ran out of attempts.
    pub fn send(&mut self, payload: &[u8]) -> Result<(), MetricsError> {
        self.deliver(payload, check_ack).map(drop)
    }

    /// Delivers `payload` and returns the first response payload received.
    ///
    /// # Errors
    /// [`MetricsError::Frame`] without connecting if `payload` is empty,
    /// [`MetricsError::TransportExhausted`] once every host ran out of attempts.
    pub fn request(&mut self, payload: &[u8]) -> Result<Vec<u8>, MetricsError> {
        self.deliver(payload, |_| Ok(()))
    }

    fn deliver<F>(&mut self, payload: &[u8], accept: F) -> Result<Vec<u8>, MetricsError>
    where
        F: Fn(&[u8]) -> Result<(), MetricsError>,
    {
        let frame = frame::encode(payload)?;
        for index in 0..self.hosts.len() {
            let host = self.hosts.0[index].clone();
            for attempt in 1..=self.retries_per_host {
                let outcome = self
                    .exchange(&host, &frame)
                    .and_then(|response| accept(&response).map(|()| response));
                match outcome {
                    Ok(response) => return Ok(response),
                    Err(e) => {
                        log::warn!(
                            "delivery to {host} failed (attempt {attempt}/{}): {e}",
                            self.retries_per_host
                        );
                        self.conn = None;
                    }
                }
            }
        }
        Err(MetricsError::TransportExhausted {
            hosts: self.hosts.len(),
        })
    }

    fn exchange(&mut self, host: &str, frame: &[u8]) -> Result<Vec<u8>, MetricsError> {
        let mut stream = match self.conn.take() {
            Some(stream) => stream,
            None => self.connect(host)?,
        };

        stream.write_all(frame)?;
        stream.flush()?;

        let mut header = [0u8; HEADER_LEN];
        stream.read_exact(&mut header).map_err(map_read_error)?;
        let len = frame::decode_header_bounded(&header, self.max_frame_len)?;
        let mut response = vec![0u8; len];
        stream.read_exact(&mut response).map_err(map_read_error)?;

        self.conn = Some(stream);
        Ok(response)
    }

    fn connect(&self, host: &str) -> Result<TcpStream, MetricsError> {
        let mut last_err = None;
        for addr in host.to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(self.io_timeout)?;
                    stream.set_write_timeout(self.io_timeout)?;
                    stream.set_nodelay(true)?;
                    log::debug!("connected to {host} ({addr})");
                    return Ok(stream);
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err
            .unwrap_or_else(|| {
                io::Error::new(ErrorKind::NotFound, format!("{host} resolved to no address"))
            })
            .into())
    }
}
