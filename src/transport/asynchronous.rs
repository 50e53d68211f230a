use super::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_RETRIES_PER_HOST, HostList, check_ack, map_read_error,
};
use crate::{
    error::MetricsError,
    events::Record,
    frame::{self, DEFAULT_MAX_FRAME_LEN, HEADER_LEN},
};
use std::{
    future::Future,
    io::{self, ErrorKind},
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time,
};

async fn bounded<T, F>(limit: Option<Duration>, fut: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match limit {
        Some(limit) => time::timeout(limit, fut)
            .await
            .map_err(|_| io::Error::from(ErrorKind::TimedOut))?,
        None => fut.await,
    }
}

/// Tokio flavour of [`Transport`](super::Transport) with the same retry and
/// failover rules.
#[derive(Debug)]
pub struct AsyncTransport {
    hosts: HostList,
    retries_per_host: usize,
    connect_timeout: Duration,
    io_timeout: Option<Duration>,
    max_frame_len: usize,
    conn: Option<TcpStream>,
}

impl AsyncTransport {
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

    #[must_use]
    pub const fn io_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.io_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    pub const fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// # Errors
    /// Returns a serialization error or whatever [`AsyncTransport::send`] returns.
    pub async fn send_record(&mut self, record: &Record) -> Result<(), MetricsError> {
        let payload: Vec<u8> = record.try_into()?;
        self.send(&payload).await
    }

    /// # Errors
    /// [`MetricsError::Frame`] without connecting if `payload` is empty,
    /// [`MetricsError::TransportExhausted`] once every host ran out of attempts.
    pub async fn send(&mut self, payload: &[u8]) -> Result<(), MetricsError> {
        self.deliver(payload, true).await.map(drop)
    }

    /// # Errors
    /// [`MetricsError::Frame`] without connecting if `payload` is empty,
    /// [`MetricsError::TransportExhausted`] once every host ran out of attempts.
    pub async fn request(&mut self, payload: &[u8]) -> Result<Vec<u8>, MetricsError> {
        self.deliver(payload, false).await
    }

    async fn deliver(&mut self, payload: &[u8], want_ack: bool) -> Result<Vec<u8>, MetricsError> {
        let frame = frame::encode(payload)?;
        for index in 0..self.hosts.len() {
            let host = self.hosts.0[index].clone();
            for attempt in 1..=self.retries_per_host {
                let outcome = match self.exchange(&host, &frame).await {
                    Ok(response) if want_ack => check_ack(&response).map(|()| response),
                    other => other,
                };
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

    async fn exchange(&mut self, host: &str, frame: &[u8]) -> Result<Vec<u8>, MetricsError> {
        let mut stream = match self.conn.take() {
            Some(stream) => stream,
            None => self.connect(host).await?,
        };

        bounded(self.io_timeout, stream.write_all(frame)).await?;

        let mut header = [0u8; HEADER_LEN];
        bounded(self.io_timeout, stream.read_exact(&mut header))
            .await
            .map_err(map_read_error)?;
        let len = frame::decode_header_bounded(&header, self.max_frame_len)?;
        let mut response = vec![0u8; len];
        bounded(self.io_timeout, stream.read_exact(&mut response))
            .await
            .map_err(map_read_error)?;

        self.conn = Some(stream);
        Ok(response)
    }

    async fn connect(&self, host: &str) -> Result<TcpStream, MetricsError> {
        let stream = bounded(Some(self.connect_timeout), TcpStream::connect(host)).await?;
        stream.set_nodelay(true)?;
        log::debug!("connected to {host}");
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn ack_once(live: TcpListener) -> Vec<u8> {
        let (mut stream, _) = live.accept().await.unwrap();
        let mut header = [0u8; HEADER_LEN];
        stream.read_exact(&mut header).await.unwrap();
        let mut payload = vec![0u8; frame::decode_header(&header).unwrap()];
        stream.read_exact(&mut payload).await.unwrap();
        stream
            .write_all(&frame::encode(frame::ACK).unwrap())
            .await
            .unwrap();
        payload
    }

    #[tokio::test]
    async fn fails_over_after_every_retry_on_the_dead_host() {
        let dead = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let dead_addr = dead.local_addr().unwrap();
        drop(dead);

        let live = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live_addr = live.local_addr().unwrap();
        let server = tokio::spawn(ack_once(live));

        let hosts = format!("{dead_addr};{live_addr}").parse().unwrap();
        let mut transport = AsyncTransport::new(hosts);
        assert_eq!(transport.retries_per_host, DEFAULT_RETRIES_PER_HOST);
        transport.send(b"load").await.unwrap();
        assert_eq!(server.await.unwrap(), b"load");
    }

    #[tokio::test]
    async fn empty_payload_fails_before_connecting() {
        let mut transport = AsyncTransport::new("127.0.0.1:1".parse().unwrap());
        let err = transport.send(b"").await.unwrap_err();
        assert!(matches!(
            err,
            MetricsError::Frame(frame::FrameError::InvalidLength)
        ));
    }

    #[tokio::test]
    async fn fails_over_to_the_next_host() {
        let dead = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let dead_addr = dead.local_addr().unwrap();
        drop(dead);

        let live = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live_addr = live.local_addr().unwrap();
        let server = tokio::spawn(ack_once(live));

        let hosts = format!("{dead_addr};{live_addr}").parse().unwrap();
        let mut transport = AsyncTransport::new(hosts).retries_per_host(1);
        transport.send(b"load").await.unwrap();
        assert!(transport.is_connected());
        assert_eq!(server.await.unwrap(), b"load");
    }

    #[tokio::test]
    async fn exhausts_when_no_host_answers() {
        let dead = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let dead_addr = dead.local_addr().unwrap();
        drop(dead);

        let mut transport = AsyncTransport::new(dead_addr.to_string().parse().unwrap());
        let err = transport.request(b"x").await.unwrap_err();
        assert!(matches!(err, MetricsError::TransportExhausted { hosts: 1 }));
        assert!(!transport.is_connected());
    }
}
