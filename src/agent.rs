use crate::{error::MetricsError, events::Record, recorder::SnapshotRecorder, transport::Transport};
use crossbeam_channel::{Receiver, Sender, bounded, select, tick};
use std::{
    thread::{self, JoinHandle},
    time::Duration,
};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(3);
pub const DEFAULT_CAPACITY: usize = 10;

/// Host label used when none is configured: `$HOSTNAME`, else `localhost`.
#[must_use]
pub fn default_host() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|host| !host.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Gathers everything measured since the previous call.
pub trait Collect: Send + 'static {
    /// # Errors
    /// A failed collection is logged and that cycle is skipped.
    fn collect(&mut self) -> Result<Record, MetricsError>;
}

impl Collect for SnapshotRecorder {
    fn collect(&mut self) -> Result<Record, MetricsError> {
        Ok(self.take_record())
    }
}

impl<F> Collect for F
where
    F: FnMut() -> Result<Record, MetricsError> + Send + 'static,
{
    fn collect(&mut self) -> Result<Record, MetricsError> {
        self()
    }
}

/// Delivers one record to wherever records go.
pub trait Ship: Send + 'static {
    /// # Errors
    /// A failed delivery is logged and the record is dropped.
    fn ship(&mut self, record: &Record) -> Result<(), MetricsError>;
}

impl Ship for Transport {
    fn ship(&mut self, record: &Record) -> Result<(), MetricsError> {
        self.send_record(record)
    }
}

impl<F> Ship for F
where
    F: FnMut(&Record) -> Result<(), MetricsError> + Send + 'static,
{
    fn ship(&mut self, record: &Record) -> Result<(), MetricsError> {
        self(record)
    }
}

/// Periodic collect-and-ship pipeline.
///
/// A producer thread collects a [`Record`] every interval and queues it; a
/// consumer thread takes at most one record per interval and ships it. A
/// full queue holds the producer back. A failed shipment drops that record.
///
/// # Example
/// ```no_run
/// use metrics_tcp_collector::{Agent, SnapshotRecorder, Transport};
/// let recorder = SnapshotRecorder::new("web-1").install().unwrap();
/// let transport = Transport::new("127.0.0.1:9000".parse().unwrap());
/// let agent = Agent::new(recorder, transport).start().unwrap();
/// // ...
/// agent.stop();
/// ```
pub struct Agent<C, S> {
    collector: C,
    shipper: S,
    host: String,
    interval: Duration,
    capacity: usize,
}

impl<C: Collect, S: Ship> Agent<C, S> {
    pub fn new(collector: C, shipper: S) -> Self {
        Self {
            collector,
            shipper,
            host: default_host(),
            interval: DEFAULT_INTERVAL,
            capacity: DEFAULT_CAPACITY,
        }
    }

    /// Host label stamped on records collected without one.
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    #[must_use]
    pub const fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets how many records may wait for shipping.
    #[must_use]
    pub const fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Spawns the producer and consumer threads.
    ///
    /// # Errors
    /// Returns an error if a thread cannot be spawned.
    pub fn start(self) -> Result<AgentHandle, MetricsError> {
        let Self {
            collector,
            shipper,
            host,
            interval,
            capacity,
        } = self;
        let (queue_tx, queue_rx) = bounded(capacity.max(1));
        // Never sent on: dropping the sender is the stop signal.
        let (stop_tx, stop_rx) = bounded::<()>(0);

        let producer = {
            let stop = stop_rx.clone();
            thread::Builder::new()
                .name("agent-producer".into())
                .spawn(move || produce(collector, &host, interval, &queue_tx, &stop))?
        };
        let mut handle = AgentHandle {
            queue: queue_rx.clone(),
            stop: Some(stop_tx),
            threads: vec![producer],
        };

        let consumer = thread::Builder::new()
            .name("agent-consumer".into())
            .spawn(move || consume(shipper, interval, &queue_rx, &stop_rx))?;
        handle.threads.push(consumer);
        Ok(handle)
    }
}

fn produce<C: Collect>(
    mut collector: C,
    host: &str,
    interval: Duration,
    queue: &Sender<Record>,
    stop: &Receiver<()>,
) {
    let ticker = tick(interval);
    loop {
        select! {
            recv(stop) -> _ => return,
            recv(ticker) -> _ => {}
        }
        let mut record = match collector.collect() {
            Ok(record) if record.is_empty() => {
                log::trace!("nothing collected this cycle");
                continue;
            }
            Ok(record) => record,
            Err(e) => {
                log::warn!("collection failed: {e}");
                continue;
            }
        };
        if record.host.is_empty() {
            record.host = host.to_string();
        }
        // Blocks while the queue is full, unless the agent stops meanwhile.
        select! {
            send(queue, record) -> sent => if sent.is_err() { return },
            recv(stop) -> _ => return,
        }
    }
}

fn consume<S: Ship>(
    mut shipper: S,
    interval: Duration,
    queue: &Receiver<Record>,
    stop: &Receiver<()>,
) {
    let ticker = tick(interval);
    loop {
        select! {
            recv(stop) -> _ => return,
            recv(ticker) -> _ => {}
        }
        let Ok(record) = queue.try_recv() else {
            continue;
        };
        match shipper.ship(&record) {
            Ok(()) => log::debug!(
                "shipped {} events from {}",
                record.events.len(),
                record.host
            ),
            Err(e) => log::warn!("dropping record from {}: {e}", record.host),
        }
    }
}

/// Running [`Agent`]; stopping or dropping it joins both threads.
#[derive(Debug)]
pub struct AgentHandle {
    queue: Receiver<Record>,
    stop: Option<Sender<()>>,
    threads: Vec<JoinHandle<()>>,
}

impl AgentHandle {
    /// Number of records collected but not shipped yet.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.stop.take().is_none() {
            return;
        }
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                log::error!("agent thread panicked");
            }
        }
        let dropped = self.queue.len();
        if dropped > 0 {
            log::debug!("agent stopped with {dropped} unshipped records");
        }
    }
}

impl Drop for AgentHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{MetricData, MetricEvent, MetricOperation};
    use std::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
            mpsc,
        },
        time::Instant,
    };

    fn record(value: u64) -> Record {
        Record {
            host: String::new(),
            timestamp: value,
            events: vec![MetricEvent::Metric(MetricData {
                name: "ticks".into(),
                labels: Default::default(),
                operation: MetricOperation::IncrementCounter(value),
            })],
        }
    }

    #[test]
    fn ships_collected_records_with_the_host_label() {
        let mut next = 0;
        let collect = move || {
            next += 1;
            Ok::<_, MetricsError>(record(next))
        };
        let (shipped, received) = mpsc::channel();
        let ship = move |record: &Record| {
            shipped.send(record.clone()).ok();
            Ok::<_, MetricsError>(())
        };

        let agent = Agent::new(collect, ship)
            .host("db-2")
            .interval(Duration::from_millis(20))
            .start()
            .unwrap();
        let first = received.recv_timeout(Duration::from_secs(5)).unwrap();
        let second = received.recv_timeout(Duration::from_secs(5)).unwrap();
        agent.stop();

        assert_eq!(first.host, "db-2");
        assert!(first.timestamp < second.timestamp);
    }

    #[test]
    fn full_queue_holds_the_producer_back() {
        let collected = Arc::new(AtomicUsize::new(0));
        let collect = {
            let collected = collected.clone();
            move || {
                let n = collected.fetch_add(1, Ordering::SeqCst) + 1;
                Ok::<_, MetricsError>(record(n as u64))
            }
        };
        // The first shipment hangs until the gate is dropped.
        let (gate, wait) = mpsc::channel::<()>();
        let ship = move |_: &Record| {
            wait.recv().ok();
            Ok::<_, MetricsError>(())
        };

        let agent = Agent::new(collect, ship)
            .interval(Duration::from_millis(10))
            .capacity(1)
            .start()
            .unwrap();
        thread::sleep(Duration::from_millis(300));

        // One record in the stuck shipment, one queued, one blocked in the producer.
        assert_eq!(collected.load(Ordering::SeqCst), 3);
        assert_eq!(agent.pending(), 1);

        drop(gate);
        agent.stop();
    }

    #[test]
    fn empty_cycles_are_not_queued() {
        let (shipped, received) = mpsc::channel::<Record>();
        let agent = Agent::new(
            || Ok::<_, MetricsError>(Record::default()),
            move |record: &Record| {
                shipped.send(record.clone()).ok();
                Ok::<_, MetricsError>(())
            },
        )
        .interval(Duration::from_millis(10))
        .start()
        .unwrap();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(agent.pending(), 0);
        agent.stop();
        assert!(received.try_recv().is_err());
    }

    #[test]
    fn failed_shipments_drop_the_record() {
        let (attempts, seen) = mpsc::channel();
        let agent = Agent::new(
            || Ok::<_, MetricsError>(record(7)),
            move |record: &Record| -> Result<(), MetricsError> {
                attempts.send(record.timestamp).ok();
                Err(MetricsError::PeerClosed)
            },
        )
        .interval(Duration::from_millis(10))
        .capacity(2)
        .start()
        .unwrap();
        for _ in 0..3 {
            assert_eq!(seen.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
        }
        agent.stop();
    }

    #[test]
    fn stop_returns_promptly_with_long_intervals() {
        let agent = Agent::new(
            || Ok::<_, MetricsError>(record(1)),
            |_: &Record| Ok::<_, MetricsError>(()),
        )
        .interval(Duration::from_secs(3600))
        .start()
        .unwrap();
        let started = Instant::now();
        agent.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
