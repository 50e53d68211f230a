use crate::{
    error::MetricsError,
    events::{MetricData, MetricEvent, MetricKind, MetricMetadata, MetricOperation, Record},
};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
    time::{SystemTime, UNIX_EPOCH},
};

type Buffer = Arc<Mutex<Vec<MetricEvent>>>;

fn lock(buffer: &Buffer) -> MutexGuard<'_, Vec<MetricEvent>> {
    buffer
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[derive(Debug)]
struct Handle {
    key: metrics::Key,
    buffer: Buffer,
}

impl Handle {
    const fn new(key: metrics::Key, buffer: Buffer) -> Self {
        Self { key, buffer }
    }

    fn push_metric(&self, op: MetricOperation) {
        let metric = MetricData {
            name: self.key.name().to_string(),
            labels: self
                .key
                .labels()
                .map(|label| (label.key().to_owned(), label.value().to_owned()))
                .collect::<BTreeMap<_, _>>(),
            operation: op,
        };
        lock(&self.buffer).push(MetricEvent::Metric(metric));
    }
}

impl metrics::CounterFn for Handle {
    fn increment(&self, value: u64) {
        self.push_metric(MetricOperation::IncrementCounter(value));
    }

    fn absolute(&self, value: u64) {
        self.push_metric(MetricOperation::SetCounter(value));
    }
}

impl metrics::GaugeFn for Handle {
    fn increment(&self, value: f64) {
        self.push_metric(MetricOperation::IncrementGauge(value));
    }

    fn decrement(&self, value: f64) {
        self.push_metric(MetricOperation::DecrementGauge(value));
    }

    fn set(&self, value: f64) {
        self.push_metric(MetricOperation::SetGauge(value));
    }
}

impl metrics::HistogramFn for Handle {
    fn record(&self, value: f64) {
        self.push_metric(MetricOperation::RecordHistogram(value));
    }
}

/// A recorder that buffers every metric operation until the agent ships it.
///
/// Clones share the same buffer: install one clone as the global recorder and
/// keep another to drain with [`SnapshotRecorder::take_record`].
#[derive(Debug, Clone)]
pub struct SnapshotRecorder {
    host: String,
    buffer: Buffer,
}

impl SnapshotRecorder {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            buffer: Arc::default(),
        }
    }

    /// Installs a clone of this recorder as the global `metrics` recorder and
    /// returns the original for draining.
    ///
    /// # Example
    /// ```rust
    /// use metrics_tcp_collector::SnapshotRecorder;
    /// let recorder = SnapshotRecorder::new("web-1").install().unwrap();
    /// metrics::counter!("requests").increment(1);
    /// assert_eq!(recorder.take_record().events.len(), 1);
    /// ```
    ///
    /// # Errors
    /// Returns an error if a global recorder is already installed.
    pub fn install(self) -> Result<Self, MetricsError> {
        metrics::set_global_recorder(self.clone())?;
        Ok(self)
    }

    /// Drains everything recorded since the previous call into a [`Record`].
    #[must_use]
    pub fn take_record(&self) -> Record {
        let events = std::mem::take(&mut *lock(&self.buffer));
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_secs());
        Record {
            host: self.host.clone(),
            timestamp,
            events,
        }
    }

    fn register_metric(
        &self,
        key_name: &metrics::KeyName,
        kind: MetricKind,
        unit: Option<metrics::Unit>,
        description: &metrics::SharedString,
    ) {
        let metadata = MetricMetadata {
            name: key_name.as_str().to_string(),
            kind,
            unit: unit.map(|u| u.as_str().to_string()),
            description: description.to_string(),
        };
        lock(&self.buffer).push(MetricEvent::Metadata(metadata));
    }
}

impl metrics::Recorder for SnapshotRecorder {
    fn describe_counter(
        &self,
        key_name: metrics::KeyName,
        unit: Option<metrics::Unit>,
        description: metrics::SharedString,
    ) {
        self.register_metric(&key_name, MetricKind::Counter, unit, &description);
    }

    fn describe_gauge(
        &self,
        key_name: metrics::KeyName,
        unit: Option<metrics::Unit>,
        description: metrics::SharedString,
    ) {
        self.register_metric(&key_name, MetricKind::Gauge, unit, &description);
    }

    fn describe_histogram(
        &self,
        key_name: metrics::KeyName,
        unit: Option<metrics::Unit>,
        description: metrics::SharedString,
    ) {
        self.register_metric(&key_name, MetricKind::Histogram, unit, &description);
    }

    fn register_counter(
        &self,
        key: &metrics::Key,
        _meta: &metrics::Metadata<'_>,
    ) -> metrics::Counter {
        metrics::Counter::from_arc(Arc::new(Handle::new(key.clone(), self.buffer.clone())))
    }

    fn register_gauge(&self, key: &metrics::Key, _meta: &metrics::Metadata<'_>) -> metrics::Gauge {
        metrics::Gauge::from_arc(Arc::new(Handle::new(key.clone(), self.buffer.clone())))
    }

    fn register_histogram(
        &self,
        key: &metrics::Key,
        _meta: &metrics::Metadata<'_>,
    ) -> metrics::Histogram {
        metrics::Histogram::from_arc(Arc::new(Handle::new(key.clone(), self.buffer.clone())))
    }
}
