use crate::{
    events::{MetricData, MetricEvent, MetricKind, MetricMetadata, MetricOperation, Record},
    frame::ACK,
};

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Turns one request payload into one response payload.
///
/// Runs synchronously inside the reactor, so it must not block. Errors and
/// panics close the connection that carried the request.
pub trait RequestHandler {
    /// # Errors
    /// Any error closes the connection without a response.
    fn handle(&mut self, request: &[u8]) -> Result<Vec<u8>, HandlerError>;
}

impl<F, E> RequestHandler for F
where
    F: FnMut(&[u8]) -> Result<Vec<u8>, E>,
    E: Into<HandlerError>,
{
    fn handle(&mut self, request: &[u8]) -> Result<Vec<u8>, HandlerError> {
        self(request).map_err(Into::into)
    }
}

/// Replays every received [`Record`] into the process-global `metrics` recorder
/// and acknowledges it with `OK`.
///
/// Each metric gets a `host` label naming the agent that shipped it.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsSink;

impl RequestHandler for MetricsSink {
    fn handle(&mut self, request: &[u8]) -> Result<Vec<u8>, HandlerError> {
        let Record { host, events, .. } = Record::try_from(request)?;
        log::trace!("replaying {} events from {host}", events.len());
        for event in events {
            match event {
                MetricEvent::Metadata(metadata) => handle_metadata_event(metadata),
                MetricEvent::Metric(metric) => handle_metric_event(metric, &host),
            }
        }
        Ok(ACK.to_vec())
    }
}

pub fn handle_metric_event(metric: MetricData, host: &str) {
    let mut labels: Vec<(String, String)> = metric.labels.into_iter().collect();
    labels.push(("host".to_string(), host.to_string()));

    match metric.operation {
        MetricOperation::IncrementCounter(value) => {
            metrics::counter!(metric.name, &labels).increment(value);
        }
        MetricOperation::SetCounter(value) => {
            metrics::counter!(metric.name, &labels).absolute(value);
        }
        MetricOperation::IncrementGauge(value) => {
            metrics::gauge!(metric.name, &labels).increment(value);
        }
        MetricOperation::DecrementGauge(value) => {
            metrics::gauge!(metric.name, &labels).decrement(value);
        }
        MetricOperation::SetGauge(value) => {
            metrics::gauge!(metric.name, &labels).set(value);
        }
        MetricOperation::RecordHistogram(value) => {
            metrics::histogram!(metric.name, &labels).record(value);
        }
    }
}

pub fn handle_metadata_event(metadata: MetricMetadata) {
    let unit = metadata
        .unit
        .as_deref()
        .and_then(metrics::Unit::from_string);

    match metadata.kind {
        MetricKind::Counter => {
            if let Some(unit) = unit {
                metrics::describe_counter!(metadata.name, unit, metadata.description);
            } else {
                metrics::describe_counter!(metadata.name, metadata.description);
            }
        }
        MetricKind::Gauge => {
            if let Some(unit) = unit {
                metrics::describe_gauge!(metadata.name, unit, metadata.description);
            } else {
                metrics::describe_gauge!(metadata.name, metadata.description);
            }
        }
        MetricKind::Histogram => {
            if let Some(unit) = unit {
                metrics::describe_histogram!(metadata.name, unit, metadata.description);
            } else {
                metrics::describe_histogram!(metadata.name, metadata.description);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{events::MetricData, recorder::SnapshotRecorder};
    use std::collections::BTreeMap;

    #[test]
    fn sink_replays_with_host_label() {
        let record = Record {
            host: "web-1".into(),
            timestamp: 0,
            events: vec![MetricEvent::Metric(MetricData {
                name: "ticks".into(),
                labels: BTreeMap::new(),
                operation: MetricOperation::IncrementCounter(4),
            })],
        };
        let request: Vec<u8> = (&record).try_into().unwrap();

        // Capture the replay with a local recorder.
        let capture = SnapshotRecorder::new("collector");
        let response = metrics::with_local_recorder(&capture, || MetricsSink.handle(&request));
        assert_eq!(response.unwrap(), ACK);

        let replayed = capture.take_record();
        let MetricEvent::Metric(metric) = &replayed.events[0] else {
            panic!("expected a metric event");
        };
        assert_eq!(metric.name, "ticks");
        assert_eq!(metric.labels.get("host").map(String::as_str), Some("web-1"));
        assert_eq!(metric.operation, MetricOperation::IncrementCounter(4));
    }

    #[test]
    fn sink_rejects_garbage() {
        assert!(MetricsSink.handle(b"definitely not a record").is_err());
    }
}
