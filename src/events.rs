use crate::error::MetricsError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The kind of metric being recorded.
///
/// Used to distinguish between counters, gauges, and histograms.
///
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

/// Metadata describing a metric.
///
/// Includes the metric name, kind, description, and optional unit.
///
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricMetadata {
    pub name: String,
    pub kind: MetricKind,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

/// Data for a single metric event.
///
/// Contains the metric name, labels, and the operation performed.
///
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricData {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    #[serde(flatten)]
    pub operation: MetricOperation,
}

/// Different operations that can be performed on a metric.
///
/// Includes increment/set for counters and gauges, and record for histograms.
///
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "operation", content = "value")]
#[serde(rename_all = "snake_case")]
pub enum MetricOperation {
    IncrementCounter(u64),
    SetCounter(u64),
    IncrementGauge(f64),
    DecrementGauge(f64),
    SetGauge(f64),
    RecordHistogram(f64),
}

/// One recorded event, either metric metadata or metric data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetricEvent {
    /// Metadata describing the metric (name, kind, description, unit).
    Metadata(MetricMetadata),
    /// Data for a single metric event (name, labels, operation).
    Metric(MetricData),
}

/// Everything an agent observed during one collection cycle.
///
/// This is the payload an agent frames and ships to the collector.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Record {
    /// Host the agent runs on, attached to every replayed metric as a `host` label.
    pub host: String,
    /// Unix timestamp (seconds) at which the cycle was drained.
    pub timestamp: u64,
    pub events: Vec<MetricEvent>,
}

impl Record {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl TryFrom<&[u8]> for Record {
    type Error = MetricsError;

    fn try_from(buffer: &[u8]) -> Result<Self, Self::Error> {
        rmp_serde::from_slice(buffer).map_err(MetricsError::from)
    }
}

impl TryFrom<&Record> for Vec<u8> {
    type Error = MetricsError;

    // Named encoding, the flattened and tagged enums need map form.
    fn try_from(record: &Record) -> Result<Self, Self::Error> {
        rmp_serde::to_vec_named(record).map_err(MetricsError::from)
    }
}
