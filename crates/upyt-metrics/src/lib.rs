//! Metrics for the upyt host transport.
//!
//! Every metric the host emits is declared here as a [`Metric`] constant so
//! names, units and label keys live in one place. The `metrics` crate is
//! re-exported for convenience; install any recorder to collect the values.
//!
//! # Example
//!
//! ```rust
//! use upyt_metrics::{metric_defs, LinkLabels};
//!
//! let labels = LinkLabels::new("/dev/ttyACM0");
//! metrics::counter!(metric_defs::LINES_SENT.name, &labels.to_labels()).increment(1);
//! ```

pub use metrics;

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};

/// The kind of metric (counter, gauge, or histogram).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// A monotonically increasing counter.
    Counter,
    /// A gauge that can go up and down.
    Gauge,
    /// A histogram for recording distributions.
    Histogram,
}

impl MetricKind {
    /// Returns the kind as a lowercase string.
    pub const fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
        }
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A metric declaration with its metadata.
///
/// ```rust
/// use upyt_metrics::{Metric, MetricKind};
/// use metrics::Unit;
///
/// const REQUESTS: Metric = Metric::counter("upyt.test.requests")
///     .with_description("Requests made")
///     .with_unit(Unit::Count)
///     .with_labels(&["port"]);
///
/// assert_eq!(REQUESTS.kind, MetricKind::Counter);
/// ```
#[derive(Debug, Clone)]
pub struct Metric {
    /// The metric name (e.g., "upyt.link.lines_sent").
    pub name: &'static str,
    /// The kind of metric.
    pub kind: MetricKind,
    /// Human-readable description.
    pub description: &'static str,
    /// The unit of measurement (optional).
    pub unit: Option<Unit>,
    /// Expected label keys.
    pub labels: &'static [&'static str],
}

impl Metric {
    /// Creates a new counter metric with the given name.
    pub const fn counter(name: &'static str) -> Self {
        Self::new(name, MetricKind::Counter)
    }

    /// Creates a new gauge metric with the given name.
    pub const fn gauge(name: &'static str) -> Self {
        Self::new(name, MetricKind::Gauge)
    }

    /// Creates a new histogram metric with the given name.
    pub const fn histogram(name: &'static str) -> Self {
        Self::new(name, MetricKind::Histogram)
    }

    const fn new(name: &'static str, kind: MetricKind) -> Self {
        Self {
            name,
            kind,
            description: "",
            unit: None,
            labels: &[],
        }
    }

    /// Sets the description for the metric.
    pub const fn with_description(mut self, description: &'static str) -> Self {
        self.description = description;
        self
    }

    /// Sets the unit for the metric.
    pub const fn with_unit(mut self, unit: Unit) -> Self {
        self.unit = Some(unit);
        self
    }

    /// Sets the expected label keys for the metric.
    pub const fn with_labels(mut self, labels: &'static [&'static str]) -> Self {
        self.labels = labels;
        self
    }

    /// Registers this metric's description with the installed recorder.
    pub fn describe(&self) {
        match (self.kind, self.unit) {
            (MetricKind::Counter, Some(unit)) => {
                describe_counter!(self.name, unit, self.description);
            }
            (MetricKind::Counter, None) => {
                describe_counter!(self.name, self.description);
            }
            (MetricKind::Gauge, Some(unit)) => {
                describe_gauge!(self.name, unit, self.description);
            }
            (MetricKind::Gauge, None) => {
                describe_gauge!(self.name, self.description);
            }
            (MetricKind::Histogram, Some(unit)) => {
                describe_histogram!(self.name, unit, self.description);
            }
            (MetricKind::Histogram, None) => {
                describe_histogram!(self.name, self.description);
            }
        }
    }
}

/// All metric definitions for the host transport.
pub mod metric_defs {
    use super::{Metric, Unit};

    // ========================================================================
    // Link Traffic
    // ========================================================================

    /// Standard labels present on every link metric.
    pub const LINK_LABELS: &[&str] = &["port"];

    /// Request lines written to the device.
    pub const LINES_SENT: Metric = Metric::counter("upyt.link.lines_sent")
        .with_description("Request lines written to the device")
        .with_unit(Unit::Count)
        .with_labels(LINK_LABELS);

    /// Lines read from the device (acks, responses and diagnostics).
    pub const LINES_RECEIVED: Metric = Metric::counter("upyt.link.lines_received")
        .with_description("Lines read from the device")
        .with_unit(Unit::Count)
        .with_labels(LINK_LABELS);

    /// Bytes written to the device.
    pub const BYTES_SENT: Metric = Metric::counter("upyt.link.bytes_sent")
        .with_description("Bytes written to the device")
        .with_unit(Unit::Bytes)
        .with_labels(LINK_LABELS);

    // ========================================================================
    // Protocol Events
    // ========================================================================

    /// Acknowledgements received.
    pub const ACKS: Metric = Metric::counter("upyt.protocol.acks")
        .with_description("Acknowledgements received")
        .with_unit(Unit::Count)
        .with_labels(LINK_LABELS);

    /// Response values received.
    pub const RESPONSES: Metric = Metric::counter("upyt.protocol.responses")
        .with_description("Response values received")
        .with_unit(Unit::Count)
        .with_labels(LINK_LABELS);

    /// Remote faults reported by the device.
    pub const REMOTE_FAULTS: Metric = Metric::counter("upyt.protocol.remote_faults")
        .with_description("Remote faults reported by the device")
        .with_unit(Unit::Count)
        .with_labels(LINK_LABELS);

    /// Acknowledgements that did not arrive in time.
    pub const ACK_TIMEOUTS: Metric = Metric::counter("upyt.protocol.ack_timeouts")
        .with_description("Acknowledgements that did not arrive in time")
        .with_unit(Unit::Count)
        .with_labels(LINK_LABELS);

    /// Lines waiting in the transmit queue.
    pub const TRANSMIT_BACKLOG: Metric = Metric::gauge("upyt.protocol.transmit_backlog")
        .with_description("Lines waiting in the transmit queue")
        .with_unit(Unit::Count)
        .with_labels(LINK_LABELS);

    /// Time from writing a line to receiving its acknowledgement.
    pub const ACK_LATENCY: Metric = Metric::histogram("upyt.protocol.ack_latency_us")
        .with_description("Time from writing a line to receiving its acknowledgement")
        .with_unit(Unit::Microseconds)
        .with_labels(LINK_LABELS);

    /// Returns a slice of all defined metrics.
    pub const ALL: &[&Metric] = &[
        &LINES_SENT,
        &LINES_RECEIVED,
        &BYTES_SENT,
        &ACKS,
        &RESPONSES,
        &REMOTE_FAULTS,
        &ACK_TIMEOUTS,
        &TRANSMIT_BACKLOG,
        &ACK_LATENCY,
    ];
}

/// Labels identifying the link a metric belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkLabels {
    /// Port name or simulated link name.
    pub port: String,
}

impl LinkLabels {
    /// Labels for a port.
    pub fn new(port: impl Into<String>) -> Self {
        Self { port: port.into() }
    }

    /// Converts the labels to the metrics crate label format.
    pub fn to_labels(&self) -> Vec<(&'static str, String)> {
        vec![("port", self.port.clone())]
    }
}

/// Describes all metrics. Call once at startup, after installing a recorder.
pub fn describe_metrics() {
    for metric in metric_defs::ALL {
        metric.describe();
    }
}
