// src/metrics.rs

//! Ordered lifecycle events for one deploy invocation
//!
//! The ledger is append-only. Events render as `NAME` or `NAME:STATUS`
//! (`DELTAINSTALL:DISABLED`, `COMPARE:Failed`), which is the form sinks and
//! tests compare against.

use chrono::{DateTime, Utc};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::info;

/// One recorded event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricEvent {
    pub name: String,
    pub status: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub duration: Option<Duration>,
}

impl MetricEvent {
    pub fn new(name: impl Into<String>, status: Option<String>) -> Self {
        Self {
            name: name.into(),
            status,
            timestamp: Utc::now(),
            duration: None,
        }
    }
}

impl fmt::Display for MetricEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.status {
            Some(status) => write!(f, "{}:{}", self.name, status),
            None => write!(f, "{}", self.name),
        }
    }
}

/// A timed event that has started but not yet been recorded
#[derive(Debug)]
#[must_use = "a started metric is only recorded by MetricsLedger::finish"]
pub struct StartedMetric {
    name: String,
    started: Instant,
}

/// Append-only event list
#[derive(Debug, Default, Clone)]
pub struct MetricsLedger {
    events: Vec<MetricEvent>,
}

impl MetricsLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an event with no status
    pub fn record(&mut self, name: impl Into<String>) {
        self.events.push(MetricEvent::new(name, None));
    }

    /// Record an event with a status
    pub fn record_status(&mut self, name: impl Into<String>, status: impl Into<String>) {
        self.events.push(MetricEvent::new(name, Some(status.into())));
    }

    /// Start timing an event; nothing is recorded until [`Self::finish`]
    pub fn start(&self, name: impl Into<String>) -> StartedMetric {
        StartedMetric {
            name: name.into(),
            started: Instant::now(),
        }
    }

    /// Record a timed event with its elapsed duration
    pub fn finish(&mut self, started: StartedMetric) {
        let mut event = MetricEvent::new(started.name, None);
        event.duration = Some(started.started.elapsed());
        self.events.push(event);
    }

    pub fn events(&self) -> &[MetricEvent] {
        &self.events
    }

    /// Rendered event names in order
    pub fn names(&self) -> Vec<String> {
        self.events.iter().map(ToString::to_string).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Hand every event to a sink, in order
    pub fn emit_to(&self, sink: &dyn MetricsSink) {
        sink.emit(&self.events);
    }
}

/// Receiver for the finished event list
pub trait MetricsSink {
    fn emit(&self, events: &[MetricEvent]);
}

/// Sink that writes each event through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl MetricsSink for LogSink {
    fn emit(&self, events: &[MetricEvent]) {
        for event in events {
            match event.duration {
                Some(duration) => info!(
                    "metric {} ({} ms)",
                    event,
                    duration.as_millis()
                ),
                None => info!("metric {}", event),
            }
        }
    }
}
