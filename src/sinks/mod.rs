//! Output sinks for routed samples.
//!
//! Each enabled sink runs on its own worker thread ([`SinkWorker`]) behind a
//! bounded queue. File sinks (text, tree) are gated by a [`WritePolicy`] that
//! decides once per sample whether it goes to disk; stream sinks (InfluxDB,
//! plot buffer) see every routed sample and decimate on their own.

use log::{error, info};

use crate::errors::{AcquisitionError, SinkError};
use crate::router::{RoutedSample, SampleKind};

pub mod influx;
pub mod plot;
pub mod text;
pub mod tree;
mod worker;

pub use influx::{InfluxConfig, InfluxSink, Precision};
pub use plot::{PlotBuffer, PlotQuantity, PlotWindow};
pub use text::TextSink;
pub use tree::{TreeReader, TreeSink};
pub use worker::{SinkReport, SinkWorker, DEFAULT_QUEUE_CAPACITY};

/// Destination for routed samples. Runs on a sink worker thread.
pub trait Sink: Send {
    fn name(&self) -> &str;

    /// Handle one sample. `Ok(false)` means the sink chose not to record it.
    fn write(&mut self, sample: &RoutedSample) -> Result<bool, SinkError>;

    fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Decides whether a routed sample is written to the file sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WritePolicy {
    /// Keep one event out of `slow_factor`.
    pub slow_factor: u64,
    /// Marker frames are not written (and are counted as skipped).
    pub skip_markers: bool,
    /// Hold rows back until both a current and a voltage frame were merged.
    pub require_complete: bool,
}

impl Default for WritePolicy {
    fn default() -> Self {
        Self {
            slow_factor: 1,
            skip_markers: true,
            require_complete: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteDecision {
    Write,
    Decimated,
    Marker,
    Incomplete,
}

impl WritePolicy {
    pub fn decide(&self, sample: &RoutedSample) -> WriteDecision {
        if sample.event % self.slow_factor.max(1) != 0 {
            WriteDecision::Decimated
        } else if self.skip_markers && sample.kind == SampleKind::Marker {
            WriteDecision::Marker
        } else if self.require_complete && !sample.complete {
            WriteDecision::Incomplete
        } else {
            WriteDecision::Write
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchCounts {
    /// Rows handed to the file sinks.
    pub written: u64,
    /// Marker frames kept out of the file sinks.
    pub skipped: u64,
    /// Submissions that failed because a worker had already stopped.
    pub submit_errors: u64,
}

/// Every sink worker of a run.
pub struct SinkSet {
    policy: WritePolicy,
    files: Vec<SinkWorker>,
    streams: Vec<SinkWorker>,
    counts: DispatchCounts,
    first_written: Option<u64>,
}

impl SinkSet {
    pub fn new(policy: WritePolicy) -> Self {
        Self {
            policy,
            files: Vec::new(),
            streams: Vec::new(),
            counts: DispatchCounts::default(),
            first_written: None,
        }
    }

    /// Add a sink behind the write policy.
    pub fn add_file(&mut self, worker: SinkWorker) {
        self.files.push(worker);
    }

    /// Add a sink that receives every routed sample.
    pub fn add_stream(&mut self, worker: SinkWorker) {
        self.streams.push(worker);
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.streams.is_empty()
    }

    /// Offer a sample to every sink. Blocks while a queue is full; never fails
    /// the caller.
    pub fn offer(&mut self, sample: &RoutedSample) {
        if !self.files.is_empty() {
            match self.policy.decide(sample) {
                WriteDecision::Write => {
                    self.counts.written += 1;
                    if self.first_written.is_none() {
                        info!("first event written to file: event={}", sample.event);
                        self.first_written = Some(sample.event);
                    }
                    for worker in &self.files {
                        submit(worker, sample, &mut self.counts);
                    }
                }
                WriteDecision::Marker => self.counts.skipped += 1,
                WriteDecision::Decimated | WriteDecision::Incomplete => {}
            }
        }
        for worker in &self.streams {
            submit(worker, sample, &mut self.counts);
        }
    }

    pub fn counts(&self) -> DispatchCounts {
        self.counts
    }

    /// Flush and stop every worker, in registration order.
    pub fn close(self) -> Vec<SinkReport> {
        self.files
            .into_iter()
            .chain(self.streams)
            .map(SinkWorker::close)
            .collect()
    }
}

fn submit(worker: &SinkWorker, sample: &RoutedSample, counts: &mut DispatchCounts) {
    if let Err(e) = worker.submit(*sample) {
        counts.submit_errors += 1;
        let e = AcquisitionError::from(e);
        error!("dropping sample {} for {}: {}", sample.event, worker.name(), e);
    }
}
