use std::io;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, error, info, warn};

use super::Sink;
use crate::errors::SinkError;
use crate::router::RoutedSample;

/// Samples queued per sink before the decode loop is made to wait.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// What a sink did over the run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SinkReport {
    pub name: String,
    pub received: u64,
    pub written: u64,
    pub errors: u64,
    pub panicked: bool,
}

/// A sink running on its own thread behind a bounded queue.
///
/// Samples are handled in submission order. `submit` blocks while the queue
/// is full. Write failures are logged and counted on the worker; they never
/// reach the producer.
pub struct SinkWorker {
    name: String,
    tx: Option<Sender<RoutedSample>>,
    handle: Option<JoinHandle<SinkReport>>,
}

impl SinkWorker {
    pub fn spawn(sink: Box<dyn Sink>, capacity: usize) -> io::Result<Self> {
        let name = sink.name().to_string();
        let (tx, rx) = bounded(capacity.max(1));
        let handle = thread::Builder::new()
            .name(format!("sink-{name}"))
            .spawn(move || drain(sink, rx))?;
        debug!("sink worker started: name={}, capacity={}", name, capacity);
        Ok(Self {
            name,
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn submit(&self, sample: RoutedSample) -> Result<(), SinkError> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| SinkError::Closed(self.name.clone()))?;
        tx.send(sample)
            .map_err(|_| SinkError::Closed(self.name.clone()))
    }

    /// Stop accepting samples, let the worker drain its queue and flush, and
    /// wait for it.
    pub fn close(mut self) -> SinkReport {
        self.shutdown()
    }

    fn shutdown(&mut self) -> SinkReport {
        drop(self.tx.take());
        let Some(handle) = self.handle.take() else {
            return SinkReport {
                name: self.name.clone(),
                ..SinkReport::default()
            };
        };
        match handle.join() {
            Ok(report) => {
                info!(
                    "sink closed: name={}, received={}, written={}, errors={}",
                    report.name, report.received, report.written, report.errors
                );
                report
            }
            Err(_) => {
                error!("sink worker panicked: name={}", self.name);
                SinkReport {
                    name: self.name.clone(),
                    panicked: true,
                    ..SinkReport::default()
                }
            }
        }
    }
}

impl Drop for SinkWorker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.shutdown();
        }
    }
}

fn drain(mut sink: Box<dyn Sink>, rx: Receiver<RoutedSample>) -> SinkReport {
    let mut report = SinkReport {
        name: sink.name().to_string(),
        ..SinkReport::default()
    };

    for sample in rx.iter() {
        report.received += 1;
        match sink.write(&sample) {
            Ok(true) => report.written += 1,
            Ok(false) => {}
            Err(e) => {
                report.errors += 1;
                if report.errors == 1 {
                    error!("sink {} failed on event {}: {}", report.name, sample.event, e);
                } else {
                    debug!("sink {} failed on event {}: {}", report.name, sample.event, e);
                }
            }
        }
    }

    if let Err(e) = sink.flush() {
        report.errors += 1;
        warn!("flushing sink {} failed: {}", report.name, e);
    }
    report
}
