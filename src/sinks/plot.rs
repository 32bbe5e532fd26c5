//! Rolling window of points for a live plot. Rendering happens elsewhere; the
//! window is shared behind a mutex and read with [`PlotWindow::snapshot`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use super::Sink;
use crate::errors::SinkError;
use crate::frame::{Channel, CHANNELS};
use crate::router::{RoutedSample, SampleKind};

pub const DEFAULT_PLOT_EVERY: u64 = 65;
pub const DEFAULT_PLOT_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum PlotQuantity {
    #[default]
    Voltage,
    Current,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlotPoint {
    pub seconds: f64,
    /// One value per selected channel, in selection order.
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlotWindow {
    quantity: PlotQuantity,
    channels: Vec<Channel>,
    capacity: usize,
    points: VecDeque<PlotPoint>,
}

impl PlotWindow {
    /// An empty channel selection means every channel.
    pub fn new(quantity: PlotQuantity, channels: Vec<Channel>, capacity: usize) -> Self {
        let channels = if channels.is_empty() {
            CHANNELS.to_vec()
        } else {
            channels
        };
        let capacity = capacity.max(1);
        Self {
            quantity,
            channels,
            capacity,
            points: VecDeque::with_capacity(capacity),
        }
    }

    pub fn quantity(&self) -> PlotQuantity {
        self.quantity
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn push(&mut self, sample: &RoutedSample) {
        let source = match self.quantity {
            PlotQuantity::Voltage => &sample.row.voltage,
            PlotQuantity::Current => &sample.row.current,
        };
        let values = self.channels.iter().map(|ch| source[ch.index()]).collect();
        if self.points.len() == self.capacity {
            self.points.pop_front();
        }
        self.points.push_back(PlotPoint {
            seconds: sample.seconds,
            values,
        });
    }

    pub fn snapshot(&self) -> Vec<PlotPoint> {
        self.points.iter().cloned().collect()
    }
}

/// Feeds a shared [`PlotWindow`] with one in `every` non-marker samples.
pub struct PlotBuffer {
    window: Arc<Mutex<PlotWindow>>,
    every: u64,
}

impl PlotBuffer {
    pub fn new(window: PlotWindow, every: u64) -> Self {
        Self {
            window: Arc::new(Mutex::new(window)),
            every: every.max(1),
        }
    }

    /// Handle for the renderer.
    pub fn window(&self) -> Arc<Mutex<PlotWindow>> {
        Arc::clone(&self.window)
    }

    fn lock(&self) -> MutexGuard<'_, PlotWindow> {
        // A reader that panicked mid-snapshot leaves the window intact.
        self.window.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Sink for PlotBuffer {
    fn name(&self) -> &str {
        "plot"
    }

    fn write(&mut self, sample: &RoutedSample) -> Result<bool, SinkError> {
        if sample.kind == SampleKind::Marker || sample.event % self.every != 0 {
            return Ok(false);
        }
        self.lock().push(sample);
        Ok(true)
    }
}
