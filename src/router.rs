//! Frame classification and latest-known-value merging.
//!
//! The device multiplexes channel groups: one frame carries seven currents,
//! the next might carry seven voltages, temperatures show up every now and
//! then. The router keeps the last value of every group in an
//! [`AccumulatedRow`] and hands the whole merged row downstream on every
//! accepted frame, so a row routinely mixes fresh currents with voltages from
//! an earlier frame.

use std::time::SystemTime;

use log::{debug, trace};

use crate::calibration::Calibration;
use crate::frame::{Label, RawFrame, CHANNEL_COUNT};
use crate::timestamp::TimestampReconstructor;

/// What a frame carries, decided from its labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleKind {
    Current,
    Voltage,
    Temperature,
    /// Auxiliary timing marker; no payload to merge.
    Marker,
    /// A trash label was present.
    Corrupted,
}

/// How a temperature frame maps onto the seven temperature slots.
///
/// The default keeps one reading per channel even when several channels are
/// tagged `T`, which is what the stored text and tree columns expect. `Mean`
/// collapses the tagged channels into a single averaged reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum TemperatureMode {
    /// Each channel converted on its own, tagged or not.
    #[default]
    PerChannel,
    /// Mean of the `T`-tagged channels (time slot excluded), reported on
    /// every slot. Falls back to per-channel when none is tagged.
    Mean,
}

/// Classify a frame. Slot 0 takes part, and the checks run in priority order:
/// trash, temperature, voltage, current. Anything else is a marker frame.
pub fn classify(frame: &RawFrame) -> SampleKind {
    if frame.has_label(|l| matches!(l, Label::Trash(_))) {
        SampleKind::Corrupted
    } else if frame.has_label(|l| l == Label::Temperature) {
        SampleKind::Temperature
    } else if frame.has_label(|l| l == Label::Voltage) {
        SampleKind::Voltage
    } else if frame.has_label(Label::is_current) {
        SampleKind::Current
    } else {
        SampleKind::Marker
    }
}

/// Latest known values of every channel group.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccumulatedRow {
    pub timestamp: i64,
    pub current: [f64; CHANNEL_COUNT],
    pub voltage: [f64; CHANNEL_COUNT],
    pub temperature: [f64; CHANNEL_COUNT],
    pub time_flag: Label,
    pub labels: [Label; CHANNEL_COUNT],
}

impl Default for AccumulatedRow {
    fn default() -> Self {
        Self {
            timestamp: 0,
            current: [0.0; CHANNEL_COUNT],
            voltage: [0.0; CHANNEL_COUNT],
            temperature: [0.0; CHANNEL_COUNT],
            time_flag: Label::TimeUpper,
            labels: [Label::Other(b'0'); CHANNEL_COUNT],
        }
    }
}

/// A merged row offered to the sinks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoutedSample {
    /// Index of the frame among all marker-valid frames of the run.
    pub event: u64,
    pub kind: SampleKind,
    /// Extended timestamp in counter ticks.
    pub timestamp: i64,
    pub seconds: f64,
    pub wall_clock: SystemTime,
    pub row: AccumulatedRow,
    /// A current frame and a voltage frame have both been merged already.
    pub complete: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KindCounts {
    pub current: u64,
    pub voltage: u64,
    pub temperature: u64,
    pub marker: u64,
    pub corrupted: u64,
}

impl KindCounts {
    fn bump(&mut self, kind: SampleKind) {
        match kind {
            SampleKind::Current => self.current += 1,
            SampleKind::Voltage => self.voltage += 1,
            SampleKind::Temperature => self.temperature += 1,
            SampleKind::Marker => self.marker += 1,
            SampleKind::Corrupted => self.corrupted += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.current + self.voltage + self.temperature + self.marker + self.corrupted
    }
}

/// Per-run routing context: timestamps, calibration and the merged row.
#[derive(Debug)]
pub struct Router {
    calibration: Calibration,
    temperature_mode: TemperatureMode,
    timestamps: TimestampReconstructor,
    run_start: SystemTime,
    row: AccumulatedRow,
    counts: KindCounts,
}

impl Router {
    pub fn new(
        calibration: Calibration,
        temperature_mode: TemperatureMode,
        timestamps: TimestampReconstructor,
        run_start: SystemTime,
    ) -> Self {
        Self {
            calibration,
            temperature_mode,
            timestamps,
            run_start,
            row: AccumulatedRow::default(),
            counts: KindCounts::default(),
        }
    }

    /// Route one decoded frame.
    ///
    /// The timestamp is reconstructed for every frame, corrupted ones
    /// included, so flag changes are never skipped. Corrupted frames stop
    /// there and return `None`; everything else returns the merged row.
    pub fn route(&mut self, frame: &RawFrame) -> Option<RoutedSample> {
        let event = self.counts.total();
        let timestamp = self.timestamps.reconstruct(frame.counter, frame.time_flag);
        let kind = classify(frame);
        self.counts.bump(kind);

        trace!(
            "event={} flag={} counter={} labels={:?} values={:?}",
            event,
            frame.time_flag,
            frame.counter,
            frame.labels.map(Label::as_char),
            frame.values
        );

        match kind {
            SampleKind::Corrupted => {
                debug!("event={}: trash label, frame dropped", event);
                return None;
            }
            SampleKind::Temperature => {
                self.row.temperature = self.temperatures(frame);
            }
            SampleKind::Voltage => {
                self.row.voltage = self.calibration.apply_voltage(frame.values);
            }
            SampleKind::Current => {
                self.row.current = self.calibration.apply_current(frame.values, frame.labels);
            }
            SampleKind::Marker => {}
        }

        if kind != SampleKind::Marker {
            self.row.timestamp = timestamp;
            self.row.time_flag = frame.time_flag;
            self.row.labels = frame.labels;
        }

        debug!(
            "event={} kind={:?} ts={} current={:?} voltage={:?} temperature={:?}",
            event,
            kind,
            timestamp,
            self.row.current,
            self.row.voltage,
            self.row.temperature
        );

        Some(RoutedSample {
            event,
            kind,
            timestamp,
            seconds: self.timestamps.seconds(timestamp),
            wall_clock: self.timestamps.wall_clock(timestamp, self.run_start),
            row: self.row,
            complete: self.counts.current > 0 && self.counts.voltage > 0,
        })
    }

    fn temperatures(&self, frame: &RawFrame) -> [f64; CHANNEL_COUNT] {
        if self.temperature_mode == TemperatureMode::Mean {
            let tagged: Vec<i32> = frame
                .labels
                .iter()
                .zip(frame.values)
                .filter(|(label, _)| **label == Label::Temperature)
                .map(|(_, value)| value)
                .collect();
            if !tagged.is_empty() {
                let mean =
                    tagged.iter().map(|&v| f64::from(v)).sum::<f64>() / tagged.len() as f64;
                return [self.calibration.temperature_of(mean); CHANNEL_COUNT];
            }
        }
        self.calibration.apply_temperature(frame.values)
    }

    pub fn row(&self) -> &AccumulatedRow {
        &self.row
    }

    pub fn counts(&self) -> KindCounts {
        self.counts
    }

    pub fn wrap_count(&self) -> u64 {
        self.timestamps.wrap_count()
    }
}
