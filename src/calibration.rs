//! Raw ADC readings to physical units.
//!
//! Voltage and current channels use linear fits measured per device and
//! shipped as JSON (`<pico>_Calibration_Voltage.json`,
//! `<pico>_Calibration_Current.json`). Current channels have two fits, one
//! per acquisition range, selected frame by frame from the channel label.
//! Temperature goes through the ADC transfer and the sensor's datasheet curve.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use log::{debug, warn};
use serde::Deserialize;

use crate::errors::CalibrationError;
use crate::frame::{Label, CHANNELS, CHANNEL_COUNT};

/// `physical = raw * slope + intercept`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearModel {
    pub slope: f64,
    pub intercept: f64,
}

impl LinearModel {
    pub const IDENTITY: LinearModel = LinearModel {
        slope: 1.0,
        intercept: 0.0,
    };

    pub fn new(slope: f64, intercept: f64) -> Self {
        Self { slope, intercept }
    }

    #[inline]
    pub fn apply(&self, raw: i32) -> f64 {
        f64::from(raw) * self.slope + self.intercept
    }
}

/// The two current fits of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CurrentModels {
    /// Selected by `I`
    pub high: Option<LinearModel>,
    /// Selected by `i`
    pub low: Option<LinearModel>,
}

impl CurrentModels {
    fn select(&self, label: Label) -> Option<&LinearModel> {
        match label {
            Label::CurrentHigh => self.high.as_ref(),
            Label::CurrentLow => self.low.as_ref(),
            _ => None,
        }
    }
}

/// Temperature sensor behind an N-bit ADC.
///
/// `volts = raw * v_ref / (2^bits - 1)`, `celsius = (volts - offset) / scale`.
/// ADC widths outside 1..=64 bits give NaN.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemperatureSensor {
    pub v_ref: f64,
    pub bits: u32,
    pub offset: f64,
    pub scale: f64,
}

impl TemperatureSensor {
    /// TI LM50 (500 mV at 0 °C, 10 mV/°C) on a 10-bit, 3.3 V ADC.
    pub const LM50: TemperatureSensor = TemperatureSensor {
        v_ref: 3.3,
        bits: 10,
        offset: 0.5,
        scale: 0.01,
    };

    pub fn volts(&self, raw: f64) -> f64 {
        match self.full_scale() {
            Some(full_scale) => raw * self.v_ref / full_scale,
            None => f64::NAN,
        }
    }

    fn full_scale(&self) -> Option<f64> {
        match self.bits {
            0 => None,
            64 => Some(u64::MAX as f64),
            bits => 1u64.checked_shl(bits).map(|levels| (levels - 1) as f64),
        }
    }

    pub fn celsius(&self, raw: f64) -> f64 {
        (self.volts(raw) - self.offset) / self.scale
    }
}

impl Default for TemperatureSensor {
    fn default() -> Self {
        Self::LM50
    }
}

// ----------------------------------------------------------------------------
// Calibration file format
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct FitJson {
    m: Vec<f64>,
    q: Vec<f64>,
}

#[derive(Debug, Deserialize)]
struct VoltageEntryJson {
    #[serde(rename = "calFit")]
    cal_fit: FitJson,
}

#[derive(Debug, Deserialize)]
struct CurrentEntryJson {
    #[serde(rename = "calFit_I")]
    high: Option<FitJson>,
    #[serde(rename = "calFit_i")]
    low: Option<FitJson>,
}

fn fit_to_model(
    fit: &FitJson,
    kind: &'static str,
    channel: &str,
) -> Result<LinearModel, CalibrationError> {
    match (fit.m.first(), fit.q.first()) {
        (Some(&m), Some(&q)) => Ok(LinearModel::new(m, q)),
        _ => Err(CalibrationError::EmptyFit {
            kind,
            channel: channel.to_string(),
        }),
    }
}

/// Parse a voltage calibration file. Every channel must be present.
pub fn parse_voltage_table(json: &str) -> Result<[LinearModel; CHANNEL_COUNT], CalibrationError> {
    let entries: HashMap<String, VoltageEntryJson> = serde_json::from_str(json)?;
    let mut table = [LinearModel::IDENTITY; CHANNEL_COUNT];
    for ch in CHANNELS {
        let entry = entries
            .get(ch.name())
            .ok_or_else(|| CalibrationError::MissingChannel {
                kind: "voltage",
                channel: ch.name().to_string(),
            })?;
        table[ch.index()] = fit_to_model(&entry.cal_fit, "voltage", ch.name())?;
    }
    Ok(table)
}

/// Parse a current calibration file. Channels may be missing; they pass through raw.
pub fn parse_current_table(
    json: &str,
) -> Result<[Option<CurrentModels>; CHANNEL_COUNT], CalibrationError> {
    let entries: HashMap<String, CurrentEntryJson> = serde_json::from_str(json)?;
    let mut table = [None; CHANNEL_COUNT];
    for ch in CHANNELS {
        let Some(entry) = entries.get(ch.name()) else {
            debug!("no current calibration for {}, passing raw values", ch);
            continue;
        };
        let high = entry
            .high
            .as_ref()
            .map(|fit| fit_to_model(fit, "current", ch.name()))
            .transpose()?;
        let low = entry
            .low
            .as_ref()
            .map(|fit| fit_to_model(fit, "current", ch.name()))
            .transpose()?;
        table[ch.index()] = Some(CurrentModels { high, low });
    }
    Ok(table)
}

fn read_file(path: &Path) -> Result<String, CalibrationError> {
    fs::read_to_string(path).map_err(|source| CalibrationError::Io {
        path: path.display().to_string(),
        source,
    })
}

// ----------------------------------------------------------------------------
// Calibration engine
// ----------------------------------------------------------------------------

/// Immutable calibration for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct Calibration {
    voltage: Option<[LinearModel; CHANNEL_COUNT]>,
    current: [Option<CurrentModels>; CHANNEL_COUNT],
    temperature: Option<TemperatureSensor>,
}

impl Calibration {
    pub fn new(
        voltage: [LinearModel; CHANNEL_COUNT],
        current: [Option<CurrentModels>; CHANNEL_COUNT],
        temperature: TemperatureSensor,
    ) -> Self {
        Self {
            voltage: Some(voltage),
            current,
            temperature: Some(temperature),
        }
    }

    /// Every reading is reported as its raw integer value.
    pub fn uncalibrated() -> Self {
        Self {
            voltage: None,
            current: [None; CHANNEL_COUNT],
            temperature: None,
        }
    }

    pub fn from_json(
        voltage_json: &str,
        current_json: &str,
        temperature: TemperatureSensor,
    ) -> Result<Self, CalibrationError> {
        Ok(Self::new(
            parse_voltage_table(voltage_json)?,
            parse_current_table(current_json)?,
            temperature,
        ))
    }

    /// Load both calibration files.
    pub fn load(
        voltage_path: &Path,
        current_path: &Path,
        temperature: TemperatureSensor,
    ) -> Result<Self, CalibrationError> {
        debug!(
            "loading calibration: voltage={}, current={}",
            voltage_path.display(),
            current_path.display()
        );
        let calibration = Self::from_json(
            &read_file(voltage_path)?,
            &read_file(current_path)?,
            temperature,
        )?;
        let missing: Vec<_> = CHANNELS
            .iter()
            .filter(|ch| calibration.current[ch.index()].is_none())
            .map(|ch| ch.name())
            .collect();
        if !missing.is_empty() {
            warn!("current calibration missing for {:?}", missing);
        }
        Ok(calibration)
    }

    pub fn is_calibrated(&self) -> bool {
        self.voltage.is_some()
    }

    pub fn apply_voltage(&self, raw: [i32; CHANNEL_COUNT]) -> [f64; CHANNEL_COUNT] {
        match &self.voltage {
            Some(models) => std::array::from_fn(|i| models[i].apply(raw[i])),
            None => raw.map(f64::from),
        }
    }

    /// Calibrate currents, choosing the fit per channel from its label.
    pub fn apply_current(
        &self,
        raw: [i32; CHANNEL_COUNT],
        labels: [Label; CHANNEL_COUNT],
    ) -> [f64; CHANNEL_COUNT] {
        std::array::from_fn(|i| {
            self.current[i]
                .as_ref()
                .and_then(|models| models.select(labels[i]))
                .map_or(f64::from(raw[i]), |model| model.apply(raw[i]))
        })
    }

    pub fn apply_temperature(&self, raw: [i32; CHANNEL_COUNT]) -> [f64; CHANNEL_COUNT] {
        raw.map(|v| self.temperature_of(f64::from(v)))
    }

    /// Convert a single (possibly averaged) temperature count.
    pub fn temperature_of(&self, raw: f64) -> f64 {
        match &self.temperature {
            Some(sensor) => sensor.celsius(raw),
            None => raw,
        }
    }
}
