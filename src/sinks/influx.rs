//! InfluxDB v2 writer.
//!
//! Each written sample becomes three line-protocol points, one per channel
//! group, POSTed to `/api/v2/write`. The sink owns a single-threaded tokio
//! runtime and blocks on every request, so it stays on its worker thread.

use std::fmt::Write as _;
use std::time::{Duration, SystemTime};

use log::{debug, info};
use reqwest::Client;
use tokio::runtime::{Builder, Runtime};

use super::Sink;
use crate::errors::SinkError;
use crate::frame::{CHANNELS, CHANNEL_COUNT};
use crate::router::RoutedSample;

pub const DEFAULT_INFLUX_EVERY: u64 = 10;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Timestamp precision of written points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum Precision {
    S,
    #[default]
    Ms,
    Us,
    Ns,
}

impl Precision {
    pub fn as_str(self) -> &'static str {
        match self {
            Precision::S => "s",
            Precision::Ms => "ms",
            Precision::Us => "us",
            Precision::Ns => "ns",
        }
    }

    /// Time since the Unix epoch in this precision. Times before the epoch
    /// map to zero.
    pub fn timestamp(self, at: SystemTime) -> u128 {
        let since = at
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default();
        match self {
            Precision::S => u128::from(since.as_secs()),
            Precision::Ms => since.as_millis(),
            Precision::Us => since.as_micros(),
            Precision::Ns => since.as_nanos(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfluxConfig {
    /// Server base URL, e.g. `http://localhost:8086`.
    pub url: String,
    pub org: String,
    pub bucket: String,
    pub token: Option<String>,
    pub precision: Precision,
    /// Write one event out of `every`.
    pub every: u64,
}

impl InfluxConfig {
    pub fn write_url(&self) -> String {
        format!("{}/api/v2/write", self.url.trim_end_matches('/'))
    }
}

fn push_point(
    body: &mut String,
    measurement: &str,
    prefix: &str,
    values: &[f64; CHANNEL_COUNT],
    timestamp: u128,
) {
    let mut fields = String::new();
    for (channel, value) in CHANNELS.iter().zip(values) {
        if !value.is_finite() {
            continue;
        }
        if !fields.is_empty() {
            fields.push(',');
        }
        let _ = write!(fields, "{prefix}_{channel}={value}");
    }
    if !fields.is_empty() {
        let _ = writeln!(body, "{measurement} {fields} {timestamp}");
    }
}

/// Line-protocol body for one sample. Non-finite values are left out.
pub fn line_protocol(sample: &RoutedSample, precision: Precision) -> String {
    let ts = precision.timestamp(sample.wall_clock);
    let mut body = String::with_capacity(512);
    push_point(&mut body, "current_measurement", "I", &sample.row.current, ts);
    push_point(&mut body, "voltage_measurement", "V", &sample.row.voltage, ts);
    push_point(
        &mut body,
        "temperature_measurement",
        "T",
        &sample.row.temperature,
        ts,
    );
    body
}

pub struct InfluxSink {
    config: InfluxConfig,
    client: Client,
    rt: Runtime,
    name: String,
}

impl InfluxSink {
    pub fn new(config: InfluxConfig) -> Result<Self, SinkError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Self::with_client(config, client)
    }

    pub fn with_client(config: InfluxConfig, client: Client) -> Result<Self, SinkError> {
        let rt = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| SinkError::Runtime(e.to_string()))?;
        info!(
            "influx sink: url={}, org={}, bucket={}, precision={}, every={}",
            config.url,
            config.org,
            config.bucket,
            config.precision.as_str(),
            config.every
        );
        let name = format!("influx:{}", config.bucket);
        Ok(Self {
            config,
            client,
            rt,
            name,
        })
    }

    async fn post(&self, body: String) -> Result<(), SinkError> {
        let mut request = self
            .client
            .post(self.config.write_url())
            .query(&[
                ("org", self.config.org.as_str()),
                ("bucket", self.config.bucket.as_str()),
                ("precision", self.config.precision.as_str()),
            ])
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body);
        if let Some(token) = &self.config.token {
            request = request.header("Authorization", format!("Token {token}"));
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(SinkError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

impl Sink for InfluxSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn write(&mut self, sample: &RoutedSample) -> Result<bool, SinkError> {
        if sample.event % self.config.every.max(1) != 0 {
            return Ok(false);
        }
        let body = line_protocol(sample, self.config.precision);
        if body.is_empty() {
            return Ok(false);
        }
        debug!("influx write: event={}, bytes={}", sample.event, body.len());
        self.rt.block_on(self.post(body))?;
        Ok(true)
    }
}
