use std::fmt::Write as _;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use log::info;

use super::Sink;
use crate::errors::SinkError;
use crate::frame::{Label, CHANNELS};
use crate::router::RoutedSample;

/// Delimited text rows, one per written sample, with a header line.
pub struct TextSink<W: Write + Send> {
    out: BufWriter<W>,
    separator: String,
    name: String,
}

impl TextSink<File> {
    pub fn create(path: &Path, separator: &str) -> io::Result<Self> {
        info!("writing text rows to {}", path.display());
        let file = File::create(path)?;
        Self::new(file, separator, format!("text:{}", path.display()))
    }
}

impl<W: Write + Send> TextSink<W> {
    pub fn new(writer: W, separator: &str, name: String) -> io::Result<Self> {
        let mut out = BufWriter::new(writer);
        writeln!(out, "{}", header(separator))?;
        Ok(Self {
            out,
            separator: separator.to_string(),
            name,
        })
    }

    pub fn into_inner(self) -> io::Result<W> {
        self.out.into_inner().map_err(|e| e.into_error())
    }
}

/// Column names, matching [`format_row`].
pub fn header(separator: &str) -> String {
    let mut columns = vec!["Timestamp".to_string(), "Time_s".to_string()];
    for group in ["Current", "Voltage", "Temperature"] {
        columns.extend(CHANNELS.iter().map(|ch| format!("{group}_{ch}")));
    }
    columns.push("time_flag".to_string());
    columns.extend(CHANNELS.iter().map(|ch| format!("label_{ch}")));
    columns.join(separator)
}

pub fn format_row(sample: &RoutedSample, separator: &str) -> String {
    let row = &sample.row;
    let mut line = String::with_capacity(256);
    let _ = write!(line, "{}{}{}", sample.timestamp, separator, sample.seconds);
    for value in row
        .current
        .iter()
        .chain(&row.voltage)
        .chain(&row.temperature)
    {
        let _ = write!(line, "{separator}{value}");
    }
    let labels = std::iter::once(row.time_flag).chain(row.labels);
    for label in labels {
        let _ = write!(line, "{separator}{}", Label::as_char(label));
    }
    line
}

impl<W: Write + Send> Sink for TextSink<W> {
    fn name(&self) -> &str {
        &self.name
    }

    fn write(&mut self, sample: &RoutedSample) -> Result<bool, SinkError> {
        writeln!(self.out, "{}", format_row(sample, &self.separator))?;
        Ok(true)
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.out.flush()?;
        Ok(())
    }
}
