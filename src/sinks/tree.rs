//! Self-describing binary record file.
//!
//! Layout, all integers big-endian:
//!
//! ```text
//! "PICOTREE"  u32 version  u16 field_count
//! field_count x { u16 len, name bytes, u16 len, unit bytes }
//! records: field_count x f64
//! ```

use std::fs::File;
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

use log::info;

use super::Sink;
use crate::errors::SinkError;
use crate::frame::{CHANNELS, CHANNEL_COUNT};
use crate::router::RoutedSample;

pub const TREE_MAGIC: [u8; 8] = *b"PICOTREE";
pub const TREE_VERSION: u32 = 1;

/// Timestamp plus current, voltage and temperature of every channel.
pub const TREE_FIELD_COUNT: usize = 1 + 3 * CHANNEL_COUNT;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: String,
    pub unit: String,
}

pub fn fields() -> Vec<FieldDescriptor> {
    let mut fields = Vec::with_capacity(TREE_FIELD_COUNT);
    fields.push(FieldDescriptor {
        name: "timestamp".into(),
        unit: "1e-4 s".into(),
    });
    for (group, unit) in [("current", "A"), ("voltage", "V"), ("temperature", "degC")] {
        fields.extend(CHANNELS.iter().map(|ch| FieldDescriptor {
            name: format!("{group}_{ch}"),
            unit: unit.into(),
        }));
    }
    fields
}

fn record(sample: &RoutedSample) -> [f64; TREE_FIELD_COUNT] {
    let mut out = [0.0; TREE_FIELD_COUNT];
    out[0] = sample.timestamp as f64;
    let values = sample
        .row
        .current
        .iter()
        .chain(&sample.row.voltage)
        .chain(&sample.row.temperature);
    for (slot, value) in out[1..].iter_mut().zip(values) {
        *slot = *value;
    }
    out
}

fn write_str<W: Write>(out: &mut W, s: &str) -> io::Result<()> {
    let len = u16::try_from(s.len())
        .map_err(|_| io::Error::new(ErrorKind::InvalidInput, "field descriptor too long"))?;
    out.write_all(&len.to_be_bytes())?;
    out.write_all(s.as_bytes())
}

pub struct TreeSink<W: Write + Send> {
    out: BufWriter<W>,
    name: String,
}

impl TreeSink<File> {
    pub fn create(path: &Path) -> io::Result<Self> {
        info!("writing tree records to {}", path.display());
        let file = File::create(path)?;
        Self::new(file, format!("tree:{}", path.display()))
    }
}

impl<W: Write + Send> TreeSink<W> {
    pub fn new(writer: W, name: String) -> io::Result<Self> {
        let mut out = BufWriter::new(writer);
        out.write_all(&TREE_MAGIC)?;
        out.write_all(&TREE_VERSION.to_be_bytes())?;
        out.write_all(&(TREE_FIELD_COUNT as u16).to_be_bytes())?;
        for field in fields() {
            write_str(&mut out, &field.name)?;
            write_str(&mut out, &field.unit)?;
        }
        Ok(Self { out, name })
    }

    pub fn into_inner(self) -> io::Result<W> {
        self.out.into_inner().map_err(|e| e.into_error())
    }
}

impl<W: Write + Send> Sink for TreeSink<W> {
    fn name(&self) -> &str {
        &self.name
    }

    fn write(&mut self, sample: &RoutedSample) -> Result<bool, SinkError> {
        for value in record(sample) {
            self.out.write_all(&value.to_be_bytes())?;
        }
        Ok(true)
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.out.flush()?;
        Ok(())
    }
}

/// Reads back a file produced by [`TreeSink`].
pub struct TreeReader<R: Read> {
    input: R,
    version: u32,
    fields: Vec<FieldDescriptor>,
}

impl TreeReader<BufReader<File>> {
    pub fn open(path: &Path) -> io::Result<Self> {
        Self::new(BufReader::new(File::open(path)?))
    }
}

impl<R: Read> TreeReader<R> {
    pub fn new(mut input: R) -> io::Result<Self> {
        let mut magic = [0u8; 8];
        input.read_exact(&mut magic)?;
        if magic != TREE_MAGIC {
            return Err(io::Error::new(ErrorKind::InvalidData, "not a PICOTREE file"));
        }
        let mut word = [0u8; 4];
        input.read_exact(&mut word)?;
        let version = u32::from_be_bytes(word);
        if version != TREE_VERSION {
            return Err(io::Error::new(
                ErrorKind::InvalidData,
                format!("unsupported tree version {version}"),
            ));
        }
        let count = read_u16(&mut input)?;
        let mut fields = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            let name = read_str(&mut input)?;
            let unit = read_str(&mut input)?;
            fields.push(FieldDescriptor { name, unit });
        }
        Ok(Self {
            input,
            version,
            fields,
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    /// Next record, or `None` at a clean end of file. A truncated record is
    /// an error.
    pub fn read_record(&mut self) -> io::Result<Option<Vec<f64>>> {
        let mut record = Vec::with_capacity(self.fields.len());
        let mut word = [0u8; 8];
        for i in 0..self.fields.len() {
            if i == 0 {
                let n = read_full(&mut self.input, &mut word)?;
                if n == 0 {
                    return Ok(None);
                }
                if n < word.len() {
                    return Err(ErrorKind::UnexpectedEof.into());
                }
            } else {
                self.input.read_exact(&mut word)?;
            }
            record.push(f64::from_be_bytes(word));
        }
        Ok(Some(record))
    }
}

impl<R: Read> Iterator for TreeReader<R> {
    type Item = io::Result<Vec<f64>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_record().transpose()
    }
}

fn read_u16<R: Read>(input: &mut R) -> io::Result<u16> {
    let mut buf = [0u8; 2];
    input.read_exact(&mut buf)?;
    Ok(u16::from_be_bytes(buf))
}

fn read_str<R: Read>(input: &mut R) -> io::Result<String> {
    let len = read_u16(input)?;
    let mut buf = vec![0u8; usize::from(len)];
    input.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|e| io::Error::new(ErrorKind::InvalidData, e))
}

fn read_full<R: Read>(input: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::router::SampleKind;
    use crate::sinks::tests::sample;

    #[test]
    fn field_names_and_units() {
        let fields = fields();
        assert_eq!(fields.len(), TREE_FIELD_COUNT);
        assert_eq!(fields[1].name, "current_G3B");
        assert_eq!(fields[1].unit, "A");
        assert_eq!(fields[14].name, "voltage_DRIFT");
        assert_eq!(fields[21].name, "temperature_DRIFT");
        assert_eq!(fields[21].unit, "degC");
    }

    #[test]
    fn reader_returns_written_records() {
        let mut sink = TreeSink::new(Vec::new(), "mem".into()).unwrap();
        let mut s = sample(2, SampleKind::Voltage, true);
        s.row.current[0] = 0.25;
        s.row.voltage[3] = -1.5;
        s.row.temperature[6] = 21.0;
        sink.write(&s).unwrap();
        sink.write(&sample(3, SampleKind::Current, true)).unwrap();
        sink.flush().unwrap();
        let bytes = sink.into_inner().unwrap();

        let mut reader = TreeReader::new(Cursor::new(bytes)).unwrap();
        assert_eq!(reader.version(), TREE_VERSION);
        assert_eq!(reader.fields(), fields().as_slice());

        let first = reader.read_record().unwrap().unwrap();
        assert_eq!(first[0], 50.0);
        assert_eq!(first[1], 0.25);
        assert_eq!(first[8 + 3], -1.5);
        assert_eq!(first[21], 21.0);
        let second = reader.read_record().unwrap().unwrap();
        assert_eq!(second[0], 75.0);
        assert!(reader.read_record().unwrap().is_none());
    }

    #[test]
    fn truncated_record_is_an_error() {
        let mut sink = TreeSink::new(Vec::new(), "mem".into()).unwrap();
        sink.write(&sample(1, SampleKind::Voltage, true)).unwrap();
        let mut bytes = sink.into_inner().unwrap();
        bytes.truncate(bytes.len() - 4);

        let reader = TreeReader::new(Cursor::new(bytes)).unwrap();
        let records: Vec<_> = reader.collect();
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].as_ref().unwrap_err().kind(),
            ErrorKind::UnexpectedEof
        );
    }

    #[test]
    fn rejects_foreign_files() {
        let err = TreeReader::new(Cursor::new(b"NOTATREE\0\0\0\x01".to_vec()))
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn file_roundtrip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.tree");
        let mut sink = TreeSink::create(&path).unwrap();
        sink.write(&sample(4, SampleKind::Voltage, true)).unwrap();
        sink.flush().unwrap();
        drop(sink);

        let records: Vec<Vec<f64>> = TreeReader::open(&path)
            .unwrap()
            .collect::<io::Result<_>>()
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0][0], 100.0);
    }
}
