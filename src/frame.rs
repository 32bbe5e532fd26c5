//! Pico wire format.
//!
//! Every record the device emits has the same 50-byte layout:
//!
//! ```text
//! "START" | flag:u8 counter:u32be | (label:u8 value:i32be) x 7 | "/END/"
//! ```
//!
//! Slot 0 carries the time flag and the raw time counter, slots 1..=7 carry
//! the seven channels in [`CHANNELS`] order. There is no checksum: a frame is
//! accepted when both markers match.

use std::fmt;

use crate::errors::FrameError;

pub const START_MARKER: [u8; 5] = *b"START";
pub const END_MARKER: [u8; 5] = *b"/END/";
pub const MARKER_LEN: usize = 5;
pub const PAIR_LEN: usize = 5;
pub const CHANNEL_COUNT: usize = 7;
/// Total frame length: markers plus the time slot plus seven channel slots.
pub const FRAME_SIZE: usize = 2 * MARKER_LEN + (CHANNEL_COUNT + 1) * PAIR_LEN;

/// Detector channels, in the order they appear in a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    G3B,
    G3T,
    G2B,
    G2T,
    G1B,
    G1T,
    Drift,
}

pub const CHANNELS: [Channel; CHANNEL_COUNT] = [
    Channel::G3B,
    Channel::G3T,
    Channel::G2B,
    Channel::G2T,
    Channel::G1B,
    Channel::G1T,
    Channel::Drift,
];

impl Channel {
    /// Name used by calibration files and output columns.
    pub fn name(self) -> &'static str {
        match self {
            Channel::G3B => "G3B",
            Channel::G3T => "G3T",
            Channel::G2B => "G2B",
            Channel::G2T => "G2T",
            Channel::G1B => "G1B",
            Channel::G1T => "G1T",
            Channel::Drift => "DRIFT",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        CHANNELS
            .into_iter()
            .find(|ch| ch.name().eq_ignore_ascii_case(name))
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One-byte tag attached to every value in a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Label {
    /// `W`: time flag, upper phase
    TimeUpper,
    /// `w`: time flag, lower phase
    TimeLower,
    /// `V`
    Voltage,
    /// `I`: current read on the high range
    CurrentHigh,
    /// `i`: current read on the low range
    CurrentLow,
    /// `T`: raw temperature ADC count
    Temperature,
    /// `P`, `p`, `M`, `m`: auxiliary timing markers
    Marker(u8),
    /// `J`, `D`: the device flagged the content as unusable
    Trash(u8),
    Other(u8),
}

impl Label {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            b'W' => Label::TimeUpper,
            b'w' => Label::TimeLower,
            b'V' => Label::Voltage,
            b'I' => Label::CurrentHigh,
            b'i' => Label::CurrentLow,
            b'T' => Label::Temperature,
            b'P' | b'p' | b'M' | b'm' => Label::Marker(byte),
            b'J' | b'D' => Label::Trash(byte),
            other => Label::Other(other),
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            Label::TimeUpper => b'W',
            Label::TimeLower => b'w',
            Label::Voltage => b'V',
            Label::CurrentHigh => b'I',
            Label::CurrentLow => b'i',
            Label::Temperature => b'T',
            Label::Marker(b) | Label::Trash(b) | Label::Other(b) => b,
        }
    }

    pub fn is_current(self) -> bool {
        matches!(self, Label::CurrentHigh | Label::CurrentLow)
    }

    pub fn as_char(self) -> char {
        self.to_byte() as char
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// A frame with valid markers, split into its time slot and channel slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFrame {
    pub time_flag: Label,
    pub counter: u32,
    pub labels: [Label; CHANNEL_COUNT],
    pub values: [i32; CHANNEL_COUNT],
}

impl RawFrame {
    /// Labels of all eight slots, time flag first.
    pub fn all_labels(&self) -> impl Iterator<Item = Label> + '_ {
        std::iter::once(self.time_flag).chain(self.labels.iter().copied())
    }

    pub fn has_label(&self, pred: impl Fn(Label) -> bool) -> bool {
        self.all_labels().any(pred)
    }

    /// Serialize back into the wire layout.
    pub fn encode(&self) -> [u8; FRAME_SIZE] {
        let mut out = [0u8; FRAME_SIZE];
        out[..MARKER_LEN].copy_from_slice(&START_MARKER);
        out[MARKER_LEN] = self.time_flag.to_byte();
        out[MARKER_LEN + 1..MARKER_LEN + PAIR_LEN].copy_from_slice(&self.counter.to_be_bytes());
        for (i, (label, value)) in self.labels.iter().zip(self.values).enumerate() {
            let at = MARKER_LEN + (i + 1) * PAIR_LEN;
            out[at] = label.to_byte();
            out[at + 1..at + PAIR_LEN].copy_from_slice(&value.to_be_bytes());
        }
        out[FRAME_SIZE - MARKER_LEN..].copy_from_slice(&END_MARKER);
        out
    }
}

/// Decode one frame. Pure; the resynchronizer is in charge of alignment.
pub fn decode(buf: &[u8; FRAME_SIZE]) -> Result<RawFrame, FrameError> {
    let start: [u8; MARKER_LEN] = read_array(buf, 0);
    let end: [u8; MARKER_LEN] = read_array(buf, FRAME_SIZE - MARKER_LEN);
    if start != START_MARKER || end != END_MARKER {
        return Err(FrameError::InvalidMarkers { start, end });
    }

    let time_flag = Label::from_byte(buf[MARKER_LEN]);
    let counter = u32::from_be_bytes(read_array(buf, MARKER_LEN + 1));

    let mut labels = [Label::Other(0); CHANNEL_COUNT];
    let mut values = [0i32; CHANNEL_COUNT];
    for i in 0..CHANNEL_COUNT {
        let at = MARKER_LEN + (i + 1) * PAIR_LEN;
        labels[i] = Label::from_byte(buf[at]);
        values[i] = i32::from_be_bytes(read_array(buf, at + 1));
    }

    Ok(RawFrame {
        time_flag,
        counter,
        labels,
        values,
    })
}

/// Decode from an arbitrary slice, rejecting anything that is not exactly one frame.
pub fn decode_slice(buf: &[u8]) -> Result<RawFrame, FrameError> {
    let fixed: &[u8; FRAME_SIZE] = buf
        .try_into()
        .map_err(|_| FrameError::Length(buf.len()))?;
    decode(fixed)
}

fn read_array<const N: usize>(buf: &[u8; FRAME_SIZE], at: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&buf[at..at + N]);
    out
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build wire bytes from a flag, counter and seven (label, value) pairs.
    pub(crate) fn frame_bytes(flag: u8, counter: u32, pairs: [(u8, i32); 7]) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAME_SIZE);
        out.extend_from_slice(b"START");
        out.push(flag);
        out.extend_from_slice(&counter.to_be_bytes());
        for (label, value) in pairs {
            out.push(label);
            out.extend_from_slice(&value.to_be_bytes());
        }
        out.extend_from_slice(b"/END/");
        out
    }

    #[test]
    fn frame_size_matches_layout() {
        assert_eq!(FRAME_SIZE, 50);
    }

    #[test]
    fn decodes_big_endian_signed_values() {
        let bytes = frame_bytes(
            b'W',
            0xDEAD_BEEF,
            [
                (b'V', 1),
                (b'V', -1),
                (b'V', i32::MAX),
                (b'V', i32::MIN),
                (b'V', 256),
                (b'V', -256),
                (b'V', 0),
            ],
        );
        let frame = decode_slice(&bytes).unwrap();
        assert_eq!(frame.time_flag, Label::TimeUpper);
        assert_eq!(frame.counter, 0xDEAD_BEEF);
        assert_eq!(frame.labels, [Label::Voltage; 7]);
        assert_eq!(frame.values, [1, -1, i32::MAX, i32::MIN, 256, -256, 0]);
    }

    #[test]
    fn encode_restores_wire_bytes() {
        let bytes = frame_bytes(
            b'w',
            42,
            [
                (b'I', -5),
                (b'i', 7),
                (b'I', 1_000_000),
                (b'i', -3),
                (b'I', 0),
                (b'q', 11),
                (b'i', 12),
            ],
        );
        let frame = decode_slice(&bytes).unwrap();
        assert_eq!(frame.labels[5], Label::Other(b'q'));
        assert_eq!(frame.encode().as_slice(), bytes.as_slice());
    }

    #[test]
    fn rejects_bad_start_marker() {
        let mut bytes = frame_bytes(b'W', 0, [(b'V', 0); 7]);
        bytes[0] = b's';
        match decode_slice(&bytes) {
            Err(FrameError::InvalidMarkers { start, end }) => {
                assert_eq!(&start, b"sTART");
                assert_eq!(&end, b"/END/");
            }
            other => panic!("expected marker error, got {other:?}"),
        }
    }

    #[test]
    fn rejects_bad_end_marker() {
        let mut bytes = frame_bytes(b'W', 0, [(b'V', 0); 7]);
        bytes[FRAME_SIZE - 1] = b'X';
        assert!(matches!(
            decode_slice(&bytes),
            Err(FrameError::InvalidMarkers { .. })
        ));
    }

    #[test]
    fn rejects_wrong_length() {
        assert_eq!(decode_slice(&[0u8; 45]), Err(FrameError::Length(45)));
    }

    #[test]
    fn label_alphabet() {
        for b in [b'P', b'p', b'M', b'm'] {
            assert_eq!(Label::from_byte(b), Label::Marker(b));
        }
        assert_eq!(Label::from_byte(b'J'), Label::Trash(b'J'));
        assert_eq!(Label::from_byte(b'D'), Label::Trash(b'D'));
        assert!(Label::CurrentLow.is_current());
        assert!(!Label::Voltage.is_current());
        for b in 0..=u8::MAX {
            assert_eq!(Label::from_byte(b).to_byte(), b);
        }
    }

    #[test]
    fn channel_names() {
        assert_eq!(Channel::from_name("drift"), Some(Channel::Drift));
        assert_eq!(Channel::from_name("G2T").map(Channel::index), Some(3));
        assert_eq!(Channel::from_name("G4B"), None);
    }
}
