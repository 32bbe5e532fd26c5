//! Frame recovery over a chunked, possibly misaligned byte stream.
//!
//! The transport hands over whatever the socket or serial port produced; a
//! chunk may hold half a frame, several frames, or line noise. Bytes are
//! accumulated until both markers are visible, the buffer is trimmed up to the
//! first `START`, and one frame-sized candidate is cut off the front.
//!
//! Without a checksum, a run of payload bytes spelling `START` is
//! indistinguishable from a real marker and will shift alignment until the
//! next genuine frame boundary. Candidates cut at a bad offset fail marker
//! validation in [`crate::frame::decode`] and are counted there.

use log::trace;

use crate::frame::{END_MARKER, FRAME_SIZE, START_MARKER};

/// Consumed bytes are only shifted out once this many have piled up in front
/// of the cursor.
const COMPACT_THRESHOLD: usize = 4096;

#[derive(Debug, Default)]
pub struct FrameResynchronizer {
    buf: Vec<u8>,
    head: usize,
    discarded: u64,
}

impl FrameResynchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            ..Self::default()
        }
    }

    /// Append a chunk received from the transport.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.compact();
        self.buf.extend_from_slice(chunk);
    }

    /// Bytes buffered but not yet handed out or discarded.
    pub fn pending_len(&self) -> usize {
        self.buf.len() - self.head
    }

    /// Bytes thrown away while realigning on `START`, plus any dropped remainder.
    pub fn discarded_bytes(&self) -> u64 {
        self.discarded
    }

    /// Cut the next candidate frame off the buffer, if one is available.
    ///
    /// Returns `None` when more data is needed: fewer than [`FRAME_SIZE`]
    /// bytes, or one of the markers not yet seen. Garbage is only trimmed once
    /// both markers are present, so a marker split across two chunks survives.
    pub fn try_extract_frame(&mut self) -> Option<[u8; FRAME_SIZE]> {
        if self.pending_len() < FRAME_SIZE {
            return None;
        }

        let pending = &self.buf[self.head..];
        let start = find(pending, &START_MARKER)?;
        find(pending, &END_MARKER)?;

        if start > 0 {
            trace!("discarding {} bytes before START", start);
            self.head += start;
            self.discarded += start as u64;
        }
        if self.pending_len() < FRAME_SIZE {
            return None;
        }

        let mut frame = [0u8; FRAME_SIZE];
        frame.copy_from_slice(&self.buf[self.head..self.head + FRAME_SIZE]);
        self.head += FRAME_SIZE;
        Some(frame)
    }

    /// Drop whatever is left (used once the transport is gone). Returns the
    /// number of bytes dropped.
    pub fn drain_remainder(&mut self) -> usize {
        let dropped = self.pending_len();
        self.discarded += dropped as u64;
        self.buf.clear();
        self.head = 0;
        dropped
    }

    fn compact(&mut self) {
        if self.head == 0 {
            return;
        }
        if self.head == self.buf.len() {
            self.buf.clear();
            self.head = 0;
        } else if self.head >= COMPACT_THRESHOLD {
            self.buf.drain(..self.head);
            self.head = 0;
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::tests::frame_bytes;
    use crate::frame::{decode, decode_slice};

    fn voltage_frame(counter: u32) -> Vec<u8> {
        frame_bytes(b'W', counter, [(b'V', counter as i32); 7])
    }

    /// Deterministic noise that never contains an `S`, hence never `START`.
    fn garbage(seed: &mut u32, len: usize) -> Vec<u8> {
        (0..len)
            .map(|_| {
                *seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                let b = (*seed >> 16) as u8;
                if b == b'S' {
                    b'x'
                } else {
                    b
                }
            })
            .collect()
    }

    #[test]
    fn needs_a_full_frame() {
        let mut sync = FrameResynchronizer::new();
        sync.feed(&voltage_frame(1)[..FRAME_SIZE - 1]);
        assert!(sync.try_extract_frame().is_none());
        assert_eq!(sync.pending_len(), FRAME_SIZE - 1);
    }

    #[test]
    fn frame_split_across_chunks() {
        let bytes = voltage_frame(7);
        for split in 1..FRAME_SIZE {
            let mut sync = FrameResynchronizer::new();
            sync.feed(&bytes[..split]);
            assert!(sync.try_extract_frame().is_none(), "split at {split}");
            sync.feed(&bytes[split..]);
            let frame = sync.try_extract_frame().expect("frame after second chunk");
            assert_eq!(frame.as_slice(), bytes.as_slice());
            assert!(sync.try_extract_frame().is_none());
            assert_eq!(sync.pending_len(), 0);
        }
    }

    #[test]
    fn frames_interleaved_with_garbage_come_out_in_order() {
        let mut seed = 99;
        let mut stream = Vec::new();
        let n = 40u32;
        for i in 0..n {
            let noise_len = (i as usize * 7) % 23;
            stream.extend(garbage(&mut seed, noise_len));
            stream.extend(voltage_frame(i));
        }

        let mut sync = FrameResynchronizer::new();
        let mut got = Vec::new();
        for chunk in stream.chunks(13) {
            sync.feed(chunk);
            while let Some(frame) = sync.try_extract_frame() {
                got.push(decode(&frame).unwrap().counter);
            }
        }
        assert_eq!(got, (0..n).collect::<Vec<_>>());
    }

    #[test]
    fn garbage_kept_until_both_markers_present() {
        let mut sync = FrameResynchronizer::new();
        let mut seed = 5;
        sync.feed(&garbage(&mut seed, 60));
        assert!(sync.try_extract_frame().is_none());
        assert_eq!(sync.pending_len(), 60);
        assert_eq!(sync.discarded_bytes(), 0);

        sync.feed(&voltage_frame(3));
        let frame = sync.try_extract_frame().unwrap();
        assert_eq!(decode_slice(&frame).unwrap().counter, 3);
        assert_eq!(sync.discarded_bytes(), 60);
    }

    #[test]
    fn trimmed_buffer_shorter_than_a_frame_waits() {
        let mut sync = FrameResynchronizer::new();
        // stale trailer, then the first half of a real frame
        let mut chunk = b"junk/END/".to_vec();
        chunk.extend_from_slice(&voltage_frame(9)[..45]);
        sync.feed(&chunk);
        assert!(sync.try_extract_frame().is_none());
        assert_eq!(sync.pending_len(), 45);

        sync.feed(&voltage_frame(9)[45..]);
        assert!(sync.try_extract_frame().is_some());
    }

    #[test]
    fn false_start_yields_an_undecodable_candidate() {
        let mut sync = FrameResynchronizer::new();
        let mut chunk = b"START".to_vec();
        chunk.extend_from_slice(&voltage_frame(1));
        sync.feed(&chunk);

        let first = sync.try_extract_frame().unwrap();
        assert!(decode(&first).is_err());
        // the real frame lost its first five bytes to the bogus candidate
        assert!(sync.try_extract_frame().is_none());
        assert_eq!(sync.pending_len(), 5);
    }

    #[test]
    fn drain_drops_the_remainder() {
        let mut sync = FrameResynchronizer::new();
        sync.feed(&voltage_frame(1)[..20]);
        assert_eq!(sync.drain_remainder(), 20);
        assert_eq!(sync.pending_len(), 0);
        assert_eq!(sync.discarded_bytes(), 20);
    }

    #[test]
    fn compaction_keeps_pending_bytes() {
        let frames = (COMPACT_THRESHOLD / FRAME_SIZE + 10) as u32;
        let mut sync = FrameResynchronizer::with_capacity(64);
        for i in 0..frames {
            sync.feed(&voltage_frame(i));
        }
        let tail = voltage_frame(frames);
        sync.feed(&tail[..25]);
        for i in 0..frames {
            assert_eq!(decode(&sync.try_extract_frame().unwrap()).unwrap().counter, i);
        }
        assert!(sync.head >= COMPACT_THRESHOLD);

        sync.feed(&tail[25..]);
        assert_eq!(sync.head, 0);
        assert_eq!(sync.buf.len(), FRAME_SIZE);
        let last = sync.try_extract_frame().unwrap();
        assert_eq!(decode(&last).unwrap().counter, frames);
    }
}
