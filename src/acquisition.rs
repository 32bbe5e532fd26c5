//! The acquisition loop: read, resynchronise, decode, route, dispatch.
//!
//! Everything happens on the calling thread except sink output. Frames are
//! processed strictly in arrival order. The loop reads until the deadline
//! (or the cancel flag), then stops reading, routes whatever complete frames
//! are still buffered, closes the sinks and reports.

use std::fmt;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::errors::AcquisitionError;
use crate::frame::{self, FRAME_SIZE};
use crate::resync::FrameResynchronizer;
use crate::router::{KindCounts, Router};
use crate::sinks::{SinkReport, SinkSet};
use crate::transport::Transport;

/// Good events between progress reports.
pub const PROGRESS_EVERY: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquisitionConfig {
    /// Wall-clock acquisition budget.
    pub duration: Duration,
    /// Bytes requested per read.
    pub read_chunk: usize,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(10),
            read_chunk: FRAME_SIZE,
        }
    }
}

/// End-of-run counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub loop_iterations: u64,
    /// Frames that passed marker validation.
    pub good_frames: u64,
    pub skipped: u64,
    pub written: u64,
    /// Candidates rejected by the frame codec.
    pub non_matching: u64,
    pub corrupted: u64,
    pub read_errors: u64,
    pub sink_errors: u64,
    pub time_flag_flips: u64,
    pub discarded_bytes: u64,
    pub kinds: KindCounts,
    pub elapsed: Duration,
    pub sinks: Vec<SinkReport>,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "time_flag has changed:             {}", self.time_flag_flips)?;
        writeln!(f, "loop iterations:                   {}", self.loop_iterations)?;
        writeln!(f, "good events:                       {}", self.good_frames)?;
        writeln!(f, "skipped events:                    {}", self.skipped)?;
        writeln!(f, "written events:                    {}", self.written)?;
        writeln!(f, "non-matching events:               {}", self.non_matching)?;
        writeln!(f, "corrupted events:                  {}", self.corrupted)?;
        writeln!(f, "read errors:                       {}", self.read_errors)?;
        writeln!(f, "sink errors:                       {}", self.sink_errors)?;
        writeln!(f, "discarded bytes:                   {}", self.discarded_bytes)?;
        write!(
            f,
            "time elapsed:                      {:.3} s",
            self.elapsed.as_secs_f64()
        )
    }
}

pub struct Acquisition {
    transport: Option<Box<dyn Transport>>,
    resync: FrameResynchronizer,
    router: Router,
    sinks: SinkSet,
    config: AcquisitionConfig,
    cancel: Arc<AtomicBool>,
    summary: RunSummary,
    started: Instant,
}

impl Acquisition {
    pub fn new(
        transport: Box<dyn Transport>,
        router: Router,
        sinks: SinkSet,
        config: AcquisitionConfig,
    ) -> Self {
        Self {
            transport: Some(transport),
            resync: FrameResynchronizer::with_capacity(8 * FRAME_SIZE),
            router,
            sinks,
            config,
            cancel: Arc::new(AtomicBool::new(false)),
            summary: RunSummary::default(),
            started: Instant::now(),
        }
    }

    /// Share an externally owned cancel flag (e.g. set from a Ctrl-C handler).
    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn run(mut self) -> RunSummary {
        let started = Instant::now();
        self.started = started;
        let deadline = started + self.config.duration;
        let mut chunk = vec![0u8; self.config.read_chunk.max(1)];
        info!(
            "acquisition started: duration={:?}, sinks={}",
            self.config.duration,
            if self.sinks.is_empty() { "none" } else { "enabled" }
        );

        loop {
            self.summary.loop_iterations += 1;

            if self.transport.is_some() {
                if self.cancel.load(Ordering::Relaxed) {
                    info!("acquisition interrupted, closing transport");
                    self.transport = None;
                } else if Instant::now() >= deadline {
                    info!("acquisition time elapsed, closing transport");
                    self.transport = None;
                }
            }

            if let Some(transport) = self.transport.as_mut() {
                match transport.read(&mut chunk) {
                    Ok(0) => {
                        info!("transport closed by peer");
                        self.transport = None;
                    }
                    Ok(n) => self.resync.feed(&chunk[..n]),
                    Err(e)
                        if matches!(
                            e.kind(),
                            ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                        ) => {}
                    Err(e) => {
                        self.summary.read_errors += 1;
                        warn!("{}", AcquisitionError::TransportRead(e));
                    }
                }
            }

            self.process_buffered();

            if self.transport.is_none() {
                let dropped = self.resync.drain_remainder();
                if dropped > 0 {
                    debug!("dropping {} trailing bytes", dropped);
                }
                break;
            }
        }

        self.finish(started)
    }

    fn process_buffered(&mut self) {
        while let Some(bytes) = self.resync.try_extract_frame() {
            let raw = match frame::decode(&bytes) {
                Ok(raw) => raw,
                Err(e) => {
                    self.summary.non_matching += 1;
                    debug!("{}", AcquisitionError::Frame(e));
                    continue;
                }
            };
            self.summary.good_frames += 1;
            if is_progress_point(self.summary.good_frames) {
                info!(
                    "time elapsed: {:.3} s, good events: {}",
                    self.started.elapsed().as_secs_f64(),
                    self.summary.good_frames
                );
            }

            match self.router.route(&raw) {
                Some(sample) => self.sinks.offer(&sample),
                None => {
                    let event = self.summary.good_frames - 1;
                    debug!("{}", AcquisitionError::DataCorrupted { event });
                }
            }
        }
    }

    fn finish(mut self, started: Instant) -> RunSummary {
        let dispatch = self.sinks.counts();
        let reports = self.sinks.close();

        let summary = &mut self.summary;
        summary.kinds = self.router.counts();
        summary.corrupted = summary.kinds.corrupted;
        summary.skipped = dispatch.skipped;
        summary.written = dispatch.written;
        summary.sink_errors =
            dispatch.submit_errors + reports.iter().map(|r| r.errors).sum::<u64>();
        summary.time_flag_flips = self.router.wrap_count();
        summary.discarded_bytes = self.resync.discarded_bytes();
        summary.sinks = reports;
        summary.elapsed = started.elapsed();

        info!(
            "acquisition finished: good={}, written={}, skipped={}, non_matching={}, corrupted={}, read_errors={}, sink_errors={}, flips={}, elapsed={:.3}s",
            summary.good_frames,
            summary.written,
            summary.skipped,
            summary.non_matching,
            summary.corrupted,
            summary.read_errors,
            summary.sink_errors,
            summary.time_flag_flips,
            summary.elapsed.as_secs_f64()
        );
        self.summary
    }
}

fn is_progress_point(good_frames: u64) -> bool {
    good_frames > 0 && good_frames % PROGRESS_EVERY == 0
}

#[cfg(test)]
mod tests {
    use std::io::{self, Cursor, Read};
    use std::time::SystemTime;

    use super::*;
    use crate::calibration::Calibration;
    use crate::frame::tests::frame_bytes;
    use crate::router::TemperatureMode;
    use crate::sinks::{SinkWorker, TextSink, TreeReader, TreeSink, WritePolicy};
    use crate::timestamp::TimestampReconstructor;

    fn router() -> Router {
        Router::new(
            Calibration::uncalibrated(),
            TemperatureMode::PerChannel,
            TimestampReconstructor::new(1.0),
            SystemTime::UNIX_EPOCH,
        )
    }

    fn acquisition(transport: Box<dyn Transport>) -> Acquisition {
        Acquisition::new(
            transport,
            router(),
            SinkSet::new(WritePolicy::default()),
            AcquisitionConfig {
                duration: Duration::from_secs(5),
                read_chunk: FRAME_SIZE,
            },
        )
    }

    fn voltage(counter: u32) -> Vec<u8> {
        frame_bytes(b'W', counter, [(b'V', 0); 7])
    }

    #[test]
    fn counts_good_bad_and_corrupted() {
        let mut stream = Vec::new();
        stream.extend(voltage(10));
        stream.extend(b"noise");
        stream.extend(frame_bytes(b'W', 11, [(b'J', 0); 7]));
        let mut bad = voltage(12);
        bad[FRAME_SIZE - 1] = b'X';
        stream.extend(bad);
        stream.extend(voltage(13));
        stream.extend(&voltage(14)[..20]);

        let summary = acquisition(Box::new(Cursor::new(stream))).run();
        assert_eq!(summary.good_frames, 3);
        assert_eq!(summary.non_matching, 1);
        assert_eq!(summary.corrupted, 1);
        assert_eq!(summary.kinds.voltage, 2);
        assert_eq!(summary.discarded_bytes, 5 + 20);
        assert_eq!(summary.read_errors, 0);
    }

    #[test]
    fn cancelled_before_start_reads_nothing() {
        let run = acquisition(Box::new(Cursor::new(voltage(1))));
        run.cancel_handle().store(true, Ordering::Relaxed);
        let summary = run.run();
        assert_eq!(summary.good_frames, 0);
        assert_eq!(summary.loop_iterations, 1);
    }

    /// Never yields data, only read timeouts.
    struct Silent;

    impl Read for Silent {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            std::thread::sleep(Duration::from_millis(5));
            Err(io::Error::new(ErrorKind::TimedOut, "no data"))
        }
    }

    #[test]
    fn deadline_ends_a_silent_run() {
        let mut run = acquisition(Box::new(Silent));
        run.config.duration = Duration::from_millis(50);
        let summary = run.run();
        assert_eq!(summary.good_frames, 0);
        assert_eq!(summary.read_errors, 0);
        assert!(summary.elapsed >= Duration::from_millis(50));
    }

    /// Fails once, then delivers its payload.
    struct Flaky {
        failed: bool,
        inner: Cursor<Vec<u8>>,
    }

    impl Read for Flaky {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if !self.failed {
                self.failed = true;
                return Err(io::Error::new(ErrorKind::ConnectionReset, "reset"));
            }
            self.inner.read(buf)
        }
    }

    #[test]
    fn read_errors_are_counted_not_fatal() {
        let summary = acquisition(Box::new(Flaky {
            failed: false,
            inner: Cursor::new(voltage(5)),
        }))
        .run();
        assert_eq!(summary.read_errors, 1);
        assert_eq!(summary.good_frames, 1);
    }

    /// Serves its payload, then raises the cancel flag and reports read
    /// timeouts from then on.
    struct ThenIdle {
        inner: Cursor<Vec<u8>>,
        cancel: Option<Arc<AtomicBool>>,
    }

    impl Read for ThenIdle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.inner.read(buf)?;
            if n > 0 {
                return Ok(n);
            }
            if let Some(cancel) = &self.cancel {
                cancel.store(true, Ordering::Relaxed);
            }
            std::thread::sleep(Duration::from_millis(2));
            Err(io::Error::new(ErrorKind::TimedOut, "idle"))
        }
    }

    fn permissive_sinks() -> SinkSet {
        SinkSet::new(WritePolicy {
            slow_factor: 1,
            skip_markers: false,
            require_complete: false,
        })
    }

    #[test]
    fn cancel_mid_stream_flushes_file_sinks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.txt");
        let mut sinks = permissive_sinks();
        let text = TextSink::create(&path, ",").unwrap();
        sinks.add_file(SinkWorker::spawn(Box::new(text), 2).unwrap());

        let stream: Vec<u8> = (0..4).flat_map(|i| voltage(100 + i)).collect();
        let cancel = Arc::new(AtomicBool::new(false));
        let transport = ThenIdle {
            inner: Cursor::new(stream),
            cancel: Some(Arc::clone(&cancel)),
        };
        let run = Acquisition::new(
            Box::new(transport),
            router(),
            sinks,
            AcquisitionConfig {
                duration: Duration::from_secs(30),
                read_chunk: FRAME_SIZE,
            },
        )
        .with_cancel(cancel);
        let summary = run.run();

        assert!(summary.elapsed < Duration::from_secs(30));
        assert_eq!(summary.good_frames, 4);
        assert_eq!(summary.written, 4);
        assert_eq!(summary.sinks.len(), 1);
        assert_eq!(summary.sinks[0].written, 4);

        let text = std::fs::read_to_string(&path).unwrap();
        let timestamps: Vec<&str> = text
            .lines()
            .skip(1)
            .map(|line| line.split(',').next().unwrap())
            .collect();
        assert_eq!(timestamps, vec!["0", "1", "2", "3"]);
    }

    #[test]
    fn deadline_routes_buffered_frames_and_drops_the_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.tree");
        let mut sinks = permissive_sinks();
        let tree = TreeSink::create(&path).unwrap();
        sinks.add_file(SinkWorker::spawn(Box::new(tree), 2).unwrap());

        let mut stream: Vec<u8> = (0..5).flat_map(|i| voltage(10 + i)).collect();
        stream.extend(&voltage(15)[..30]);
        let transport = ThenIdle {
            inner: Cursor::new(stream),
            cancel: None,
        };
        let summary = Acquisition::new(
            Box::new(transport),
            router(),
            sinks,
            AcquisitionConfig {
                duration: Duration::from_millis(40),
                read_chunk: 8 * FRAME_SIZE,
            },
        )
        .run();

        assert!(summary.elapsed >= Duration::from_millis(40));
        assert_eq!(summary.good_frames, 5);
        assert_eq!(summary.written, 5);
        assert_eq!(summary.discarded_bytes, 30);
        assert_eq!(summary.read_errors, 0);

        let records = TreeReader::open(&path)
            .unwrap()
            .collect::<io::Result<Vec<_>>>()
            .unwrap();
        assert_eq!(records.len(), 5);
        assert_eq!(records[4][0], 4.0);
    }

    #[test]
    fn progress_is_reported_every_ten_thousand_good_events() {
        assert!(!is_progress_point(0));
        assert!(!is_progress_point(9_999));
        assert!(is_progress_point(10_000));
        assert!(!is_progress_point(10_001));
        assert!(is_progress_point(30_000));
    }

    #[test]
    fn summary_display_lists_counters() {
        let summary = RunSummary {
            good_frames: 7,
            ..RunSummary::default()
        };
        let text = summary.to_string();
        assert!(text.contains("good events:                       7"));
        assert!(text.ends_with(" s"));
    }
}
