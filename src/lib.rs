//! Pico readout telemetry reader.
//!
//! Connects to a Pico multichannel readout board over TCP or a serial port,
//! recovers fixed-size frames from the byte stream, reconstructs a monotonic
//! timestamp from the board's 32-bit counter, converts raw readings to
//! physical units and fans the merged rows out to text, binary, InfluxDB and
//! plot sinks.
//!
//! # Frame format
//!
//! Every frame is 50 bytes, big-endian:
//!
//! ```text
//! "START" | flag u8, counter u32 | 7 x (label u8, value i32) | "/END/"
//! ```
//!
//! The flag toggles between `W` and `w` each time the counter wraps. Channel
//! labels tell what the frame carries: `V` voltages, `I`/`i` currents (high
//! and low range), `T` temperatures, `P`/`p`/`M`/`m` markers, and `J`/`D`
//! for frames the board itself flagged as corrupted.
//!
//! # Timing
//!
//! 1. The first frame fixes the counter base
//! 2. A flag change counts as one counter wrap
//! 3. Sample times are `run_start + extended_ticks * 1e-4 s`

pub mod acquisition;
pub mod calibration;
pub mod config;
pub mod errors;
pub mod frame;
pub mod logging;
pub mod resync;
pub mod router;
pub mod sinks;
pub mod timestamp;
pub mod transport;

pub use acquisition::{Acquisition, AcquisitionConfig, RunSummary};
pub use calibration::{Calibration, CurrentModels, LinearModel, TemperatureSensor};
pub use config::DeviceProfile;
pub use errors::*;
pub use frame::{decode, Channel, Label, RawFrame, CHANNELS, FRAME_SIZE};
pub use resync::FrameResynchronizer;
pub use router::{AccumulatedRow, RoutedSample, Router, SampleKind, TemperatureMode};
pub use sinks::{Sink, SinkSet, SinkWorker, WritePolicy};
pub use timestamp::TimestampReconstructor;
pub use transport::{Connector, Endpoint, Transport};
