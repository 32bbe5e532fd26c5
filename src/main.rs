use std::path::PathBuf;
use std::process::exit;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};

use pico_reader::calibration::{Calibration, TemperatureSensor};
use pico_reader::config::DeviceProfile;
use pico_reader::frame::Channel;
use pico_reader::logging;
use pico_reader::router::{Router, TemperatureMode};
use pico_reader::sinks::influx::DEFAULT_INFLUX_EVERY;
use pico_reader::sinks::plot::{DEFAULT_PLOT_CAPACITY, DEFAULT_PLOT_EVERY};
use pico_reader::sinks::{
    InfluxConfig, InfluxSink, PlotBuffer, PlotQuantity, PlotWindow, Precision, SinkSet,
    SinkWorker, TextSink, TreeSink, WritePolicy, DEFAULT_QUEUE_CAPACITY,
};
use pico_reader::timestamp::TimestampReconstructor;
use pico_reader::transport::{Connector, Endpoint};
use pico_reader::{Acquisition, AcquisitionConfig};

#[derive(Parser, Debug)]
#[command(name = "pico-reader", about = "Read, decode and store Pico telemetry frames")]
struct Args {
    /// Readout board; selects host, serial port and calibration tables
    #[arg(value_enum, default_value_t = DeviceProfile::Pico5)]
    profile: DeviceProfile,

    /// Read from the serial port instead of the network
    #[arg(long)]
    serial: bool,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    serial_path: Option<String>,
    #[arg(long)]
    baud: Option<u32>,

    /// Acquisition time in seconds
    #[arg(short, long, default_value_t = 10.0)]
    time: f64,

    /// Write delimited text rows to FILE
    #[arg(short, long, value_name = "FILE")]
    write: Option<PathBuf>,
    /// Write binary tree records to FILE
    #[arg(long, value_name = "FILE")]
    tree: Option<PathBuf>,
    #[arg(long, default_value = ",")]
    separator: String,
    /// Keep one event out of N in the output files
    #[arg(long, default_value_t = 1)]
    slow: u64,

    /// Report raw integer readings, no calibration
    #[arg(long)]
    raw: bool,
    #[arg(long, default_value = "calibrations")]
    calibration_dir: PathBuf,
    #[arg(long, value_enum, default_value_t = TemperatureMode::PerChannel)]
    temperature_mode: TemperatureMode,
    /// Temperature ADC reference voltage
    #[arg(long, default_value_t = TemperatureSensor::LM50.v_ref)]
    temp_vref: f64,
    /// Temperature ADC width in bits (1..=64)
    #[arg(
        long,
        default_value_t = TemperatureSensor::LM50.bits,
        value_parser = clap::value_parser!(u32).range(1..=64)
    )]
    temp_bits: u32,
    /// Sensor output at 0 °C, in volts
    #[arg(long, default_value_t = TemperatureSensor::LM50.offset)]
    temp_offset: f64,
    /// Sensor slope, in volts per °C
    #[arg(long, default_value_t = TemperatureSensor::LM50.scale)]
    temp_scale: f64,

    /// InfluxDB base URL; enables the InfluxDB sink
    #[arg(long)]
    influx_url: Option<String>,
    #[arg(long, default_value = "organization")]
    influx_org: String,
    #[arg(long, default_value = "bucket")]
    influx_bucket: String,
    #[arg(long, env = "INFLUX_TOKEN", hide_env_values = true)]
    influx_token: Option<String>,
    #[arg(long, value_enum, default_value_t = Precision::Ms)]
    influx_precision: Precision,
    #[arg(long, default_value_t = DEFAULT_INFLUX_EVERY)]
    influx_every: u64,

    /// Keep a rolling plot window
    #[arg(long)]
    plot: bool,
    #[arg(long, value_enum, default_value_t = PlotQuantity::Voltage)]
    plot_quantity: PlotQuantity,
    /// Channels to plot (comma separated); all when empty
    #[arg(long, value_delimiter = ',', value_parser = parse_channel)]
    plot_channels: Vec<Channel>,
    #[arg(long, default_value_t = DEFAULT_PLOT_EVERY)]
    plot_every: u64,
    #[arg(long, default_value_t = DEFAULT_PLOT_CAPACITY)]
    plot_points: usize,

    #[arg(long, default_value_t = DEFAULT_QUEUE_CAPACITY)]
    queue_capacity: usize,

    #[arg(short, long)]
    verbose: bool,
}

fn parse_channel(s: &str) -> std::result::Result<Channel, String> {
    Channel::from_name(s).ok_or_else(|| format!("unknown channel {s:?}"))
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    logging::init_logging(args.verbose);

    let duration = Duration::try_from_secs_f64(args.time)
        .with_context(|| format!("invalid acquisition time {}", args.time))?;

    let calibration = load_calibration(&args)?;
    let endpoint = endpoint(&args);
    info!("profile={}, target={}", args.profile, endpoint);

    let transport = Connector::default()
        .connect(&endpoint)
        .with_context(|| format!("connecting to {endpoint}"))?;

    let (sinks, plot) = build_sinks(&args)?;

    let cancel = Arc::new(AtomicBool::new(false));
    watch_ctrl_c(Arc::clone(&cancel));

    let router = Router::new(
        calibration,
        args.temperature_mode,
        TimestampReconstructor::default(),
        SystemTime::now(),
    );
    let config = AcquisitionConfig {
        duration,
        ..AcquisitionConfig::default()
    };
    let summary = Acquisition::new(transport, router, sinks, config)
        .with_cancel(cancel)
        .run();

    if let Some(window) = plot {
        let window = window.lock().unwrap_or_else(|e| e.into_inner());
        info!("plot window holds {} points", window.len());
    }
    for report in &summary.sinks {
        if report.panicked {
            warn!("sink {} stopped early", report.name);
        }
    }
    println!("{summary}");
    Ok(())
}

fn load_calibration(args: &Args) -> Result<Calibration> {
    if args.raw {
        info!("raw mode: calibration disabled");
        return Ok(Calibration::uncalibrated());
    }
    let (voltage, current) = args.profile.calibration_files(&args.calibration_dir);
    let sensor = TemperatureSensor {
        v_ref: args.temp_vref,
        bits: args.temp_bits,
        offset: args.temp_offset,
        scale: args.temp_scale,
    };
    Calibration::load(&voltage, &current, sensor)
        .with_context(|| format!("loading {} calibration", args.profile))
}

fn endpoint(args: &Args) -> Endpoint {
    match args.profile.endpoint(args.serial) {
        Endpoint::Tcp { host, port } => Endpoint::Tcp {
            host: args.host.clone().unwrap_or(host),
            port: args.port.unwrap_or(port),
        },
        Endpoint::Serial { path, baud } => Endpoint::Serial {
            path: args.serial_path.clone().unwrap_or(path),
            baud: args.baud.unwrap_or(baud),
        },
    }
}

/// 128 + SIGINT.
const ABORT_EXIT_CODE: i32 = 130;

type SharedPlot = Arc<std::sync::Mutex<PlotWindow>>;

fn build_sinks(args: &Args) -> Result<(SinkSet, Option<SharedPlot>)> {
    let capacity = args.queue_capacity;
    let mut sinks = SinkSet::new(WritePolicy {
        slow_factor: args.slow,
        ..WritePolicy::default()
    });

    if let Some(path) = &args.write {
        let sink = TextSink::create(path, &args.separator)
            .with_context(|| format!("creating {}", path.display()))?;
        sinks.add_file(SinkWorker::spawn(Box::new(sink), capacity)?);
    }
    if let Some(path) = &args.tree {
        let sink =
            TreeSink::create(path).with_context(|| format!("creating {}", path.display()))?;
        sinks.add_file(SinkWorker::spawn(Box::new(sink), capacity)?);
    }
    if let Some(url) = &args.influx_url {
        let sink = InfluxSink::new(InfluxConfig {
            url: url.clone(),
            org: args.influx_org.clone(),
            bucket: args.influx_bucket.clone(),
            token: args.influx_token.clone(),
            precision: args.influx_precision,
            every: args.influx_every,
        })
        .context("setting up the InfluxDB sink")?;
        sinks.add_stream(SinkWorker::spawn(Box::new(sink), capacity)?);
    }

    let mut plot = None;
    if args.plot {
        let window = PlotWindow::new(
            args.plot_quantity,
            args.plot_channels.clone(),
            args.plot_points,
        );
        let buffer = PlotBuffer::new(window, args.plot_every);
        plot = Some(buffer.window());
        sinks.add_stream(SinkWorker::spawn(Box::new(buffer), capacity)?);
    }

    Ok((sinks, plot))
}

/// Set `cancel` on the first Ctrl-C. A second one exits at once, without
/// waiting for the sinks to drain.
fn watch_ctrl_c(cancel: Arc<AtomicBool>) {
    let spawned = thread::Builder::new()
        .name("ctrl-c".into())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    warn!("ctrl-c handler unavailable: {}", e);
                    return;
                }
            };
            loop {
                if let Err(e) = rt.block_on(tokio::signal::ctrl_c()) {
                    warn!("failed to listen for ctrl-c: {}", e);
                    return;
                }
                match interrupt(&cancel) {
                    Interrupt::Stop => {
                        info!("received Ctrl+C, stopping acquisition (press again to abort)")
                    }
                    Interrupt::Abort => {
                        warn!("received second Ctrl+C, aborting without flushing sinks");
                        exit(ABORT_EXIT_CODE);
                    }
                }
            }
        });
    if let Err(e) = spawned {
        warn!("ctrl-c handler unavailable: {}", e);
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Interrupt {
    /// Stop reading, drain and close the sinks.
    Stop,
    /// Already stopping; exit now.
    Abort,
}

fn interrupt(cancel: &AtomicBool) -> Interrupt {
    if cancel.swap(true, Ordering::Relaxed) {
        Interrupt::Abort
    } else {
        Interrupt::Stop
    }
}
