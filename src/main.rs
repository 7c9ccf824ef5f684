use anyhow::{bail, Context, Result};
use clap::Parser;
use confique::Config as _;
use log::{info, LevelFilter};
use scope_daq::*;
use simplelog::{
    ColorChoice, CombinedLogger, Config, SharedLogger, TermLogger, TerminalMode, WriteLogger,
};
use std::{
    fs::File,
    path::{Path, PathBuf},
    time::Duration,
};
use time::format_description::well_known::Rfc3339;

/// Capture waveforms from a LiteX oscilloscope board
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Board address, overrides the configuration
    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    /// Run against the built-in simulated board
    #[arg(long)]
    simulate: bool,

    /// Channels to capture, e.g. `0,1`
    #[arg(long, value_delimiter = ',')]
    channels: Option<Vec<u8>>,

    #[arg(short = 'n', long)]
    samples: Option<usize>,

    /// Keep one sample out of every N+1
    #[arg(short, long)]
    downsampling: Option<u32>,

    /// Full-scale range in volts applied to every captured channel
    #[arg(short, long)]
    range: Option<f64>,

    /// Put 0 V at mid-scale
    #[arg(long)]
    center: bool,

    /// Force the input divider (1, 10 or 100)
    #[arg(long)]
    divider: Option<u16>,

    #[arg(long, value_enum)]
    trigger: Option<TriggerMode>,

    #[arg(short, long, value_enum)]
    output: Option<OutputMode>,

    /// Output file for csv, plot and hdf5 modes
    #[arg(long)]
    dump: Option<PathBuf>,

    /// Viewer address for stream mode
    #[arg(long)]
    stream_addr: Option<String>,

    /// Measure ADC statistics before capturing
    #[arg(long)]
    stats: bool,

    #[arg(long)]
    log_file: Option<PathBuf>,

    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbose: u8, log_file: Option<&Path>) -> Result<()> {
    let level = match verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        level,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )];
    if let Some(path) = log_file {
        let file = File::create(path)
            .with_context(|| format!("failed to create log file {}", path.display()))?;
        loggers.push(WriteLogger::new(LevelFilter::Debug, Config::default(), file));
    }
    CombinedLogger::init(loggers)?;
    Ok(())
}

fn load_config(args: &Args) -> Result<Conf> {
    let mut conf = match args.config {
        Some(ref path) => Conf::load(path)
            .with_context(|| format!("failed to load configuration {}", path.display()))?,
        None => Conf::builder().load()?,
    };

    if let Some(ref host) = args.host {
        conf.transport.host = host.clone();
    }
    if let Some(port) = args.port {
        conf.transport.port = port;
    }
    if let Some(ref channels) = args.channels {
        conf.capture.channels = channels.clone();
    }
    if let Some(samples) = args.samples {
        conf.capture.samples = samples;
    }
    if let Some(ratio) = args.downsampling {
        conf.capture.downsampling = ratio;
    }
    if let Some(trigger) = args.trigger {
        conf.capture.trigger = trigger;
    }
    if let Some(mode) = args.output {
        conf.output.mode = mode;
    }
    if let Some(ref path) = args.dump {
        conf.output.path = path.clone();
    }
    if let Some(ref addr) = args.stream_addr {
        conf.output.stream_addr = addr.clone();
    }

    if let Some(range) = args.range {
        let divider = args
            .divider
            .map(Divider::try_from)
            .transpose()
            .map_err(anyhow::Error::msg)?;
        for &id in &conf.capture.channels {
            conf.channels.retain(|c| c.id != id);
            conf.channels.push(ChannelRequest {
                id,
                range,
                center: args.center,
                divider,
                coupling: Coupling::Dc,
                bandwidth: Bandwidth::Full,
            });
        }
    } else if args.divider.is_some() || args.center {
        bail!("--center and --divider need --range");
    }
    Ok(conf)
}

fn open_bus(args: &Args, conf: &Conf) -> Result<Box<dyn RegisterBus>> {
    if args.simulate {
        info!("using the simulated board");
        return Ok(Box::new(SimBoard::new(&conf.board)?));
    }
    let base_dir = args
        .config
        .as_deref()
        .and_then(Path::parent)
        .unwrap_or(Path::new("."));
    let map = load_register_map(&conf.board, base_dir).context("failed to load register map")?;
    if map.is_empty() {
        bail!("the board description defines no registers (set board.registers or board.csr_csv)");
    }
    let bus = UdpBus::open(&conf.transport, map).with_context(|| {
        format!(
            "failed to open register bus {}:{}",
            conf.transport.host, conf.transport.port
        )
    })?;
    Ok(Box::new(bus))
}

fn open_sink(output: &OutputSettings) -> Result<Box<dyn WaveformSink>> {
    let with_ext = |ext: &str| match output.path.extension() {
        Some(e) if e == "csv" => output.path.with_extension(ext),
        _ => output.path.clone(),
    };
    let sink: Box<dyn WaveformSink> = match output.mode {
        OutputMode::Csv => Box::new(CsvSink::new(&output.path)),
        OutputMode::Plot => Box::new(PlotSink::new(with_ext("png"))),
        OutputMode::Stream => Box::new(
            StreamSink::connect(output.stream_addr.as_str())
                .with_context(|| format!("failed to reach viewer at {}", output.stream_addr))?,
        ),
        #[cfg(feature = "hdf5")]
        OutputMode::Hdf5 => Box::new(Hdf5Sink::create(&with_ext("h5"))?),
        #[cfg(not(feature = "hdf5"))]
        OutputMode::Hdf5 => bail!("hdf5 output needs a build with the `hdf5` feature"),
    };
    Ok(sink)
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose, args.log_file.as_deref())?;

    let conf = load_config(&args)?;
    conf.board.validate()?;
    let bus = open_bus(&args, &conf)?;
    let digitizer = Digitizer::new(bus, &conf.board, PollPolicy::from(&conf.capture))?;

    for request in &conf.channels {
        digitizer
            .configure_channel(request)
            .with_context(|| format!("failed to configure channel {}", request.id))?;
    }

    if args.stats {
        for &ch in &conf.capture.channels {
            let stats = digitizer.measure_statistics(ch, Duration::from_millis(100))?;
            info!(
                "adc{ch}: min {} max {} samplerate {:.3} MSa/s",
                stats.min,
                stats.max,
                stats.samplerate / 1e6
            );
        }
    }
    if args.verbose > 0 {
        digitizer.log_registers()?;
    }

    let request = CaptureRequest::new(&conf.capture.channels, conf.capture.samples)?
        .with_downsampling(conf.capture.downsampling)
        .with_trigger(conf.capture.trigger);
    let mut sink = open_sink(&conf.output)?;
    let summary = digitizer
        .acquire(request, sink.as_mut())
        .context("capture failed")?;

    info!(
        "done: {} channel(s) x {} samples, {:.3} ns/sample, started {}",
        summary.channels.len(),
        summary.samples,
        summary.sample_interval * 1e9,
        summary.started_at.format(&Rfc3339).unwrap_or_default()
    );
    Ok(())
}
