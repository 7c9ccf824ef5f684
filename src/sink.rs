use crate::{SinkError, Waveform};
use byteorder::{LittleEndian, WriteBytesExt};
use log::{debug, info};
use plotters::prelude::*;
use std::{
    io::{BufWriter, Write},
    net::{TcpStream, ToSocketAddrs},
    path::{Path, PathBuf},
};

/// Consumer of finished waveforms.
///
/// The acquisition pipeline calls `emit` exactly once per channel of a
/// successful capture, then `finish` once. Errors are reported, never retried.
pub trait WaveformSink {
    fn emit(&mut self, waveform: Waveform) -> Result<(), SinkError>;

    fn finish(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

impl<S: WaveformSink + ?Sized> WaveformSink for Box<S> {
    fn emit(&mut self, waveform: Waveform) -> Result<(), SinkError> {
        self.as_mut().emit(waveform)
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        self.as_mut().finish()
    }
}

/// `capture.csv` → `capture_ch2.csv`
pub fn channel_path(path: &Path, channel: u8) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "capture".into());
    let name = match path.extension() {
        Some(ext) => format!("{stem}_ch{channel}.{}", ext.to_string_lossy()),
        None => format!("{stem}_ch{channel}"),
    };
    path.with_file_name(name)
}

/// Raw dump, one delimited file per channel.
pub struct CsvSink {
    path: PathBuf,
    written: Vec<PathBuf>,
}

impl CsvSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            written: Vec::new(),
        }
    }

    pub fn written(&self) -> &[PathBuf] {
        &self.written
    }
}

impl WaveformSink for CsvSink {
    fn emit(&mut self, waveform: Waveform) -> Result<(), SinkError> {
        let path = channel_path(&self.path, waveform.channel);
        let mut writer = csv::Writer::from_path(&path)?;
        writer.write_record(["time", "volts", "code"])?;
        for ((t, v), code) in waveform.samples().zip(waveform.codes.iter()) {
            writer.serialize((t, v, code))?;
        }
        writer.flush()?;
        info!("ch{}: {} samples -> {}", waveform.channel, waveform.len(), path.display());
        self.written.push(path);
        Ok(())
    }
}

/// Renders every emitted channel into one PNG on `finish`.
pub struct PlotSink {
    path: PathBuf,
    size: (u32, u32),
    waveforms: Vec<Waveform>,
}

const PALETTE: [RGBColor; 4] = [YELLOW, CYAN, MAGENTA, BLUE];

impl PlotSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            size: (1024, 600),
            waveforms: Vec::new(),
        }
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.size = (width, height);
        self
    }

    fn render(&self) -> Result<(), SinkError> {
        let x_max = self
            .waveforms
            .iter()
            .filter_map(|w| w.time.last().copied())
            .fold(0.0f64, f64::max)
            .max(f64::MIN_POSITIVE);
        let (y_min, y_max) = self
            .waveforms
            .iter()
            .flat_map(|w| w.volts.iter().copied())
            .fold((0.0f64, 0.0f64), |(lo, hi), v| (lo.min(v), hi.max(v)));
        let y_pad = ((y_max - y_min) * 0.05).max(1e-3);

        let root = BitMapBackend::new(&self.path, self.size).into_drawing_area();
        root.fill(&BLACK)?;
        let mut chart = ChartBuilder::on(&root)
            .margin(10)
            .build_cartesian_2d(0.0..x_max, (y_min - y_pad)..(y_max + y_pad))?;
        chart.draw_series(LineSeries::new(
            [(0.0, 0.0), (x_max, 0.0)],
            &WHITE.mix(0.3),
        ))?;
        for waveform in &self.waveforms {
            let color = PALETTE[waveform.channel as usize % PALETTE.len()];
            chart.draw_series(LineSeries::new(waveform.samples(), &color))?;
        }
        root.present()?;
        Ok(())
    }
}

impl WaveformSink for PlotSink {
    fn emit(&mut self, waveform: Waveform) -> Result<(), SinkError> {
        self.waveforms.push(waveform);
        Ok(())
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        if self.waveforms.is_empty() {
            return Err(SinkError::Plot("no waveform to plot".into()));
        }
        self.render()?;
        info!(
            "plotted {} channel(s) -> {}",
            self.waveforms.len(),
            self.path.display()
        );
        Ok(())
    }
}

pub const FRAME_MAGIC: &[u8; 4] = b"WFRM";

/// Pushes calibrated frames to a listening viewer over TCP.
///
/// Frame, little-endian: `"WFRM"`, channel `u8`, sample count `u32`,
/// sample interval `f64` seconds, capture start `f64` Unix seconds, then the
/// volts as `f32`.
pub struct StreamSink<W: Write = BufWriter<TcpStream>> {
    out: W,
}

impl StreamSink {
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self, SinkError> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        debug!("streaming to {}", stream.peer_addr()?);
        Ok(Self {
            out: BufWriter::new(stream),
        })
    }
}

impl<W: Write> StreamSink<W> {
    pub fn from_writer(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> WaveformSink for StreamSink<W> {
    fn emit(&mut self, waveform: Waveform) -> Result<(), SinkError> {
        let start = waveform.capture_start.unix_timestamp_nanos() as f64 * 1e-9;
        self.out.write_all(FRAME_MAGIC)?;
        self.out.write_u8(waveform.channel)?;
        self.out.write_u32::<LittleEndian>(waveform.len() as u32)?;
        self.out.write_f64::<LittleEndian>(waveform.sample_interval)?;
        self.out.write_f64::<LittleEndian>(start)?;
        for &v in waveform.volts.iter() {
            self.out.write_f32::<LittleEndian>(v as f32)?;
        }
        self.out.flush()?;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        self.out.flush()?;
        Ok(())
    }
}

/// Keeps waveforms in memory. Can be told to reject one channel.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub waveforms: Vec<Waveform>,
    pub finished: bool,
    reject: Option<u8>,
}

impl MemorySink {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn rejecting(channel: u8) -> Self {
        Self {
            reject: Some(channel),
            ..Default::default()
        }
    }
}

impl WaveformSink for MemorySink {
    fn emit(&mut self, waveform: Waveform) -> Result<(), SinkError> {
        if self.reject == Some(waveform.channel) {
            return Err(SinkError::Rejected {
                channel: waveform.channel,
                reason: "rejected by test sink".into(),
            });
        }
        self.waveforms.push(waveform);
        Ok(())
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        self.finished = true;
        Ok(())
    }
}
