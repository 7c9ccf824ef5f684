use crate::AcqError;
use confique::Config;
use serde::Deserialize;
use std::{collections::HashMap, fmt, path::PathBuf};

#[derive(Config, Debug, Clone)]
pub struct Conf {
    #[config(nested)]
    pub transport: TransportSettings,
    #[config(nested)]
    pub board: BoardSettings,
    #[config(nested)]
    pub capture: CaptureSettings,
    #[config(nested)]
    pub output: OutputSettings,
    #[config(default = [])]
    pub channels: Vec<ChannelRequest>,
}

impl Conf {
    pub fn load(path: &std::path::Path) -> Result<Self, confique::Error> {
        Conf::builder().file(path).load()
    }
}

#[derive(Config, Debug, Clone)]
pub struct TransportSettings {
    #[config(default = "192.168.1.50")]
    pub host: String,
    #[config(default = 1234)]
    pub port: u16,
    #[config(default = 100)]
    pub timeout_ms: u64,
    /// Largest memory burst the link carries, in bytes.
    #[config(default = 1024)]
    pub max_burst: usize,
    #[config(default = "etherbone")]
    pub upload_mode: UploadMode,
    /// Local UDP port the DMA uploader streams to.
    #[config(default = 2000)]
    pub data_port: u16,
}

/// Board description: everything the gateware fixes and the host must be told.
#[derive(Config, Debug, Clone)]
pub struct BoardSettings {
    #[config(default = 4)]
    pub num_channels: u8,
    #[config(default = 8)]
    pub adc_bits: u8,
    #[config(default = false)]
    pub adc_signed: bool,
    #[config(default = 1000000000.0)]
    pub sample_rate_hz: f64,
    /// Bus address of the shared sample memory.
    #[config(default = 0)]
    pub memory_base: u32,
    /// Size of the shared sample memory in bytes.
    #[config(default = 1048576)]
    pub memory_depth: u32,
    #[config(default = 65535)]
    pub max_downsampling: u32,
    #[config(default = 64)]
    pub frontend_base: u8,
    #[config(default = 32768)]
    pub offset_dac_center: u16,
    #[config(default = 9728)]
    pub offset_dac_bottom: u16,
    /// Largest accepted relative error between requested and achieved range.
    #[config(default = 0.25)]
    pub range_tolerance: f64,
    pub gains: Option<Vec<GainEntry>>,
    pub registers: Option<HashMap<String, u32>>,
    pub csr_csv: Option<PathBuf>,
}

impl BoardSettings {
    /// Rejects descriptions no board can have, before anything talks to the bus.
    pub fn validate(&self) -> Result<(), AcqError> {
        let invalid = |msg: String| Err(AcqError::InvalidBoard(msg));
        if !(1..=32).contains(&self.num_channels) {
            return invalid(format!("{} channels (1 to 32 supported)", self.num_channels));
        }
        if !(1..=16).contains(&self.adc_bits) {
            return invalid(format!("{}-bit ADC words (1 to 16 supported)", self.adc_bits));
        }
        if !(self.sample_rate_hz.is_finite() && self.sample_rate_hz > 0.0) {
            return invalid(format!("sample rate {} Hz", self.sample_rate_hz));
        }
        if self.memory_depth == 0 {
            return invalid("no sample memory".into());
        }
        if self.range_tolerance.is_nan() || self.range_tolerance < 0.0 {
            return invalid(format!("range tolerance {}", self.range_tolerance));
        }
        if self.gain_table().is_empty() {
            return invalid("empty gain table".into());
        }
        Ok(())
    }

    pub fn gain_table(&self) -> Vec<GainEntry> {
        match self.gains {
            Some(ref gains) => gains.clone(),
            None => GainEntry::default_table(),
        }
    }
}

#[derive(Config, Debug, Clone)]
pub struct CaptureSettings {
    #[config(default = [0])]
    pub channels: Vec<u8>,
    #[config(default = 1000)]
    pub samples: usize,
    #[config(default = 0)]
    pub downsampling: u32,
    #[config(default = "immediate")]
    pub trigger: TriggerMode,
    #[config(default = 1)]
    pub poll_interval_ms: u64,
    #[config(default = 50)]
    pub max_poll_interval_ms: u64,
    #[config(default = 1000)]
    pub max_polls: u32,
    #[config(default = 2000)]
    pub timeout_ms: u64,
}

#[derive(Config, Debug, Clone)]
pub struct OutputSettings {
    #[config(default = "csv")]
    pub mode: OutputMode,
    #[config(default = "capture.csv")]
    pub path: PathBuf,
    #[config(default = "127.0.0.1:50101")]
    pub stream_addr: String,
}

/// One row of the AFE gain table: a full-scale range reachable with a divider and VGA code.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct GainEntry {
    pub range: f64,
    pub divider: Divider,
    pub vga: u8,
}

impl GainEntry {
    pub fn default_table() -> Vec<GainEntry> {
        [
            (0.1, Divider::X1, 0xad),
            (0.2, Divider::X1, 0x8f),
            (0.5, Divider::X1, 0x5f),
            (1.0, Divider::X10, 0xad),
            (2.0, Divider::X10, 0x8f),
            (5.0, Divider::X10, 0x5f),
            (10.0, Divider::X100, 0xad),
            (20.0, Divider::X100, 0x8f),
            (50.0, Divider::X100, 0x5f),
        ]
        .into_iter()
        .map(|(range, divider, vga)| GainEntry {
            range,
            divider,
            vga,
        })
        .collect()
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ChannelRequest {
    pub id: u8,
    pub range: f64,
    #[serde(default)]
    pub center: bool,
    pub divider: Option<Divider>,
    #[serde(default)]
    pub coupling: Coupling,
    #[serde(default)]
    pub bandwidth: Bandwidth,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(try_from = "u16")]
pub enum Divider {
    X1,
    X10,
    X100,
}

impl Divider {
    pub fn ratio(self) -> u16 {
        match self {
            Divider::X1 => 1,
            Divider::X10 => 10,
            Divider::X100 => 100,
        }
    }
}

impl TryFrom<u16> for Divider {
    type Error = String;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Divider::X1),
            10 => Ok(Divider::X10),
            100 => Ok(Divider::X100),
            other => Err(format!("unsupported divider {other}, expected 1, 10 or 100")),
        }
    }
}

impl fmt::Display for Divider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.ratio())
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Coupling {
    #[default]
    Dc,
    Ac,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Bandwidth {
    #[default]
    Full,
    Limit20Mhz,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TriggerMode {
    #[default]
    Immediate,
    External,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum UploadMode {
    #[default]
    Etherbone,
    Dma,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    #[default]
    Csv,
    Plot,
    Stream,
    Hdf5,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_describe_the_stock_board() {
        let board = BoardSettings::builder().load().unwrap();
        assert_eq!(board.num_channels, 4);
        assert_eq!(board.adc_bits, 8);
        assert!(!board.adc_signed);
        assert_eq!(board.offset_dac_center, 0x8000);
        assert_eq!(board.offset_dac_bottom, 0x2600);
        assert_eq!(board.gain_table().len(), 9);
    }

    #[test]
    fn rejects_impossible_boards() {
        let stock = BoardSettings::builder().load().unwrap();
        assert!(stock.validate().is_ok());

        let mut wide = stock.clone();
        wide.adc_bits = 24;
        let mut no_clock = stock.clone();
        no_clock.sample_rate_hz = 0.0;
        let mut no_memory = stock.clone();
        no_memory.memory_depth = 0;
        let mut no_gains = stock.clone();
        no_gains.gains = Some(vec![]);

        for board in [wide, no_clock, no_memory, no_gains] {
            assert!(matches!(board.validate(), Err(AcqError::InvalidBoard(_))));
        }
    }

    #[test]
    fn loads_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
[transport]
host = "10.0.0.2"
upload_mode = "dma"

[board]
adc_bits = 12
adc_signed = true
gains = [{{ range = 5.0, divider = 10, vga = 31 }}]

[board.registers]
capture_status = 4096

[capture]
channels = [0, 1]
samples = 2048
trigger = "external"

[output]
mode = "stream"

[[channels]]
id = 1
range = 5.0
center = true
divider = 10
coupling = "ac"
"#
        )
        .unwrap();

        let conf = Conf::builder().file(file.path()).load().unwrap();
        assert_eq!(conf.transport.host, "10.0.0.2");
        assert_eq!(conf.transport.port, 1234);
        assert_eq!(conf.transport.upload_mode, UploadMode::Dma);
        assert_eq!(conf.board.adc_bits, 12);
        assert_eq!(
            conf.board.gain_table(),
            vec![GainEntry {
                range: 5.0,
                divider: Divider::X10,
                vga: 31
            }]
        );
        assert_eq!(
            conf.board.registers.unwrap().get("capture_status"),
            Some(&4096)
        );
        assert_eq!(conf.capture.channels, vec![0, 1]);
        assert_eq!(conf.capture.trigger, TriggerMode::External);
        assert_eq!(conf.output.mode, OutputMode::Stream);
        assert_eq!(conf.channels.len(), 1);
        assert_eq!(conf.channels[0].divider, Some(Divider::X10));
        assert_eq!(conf.channels[0].coupling, Coupling::Ac);
        assert_eq!(conf.channels[0].bandwidth, Bandwidth::Full);
    }

    #[test]
    fn rejects_unknown_divider() {
        assert!(Divider::try_from(3).is_err());
        assert_eq!(Divider::try_from(100), Ok(Divider::X100));
    }
}
