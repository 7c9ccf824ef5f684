use crate::{regs, AcqError, BoardSettings, RegisterBus, TransportError};
use log::info;
use std::{thread, time::Duration};

/// Word format of the ADC codes stored in sample memory (little-endian).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdcFormat {
    pub bits: u8,
    pub signed: bool,
}

impl AdcFormat {
    pub fn new(bits: u8, signed: bool) -> Result<Self, AcqError> {
        if !(1..=16).contains(&bits) {
            return Err(AcqError::InvalidBoard(format!(
                "{bits}-bit ADC words (1 to 16 supported)"
            )));
        }
        Ok(Self { bits, signed })
    }

    pub fn from_board(board: &BoardSettings) -> Result<Self, AcqError> {
        Self::new(board.adc_bits, board.adc_signed)
    }

    pub fn bytes_per_sample(&self) -> usize {
        (self.bits as usize).div_ceil(8)
    }

    /// Number of distinct codes the ADC produces.
    pub fn levels(&self) -> u32 {
        1 << self.bits
    }

    pub fn min_code(&self) -> i32 {
        if self.signed {
            -(1 << (self.bits - 1))
        } else {
            0
        }
    }

    pub fn max_code(&self) -> i32 {
        self.min_code() + self.levels() as i32 - 1
    }

    pub fn decode(&self, bytes: &[u8]) -> i32 {
        let raw = bytes
            .iter()
            .take(self.bytes_per_sample())
            .rev()
            .fold(0u32, |acc, &b| (acc << 8) | b as u32)
            & (self.levels() - 1);
        if self.signed && raw & (1 << (self.bits - 1)) != 0 {
            raw as i32 - self.levels() as i32
        } else {
            raw as i32
        }
    }

    pub fn decode_all(&self, bytes: &[u8]) -> Vec<i32> {
        bytes
            .chunks_exact(self.bytes_per_sample())
            .map(|word| self.decode(word))
            .collect()
    }

    pub fn encode(&self, code: i32, out: &mut [u8]) {
        let raw = (code.clamp(self.min_code(), self.max_code()) as u32) & (self.levels() - 1);
        for (i, byte) in out.iter_mut().take(self.bytes_per_sample()).enumerate() {
            *byte = (raw >> (8 * i)) as u8;
        }
    }
}

/// Running statistics the ADC core keeps since its last statistics reset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdcStatistics {
    pub min: u8,
    pub max: u8,
    pub samplerate: f64,
}

pub fn measure_statistics(
    bus: &mut dyn RegisterBus,
    channel: u8,
    window: Duration,
) -> Result<AdcStatistics, TransportError> {
    bus.write_register(&regs::adc_control(channel), regs::ADC_CONTROL_STAT_RST)?;
    thread::sleep(window);
    let range = bus.read_register(&regs::adc_range(channel))?;
    let count = bus.read_register(&regs::adc_count(channel))?;
    Ok(AdcStatistics {
        min: (range & 0xff) as u8,
        max: ((range >> 8) & 0xff) as u8,
        samplerate: count as f64 / window.as_secs_f64().max(1e-6),
    })
}

/// Registers dumped by [`log_registers`] for every channel.
const CHANNEL_REGISTERS: &[fn(u8) -> String] = &[
    regs::frontend,
    regs::vga,
    regs::offset_dac,
    regs::write_pointer,
    regs::write_count,
];

const BOARD_REGISTERS: &[&str] = &[
    regs::OFFSET_DAC_CONTROL,
    regs::ADC_DOWNSAMPLING,
    regs::TRIGGER_CONTROL,
    regs::CAPTURE_CHANNELS,
    regs::CAPTURE_LENGTH,
    regs::CAPTURE_CONTROL,
    regs::CAPTURE_STATUS,
];

/// Logs every readable control/status register in one block. Unreadable ones are skipped.
pub fn log_registers(bus: &mut dyn RegisterBus, num_channels: u8) {
    let mut param_log = String::new();

    for &name in BOARD_REGISTERS {
        if let Ok(value) = bus.read_register(name) {
            param_log.push_str(&format!("{name}: {value:#x}\n"));
        }
    }
    for register in CHANNEL_REGISTERS {
        for ch in 0..num_channels {
            let name = register(ch);
            if let Ok(value) = bus.read_register(&name) {
                param_log.push_str(&format!("{name}: {value:#x}\n"));
            }
        }
    }

    if param_log.ends_with('\n') {
        param_log.pop();
    }
    info!("Board registers:\n{}", param_log);
}

#[cfg(test)]
mod tests {
    use super::*;
    use confique::Config;
    use crate::SimBoard;

    #[test]
    fn unsigned_8bit_codes() {
        let fmt = AdcFormat::new(8, false).unwrap();
        assert_eq!(fmt.bytes_per_sample(), 1);
        assert_eq!((fmt.min_code(), fmt.max_code()), (0, 255));
        assert_eq!(fmt.decode_all(&[0x00, 0x80, 0xff]), vec![0, 128, 255]);
    }

    #[test]
    fn signed_12bit_codes_sign_extend() {
        let fmt = AdcFormat::new(12, true).unwrap();
        assert_eq!(fmt.bytes_per_sample(), 2);
        assert_eq!((fmt.min_code(), fmt.max_code()), (-2048, 2047));
        assert_eq!(fmt.decode(&[0xff, 0x0f]), -1);
        assert_eq!(fmt.decode(&[0x00, 0x08]), -2048);
        assert_eq!(fmt.decode(&[0xff, 0x07]), 2047);
        // Bits above the word width are ignored.
        assert_eq!(fmt.decode(&[0x01, 0xf0]), 1);

        let mut out = [0u8; 2];
        fmt.encode(-2048, &mut out);
        assert_eq!(out, [0x00, 0x08]);
        fmt.encode(5000, &mut out);
        assert_eq!(fmt.decode(&out), 2047);
    }

    #[test]
    fn statistics_from_simulated_adc() {
        let board = BoardSettings::builder().load().unwrap();
        let mut sim = SimBoard::new(&board).unwrap();
        let stats = measure_statistics(&mut sim, 0, Duration::from_millis(20)).unwrap();
        assert!(stats.min <= stats.max);
        assert!(stats.samplerate > 0.0);
    }
}
