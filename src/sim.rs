//! In-process stand-in for the remote board: named registers, a ring-addressed
//! sample memory and a synthetic ADC.

use crate::{
    regs, AcqError, AdcFormat, BoardSettings, ChannelMask, MemoryLayout, RegisterBus,
    TransportError,
};
use log::debug;
use rand::Rng;
use std::{
    collections::HashMap,
    f64::consts::TAU,
    sync::{Arc, Mutex, MutexGuard},
    time::Instant,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SimSignal {
    /// Sine wave; `amplitude` is a fraction of half scale, `noise` a peak in codes.
    /// Channel `n` lags channel 0 by `n` quarter periods.
    Sine {
        frequency_hz: f64,
        amplitude: f64,
        noise: f64,
    },
    /// ADC test pattern: the code increments on every raw sample clock.
    Ramp,
}

impl Default for SimSignal {
    fn default() -> Self {
        SimSignal::Sine {
            frequency_hz: 1e6,
            amplitude: 0.8,
            noise: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimFaults {
    /// Never report completion.
    pub stall: bool,
    /// Bus accesses that still succeed before the link drops.
    pub fail_after: Option<usize>,
    /// Samples per channel the hardware keeps writing during each memory burst.
    pub overrun_per_burst: u32,
    /// Report the overrun status bit.
    pub overrun_flag: bool,
    /// Samples missing from each channel's capture.
    pub short_by: usize,
}

struct SimState {
    board: BoardSettings,
    format: AdcFormat,
    registers: HashMap<String, u32>,
    memory: Vec<u8>,
    signal: SimSignal,
    latency: u32,
    countdown: Option<u32>,
    done: bool,
    clock: u64,
    layout: Option<MemoryLayout>,
    stat_reset: Instant,
    accesses: usize,
    faults: SimFaults,
    writes: Vec<(String, u32)>,
}

impl SimState {
    fn access(&mut self, addr: u32) -> Result<(), TransportError> {
        self.accesses += 1;
        match self.faults.fail_after {
            Some(limit) if self.accesses > limit => Err(TransportError::Timeout {
                op: "simulated link",
                addr,
            }),
            _ => Ok(()),
        }
    }

    fn reg(&self, name: &str) -> u32 {
        self.registers.get(name).copied().unwrap_or(0)
    }

    fn sample(&self, channel: u8, clock: u64) -> i32 {
        let levels = self.format.levels() as f64;
        match self.signal {
            SimSignal::Ramp => {
                self.format.min_code() + (clock % self.format.levels() as u64) as i32
            }
            SimSignal::Sine {
                frequency_hz,
                amplitude,
                noise,
            } => {
                let t = clock as f64 / self.board.sample_rate_hz;
                let phase = TAU * frequency_hz * t - channel as f64 * TAU / 4.0;
                let mid = self.format.min_code() as f64 + levels / 2.0;
                let mut code = mid + amplitude * levels / 2.0 * phase.sin();
                if noise > 0.0 {
                    code += rand::rng().random_range(-noise..=noise);
                }
                code.round() as i32
            }
        }
    }

    fn write_memory(&mut self, addr: u32, code: i32) {
        let bps = self.format.bytes_per_sample();
        let offset = (addr - self.board.memory_base) as usize;
        if let Some(word) = self.memory.get_mut(offset..offset + bps) {
            self.format.encode(code, word);
        }
    }

    /// Writes `samples` decimated codes into every active region, starting
    /// at each channel's persisted write pointer.
    fn record(&mut self, samples: usize) {
        let Some(layout) = self.layout.clone() else {
            return;
        };
        let step = self.reg(regs::ADC_DOWNSAMPLING) as u64 + 1;
        for (channel, region) in layout.regions() {
            let mut wr = self.reg(&regs::write_pointer(channel)) as usize % region.len;
            for i in 0..samples {
                let code = self.sample(channel, self.clock + i as u64 * step);
                self.write_memory(region.address(wr), code);
                wr = (wr + 1) % region.len;
            }
            let count = self.reg(&regs::write_count(channel)).wrapping_add(samples as u32);
            self.registers.insert(regs::write_pointer(channel), wr as u32);
            self.registers.insert(regs::write_count(channel), count);
        }
        self.clock += samples as u64 * step;
    }

    fn start_capture(&mut self) {
        let mask = ChannelMask::from_bits(self.reg(regs::CAPTURE_CHANNELS));
        self.layout = MemoryLayout::new(&self.board, mask).ok();
        let samples = (self.reg(regs::CAPTURE_LENGTH) as usize).saturating_sub(self.faults.short_by);
        self.record(samples);
        self.done = false;
        self.countdown = Some(self.latency);
        debug!("sim: capture started, {samples} samples on {mask:?}");
    }

    fn status(&mut self) -> u32 {
        if !self.faults.stall {
            match self.countdown {
                Some(0) => {
                    self.done = true;
                    self.countdown = None;
                }
                Some(n) => self.countdown = Some(n - 1),
                None => {}
            }
        }
        let mut status = 0;
        if self.done {
            status |= regs::CAPTURE_STATUS_DONE;
        }
        if self.faults.overrun_flag {
            status |= regs::CAPTURE_STATUS_OVERRUN;
        }
        status
    }

    fn adc_range(&self, channel: u8) -> u32 {
        let (min, max) = (0..256u64)
            .map(|k| self.sample(channel, self.clock + k * 7))
            .fold((i32::MAX, i32::MIN), |(lo, hi), c| (lo.min(c), hi.max(c)));
        // Statistics are kept on the top byte of the word.
        let shift = self.format.bits.saturating_sub(8);
        let top = |code: i32| (((code - self.format.min_code()) >> shift) & 0xff) as u32;
        top(min) | (top(max) << 8)
    }
}

/// Cheap to clone; clones share the same board.
#[derive(Clone)]
pub struct SimBoard {
    state: Arc<Mutex<SimState>>,
    max_burst: usize,
}

impl SimBoard {
    pub fn new(board: &BoardSettings) -> Result<Self, AcqError> {
        board.validate()?;
        let state = SimState {
            board: board.clone(),
            format: AdcFormat::from_board(board)?,
            registers: HashMap::new(),
            memory: vec![0; board.memory_depth as usize],
            signal: SimSignal::default(),
            latency: 2,
            countdown: None,
            done: false,
            clock: 0,
            layout: None,
            stat_reset: Instant::now(),
            accesses: 0,
            faults: SimFaults::default(),
            writes: Vec::new(),
        };
        Ok(Self {
            state: Arc::new(Mutex::new(state)),
            max_burst: 1024,
        })
    }

    pub fn with_signal(self, signal: SimSignal) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.signal = signal;
        }
        self
    }

    /// Number of status reads that still report busy after a start.
    pub fn with_latency(self, polls: u32) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.latency = polls;
        }
        self
    }

    pub fn with_max_burst(mut self, bytes: usize) -> Self {
        self.max_burst = bytes;
        self
    }

    /// Replaces the active faults and restarts the access count.
    pub fn set_faults(&self, faults: SimFaults) {
        if let Ok(mut state) = self.state.lock() {
            state.faults = faults;
            state.accesses = 0;
        }
    }

    /// Positions a channel's ring write pointer, as left by earlier captures.
    pub fn set_write_pointer(&self, channel: u8, index: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.registers.insert(regs::write_pointer(channel), index);
        }
    }

    /// Register value as last written or updated by the board.
    pub fn register(&self, name: &str) -> Option<u32> {
        self.state.lock().ok()?.registers.get(name).copied()
    }

    pub fn registers(&self) -> HashMap<String, u32> {
        self.state
            .lock()
            .map(|s| s.registers.clone())
            .unwrap_or_default()
    }

    /// Host writes, in order.
    pub fn writes(&self) -> Vec<(String, u32)> {
        self.state
            .lock()
            .map(|s| s.writes.clone())
            .unwrap_or_default()
    }

    pub fn clear_writes(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.writes.clear();
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, SimState>, TransportError> {
        self.state
            .lock()
            .map_err(|_| TransportError::Protocol("simulated board poisoned".into()))
    }
}

impl RegisterBus for SimBoard {
    fn read_register(&mut self, name: &str) -> Result<u32, TransportError> {
        let mut state = self.lock()?;
        state.access(0)?;
        let value = if name == regs::CAPTURE_STATUS {
            state.status()
        } else if let Some(ch) = adc_register(name, "_range") {
            state.adc_range(ch)
        } else if adc_register(name, "_count").is_some() {
            let elapsed = state.stat_reset.elapsed().as_secs_f64();
            (elapsed * state.board.sample_rate_hz).min(u32::MAX as f64) as u32
        } else {
            state.reg(name)
        };
        Ok(value)
    }

    fn write_register(&mut self, name: &str, value: u32) -> Result<(), TransportError> {
        let mut state = self.lock()?;
        state.access(0)?;
        state.writes.push((name.to_string(), value));
        state.registers.insert(name.to_string(), value);

        if name == regs::CAPTURE_CONTROL {
            if value & regs::CAPTURE_CONTROL_START != 0 {
                state.start_capture();
            } else {
                state.countdown = None;
                state.done = false;
            }
        } else if adc_register(name, "_control").is_some() && value & regs::ADC_CONTROL_STAT_RST != 0 {
            state.stat_reset = Instant::now();
        }
        Ok(())
    }

    fn read_memory_burst(&mut self, addr: u32, len: usize) -> Result<Vec<u8>, TransportError> {
        if len > self.max_burst {
            return Err(TransportError::BurstTooLarge {
                len,
                max: self.max_burst,
            });
        }
        let mut state = self.lock()?;
        state.access(addr)?;
        let offset = addr
            .checked_sub(state.board.memory_base)
            .map(|o| o as usize)
            .filter(|o| o + len <= state.memory.len())
            .ok_or_else(|| {
                TransportError::Protocol(format!("burst {addr:#010x}+{len} outside sample memory"))
            })?;
        let bytes = state.memory[offset..offset + len].to_vec();

        let extra = state.faults.overrun_per_burst as usize;
        if extra > 0 {
            state.record(extra);
        }
        Ok(bytes)
    }

    fn max_burst(&self) -> usize {
        self.max_burst
    }
}

/// Parses `adc{n}<suffix>` into `n`.
fn adc_register(name: &str, suffix: &str) -> Option<u8> {
    name.strip_prefix("adc")?.strip_suffix(suffix)?.parse().ok()
}
