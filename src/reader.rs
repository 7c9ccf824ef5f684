use crate::{
    regs, AcqError, AdcFormat, BoardSettings, CaptureSession, ChannelMask, RegisterBus,
    TransportError,
};
use log::{debug, info, warn};
use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

/// One channel's ring window in the shared sample memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// Bus address of physical index 0.
    pub base: u32,
    /// Capacity in samples.
    pub len: usize,
    pub bytes_per_sample: usize,
}

impl Region {
    pub fn address(&self, index: usize) -> u32 {
        self.base + ((index % self.len) * self.bytes_per_sample) as u32
    }
}

/// Fixed split of the shared sample memory among the active channels: equal,
/// word-aligned regions in ascending channel order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryLayout {
    regions: Vec<(u8, Region)>,
}

impl MemoryLayout {
    pub fn new(board: &BoardSettings, mask: ChannelMask) -> Result<Self, AcqError> {
        let active: Vec<u8> = mask.iter().collect();
        if active.is_empty() {
            return Err(AcqError::InvalidRequest("no channel selected".into()));
        }
        let bytes_per_sample = AdcFormat::from_board(board)?.bytes_per_sample();
        let region_bytes = (board.memory_depth as usize / active.len()) & !3;
        let len = region_bytes / bytes_per_sample;
        if len == 0 {
            return Err(AcqError::InvalidRequest(format!(
                "{} bytes of sample memory cannot hold {} channels",
                board.memory_depth,
                active.len()
            )));
        }

        let regions = active
            .into_iter()
            .enumerate()
            .map(|(k, channel)| {
                let region = Region {
                    base: board.memory_base + (k * region_bytes) as u32,
                    len,
                    bytes_per_sample,
                };
                (channel, region)
            })
            .collect();
        Ok(Self { regions })
    }

    pub fn regions(&self) -> impl Iterator<Item = (u8, Region)> + '_ {
        self.regions.iter().copied()
    }

    pub fn region(&self, channel: u8) -> Option<Region> {
        self.regions
            .iter()
            .find(|(ch, _)| *ch == channel)
            .map(|(_, region)| *region)
    }

    /// Samples every region can hold.
    pub fn capacity(&self) -> usize {
        self.regions.first().map_or(0, |(_, r)| r.len)
    }
}

/// Contiguous run of raw codes read in one burst.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSampleBlock {
    pub channel: u8,
    /// Index of `codes[0]` within the channel's logical (unwrapped) stream.
    pub offset: usize,
    pub codes: Vec<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BurstPlan {
    pub addr: u32,
    pub bytes: usize,
    pub offset: usize,
}

/// Splits a read of `samples` codes starting at physical index `start` into
/// bursts of at most `max_burst` bytes that never cross the end of the ring.
pub fn plan_bursts(region: &Region, start: usize, samples: usize, max_burst: usize) -> Vec<BurstPlan> {
    let per_burst = (max_burst / region.bytes_per_sample).max(1);
    let mut plans = Vec::with_capacity(samples.div_ceil(per_burst) + 1);
    let mut index = start % region.len;
    let mut offset = 0;
    while offset < samples {
        let n = per_burst.min(region.len - index).min(samples - offset);
        plans.push(BurstPlan {
            addr: region.address(index),
            bytes: n * region.bytes_per_sample,
            offset,
        });
        offset += n;
        index = (index + n) % region.len;
    }
    plans
}

/// Transfer totals of one drain.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DrainStats {
    pub bytes: usize,
    pub bursts: usize,
    pub elapsed: Duration,
}

impl DrainStats {
    /// In MB/s.
    pub fn rate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.bytes as f64 / secs / (1024.0 * 1024.0)
        } else {
            0.0
        }
    }
}

/// Drains completed captures out of the ring regions.
pub struct StreamReader {
    format: AdcFormat,
    last: DrainStats,
}

impl StreamReader {
    pub fn new(format: AdcFormat) -> Self {
        Self {
            format,
            last: DrainStats::default(),
        }
    }

    /// Totals of the last drain that completed without error.
    pub fn last_drain(&self) -> DrainStats {
        self.last
    }

    /// Reads each active channel's capture in logical time order.
    ///
    /// The capture is the newest `samples` codes ending at the write pointer
    /// snapshotted on completion. After the last burst the write counters are
    /// re-read; if any channel advanced past its unread slack the whole drain
    /// fails with [`AcqError::Overrun`].
    pub fn drain(
        &mut self,
        bus: &mut dyn RegisterBus,
        session: &CaptureSession,
    ) -> Result<BTreeMap<u8, Vec<RawSampleBlock>>, AcqError> {
        let samples = session.request().samples;
        let started = Instant::now();
        let mut stats = DrainStats::default();
        let mut drained = BTreeMap::new();

        for (channel, region) in session.layout().regions() {
            let Some(snapshot) = session.completion(channel) else {
                return Err(AcqError::IncompleteCapture {
                    channel,
                    expected: samples,
                    actual: 0,
                });
            };
            let available = (snapshot.written as usize).min(region.len).min(samples);
            if available < samples {
                warn!("ch{channel}: hardware wrote {} of {samples} samples", snapshot.written);
            }
            let wr = snapshot.write_pointer % region.len;
            let start = (wr + region.len - available) % region.len;
            if start + available > region.len {
                debug!("ch{channel}: capture wraps at index {}", region.len - start);
            }

            let mut blocks = Vec::new();
            for plan in plan_bursts(&region, start, available, bus.max_burst()) {
                let bytes = bus.read_memory_burst(plan.addr, plan.bytes)?;
                if bytes.len() != plan.bytes {
                    return Err(TransportError::Protocol(format!(
                        "burst at {:#010x} returned {} bytes, {} requested",
                        plan.addr,
                        bytes.len(),
                        plan.bytes
                    ))
                    .into());
                }
                stats.bytes += bytes.len();
                stats.bursts += 1;
                blocks.push(RawSampleBlock {
                    channel,
                    offset: plan.offset,
                    codes: self.format.decode_all(&bytes),
                });
            }
            drained.insert(channel, blocks);
        }

        self.check_overrun(bus, session)?;
        stats.elapsed = started.elapsed();
        self.last = stats;
        info!(
            "drained {} bytes in {} bursts ({:.2} MB/s)",
            stats.bytes,
            stats.bursts,
            stats.rate()
        );
        Ok(drained)
    }

    fn check_overrun(
        &self,
        bus: &mut dyn RegisterBus,
        session: &CaptureSession,
    ) -> Result<(), AcqError> {
        let samples = session.request().samples;
        let flagged = bus.read_register(regs::CAPTURE_STATUS)? & regs::CAPTURE_STATUS_OVERRUN != 0;
        for (channel, region) in session.layout().regions() {
            let Some(snapshot) = session.completion(channel) else {
                continue;
            };
            let count = bus.read_register(&regs::write_count(channel))?;
            let advanced = count.wrapping_sub(snapshot.count) as u64;
            let slack = region.len.saturating_sub(samples);
            if flagged || advanced > slack as u64 {
                return Err(AcqError::Overrun {
                    channel,
                    advanced,
                    slack,
                });
            }
        }
        Ok(())
    }
}
