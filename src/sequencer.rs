use crate::{
    regs, AcqError, AfeConfigurator, BoardSettings, CalibrationCoefficients, CaptureSettings,
    MemoryLayout, RegisterBus, TriggerMode,
};
use crossbeam_channel::{after, select, Receiver};
use log::{debug, info, warn};
use std::{
    collections::BTreeMap,
    fmt, thread,
    time::{Duration, Instant},
};
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Armed,
    Capturing,
    Complete,
    Failed,
}

impl fmt::Display for CaptureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CaptureState::Idle => "idle",
            CaptureState::Armed => "armed",
            CaptureState::Capturing => "capturing",
            CaptureState::Complete => "complete",
            CaptureState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Bit set of active channels, bit `n` for channel `n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelMask(u32);

impl ChannelMask {
    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn from_channels(channels: &[u8]) -> Result<Self, AcqError> {
        channels.iter().try_fold(Self(0), |mask, &ch| {
            1u32.checked_shl(ch as u32)
                .map(|bit| Self(mask.0 | bit))
                .ok_or_else(|| AcqError::InvalidRequest(format!("channel {ch} is out of range")))
        })
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, channel: u8) -> bool {
        channel < 32 && self.0 & (1 << channel) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn count(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Active channels in ascending order.
    pub fn iter(self) -> impl Iterator<Item = u8> {
        (0..32u8).filter(move |&ch| self.contains(ch))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureRequest {
    pub channels: ChannelMask,
    pub samples: usize,
    /// Keep one sample out of every `downsampling + 1`.
    pub downsampling: u32,
    pub trigger: TriggerMode,
}

impl CaptureRequest {
    pub fn new(channels: &[u8], samples: usize) -> Result<Self, AcqError> {
        Ok(Self {
            channels: ChannelMask::from_channels(channels)?,
            samples,
            downsampling: 0,
            trigger: TriggerMode::Immediate,
        })
    }

    pub fn with_downsampling(mut self, ratio: u32) -> Self {
        self.downsampling = ratio;
        self
    }

    pub fn with_trigger(mut self, trigger: TriggerMode) -> Self {
        self.trigger = trigger;
        self
    }
}

/// Write pointer and counter of one channel at the moment the capture completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteSnapshot {
    pub write_pointer: usize,
    pub count: u32,
    /// Samples written since the session was armed.
    pub written: u32,
}

/// Everything tied to one request between `arm` and release.
#[derive(Debug, Clone)]
pub struct CaptureSession {
    request: CaptureRequest,
    layout: MemoryLayout,
    coefficients: BTreeMap<u8, CalibrationCoefficients>,
    sample_interval: f64,
    started_at: OffsetDateTime,
    started: Instant,
    polls: u32,
    armed_counts: BTreeMap<u8, u32>,
    completion: BTreeMap<u8, WriteSnapshot>,
}

impl CaptureSession {
    pub fn request(&self) -> &CaptureRequest {
        &self.request
    }

    pub fn layout(&self) -> &MemoryLayout {
        &self.layout
    }

    /// Coefficients as configured when the session was armed.
    pub fn coefficients(&self, channel: u8) -> Option<CalibrationCoefficients> {
        self.coefficients.get(&channel).copied()
    }

    /// Seconds between kept samples.
    pub fn sample_interval(&self) -> f64 {
        self.sample_interval
    }

    /// Capture epoch, taken when the start bit was written.
    pub fn started_at(&self) -> OffsetDateTime {
        self.started_at
    }

    pub fn polls(&self) -> u32 {
        self.polls
    }

    pub fn completion(&self, channel: u8) -> Option<WriteSnapshot> {
        self.completion.get(&channel).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_interval: Duration,
    pub max_polls: u32,
    pub timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(50),
            max_polls: 1000,
            timeout: Duration::from_secs(2),
        }
    }
}

impl From<&CaptureSettings> for PollPolicy {
    fn from(settings: &CaptureSettings) -> Self {
        Self {
            interval: Duration::from_millis(settings.poll_interval_ms.max(1)),
            max_interval: Duration::from_millis(settings.max_poll_interval_ms.max(1)),
            max_polls: settings.max_polls.max(1),
            timeout: Duration::from_millis(settings.timeout_ms),
        }
    }
}

/// `Idle → Armed → Capturing → Complete | Failed → Idle`, one session at a time.
///
/// Every error returned while a session exists has already moved the
/// sequencer through Failed back to Idle.
pub struct CaptureSequencer {
    board: BoardSettings,
    policy: PollPolicy,
    state: CaptureState,
    session: Option<CaptureSession>,
}

impl CaptureSequencer {
    pub fn new(board: &BoardSettings, policy: PollPolicy) -> Self {
        Self {
            board: board.clone(),
            policy,
            state: CaptureState::Idle,
            session: None,
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn session(&self) -> Option<&CaptureSession> {
        self.session.as_ref()
    }

    pub fn policy(&self) -> PollPolicy {
        self.policy
    }

    fn transition(&mut self, to: CaptureState) {
        if self.state != to {
            info!("capture {} -> {}", self.state, to);
            self.state = to;
        }
    }

    pub fn arm(
        &mut self,
        bus: &mut dyn RegisterBus,
        request: CaptureRequest,
        afe: &AfeConfigurator,
    ) -> Result<(), AcqError> {
        if self.state != CaptureState::Idle {
            return Err(AcqError::AlreadyActive { state: self.state });
        }
        let session = self.validate(request, afe)?;
        let request = session.request.clone();
        self.session = Some(session);

        let armed = Self::program(bus, &request);

        match armed {
            Ok(counts) => {
                if let Some(session) = self.session.as_mut() {
                    session.armed_counts = counts;
                }
                self.transition(CaptureState::Armed);
                Ok(())
            }
            Err(e) => Err(self.fail(bus, e)),
        }
    }

    fn program(
        bus: &mut dyn RegisterBus,
        request: &CaptureRequest,
    ) -> Result<BTreeMap<u8, u32>, AcqError> {
        bus.write_register(regs::CAPTURE_CONTROL, 0)?;
        bus.write_register(regs::ADC_DOWNSAMPLING, request.downsampling)?;
        bus.write_register(regs::CAPTURE_LENGTH, request.samples as u32)?;
        bus.write_register(regs::CAPTURE_CHANNELS, request.channels.bits())?;
        let trigger = match request.trigger {
            TriggerMode::Immediate => 0,
            TriggerMode::External => regs::TRIGGER_CONTROL_ENABLE,
        };
        bus.write_register(regs::TRIGGER_CONTROL, trigger)?;

        let mut counts = BTreeMap::new();
        for channel in request.channels.iter() {
            counts.insert(channel, bus.read_register(&regs::write_count(channel))?);
        }
        Ok(counts)
    }

    fn validate(
        &self,
        request: CaptureRequest,
        afe: &AfeConfigurator,
    ) -> Result<CaptureSession, AcqError> {
        if request.channels.is_empty() {
            return Err(AcqError::InvalidRequest("no channel selected".into()));
        }
        if request.samples == 0 {
            return Err(AcqError::InvalidRequest("sample count must be at least 1".into()));
        }
        if request.downsampling > self.board.max_downsampling {
            return Err(AcqError::InvalidRequest(format!(
                "downsampling ratio {} exceeds the board maximum of {}",
                request.downsampling, self.board.max_downsampling
            )));
        }

        let mut coefficients = BTreeMap::new();
        for channel in request.channels.iter() {
            if channel >= self.board.num_channels {
                return Err(AcqError::InvalidRequest(format!(
                    "channel {channel} does not exist (board has {})",
                    self.board.num_channels
                )));
            }
            let coeffs = afe
                .coefficients(channel)
                .ok_or(AcqError::UnconfiguredChannel { channel })?;
            coefficients.insert(channel, coeffs);
        }

        let layout = MemoryLayout::new(&self.board, request.channels)?;
        if request.samples > layout.capacity() {
            return Err(AcqError::InvalidRequest(format!(
                "{} samples on {} channels exceed the {} samples each region holds",
                request.samples,
                request.channels.count(),
                layout.capacity()
            )));
        }

        Ok(CaptureSession {
            sample_interval: (request.downsampling as f64 + 1.0) / self.board.sample_rate_hz,
            request,
            layout,
            coefficients,
            started_at: OffsetDateTime::now_utc(),
            started: Instant::now(),
            polls: 0,
            armed_counts: BTreeMap::new(),
            completion: BTreeMap::new(),
        })
    }

    pub fn trigger(&mut self, bus: &mut dyn RegisterBus) -> Result<(), AcqError> {
        if self.state != CaptureState::Armed {
            return Err(AcqError::InvalidState {
                op: "trigger",
                state: self.state,
            });
        }
        if let Err(e) = bus.write_register(regs::CAPTURE_CONTROL, regs::CAPTURE_CONTROL_START) {
            return Err(self.fail(bus, e.into()));
        }
        if let Some(session) = self.session.as_mut() {
            session.started_at = OffsetDateTime::now_utc();
            session.started = Instant::now();
        }
        self.transition(CaptureState::Capturing);
        Ok(())
    }

    /// Checks the completion flag once.
    pub fn poll(&mut self, bus: &mut dyn RegisterBus) -> Result<CaptureState, AcqError> {
        match self.state {
            CaptureState::Capturing => {}
            CaptureState::Complete => return Ok(CaptureState::Complete),
            state => return Err(AcqError::InvalidState { op: "poll", state }),
        }
        let Some(session) = self.session.as_mut() else {
            return Err(AcqError::InvalidState {
                op: "poll",
                state: self.state,
            });
        };
        session.polls += 1;
        let polls = session.polls;
        let elapsed = session.started.elapsed();

        let status = match bus.read_register(regs::CAPTURE_STATUS) {
            Ok(status) => status,
            Err(e) => return Err(self.fail(bus, e.into())),
        };
        if status & regs::CAPTURE_STATUS_DONE != 0 {
            if let Err(e) = self.snapshot_write_pointers(bus) {
                return Err(self.fail(bus, e));
            }
            debug!("capture done after {polls} polls ({elapsed:?})");
            self.transition(CaptureState::Complete);
            return Ok(CaptureState::Complete);
        }

        if polls >= self.policy.max_polls || elapsed >= self.policy.timeout {
            let request = session.request.clone();
            let err = AcqError::CaptureTimeout {
                channels: request.channels.iter().collect(),
                samples: request.samples,
                polls,
                elapsed,
            };
            return Err(self.fail(bus, err));
        }
        Ok(CaptureState::Capturing)
    }

    fn snapshot_write_pointers(&mut self, bus: &mut dyn RegisterBus) -> Result<(), AcqError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        for channel in session.request.channels.iter() {
            let write_pointer = bus.read_register(&regs::write_pointer(channel))? as usize;
            let count = bus.read_register(&regs::write_count(channel))?;
            let armed = session.armed_counts.get(&channel).copied().unwrap_or(0);
            session.completion.insert(
                channel,
                WriteSnapshot {
                    write_pointer,
                    count,
                    written: count.wrapping_sub(armed),
                },
            );
        }
        Ok(())
    }

    /// Polls with exponential backoff until the capture completes, times out or
    /// a message arrives on `cancel`.
    pub fn wait(
        &mut self,
        bus: &mut dyn RegisterBus,
        cancel: &Receiver<()>,
    ) -> Result<(), AcqError> {
        let mut backoff = self.policy.interval;
        loop {
            if self.poll(bus)? == CaptureState::Complete {
                return Ok(());
            }
            select! {
                recv(cancel) -> msg => match msg {
                    Ok(()) => return Err(self.fail(bus, AcqError::Cancelled)),
                    // Nobody can cancel any more; keep polling on the timer.
                    Err(_) => thread::sleep(backoff),
                },
                recv(after(backoff)) -> _ => {}
            }
            backoff = (backoff * 2).min(self.policy.max_interval);
        }
    }

    /// Stops the hardware and moves through Failed back to Idle, returning `err`.
    pub fn fail(&mut self, bus: &mut dyn RegisterBus, err: AcqError) -> AcqError {
        if self.state == CaptureState::Idle && self.session.is_none() {
            return err;
        }
        if let Err(e) = bus.write_register(regs::CAPTURE_CONTROL, 0) {
            warn!("could not stop capture after failure: {e}");
        }
        warn!("capture failed in state {}: {err}", self.state);
        self.transition(CaptureState::Failed);
        self.session = None;
        self.transition(CaptureState::Idle);
        err
    }

    /// Drops a session in any state; a session still running is stopped first.
    pub fn abort(&mut self, bus: &mut dyn RegisterBus) {
        if self.session.is_some() {
            let _ = self.fail(bus, AcqError::Cancelled);
        }
    }

    /// Ends a completed session and returns to Idle.
    pub fn release(&mut self) -> Result<CaptureSession, AcqError> {
        if self.state != CaptureState::Complete {
            return Err(AcqError::InvalidState {
                op: "release",
                state: self.state,
            });
        }
        let session = self.session.take().ok_or(AcqError::InvalidState {
            op: "release",
            state: self.state,
        })?;
        self.transition(CaptureState::Idle);
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use confique::Config;
    use crate::{SimBoard, SimFaults};
    use crossbeam_channel::bounded;
    use rstest::rstest;

    fn setup(channels: &[u8]) -> (BoardSettings, SimBoard, AfeConfigurator) {
        let board = BoardSettings::builder().load().unwrap();
        let mut sim = SimBoard::new(&board).unwrap();
        let mut afe = AfeConfigurator::new(&board).unwrap();
        for &ch in channels {
            afe.configure_channel(&mut sim, ch, 5.0, true, None).unwrap();
        }
        (board, sim, afe)
    }

    fn fast_policy() -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(2),
            max_polls: 20,
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn mask_from_channels() {
        let mask = ChannelMask::from_channels(&[3, 0, 3]).unwrap();
        assert_eq!(mask.bits(), 0b1001);
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![0, 3]);
        assert_eq!(mask.count(), 2);
        assert!(ChannelMask::from_channels(&[40]).is_err());
    }

    #[test]
    fn walks_the_state_machine() {
        let (board, mut sim, afe) = setup(&[0, 1]);
        let mut seq = CaptureSequencer::new(&board, fast_policy());
        let request = CaptureRequest::new(&[0, 1], 100).unwrap();

        seq.arm(&mut sim, request, &afe).unwrap();
        assert_eq!(seq.state(), CaptureState::Armed);
        assert_eq!(sim.register(regs::CAPTURE_LENGTH), Some(100));
        assert_eq!(sim.register(regs::CAPTURE_CHANNELS), Some(0b11));

        seq.trigger(&mut sim).unwrap();
        assert_eq!(seq.state(), CaptureState::Capturing);

        let (_tx, rx) = bounded(1);
        seq.wait(&mut sim, &rx).unwrap();
        assert_eq!(seq.state(), CaptureState::Complete);
        let snapshot = seq.session().unwrap().completion(1).unwrap();
        assert_eq!(snapshot.written, 100);

        let session = seq.release().unwrap();
        assert_eq!(session.request().samples, 100);
        assert_eq!(seq.state(), CaptureState::Idle);
    }

    #[test]
    fn arm_while_capturing_is_rejected_without_side_effects() {
        let (board, mut sim, afe) = setup(&[0]);
        let mut seq = CaptureSequencer::new(&board, fast_policy());
        seq.arm(&mut sim, CaptureRequest::new(&[0], 10).unwrap(), &afe)
            .unwrap();
        seq.trigger(&mut sim).unwrap();
        let before = seq.session().unwrap().request().clone();

        let err = seq
            .arm(&mut sim, CaptureRequest::new(&[0], 20).unwrap(), &afe)
            .unwrap_err();
        assert!(matches!(
            err,
            AcqError::AlreadyActive {
                state: CaptureState::Capturing
            }
        ));
        assert_eq!(seq.state(), CaptureState::Capturing);
        assert_eq!(seq.session().unwrap().request(), &before);
        assert_eq!(sim.register(regs::CAPTURE_LENGTH), Some(10));
    }

    #[test]
    fn unconfigured_channel_is_rejected() {
        let (board, mut sim, afe) = setup(&[0]);
        let mut seq = CaptureSequencer::new(&board, fast_policy());
        let err = seq
            .arm(&mut sim, CaptureRequest::new(&[0, 2], 10).unwrap(), &afe)
            .unwrap_err();
        assert!(matches!(err, AcqError::UnconfiguredChannel { channel: 2 }));
        assert_eq!(seq.state(), CaptureState::Idle);
    }

    #[rstest]
    #[case(CaptureRequest::new(&[0], 0).unwrap())]
    #[case(CaptureRequest::new(&[], 10).unwrap())]
    #[case(CaptureRequest::new(&[0], 10).unwrap().with_downsampling(70000))]
    #[case(CaptureRequest::new(&[0], 2_000_000).unwrap())]
    fn invalid_requests(#[case] request: CaptureRequest) {
        let (board, mut sim, afe) = setup(&[0]);
        let mut seq = CaptureSequencer::new(&board, fast_policy());
        assert!(matches!(
            seq.arm(&mut sim, request, &afe),
            Err(AcqError::InvalidRequest(_))
        ));
        assert_eq!(seq.state(), CaptureState::Idle);
    }

    #[test]
    fn stalled_capture_times_out_and_returns_to_idle() {
        let (board, mut sim, afe) = setup(&[0]);
        sim.set_faults(SimFaults {
            stall: true,
            ..Default::default()
        });
        let mut seq = CaptureSequencer::new(&board, fast_policy());
        seq.arm(&mut sim, CaptureRequest::new(&[0], 10).unwrap(), &afe)
            .unwrap();
        seq.trigger(&mut sim).unwrap();

        let (_tx, rx) = bounded(1);
        let err = seq.wait(&mut sim, &rx).unwrap_err();
        assert!(matches!(
            err,
            AcqError::CaptureTimeout { ref channels, samples: 10, polls: 20, .. } if channels == &[0]
        ));
        assert_eq!(seq.state(), CaptureState::Idle);
        assert!(seq.session().is_none());
        assert_eq!(sim.register(regs::CAPTURE_CONTROL), Some(0));
    }

    #[test]
    fn cancel_stops_waiting() {
        let (board, mut sim, afe) = setup(&[0]);
        sim.set_faults(SimFaults {
            stall: true,
            ..Default::default()
        });
        let mut seq = CaptureSequencer::new(&board, fast_policy());
        seq.arm(&mut sim, CaptureRequest::new(&[0], 10).unwrap(), &afe)
            .unwrap();
        seq.trigger(&mut sim).unwrap();

        let (tx, rx) = bounded(1);
        tx.send(()).unwrap();
        assert!(matches!(seq.wait(&mut sim, &rx), Err(AcqError::Cancelled)));
        assert_eq!(seq.state(), CaptureState::Idle);
    }

    #[test]
    fn link_failure_during_trigger_resets() {
        let (board, mut sim, afe) = setup(&[0]);
        let mut seq = CaptureSequencer::new(&board, fast_policy());
        seq.arm(&mut sim, CaptureRequest::new(&[0], 10).unwrap(), &afe)
            .unwrap();
        sim.set_faults(SimFaults {
            fail_after: Some(0),
            ..Default::default()
        });
        assert!(matches!(seq.trigger(&mut sim), Err(AcqError::Transport(_))));
        assert_eq!(seq.state(), CaptureState::Idle);
    }

    #[test]
    fn out_of_order_operations() {
        let (board, mut sim, _afe) = setup(&[0]);
        let mut seq = CaptureSequencer::new(&board, fast_policy());
        assert!(matches!(
            seq.trigger(&mut sim),
            Err(AcqError::InvalidState { op: "trigger", state: CaptureState::Idle })
        ));
        assert!(matches!(seq.poll(&mut sim), Err(AcqError::InvalidState { .. })));
        assert!(seq.release().is_err());
    }

    #[rstest]
    #[case(0, 1e-9)]
    #[case(1, 2e-9)]
    #[case(255, 256e-9)]
    fn interval_scales_with_downsampling(#[case] ratio: u32, #[case] interval: f64) {
        let (board, mut sim, afe) = setup(&[0]);
        let mut seq = CaptureSequencer::new(&board, fast_policy());
        let request = CaptureRequest::new(&[0], 10).unwrap().with_downsampling(ratio);
        seq.arm(&mut sim, request, &afe).unwrap();
        let got = seq.session().unwrap().sample_interval();
        assert!((got - interval).abs() < 1e-21, "{got} != {interval}");
        assert_eq!(sim.register(regs::ADC_DOWNSAMPLING), Some(ratio));
    }
}
