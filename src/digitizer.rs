use crate::{
    adc, reconstruct, AcqError, AdcFormat, AdcStatistics, AfeConfigurator, BoardSettings,
    CaptureRequest, CaptureSequencer, CaptureState, ChannelConfig, ChannelRequest, PollPolicy,
    RegisterBus, StreamReader, Waveform, WaveformSink,
};
use crossbeam_channel::{bounded, Receiver, Sender};
use log::info;
use std::{
    sync::{
        atomic::{AtomicU8, Ordering},
        Mutex, MutexGuard, TryLockError,
    },
    time::{Duration, Instant},
};
use time::OffsetDateTime;

struct Station<B> {
    bus: B,
    afe: AfeConfigurator,
    sequencer: CaptureSequencer,
    reader: StreamReader,
}

/// Requests cancellation of the capture currently waiting for completion.
#[derive(Clone)]
pub struct Canceller {
    tx: Sender<()>,
}

impl Canceller {
    pub fn cancel(&self) {
        // A pending request is already queued when the channel is full.
        let _ = self.tx.try_send(());
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionSummary {
    pub channels: Vec<u8>,
    pub samples: usize,
    pub sample_interval: f64,
    pub started_at: OffsetDateTime,
    pub polls: u32,
    pub bytes: usize,
    pub elapsed: Duration,
}

/// One physical board: AFE configuration and the capture pipeline behind a
/// single guard. Overlapping calls from other threads are rejected, not queued.
pub struct Digitizer<B: RegisterBus> {
    station: Mutex<Station<B>>,
    phase: AtomicU8,
    num_channels: u8,
    cancel_tx: Sender<()>,
    cancel_rx: Receiver<()>,
}

impl<B: RegisterBus> Digitizer<B> {
    pub fn new(bus: B, board: &BoardSettings, policy: PollPolicy) -> Result<Self, AcqError> {
        board.validate()?;
        let (cancel_tx, cancel_rx) = bounded(1);
        let station = Station {
            bus,
            afe: AfeConfigurator::new(board)?,
            sequencer: CaptureSequencer::new(board, policy),
            reader: StreamReader::new(AdcFormat::from_board(board)?),
        };
        Ok(Self {
            station: Mutex::new(station),
            phase: AtomicU8::new(encode_state(CaptureState::Idle)),
            num_channels: board.num_channels,
            cancel_tx,
            cancel_rx,
        })
    }

    pub fn canceller(&self) -> Canceller {
        Canceller {
            tx: self.cancel_tx.clone(),
        }
    }

    /// Sequencer state, readable while another thread holds the board.
    pub fn state(&self) -> CaptureState {
        decode_state(self.phase.load(Ordering::Acquire))
    }

    fn publish(&self, state: CaptureState) {
        self.phase.store(encode_state(state), Ordering::Release);
    }

    fn station(&self) -> Result<MutexGuard<'_, Station<B>>, AcqError> {
        match self.station.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::WouldBlock) => Err(AcqError::AlreadyActive {
                state: self.state(),
            }),
            Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
        }
    }

    pub fn configure_channel(&self, request: &ChannelRequest) -> Result<ChannelConfig, AcqError> {
        let locked = |state| AcqError::ConfigLocked {
            channel: request.id,
            state,
        };
        let mut guard = self.station().map_err(|e| match e {
            AcqError::AlreadyActive { state } => locked(state),
            other => other,
        })?;
        let station = &mut *guard;
        match station.sequencer.state() {
            state @ (CaptureState::Armed | CaptureState::Capturing) => Err(locked(state)),
            _ => station.afe.configure(&mut station.bus, request),
        }
    }

    pub fn channel(&self, id: u8) -> Option<ChannelConfig> {
        self.station().ok()?.afe.channel(id).cloned()
    }

    pub fn arm(&self, request: CaptureRequest) -> Result<(), AcqError> {
        let mut guard = self.station()?;
        let station = &mut *guard;
        let result = station.sequencer.arm(&mut station.bus, request, &station.afe);
        self.publish(station.sequencer.state());
        result
    }

    pub fn trigger(&self) -> Result<(), AcqError> {
        let mut guard = self.station()?;
        let station = &mut *guard;
        let result = station.sequencer.trigger(&mut station.bus);
        self.publish(station.sequencer.state());
        result
    }

    pub fn poll(&self) -> Result<CaptureState, AcqError> {
        let mut guard = self.station()?;
        let station = &mut *guard;
        let result = station.sequencer.poll(&mut station.bus);
        self.publish(station.sequencer.state());
        result
    }

    /// Stops and discards any session, leaving the board Idle.
    pub fn abort(&self) -> Result<(), AcqError> {
        let mut guard = self.station()?;
        let station = &mut *guard;
        station.sequencer.abort(&mut station.bus);
        self.publish(station.sequencer.state());
        Ok(())
    }

    /// Runs one full capture and hands every channel to `sink`.
    ///
    /// Whatever happens, the board is Idle again when this returns.
    pub fn acquire(
        &self,
        request: CaptureRequest,
        sink: &mut dyn WaveformSink,
    ) -> Result<AcquisitionSummary, AcqError> {
        let started = Instant::now();
        let (waveforms, mut summary) = {
            let mut guard = self.station()?;
            let station = &mut *guard;
            // Drop cancellations aimed at an earlier capture.
            while self.cancel_rx.try_recv().is_ok() {}

            let result = self.capture(station, request);
            self.publish(station.sequencer.state());
            result?
        };

        emit_all(waveforms, sink)?;
        summary.elapsed = started.elapsed();
        info!(
            "captured {} samples on channels {:?} in {:?} ({} polls, {} bytes)",
            summary.samples, summary.channels, summary.elapsed, summary.polls, summary.bytes
        );
        Ok(summary)
    }

    /// Drains a capture already polled to Complete and hands every channel to
    /// `sink`, the last step of a step-wise capture.
    pub fn collect(&self, sink: &mut dyn WaveformSink) -> Result<AcquisitionSummary, AcqError> {
        let started = Instant::now();
        let (waveforms, mut summary) = {
            let mut guard = self.station()?;
            let station = &mut *guard;
            let state = station.sequencer.state();
            if state != CaptureState::Complete {
                return Err(AcqError::InvalidState { op: "collect", state });
            }
            let result = Self::finish(station);
            self.publish(station.sequencer.state());
            result?
        };

        emit_all(waveforms, sink)?;
        summary.elapsed = started.elapsed();
        Ok(summary)
    }

    fn capture(
        &self,
        station: &mut Station<B>,
        request: CaptureRequest,
    ) -> Result<(Vec<Waveform>, AcquisitionSummary), AcqError> {
        station.sequencer.arm(&mut station.bus, request, &station.afe)?;
        self.publish(station.sequencer.state());
        station.sequencer.trigger(&mut station.bus)?;
        self.publish(station.sequencer.state());
        station.sequencer.wait(&mut station.bus, &self.cancel_rx)?;
        self.publish(station.sequencer.state());
        Self::finish(station)
    }

    /// Drains and reconstructs the completed session, then releases it.
    fn finish(station: &mut Station<B>) -> Result<(Vec<Waveform>, AcquisitionSummary), AcqError> {
        let waveforms = match Self::reconstruct_session(station) {
            Ok(waveforms) => waveforms,
            Err(e) => return Err(station.sequencer.fail(&mut station.bus, e)),
        };
        let session = station.sequencer.release()?;
        let summary = AcquisitionSummary {
            channels: session.request().channels.iter().collect(),
            samples: session.request().samples,
            sample_interval: session.sample_interval(),
            started_at: session.started_at(),
            polls: session.polls(),
            bytes: station.reader.last_drain().bytes,
            elapsed: Duration::ZERO,
        };
        Ok((waveforms, summary))
    }

    fn reconstruct_session(station: &mut Station<B>) -> Result<Vec<Waveform>, AcqError> {
        let session = station.sequencer.session().ok_or(AcqError::InvalidState {
            op: "drain",
            state: station.sequencer.state(),
        })?;
        let drained = station.reader.drain(&mut station.bus, session)?;

        let mut waveforms = Vec::with_capacity(drained.len());
        for (channel, blocks) in drained {
            let coefficients = session
                .coefficients(channel)
                .ok_or(AcqError::UnconfiguredChannel { channel })?;
            waveforms.push(reconstruct(
                channel,
                &blocks,
                coefficients,
                session.sample_interval(),
                session.started_at(),
                session.request().samples,
            )?);
        }
        Ok(waveforms)
    }

    pub fn measure_statistics(
        &self,
        channel: u8,
        window: Duration,
    ) -> Result<AdcStatistics, AcqError> {
        if channel >= self.num_channels {
            return Err(AcqError::InvalidRequest(format!(
                "channel {channel} does not exist (board has {})",
                self.num_channels
            )));
        }
        let mut station = self.station()?;
        Ok(adc::measure_statistics(&mut station.bus, channel, window)?)
    }

    pub fn log_registers(&self) -> Result<(), AcqError> {
        let mut station = self.station()?;
        adc::log_registers(&mut station.bus, self.num_channels);
        Ok(())
    }
}

/// Channels go out in ascending order; the first sink error ends emission.
fn emit_all(waveforms: Vec<Waveform>, sink: &mut dyn WaveformSink) -> Result<(), AcqError> {
    for waveform in waveforms {
        let channel = waveform.channel;
        sink.emit(waveform).map_err(|source| AcqError::Sink {
            channel: Some(channel),
            source,
        })?;
    }
    sink.finish()
        .map_err(|source| AcqError::Sink { channel: None, source })
}

fn encode_state(state: CaptureState) -> u8 {
    match state {
        CaptureState::Idle => 0,
        CaptureState::Armed => 1,
        CaptureState::Capturing => 2,
        CaptureState::Complete => 3,
        CaptureState::Failed => 4,
    }
}

fn decode_state(value: u8) -> CaptureState {
    match value {
        1 => CaptureState::Armed,
        2 => CaptureState::Capturing,
        3 => CaptureState::Complete,
        4 => CaptureState::Failed,
        _ => CaptureState::Idle,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use confique::Config;
    use crate::{Bandwidth, Coupling, MemorySink, SimBoard};

    fn request(id: u8) -> ChannelRequest {
        ChannelRequest {
            id,
            range: 1.0,
            center: true,
            divider: None,
            coupling: Coupling::Dc,
            bandwidth: Bandwidth::Full,
        }
    }

    #[test]
    fn configuration_is_locked_while_armed() {
        let board = BoardSettings::builder().load().unwrap();
        let sim = SimBoard::new(&board).unwrap();
        let dig = Digitizer::new(sim, &board, PollPolicy::default()).unwrap();
        dig.configure_channel(&request(0)).unwrap();
        dig.arm(CaptureRequest::new(&[0], 16).unwrap()).unwrap();
        assert_eq!(dig.state(), CaptureState::Armed);

        assert!(matches!(
            dig.configure_channel(&request(0)),
            Err(AcqError::ConfigLocked { channel: 0, state: CaptureState::Armed })
        ));
        dig.abort().unwrap();
        assert_eq!(dig.state(), CaptureState::Idle);
        dig.configure_channel(&request(0)).unwrap();
    }

    #[test]
    fn step_wise_capture() {
        let board = BoardSettings::builder().load().unwrap();
        let sim = SimBoard::new(&board).unwrap();
        let dig = Digitizer::new(sim, &board, PollPolicy::default()).unwrap();
        dig.configure_channel(&request(1)).unwrap();
        dig.arm(CaptureRequest::new(&[1], 16).unwrap()).unwrap();
        dig.trigger().unwrap();
        while dig.poll().unwrap() != CaptureState::Complete {}
        assert_eq!(dig.state(), CaptureState::Complete);

        let mut sink = MemorySink::new();
        let summary = dig.collect(&mut sink).unwrap();
        assert_eq!(summary.bytes, 16);
        assert_eq!(sink.waveforms.len(), 1);
        assert!(sink.finished);
        assert_eq!(dig.state(), CaptureState::Idle);

        assert!(matches!(
            dig.collect(&mut sink),
            Err(AcqError::InvalidState { op: "collect", state: CaptureState::Idle })
        ));
    }

    #[test]
    fn reconstruction_uses_coefficients_from_arm_time() {
        let board = BoardSettings::builder().load().unwrap();
        let sim = SimBoard::new(&board).unwrap();
        let dig = Digitizer::new(sim, &board, PollPolicy::default()).unwrap();
        let mut five_volts = request(0);
        five_volts.range = 5.0;
        let armed = dig.configure_channel(&five_volts).unwrap().coefficients;

        dig.arm(CaptureRequest::new(&[0], 64).unwrap()).unwrap();
        dig.trigger().unwrap();
        while dig.poll().unwrap() != CaptureState::Complete {}

        // Allowed once the capture is complete, but only for the next capture.
        let reconfigured = dig.configure_channel(&request(0)).unwrap().coefficients;
        assert_ne!(reconfigured, armed);

        let mut sink = MemorySink::new();
        dig.collect(&mut sink).unwrap();
        let waveform = &sink.waveforms[0];
        assert_eq!(waveform.coefficients, armed);
        for (&code, &volts) in waveform.codes.iter().zip(waveform.volts.iter()) {
            assert_eq!(volts, armed.volts(code));
        }
        assert_eq!(dig.channel(0).unwrap().coefficients, reconfigured);
    }

    #[test]
    fn impossible_board_is_rejected() {
        let mut board = BoardSettings::builder().load().unwrap();
        board.adc_bits = 24;
        assert!(matches!(
            AdcFormat::from_board(&board),
            Err(AcqError::InvalidBoard(_))
        ));
        assert!(SimBoard::new(&board).is_err());

        let stock = BoardSettings::builder().load().unwrap();
        let sim = SimBoard::new(&stock).unwrap();
        assert!(matches!(
            Digitizer::new(sim, &board, PollPolicy::default()),
            Err(AcqError::InvalidBoard(_))
        ));
    }

    #[test]
    fn states_round_trip_through_atomic() {
        for state in [
            CaptureState::Idle,
            CaptureState::Armed,
            CaptureState::Capturing,
            CaptureState::Complete,
            CaptureState::Failed,
        ] {
            assert_eq!(decode_state(encode_state(state)), state);
        }
    }
}
