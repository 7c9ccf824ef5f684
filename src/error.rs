use crate::CaptureState;
use std::time::Duration;
use thiserror::Error;

/// Failures of the remote register-bus link. Never retried at the transport layer.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("timed out during {op} at {addr:#010x}")]
    Timeout { op: &'static str, addr: u32 },
    #[error("link i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("register `{0}` is not in the board register map")]
    UnknownRegister(String),
    #[error("burst of {len} bytes exceeds the link maximum of {max}")]
    BurstTooLarge { len: usize, max: usize },
    #[error("malformed response: {0}")]
    Protocol(String),
}

#[derive(Error, Debug)]
pub enum RegisterMapError {
    #[error("{0}")]
    Csv(#[from] csv::Error),
    #[error("register `{name}` has an unparsable address `{value}`")]
    BadAddress { name: String, value: String },
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Csv(#[from] csv::Error),
    #[error("failed to render plot: {0}")]
    Plot(String),
    #[cfg(feature = "hdf5")]
    #[error("{0}")]
    Hdf5(#[from] hdf5::Error),
    #[error("sink rejected channel {channel}: {reason}")]
    Rejected { channel: u8, reason: String },
}

impl<E: std::error::Error + Send + Sync + 'static> From<plotters::drawing::DrawingAreaErrorKind<E>>
    for SinkError
{
    fn from(value: plotters::drawing::DrawingAreaErrorKind<E>) -> Self {
        SinkError::Plot(format!("{value:?}"))
    }
}

/// Every way a capture can fail. Each variant aborts only the current capture.
#[derive(Error, Debug)]
pub enum AcqError {
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
    #[error("channel {channel}: no AFE setting approximates {requested} V (nearest is {nearest} V)")]
    UnsupportedRange {
        channel: u8,
        requested: f64,
        nearest: f64,
    },
    #[error("channel {channel} has no AFE configuration")]
    UnconfiguredChannel { channel: u8 },
    #[error("invalid capture request: {0}")]
    InvalidRequest(String),
    #[error("invalid board description: {0}")]
    InvalidBoard(String),
    #[error("a capture session is already {state}")]
    AlreadyActive { state: CaptureState },
    #[error("channel {channel} cannot be reconfigured while a capture is {state}")]
    ConfigLocked { channel: u8, state: CaptureState },
    #[error("`{op}` is not valid while the sequencer is {state}")]
    InvalidState {
        op: &'static str,
        state: CaptureState,
    },
    #[error(
        "capture of {samples} samples on channels {channels:?} did not complete \
         after {polls} polls ({elapsed:?})"
    )]
    CaptureTimeout {
        channels: Vec<u8>,
        samples: usize,
        polls: u32,
        elapsed: Duration,
    },
    #[error("capture cancelled")]
    Cancelled,
    #[error(
        "channel {channel}: hardware overran unread samples \
         ({advanced} written during drain, {slack} of slack)"
    )]
    Overrun {
        channel: u8,
        advanced: u64,
        slack: usize,
    },
    #[error("channel {channel}: reconstructed {actual} samples, {expected} requested")]
    IncompleteCapture {
        channel: u8,
        expected: usize,
        actual: usize,
    },
    #[error("sink failed on channel {channel:?}: {source}")]
    Sink {
        channel: Option<u8>,
        #[source]
        source: SinkError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_context() {
        let e = AcqError::UnsupportedRange {
            channel: 2,
            requested: 300.0,
            nearest: 50.0,
        };
        assert_eq!(
            e.to_string(),
            "channel 2: no AFE setting approximates 300 V (nearest is 50 V)"
        );

        let e = AcqError::AlreadyActive {
            state: CaptureState::Capturing,
        };
        assert_eq!(e.to_string(), "a capture session is already capturing");
    }

    #[test]
    fn transport_error_converts() {
        let e: AcqError = TransportError::UnknownRegister("capture_status".into()).into();
        assert!(matches!(e, AcqError::Transport(_)));
        assert_eq!(
            e.to_string(),
            "transport failure: register `capture_status` is not in the board register map"
        );
    }
}
