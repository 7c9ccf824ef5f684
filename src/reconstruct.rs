use crate::{AcqError, CalibrationCoefficients, RawSampleBlock};
use ndarray::Array1;
use time::OffsetDateTime;

/// Calibrated samples of one channel from one capture.
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    pub channel: u8,
    /// Absolute time of sample 0.
    pub capture_start: OffsetDateTime,
    /// Seconds between samples, downsampling included.
    pub sample_interval: f64,
    /// Seconds since `capture_start`.
    pub time: Array1<f64>,
    pub volts: Array1<f64>,
    pub codes: Array1<i32>,
    pub coefficients: CalibrationCoefficients,
}

impl Waveform {
    pub fn len(&self) -> usize {
        self.volts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.volts.is_empty()
    }

    pub fn samples(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.time.iter().copied().zip(self.volts.iter().copied())
    }
}

/// Places `blocks` by their logical offsets and converts every code.
///
/// Blocks may arrive in any order but must tile `0..expected` exactly.
/// `time[i]` and `volts[i]` are computed from `i` and `codes[i]` alone.
pub fn reconstruct(
    channel: u8,
    blocks: &[RawSampleBlock],
    coefficients: CalibrationCoefficients,
    sample_interval: f64,
    capture_start: OffsetDateTime,
    expected: usize,
) -> Result<Waveform, AcqError> {
    let mut ordered: Vec<&RawSampleBlock> = blocks.iter().collect();
    ordered.sort_by_key(|b| b.offset);

    let mut codes = Vec::with_capacity(expected);
    for block in ordered {
        if block.channel != channel || block.offset != codes.len() {
            return Err(AcqError::IncompleteCapture {
                channel,
                expected,
                actual: codes.len(),
            });
        }
        codes.extend_from_slice(&block.codes);
    }
    if codes.len() != expected {
        return Err(AcqError::IncompleteCapture {
            channel,
            expected,
            actual: codes.len(),
        });
    }

    let codes = Array1::from(codes);
    let volts = codes.mapv(|c| coefficients.volts(c));
    let time = Array1::from_shape_fn(expected, |i| i as f64 * sample_interval);
    Ok(Waveform {
        channel,
        capture_start,
        sample_interval,
        time,
        volts,
        codes,
        coefficients,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const COEFFS: CalibrationCoefficients = CalibrationCoefficients {
        scale: 0.5,
        offset: -1.0,
    };

    fn block(offset: usize, codes: &[i32]) -> RawSampleBlock {
        RawSampleBlock {
            channel: 1,
            offset,
            codes: codes.to_vec(),
        }
    }

    #[test]
    fn concatenates_out_of_order_blocks() {
        let blocks = [block(3, &[6, 8]), block(0, &[0, 2, 4])];
        let wf = reconstruct(1, &blocks, COEFFS, 1e-3, OffsetDateTime::UNIX_EPOCH, 5).unwrap();
        assert_eq!(wf.codes.to_vec(), vec![0, 2, 4, 6, 8]);
        assert_eq!(wf.volts.to_vec(), vec![-1.0, 0.0, 1.0, 2.0, 3.0]);
        assert_eq!(wf.time[4], 4.0 * 1e-3);
        assert_eq!(wf.len(), 5);
    }

    #[test]
    fn gap_or_short_read_is_incomplete() {
        let gap = [block(0, &[1, 2]), block(3, &[4])];
        assert!(matches!(
            reconstruct(1, &gap, COEFFS, 1.0, OffsetDateTime::UNIX_EPOCH, 4),
            Err(AcqError::IncompleteCapture { channel: 1, expected: 4, actual: 2 })
        ));

        let short = [block(0, &[1, 2, 3])];
        assert!(matches!(
            reconstruct(1, &short, COEFFS, 1.0, OffsetDateTime::UNIX_EPOCH, 4),
            Err(AcqError::IncompleteCapture { actual: 3, .. })
        ));

        let long = [block(0, &[1, 2, 3, 4, 5])];
        assert!(reconstruct(1, &long, COEFFS, 1.0, OffsetDateTime::UNIX_EPOCH, 4).is_err());
    }

    #[test]
    fn timebase_does_not_accumulate_error() {
        let n = 100_000;
        let blocks = [block(0, &vec![0; n])];
        let dt = 1e-9 * 3.0;
        let wf = reconstruct(1, &blocks, COEFFS, dt, OffsetDateTime::UNIX_EPOCH, n).unwrap();
        assert_eq!(wf.time[n - 1], (n - 1) as f64 * dt);
    }
}
