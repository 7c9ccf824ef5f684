use crate::{SinkError, Waveform, WaveformSink};
use hdf5::{File, Group};
use log::info;
use std::path::Path;

/// HDF5Sink writes one group per channel (`ch0`, `ch1`, ...) holding
/// `time`, `volts` and `codes` datasets plus the calibration as attributes.
pub struct Hdf5Sink {
    pub file: File,
    channels: usize,
}

impl Hdf5Sink {
    pub fn create(path: &Path) -> Result<Self, SinkError> {
        let file = File::create(path)?;
        Ok(Self { file, channels: 0 })
    }

    fn write_attr<T: hdf5::H5Type>(group: &Group, name: &str, value: &T) -> Result<(), SinkError> {
        group.new_attr::<T>().create(name)?.write_scalar(value)?;
        Ok(())
    }
}

impl WaveformSink for Hdf5Sink {
    fn emit(&mut self, waveform: Waveform) -> Result<(), SinkError> {
        let group = self.file.create_group(&format!("ch{}", waveform.channel))?;
        let n = waveform.len();

        let time = group.new_dataset::<f64>().shape(n).create("time")?;
        time.write(&waveform.time)?;
        let volts = group.new_dataset::<f64>().shape(n).create("volts")?;
        volts.write(&waveform.volts)?;
        let codes = group.new_dataset::<i32>().shape(n).create("codes")?;
        codes.write(&waveform.codes)?;

        Self::write_attr(&group, "sample_interval", &waveform.sample_interval)?;
        Self::write_attr(
            &group,
            "capture_start_ns",
            &(waveform.capture_start.unix_timestamp_nanos() as i64),
        )?;
        Self::write_attr(&group, "scale", &waveform.coefficients.scale)?;
        Self::write_attr(&group, "offset", &waveform.coefficients.offset)?;
        self.channels += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        self.file.flush()?;
        info!("wrote {} channel(s) to {}", self.channels, self.file.filename());
        Ok(())
    }
}
