use crate::{
    regs, AcqError, AdcFormat, Bandwidth, BoardSettings, ChannelRequest, Coupling, Divider,
    GainEntry, RegisterBus,
};
use log::{debug, info};
use std::collections::BTreeMap;

/// `voltage = code * scale + offset`, fixed when the channel is configured.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationCoefficients {
    pub scale: f64,
    pub offset: f64,
}

impl CalibrationCoefficients {
    pub fn volts(&self, code: i32) -> f64 {
        code as f64 * self.scale + self.offset
    }
}

/// AFE state of one channel as last written to the hardware.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelConfig {
    pub id: u8,
    pub requested_range: f64,
    pub achieved_range: f64,
    pub center: bool,
    pub divider: Divider,
    pub coupling: Coupling,
    pub bandwidth: Bandwidth,
    pub frontend: u8,
    pub vga: u8,
    pub offset_dac: u16,
    pub coefficients: CalibrationCoefficients,
}

/// Computes and writes front-end, VGA and offset DAC settings per channel.
pub struct AfeConfigurator {
    format: AdcFormat,
    gains: Vec<GainEntry>,
    tolerance: f64,
    frontend_base: u8,
    dac_center: u16,
    dac_bottom: u16,
    num_channels: u8,
    channels: BTreeMap<u8, ChannelConfig>,
}

impl AfeConfigurator {
    pub fn new(board: &BoardSettings) -> Result<Self, AcqError> {
        Ok(Self {
            format: AdcFormat::from_board(board)?,
            gains: board.gain_table(),
            tolerance: board.range_tolerance,
            frontend_base: board.frontend_base,
            dac_center: board.offset_dac_center,
            dac_bottom: board.offset_dac_bottom,
            num_channels: board.num_channels,
            channels: BTreeMap::new(),
        })
    }

    pub fn channel(&self, id: u8) -> Option<&ChannelConfig> {
        self.channels.get(&id)
    }

    pub fn coefficients(&self, id: u8) -> Option<CalibrationCoefficients> {
        self.channels.get(&id).map(|c| c.coefficients)
    }

    pub fn configure_channel(
        &mut self,
        bus: &mut dyn RegisterBus,
        channel: u8,
        range: f64,
        center: bool,
        divider: Option<Divider>,
    ) -> Result<CalibrationCoefficients, AcqError> {
        let request = ChannelRequest {
            id: channel,
            range,
            center,
            divider,
            coupling: Coupling::Dc,
            bandwidth: Bandwidth::Full,
        };
        self.configure(bus, &request).map(|c| c.coefficients)
    }

    pub fn configure(
        &mut self,
        bus: &mut dyn RegisterBus,
        request: &ChannelRequest,
    ) -> Result<ChannelConfig, AcqError> {
        let channel = request.id;
        if channel >= self.num_channels {
            return Err(AcqError::InvalidRequest(format!(
                "channel {channel} does not exist (board has {})",
                self.num_channels
            )));
        }
        if !request.range.is_finite() || request.range <= 0.0 {
            return Err(AcqError::InvalidRequest(format!(
                "channel {channel}: voltage range must be positive, got {}",
                request.range
            )));
        }

        let gain = self.select_gain(channel, request.range, request.divider)?;
        let frontend = self.frontend_byte(gain.divider, request.coupling, request.bandwidth);
        let offset_dac = if request.center {
            self.dac_center
        } else {
            self.dac_bottom
        };
        let config = ChannelConfig {
            id: channel,
            requested_range: request.range,
            achieved_range: gain.range,
            center: request.center,
            divider: gain.divider,
            coupling: request.coupling,
            bandwidth: request.bandwidth,
            frontend,
            vga: gain.vga,
            offset_dac,
            coefficients: self.coefficients_for(gain.range, request.center),
        };

        bus.write_register(regs::OFFSET_DAC_CONTROL, regs::OFFSET_DAC_CONTROL_ENABLE)?;
        bus.write_register(&regs::frontend(channel), frontend as u32)?;
        bus.write_register(&regs::vga(channel), gain.vga as u32)?;
        bus.write_register(&regs::offset_dac(channel), offset_dac as u32)?;

        info!(
            "ch{channel}: {} V requested, {} V achieved ({} vga {:#04x}{}), {:e} V/code",
            request.range,
            gain.range,
            gain.divider,
            gain.vga,
            if request.center { ", centered" } else { "" },
            config.coefficients.scale
        );
        self.channels.insert(channel, config.clone());
        Ok(config)
    }

    fn select_gain(
        &self,
        channel: u8,
        range: f64,
        divider: Option<Divider>,
    ) -> Result<GainEntry, AcqError> {
        let relative_error = |g: &GainEntry| (g.range - range).abs() / range;
        let nearest = self
            .gains
            .iter()
            .filter(|g| divider.is_none_or(|d| g.divider == d))
            .min_by(|a, b| {
                relative_error(a)
                    .total_cmp(&relative_error(b))
                    // on a tie, prefer the wider range so the signal is not clipped
                    .then(b.range.total_cmp(&a.range))
            })
            .copied();

        match nearest {
            Some(gain) if relative_error(&gain) <= self.tolerance => {
                debug!("ch{channel}: {range} V -> {gain:?}");
                Ok(gain)
            }
            other => Err(AcqError::UnsupportedRange {
                channel,
                requested: range,
                nearest: other.map_or(f64::NAN, |g| g.range),
            }),
        }
    }

    fn frontend_byte(&self, divider: Divider, coupling: Coupling, bandwidth: Bandwidth) -> u8 {
        let mut value = self.frontend_base | regs::FRONTEND_VGA_ENABLE;
        value |= match divider {
            Divider::X1 => 0,
            Divider::X10 => regs::FRONTEND_10_1_FIRST_DIVIDER,
            Divider::X100 => regs::FRONTEND_10_1_FIRST_DIVIDER | regs::FRONTEND_10_1_SECOND_DIVIDER,
        };
        if coupling == Coupling::Dc {
            value |= regs::FRONTEND_DC_COUPLING;
        }
        if bandwidth == Bandwidth::Full {
            value |= regs::FRONTEND_FULL_BANDWIDTH;
        }
        value
    }

    /// Centered channels put 0 V at mid-scale; others put it at the bottom of the code range.
    fn coefficients_for(&self, range: f64, center: bool) -> CalibrationCoefficients {
        let scale = range / self.format.levels() as f64;
        let zero_code = if center {
            self.format.min_code() as f64 + self.format.levels() as f64 / 2.0
        } else {
            self.format.min_code() as f64
        };
        CalibrationCoefficients {
            scale,
            offset: -zero_code * scale,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use confique::Config;
    use crate::SimBoard;
    use rstest::rstest;

    fn board() -> BoardSettings {
        BoardSettings::builder().load().unwrap()
    }

    #[rstest]
    #[case(0.1, None, 0.1, Divider::X1)]
    #[case(4.5, None, 5.0, Divider::X10)]
    #[case(1.1, None, 1.0, Divider::X10)]
    #[case(0.12, None, 0.1, Divider::X1)]
    #[case(45.0, Some(Divider::X100), 50.0, Divider::X100)]
    fn picks_nearest_gain(
        #[case] range: f64,
        #[case] divider: Option<Divider>,
        #[case] achieved: f64,
        #[case] expected_divider: Divider,
    ) {
        let mut sim = SimBoard::new(&board()).unwrap();
        let mut afe = AfeConfigurator::new(&board()).unwrap();
        let request = ChannelRequest {
            id: 0,
            range,
            center: true,
            divider,
            coupling: Coupling::Dc,
            bandwidth: Bandwidth::Full,
        };
        let config = afe.configure(&mut sim, &request).unwrap();
        assert_eq!(config.achieved_range, achieved);
        assert_eq!(config.divider, expected_divider);
    }

    #[test]
    fn out_of_table_range_is_reported_not_clamped() {
        let mut sim = SimBoard::new(&board()).unwrap();
        let mut afe = AfeConfigurator::new(&board()).unwrap();
        let err = afe
            .configure_channel(&mut sim, 1, 400.0, false, None)
            .unwrap_err();
        assert!(matches!(
            err,
            AcqError::UnsupportedRange { channel: 1, requested, nearest }
                if requested == 400.0 && nearest == 50.0
        ));
        assert!(afe.channel(1).is_none());
        assert!(sim.writes().is_empty());
    }

    #[test]
    fn divider_override_restricts_choice() {
        let mut sim = SimBoard::new(&board()).unwrap();
        let mut afe = AfeConfigurator::new(&board()).unwrap();
        // 5 V is only reachable through /10.
        let err = afe
            .configure_channel(&mut sim, 0, 5.0, true, Some(Divider::X1))
            .unwrap_err();
        assert!(matches!(err, AcqError::UnsupportedRange { nearest, .. } if nearest == 0.5));
    }

    #[test]
    fn writes_frontend_vga_and_offset() {
        let mut sim = SimBoard::new(&board()).unwrap();
        let mut afe = AfeConfigurator::new(&board()).unwrap();
        let request = ChannelRequest {
            id: 2,
            range: 0.1,
            center: false,
            divider: None,
            coupling: Coupling::Ac,
            bandwidth: Bandwidth::Limit20Mhz,
        };
        afe.configure(&mut sim, &request).unwrap();
        assert_eq!(sim.register("offset_dac_control"), Some(1));
        assert_eq!(sim.register("frontend_ch2"), Some(0x40 | 0x10));
        assert_eq!(sim.register("vga_ch2"), Some(0xad));
        assert_eq!(sim.register("offset_dac_ch2"), Some(0x2600));

        afe.configure_channel(&mut sim, 0, 50.0, true, None).unwrap();
        assert_eq!(sim.register("frontend_ch0"), Some(0x7e));
        assert_eq!(sim.register("offset_dac_ch0"), Some(0x8000));
    }

    #[test]
    fn boundary_codes_round_trip() {
        let mut sim = SimBoard::new(&board()).unwrap();
        let mut afe = AfeConfigurator::new(&board()).unwrap();
        let coeffs = afe.configure_channel(&mut sim, 0, 5.0, true, None).unwrap();
        assert_eq!(coeffs.volts(0), -2.5);
        assert_eq!(coeffs.volts(128), 0.0);
        assert_eq!(coeffs.volts(255), 2.5 - 5.0 / 256.0);

        let coeffs = afe.configure_channel(&mut sim, 0, 5.0, false, None).unwrap();
        assert_eq!(coeffs.volts(0), 0.0);
        assert_eq!(coeffs.volts(255), 255.0 * 5.0 / 256.0);

        let mut signed = board();
        signed.adc_bits = 12;
        signed.adc_signed = true;
        let mut afe = AfeConfigurator::new(&signed).unwrap();
        let coeffs = afe.configure_channel(&mut sim, 0, 2.0, true, None).unwrap();
        assert_eq!(coeffs.volts(-2048), -1.0);
        assert_eq!(coeffs.volts(0), 0.0);
        assert_eq!(coeffs.volts(2047), 1.0 - 2.0 / 4096.0);
    }

    #[test]
    fn reconfiguring_identically_is_idempotent() {
        let mut sim = SimBoard::new(&board()).unwrap();
        let mut afe = AfeConfigurator::new(&board()).unwrap();
        let first = afe.configure_channel(&mut sim, 1, 2.0, true, None).unwrap();
        let registers = sim.registers();
        let writes = sim.writes();

        sim.clear_writes();
        let second = afe.configure_channel(&mut sim, 1, 2.0, true, None).unwrap();
        assert_eq!(first, second);
        assert_eq!(sim.registers(), registers);
        assert_eq!(sim.writes(), writes);
    }
}
