//! Logical register names used by the host, and the bit fields inside them.
//!
//! Addresses are never defined here: the board's [`crate::RegisterMap`] resolves
//! every name to a bus address.

pub const OFFSET_DAC_CONTROL: &str = "offset_dac_control";
pub const ADC_DOWNSAMPLING: &str = "adc_downsampling";
pub const TRIGGER_CONTROL: &str = "trigger_control";
pub const CAPTURE_CHANNELS: &str = "capture_channels";
pub const CAPTURE_LENGTH: &str = "capture_length";
pub const CAPTURE_CONTROL: &str = "capture_control";
pub const CAPTURE_STATUS: &str = "capture_status";
pub const DMA_READER_ENABLE: &str = "dma_upload_dma_reader_enable";
pub const DMA_READER_BASE: &str = "dma_upload_dma_reader_base";
pub const DMA_READER_LENGTH: &str = "dma_upload_dma_reader_length";

pub const OFFSET_DAC_CONTROL_ENABLE: u32 = 1 << 0;
pub const TRIGGER_CONTROL_ENABLE: u32 = 1 << 0;
pub const CAPTURE_CONTROL_START: u32 = 1 << 0;
pub const CAPTURE_STATUS_DONE: u32 = 1 << 0;
pub const CAPTURE_STATUS_OVERRUN: u32 = 1 << 1;

pub const ADC_CONTROL_FRAME_RST: u32 = 1 << 0;
pub const ADC_CONTROL_STAT_RST: u32 = 1 << 3;

// Front-end relay/switch byte.
pub const FRONTEND_10_1_FIRST_DIVIDER: u8 = 1 << 1;
pub const FRONTEND_10_1_SECOND_DIVIDER: u8 = 1 << 2;
pub const FRONTEND_DC_COUPLING: u8 = 1 << 3;
pub const FRONTEND_VGA_ENABLE: u8 = 1 << 4;
pub const FRONTEND_FULL_BANDWIDTH: u8 = 1 << 5;

pub fn frontend(channel: u8) -> String {
    format!("frontend_ch{channel}")
}

pub fn vga(channel: u8) -> String {
    format!("vga_ch{channel}")
}

pub fn offset_dac(channel: u8) -> String {
    format!("offset_dac_ch{channel}")
}

/// Next physical write index (in samples) of a channel's ring region.
pub fn write_pointer(channel: u8) -> String {
    format!("capture_wr_ptr_ch{channel}")
}

/// Free-running count of samples written into a channel's ring region.
pub fn write_count(channel: u8) -> String {
    format!("capture_count_ch{channel}")
}

pub fn adc_control(channel: u8) -> String {
    format!("adc{channel}_control")
}

pub fn adc_range(channel: u8) -> String {
    format!("adc{channel}_range")
}

pub fn adc_count(channel: u8) -> String {
    format!("adc{channel}_count")
}
