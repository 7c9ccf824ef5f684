mod adc;
mod afe;
mod config;
mod digitizer;
mod error;
pub mod etherbone;
mod reader;
mod reconstruct;
pub mod regs;
mod sequencer;
mod sim;
mod sink;
mod transport;
mod udp;
#[cfg(feature = "hdf5")]
mod writer;

pub use adc::*;
pub use afe::*;
pub use config::*;
pub use digitizer::*;
pub use error::*;
pub use reader::*;
pub use reconstruct::*;
pub use sequencer::*;
pub use sim::*;
pub use sink::*;
pub use transport::*;
pub use udp::*;
#[cfg(feature = "hdf5")]
pub use writer::*;

use std::path::Path;

/// Builds the register map from the board description: the `csr.csv` export
/// first, then the inline `registers` table, which wins on conflicts.
pub fn load_register_map(board: &BoardSettings, base_dir: &Path) -> Result<RegisterMap, RegisterMapError> {
    let mut map = RegisterMap::new();
    if let Some(ref csv) = board.csr_csv {
        map = RegisterMap::from_csr_csv(&base_dir.join(csv))?;
    }
    if let Some(ref registers) = board.registers {
        map.extend(registers.iter().map(|(k, v)| (k.clone(), *v)));
    }
    Ok(map)
}
