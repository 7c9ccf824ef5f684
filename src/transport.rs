use crate::{RegisterMapError, TransportError};
use log::debug;
use std::{collections::HashMap, path::Path};

/// Minimal contract the acquisition core needs from the remote register bus.
///
/// Calls are blocking with a bounded timeout. Failures are reported as
/// [`TransportError`] and are never retried here; retry policy belongs to callers.
pub trait RegisterBus: Send {
    fn read_register(&mut self, name: &str) -> Result<u32, TransportError>;

    fn write_register(&mut self, name: &str, value: u32) -> Result<(), TransportError>;

    /// Reads `len` bytes of sample memory starting at bus address `addr`.
    ///
    /// `len` must not exceed [`RegisterBus::max_burst`]; callers chunk larger reads.
    fn read_memory_burst(&mut self, addr: u32, len: usize) -> Result<Vec<u8>, TransportError>;

    fn max_burst(&self) -> usize;
}

impl RegisterBus for Box<dyn RegisterBus> {
    fn read_register(&mut self, name: &str) -> Result<u32, TransportError> {
        self.as_mut().read_register(name)
    }

    fn write_register(&mut self, name: &str, value: u32) -> Result<(), TransportError> {
        self.as_mut().write_register(name, value)
    }

    fn read_memory_burst(&mut self, addr: u32, len: usize) -> Result<Vec<u8>, TransportError> {
        self.as_mut().read_memory_burst(addr, len)
    }

    fn max_burst(&self) -> usize {
        self.as_ref().max_burst()
    }
}

/// Board-supplied name → bus address table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegisterMap {
    addresses: HashMap<String, u32>,
}

impl RegisterMap {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, addr: u32) {
        self.addresses.insert(name.into(), addr);
    }

    pub fn extend(&mut self, other: impl IntoIterator<Item = (String, u32)>) {
        self.addresses.extend(other);
    }

    pub fn resolve(&self, name: &str) -> Result<u32, TransportError> {
        self.addresses
            .get(name)
            .copied()
            .ok_or_else(|| TransportError::UnknownRegister(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// Loads the `csr_register` rows of a LiteX `csr.csv` export.
    pub fn from_csr_csv(path: &Path) -> Result<Self, RegisterMapError> {
        let reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .comment(Some(b'#'))
            .from_path(path)?;
        Self::from_csr_reader(reader)
    }

    fn from_csr_reader<R: std::io::Read>(
        mut reader: csv::Reader<R>,
    ) -> Result<Self, RegisterMapError> {
        let mut map = RegisterMap::new();
        for record in reader.records() {
            let record = record?;
            if record.get(0).map(str::trim) != Some("csr_register") {
                continue;
            }
            let (Some(name), Some(value)) = (record.get(1), record.get(2)) else {
                continue;
            };
            let name = name.trim();
            let addr = parse_address(value.trim()).ok_or_else(|| RegisterMapError::BadAddress {
                name: name.to_string(),
                value: value.to_string(),
            })?;
            map.insert(name, addr);
        }
        debug!("loaded {} csr registers", map.len());
        Ok(map)
    }
}

fn parse_address(value: &str) -> Option<u32> {
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}
