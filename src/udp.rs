use crate::etherbone::{self, MAX_RECORD_WORDS};
use crate::{regs, RegisterBus, RegisterMap, TransportError, TransportSettings, UploadMode};
use log::{debug, info, warn};
use std::{
    io,
    net::{SocketAddr, ToSocketAddrs, UdpSocket},
    time::{Duration, Instant},
};

const RECV_BUFFER: usize = 9000;

/// Remote register bus reached with Etherbone over UDP.
pub struct UdpBus {
    remote: SocketAddr,
    socket: UdpSocket,
    data_socket: Option<UdpSocket>,
    map: RegisterMap,
    max_burst: usize,
    upload_mode: UploadMode,
    timeout: Duration,
    next_tag: u32,
    buffer: Vec<u8>,
}

impl UdpBus {
    pub fn open(settings: &TransportSettings, map: RegisterMap) -> Result<Self, TransportError> {
        let remote = (settings.host.as_str(), settings.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                TransportError::Protocol(format!("cannot resolve {}", settings.host))
            })?;
        let timeout = Duration::from_millis(settings.timeout_ms.max(1));

        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        socket.connect(remote)?;
        socket.set_read_timeout(Some(timeout))?;

        let data_socket = match settings.upload_mode {
            UploadMode::Dma => {
                let data = UdpSocket::bind(("0.0.0.0", settings.data_port))?;
                data.set_read_timeout(Some(timeout))?;
                Some(data)
            }
            UploadMode::Etherbone => None,
        };
        let max_burst = match settings.upload_mode {
            UploadMode::Etherbone => settings.max_burst.min(4 * MAX_RECORD_WORDS),
            UploadMode::Dma => settings.max_burst,
        };

        info!(
            "register bus open: {remote} ({} registers, {:?} upload, {max_burst} byte bursts)",
            map.len(),
            settings.upload_mode
        );
        Ok(Self {
            remote,
            socket,
            data_socket,
            map,
            max_burst,
            upload_mode: settings.upload_mode,
            timeout,
            next_tag: 1,
            buffer: vec![0; RECV_BUFFER],
        })
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Every read carries a fresh tag. Replies to earlier reads that timed out
    /// arrive with an old tag and are dropped.
    fn read_words(&mut self, addrs: &[u32]) -> Result<Vec<u32>, TransportError> {
        let tag = self.next_tag;
        self.next_tag = self.next_tag.wrapping_add(1).max(1);
        self.socket.send(&etherbone::encode_read(tag, addrs))?;

        let deadline = Instant::now() + self.timeout;
        loop {
            let n = self
                .socket
                .recv(&mut self.buffer)
                .map_err(|e| timeout_or_io(e, "register read", addrs[0]))?;
            let response = etherbone::decode_read_response(&self.buffer[..n])?;
            if response.tag == tag {
                if response.words.len() != addrs.len() {
                    return Err(TransportError::Protocol(format!(
                        "expected {} words, device returned {}",
                        addrs.len(),
                        response.words.len()
                    )));
                }
                return Ok(response.words);
            }
            warn!("dropping late reply {} (waiting for {tag})", response.tag);
            if Instant::now() >= deadline {
                return Err(TransportError::Timeout {
                    op: "register read",
                    addr: addrs[0],
                });
            }
        }
    }

    fn write_word(&mut self, addr: u32, value: u32) -> Result<(), TransportError> {
        self.socket.send(&etherbone::encode_write(addr, &[value]))?;
        Ok(())
    }

    fn etherbone_burst(&mut self, addr: u32, len: usize) -> Result<Vec<u8>, TransportError> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let first = addr & !3;
        let last = (addr as u64 + len as u64).div_ceil(4) as u32 * 4;
        let addrs: Vec<u32> = (first..last).step_by(4).collect();

        let mut bytes = Vec::with_capacity(addrs.len() * 4);
        for chunk in addrs.chunks(MAX_RECORD_WORDS) {
            for word in self.read_words(chunk)? {
                bytes.extend_from_slice(&word.to_le_bytes());
            }
        }
        let skip = (addr - first) as usize;
        Ok(bytes[skip..skip + len].to_vec())
    }

    fn dma_burst(&mut self, addr: u32, len: usize) -> Result<Vec<u8>, TransportError> {
        let enable = self.map.resolve(regs::DMA_READER_ENABLE)?;
        let base = self.map.resolve(regs::DMA_READER_BASE)?;
        let length = self.map.resolve(regs::DMA_READER_LENGTH)?;
        self.write_word(enable, 0)?;
        self.write_word(base, addr)?;
        self.write_word(length, len as u32)?;
        self.write_word(enable, 1)?;

        let Some(data) = self.data_socket.as_ref() else {
            return Err(TransportError::Protocol("dma upload socket not open".into()));
        };
        let mut bytes = Vec::with_capacity(len);
        while bytes.len() < len {
            let n = data
                .recv(&mut self.buffer)
                .map_err(|e| timeout_or_io(e, "dma upload", addr))?;
            bytes.extend_from_slice(&self.buffer[..n]);
        }
        if bytes.len() != len {
            return Err(TransportError::Protocol(format!(
                "dma upload returned {} bytes, {len} requested",
                bytes.len()
            )));
        }
        Ok(bytes)
    }
}

impl RegisterBus for UdpBus {
    fn read_register(&mut self, name: &str) -> Result<u32, TransportError> {
        let addr = self.map.resolve(name)?;
        let value = self.read_words(&[addr])?[0];
        debug!("rd {name} [{addr:#010x}] = {value:#x}");
        Ok(value)
    }

    fn write_register(&mut self, name: &str, value: u32) -> Result<(), TransportError> {
        let addr = self.map.resolve(name)?;
        debug!("wr {name} [{addr:#010x}] <- {value:#x}");
        self.write_word(addr, value)
    }

    fn read_memory_burst(&mut self, addr: u32, len: usize) -> Result<Vec<u8>, TransportError> {
        if len > self.max_burst {
            return Err(TransportError::BurstTooLarge {
                len,
                max: self.max_burst,
            });
        }
        match self.upload_mode {
            UploadMode::Etherbone => self.etherbone_burst(addr, len),
            UploadMode::Dma => self.dma_burst(addr, len),
        }
    }

    fn max_burst(&self) -> usize {
        self.max_burst
    }
}

fn timeout_or_io(e: io::Error, op: &'static str, addr: u32) -> TransportError {
    match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => TransportError::Timeout { op, addr },
        _ => TransportError::Io(e),
    }
}
