//! Etherbone packet codec (single record per packet, 32-bit addresses and data).

use crate::TransportError;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

pub const MAGIC: u16 = 0x4e6f;
pub const VERSION: u8 = 1;
/// Most words a single record can read or write.
pub const MAX_RECORD_WORDS: usize = 255;

const HEADER_LEN: usize = 8;
const RECORD_HEADER_LEN: usize = 4;
const SIZES_32BIT: u8 = 0x44;
const BYTE_ENABLE: u8 = 0x0f;

fn packet(wcount: u8, rcount: u8) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + RECORD_HEADER_LEN + 4 * (1 + wcount.max(rcount) as usize));
    // Writes into a Vec cannot fail.
    let _ = buf.write_u16::<BigEndian>(MAGIC);
    buf.push(VERSION << 4);
    buf.push(SIZES_32BIT);
    buf.extend_from_slice(&[0; 4]);
    buf.push(0);
    buf.push(BYTE_ENABLE);
    buf.push(wcount);
    buf.push(rcount);
    buf
}

/// Encodes a write of consecutive words starting at `addr`.
pub fn encode_write(addr: u32, data: &[u32]) -> Vec<u8> {
    assert!(data.len() <= MAX_RECORD_WORDS, "too many words in one record");
    let mut buf = packet(data.len() as u8, 0);
    let _ = buf.write_u32::<BigEndian>(addr);
    for &word in data {
        let _ = buf.write_u32::<BigEndian>(word);
    }
    buf
}

/// Encodes a read of the given word addresses. The device writes the values
/// back to `tag` (the base return address), so the reply carries it.
pub fn encode_read(tag: u32, addrs: &[u32]) -> Vec<u8> {
    assert!(addrs.len() <= MAX_RECORD_WORDS, "too many words in one record");
    let mut buf = packet(0, addrs.len() as u8);
    let _ = buf.write_u32::<BigEndian>(tag);
    for &addr in addrs {
        let _ = buf.write_u32::<BigEndian>(addr);
    }
    buf
}

/// Write-back record the device answers a read with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadResponse {
    pub tag: u32,
    pub words: Vec<u32>,
}

pub fn decode_read_response(buf: &[u8]) -> Result<ReadResponse, TransportError> {
    let mut cursor = Cursor::new(buf);
    let short = |_| TransportError::Protocol(format!("etherbone packet truncated at {} bytes", buf.len()));

    let magic = cursor.read_u16::<BigEndian>().map_err(short)?;
    if magic != MAGIC {
        return Err(TransportError::Protocol(format!("bad etherbone magic {magic:#06x}")));
    }
    let version = cursor.read_u8().map_err(short)? >> 4;
    if version != VERSION {
        return Err(TransportError::Protocol(format!("unsupported etherbone version {version}")));
    }
    cursor.set_position(HEADER_LEN as u64);

    let _flags = cursor.read_u8().map_err(short)?;
    let _byte_enable = cursor.read_u8().map_err(short)?;
    let wcount = cursor.read_u8().map_err(short)? as usize;
    let _rcount = cursor.read_u8().map_err(short)?;
    let tag = cursor.read_u32::<BigEndian>().map_err(short)?;
    let words = (0..wcount)
        .map(|_| cursor.read_u32::<BigEndian>().map_err(short))
        .collect::<Result<_, _>>()?;
    Ok(ReadResponse { tag, words })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_packet_layout() {
        let pkt = encode_write(0xf000_1000, &[0xdead_beef]);
        assert_eq!(
            pkt,
            vec![
                0x4e, 0x6f, 0x10, 0x44, 0, 0, 0, 0, // header
                0x00, 0x0f, 0x01, 0x00, // record
                0xf0, 0x00, 0x10, 0x00, // base write address
                0xde, 0xad, 0xbe, 0xef,
            ]
        );
    }

    #[test]
    fn read_packet_layout() {
        let pkt = encode_read(7, &[0x10, 0x14]);
        assert_eq!(&pkt[8..12], &[0x00, 0x0f, 0x00, 0x02]);
        assert_eq!(&pkt[12..16], &[0, 0, 0, 7]);
        assert_eq!(&pkt[16..], &[0, 0, 0, 0x10, 0, 0, 0, 0x14]);
    }

    #[test]
    fn decodes_read_response() {
        // A device answers with a write record carrying the data.
        let response = encode_write(9, &[1, 0x8000_0000]);
        assert_eq!(
            decode_read_response(&response).unwrap(),
            ReadResponse {
                tag: 9,
                words: vec![1, 0x8000_0000]
            }
        );
    }

    #[test]
    fn rejects_bad_responses() {
        let mut response = encode_write(0, &[1]);
        response[0] = 0;
        assert!(decode_read_response(&response).is_err());
        assert!(decode_read_response(&encode_write(0, &[1, 2])[..18]).is_err());
    }
}
