//! Message framing
//!
//! Frame format: [BINCODE PAYLOAD][CRC32 of payload, little-endian]

use crate::common::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

const CRC_LEN: usize = 4;

pub fn encode<T: Serialize>(message: &T) -> Result<Bytes> {
    let payload = bincode::serialize(message)?;
    let mut frame = BytesMut::with_capacity(payload.len() + CRC_LEN);
    frame.put_slice(&payload);
    frame.put_u32_le(crc32fast::hash(&payload));
    Ok(frame.freeze())
}

pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> Result<T> {
    if frame.len() < CRC_LEN {
        return Err(Error::Corrupted(format!(
            "frame too short: {} bytes",
            frame.len()
        )));
    }

    let (payload, trailer) = frame.split_at(frame.len() - CRC_LEN);
    let mut crc = [0u8; CRC_LEN];
    crc.copy_from_slice(trailer);
    let expected = u32::from_le_bytes(crc);
    let actual = crc32fast::hash(payload);
    if expected != actual {
        return Err(Error::Corrupted(format!(
            "checksum mismatch: expected {:08x}, got {:08x}",
            expected, actual
        )));
    }

    Ok(bincode::deserialize(payload)?)
}
