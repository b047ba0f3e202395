//! Loggable definitions
//!
//! Defines the structure of individual log records and their framing.

use bytes::{Buf, BufMut, Bytes};

use crate::error::{LogTreeError, Result};

/// Frame header: type (1) + structure id (4) + payload length (4)
pub const HEADER_SIZE: usize = 9;

/// Trailing CRC32 over header and payload
pub const CRC_SIZE: usize = 4;

/// Bytes a frame adds around its payload
pub const FRAME_OVERHEAD: usize = HEADER_SIZE + CRC_SIZE;

/// Maximum payload size (16 MB)
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Structure id of records that belong to no tree (database roots)
pub const NO_STRUCTURE_ID: u32 = 0;

/// Kinds of records stored in the log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LoggableType {
    /// Database root record: points at the meta tree
    DatabaseRoot = 1,

    /// B-tree leaf node
    LeafNode = 2,

    /// B-tree internal node
    InternalNode = 3,
}

impl TryFrom<u8> for LoggableType {
    type Error = LogTreeError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(LoggableType::DatabaseRoot),
            2 => Ok(LoggableType::LeafNode),
            3 => Ok(LoggableType::InternalNode),
            other => Err(LogTreeError::Corruption(format!(
                "unknown loggable type {}",
                other
            ))),
        }
    }
}

/// A single immutable record in the log
#[derive(Debug, Clone, PartialEq)]
pub struct Loggable {
    /// Address of the first byte of the frame
    pub address: u64,

    /// What the payload encodes
    pub loggable_type: LoggableType,

    /// Owning structure (tree), `NO_STRUCTURE_ID` for roots
    pub structure_id: u32,

    /// Record payload
    pub data: Bytes,
}

impl Loggable {
    /// Full frame length in bytes
    pub fn length(&self) -> u64 {
        (FRAME_OVERHEAD + self.data.len()) as u64
    }

    /// Address right after this frame
    pub fn end_address(&self) -> u64 {
        self.address + self.length()
    }

    pub fn expired(&self) -> ExpiredLoggable {
        ExpiredLoggable {
            address: self.address,
            length: self.length(),
        }
    }
}

/// A superseded record, reported to the utilization profile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiredLoggable {
    pub address: u64,
    pub length: u64,
}

impl ExpiredLoggable {
    pub fn new(address: u64, length: u64) -> Self {
        Self { address, length }
    }
}

/// Encode a complete frame
pub(crate) fn encode_frame(loggable_type: LoggableType, structure_id: u32, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAME_OVERHEAD + payload.len());
    frame.put_u8(loggable_type as u8);
    frame.put_u32_le(structure_id);
    frame.put_u32_le(payload.len() as u32);
    frame.put_slice(payload);
    let crc = crc32fast::hash(&frame);
    frame.put_u32_le(crc);
    frame
}

/// Parsed frame header. `None` means the bytes are padding.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FrameHeader {
    pub loggable_type: LoggableType,
    pub structure_id: u32,
    pub payload_len: usize,
}

impl FrameHeader {
    pub(crate) fn parse(mut header: &[u8]) -> Result<Option<Self>> {
        if header.len() < HEADER_SIZE {
            return Err(LogTreeError::Corruption(format!(
                "truncated loggable header: {} bytes",
                header.len()
            )));
        }
        let raw_type = header.get_u8();
        if raw_type == 0 {
            return Ok(None);
        }
        let loggable_type = LoggableType::try_from(raw_type)?;
        let structure_id = header.get_u32_le();
        let payload_len = header.get_u32_le() as usize;
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(LogTreeError::Corruption(format!(
                "loggable payload length {} exceeds maximum",
                payload_len
            )));
        }
        Ok(Some(Self {
            loggable_type,
            structure_id,
            payload_len,
        }))
    }

    pub(crate) fn frame_len(&self) -> usize {
        FRAME_OVERHEAD + self.payload_len
    }
}

/// Decode a frame from a buffer that holds it entirely (header included)
pub(crate) fn decode_frame(address: u64, header: FrameHeader, frame: &[u8]) -> Result<Loggable> {
    let frame_len = header.frame_len();
    if frame.len() < frame_len {
        return Err(LogTreeError::Corruption(format!(
            "truncated loggable at {}: need {} bytes, have {}",
            address,
            frame_len,
            frame.len()
        )));
    }
    let body = &frame[..frame_len - CRC_SIZE];
    let mut crc_bytes = &frame[frame_len - CRC_SIZE..frame_len];
    let stored = crc_bytes.get_u32_le();
    let computed = crc32fast::hash(body);
    if stored != computed {
        return Err(LogTreeError::Corruption(format!(
            "CRC mismatch at address {}: stored {:08x}, computed {:08x}",
            address, stored, computed
        )));
    }
    Ok(Loggable {
        address,
        loggable_type: header.loggable_type,
        structure_id: header.structure_id,
        data: Bytes::copy_from_slice(&body[HEADER_SIZE..]),
    })
}
