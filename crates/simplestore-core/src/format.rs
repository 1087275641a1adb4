//! Binary format definitions for SimpleStore WAL batches
//!
//! One committed transaction is one batch. A batch is replayed whole or not
//! at all, which is what makes a commit atomic across crashes.
//!
//! BatchHeader (16 bytes) + op_count(u32) + op records
//! op record: operation(u8) + padding(u8) + table_len(u16) + key_len(u16) + value_len(u32) + table + key + value

use std::path::PathBuf;

use crate::error::{StoreError, StoreResult};

/// Magic bytes identifying SimpleStore WAL batches: "SSTW"
pub const MAGIC_ARRAY: [u8; 4] = [0x53, 0x53, 0x54, 0x57];

/// Current batch format version
pub const FORMAT_VERSION: u8 = 1;

/// Header size in bytes
pub const HEADER_SIZE: usize = 16;

/// Fixed part of each op record
const OP_HEADER_SIZE: usize = 10;

/// Maximum table name length in bytes
pub const MAX_TABLE_NAME: usize = 255;

/// Hard ceiling for a value, independent of `Config::max_value_size`
pub const MAX_VALUE_SIZE: usize = 128 * 1024 * 1024;

/// WAL operation types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Operation {
    /// Replace every record under a key with one value
    Put = 1,
    /// Append a duplicate record under a key
    PutDup = 2,
    /// Remove a key and all of its duplicates
    Delete = 3,
}

impl Operation {
    fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Operation::Put),
            2 => Some(Operation::PutDup),
            3 => Some(Operation::Delete),
            _ => None,
        }
    }
}

/// A single logged mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalOp {
    pub operation: Operation,
    pub table: String,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl WalOp {
    pub fn put(table: &str, key: &[u8], value: &[u8]) -> Self {
        Self { operation: Operation::Put, table: table.to_string(), key: key.to_vec(), value: value.to_vec() }
    }

    pub fn put_dup(table: &str, key: &[u8], value: &[u8]) -> Self {
        Self { operation: Operation::PutDup, table: table.to_string(), key: key.to_vec(), value: value.to_vec() }
    }

    pub fn delete(table: &str, key: &[u8]) -> Self {
        Self { operation: Operation::Delete, table: table.to_string(), key: key.to_vec(), value: Vec::new() }
    }

    fn encoded_len(&self) -> usize {
        OP_HEADER_SIZE + self.table.len() + self.key.len() + self.value.len()
    }
}

/// Fixed-size header for each WAL batch
///
/// Layout:
///   [0..4]   magic:    [u8;4] - "SSTW"
///   [4..8]   length:   u32    - payload length in bytes
///   [8..12]  checksum: u32    - CRC32C of payload bytes
///   [12]     version:  u8
///   [13..16] reserved: [u8;3]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchHeader {
    pub magic: [u8; 4],
    pub length: u32,
    pub checksum: u32,
    pub version: u8,
}

impl BatchHeader {
    pub fn new(length: u32, checksum: u32) -> Self {
        Self { magic: MAGIC_ARRAY, length, checksum, version: FORMAT_VERSION }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic);
        buf[4..8].copy_from_slice(&self.length.to_le_bytes());
        buf[8..12].copy_from_slice(&self.checksum.to_le_bytes());
        buf[12] = self.version;
        buf
    }

    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Self {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[0..4]);
        Self {
            magic,
            length: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            checksum: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            version: bytes[12],
        }
    }
}

/// A decoded batch
#[derive(Debug, Clone)]
pub struct WalBatch {
    pub header: BatchHeader,
    pub ops: Vec<WalOp>,
}

fn buffer_path() -> PathBuf {
    PathBuf::from("<buffer>")
}

/// Serialize a list of operations into one checksummed batch.
pub fn serialize_batch(ops: &[WalOp]) -> StoreResult<Vec<u8>> {
    // Validate sizes before allocating anything proportional to them
    for op in ops {
        if op.table.len() > MAX_TABLE_NAME {
            return Err(StoreError::OversizedEntry {
                entry_size: op.table.len() as u64,
                max_size: MAX_TABLE_NAME as u64,
                component: "table name".to_string(),
            });
        }
        if op.key.len() > u16::MAX as usize {
            return Err(StoreError::OversizedEntry {
                entry_size: op.key.len() as u64,
                max_size: u16::MAX as u64,
                component: "key".to_string(),
            });
        }
        if op.value.len() > MAX_VALUE_SIZE {
            return Err(StoreError::OversizedEntry {
                entry_size: op.value.len() as u64,
                max_size: MAX_VALUE_SIZE as u64,
                component: "value".to_string(),
            });
        }
    }

    let payload_size = 4 + ops.iter().map(WalOp::encoded_len).sum::<usize>();
    let mut payload = Vec::with_capacity(payload_size);
    payload.extend_from_slice(&(ops.len() as u32).to_le_bytes());
    for op in ops {
        payload.push(op.operation as u8);
        payload.push(0);
        payload.extend_from_slice(&(op.table.len() as u16).to_le_bytes());
        payload.extend_from_slice(&(op.key.len() as u16).to_le_bytes());
        payload.extend_from_slice(&(op.value.len() as u32).to_le_bytes());
        payload.extend_from_slice(op.table.as_bytes());
        payload.extend_from_slice(&op.key);
        payload.extend_from_slice(&op.value);
    }

    let checksum = crc32c::crc32c(&payload);
    let header = BatchHeader::new(payload.len() as u32, checksum);

    let mut buffer = Vec::with_capacity(HEADER_SIZE + payload.len());
    buffer.extend_from_slice(&header.to_bytes());
    buffer.extend_from_slice(&payload);
    Ok(buffer)
}

/// Deserialize one batch from the start of `data`.
pub fn deserialize_batch(data: &[u8]) -> StoreResult<WalBatch> {
    if data.len() < HEADER_SIZE {
        return Err(StoreError::WalCorrupted {
            path: buffer_path(),
            offset: 0,
            reason: format!("Batch too short: {} bytes, need at least {}", data.len(), HEADER_SIZE),
        });
    }

    let mut header_bytes = [0u8; HEADER_SIZE];
    header_bytes.copy_from_slice(&data[..HEADER_SIZE]);
    let header = BatchHeader::from_bytes(&header_bytes);

    if header.magic != MAGIC_ARRAY {
        return Err(StoreError::NoMagicFound {
            path: buffer_path(),
            offset: 0,
            found_bytes: header.magic,
        });
    }
    if header.version != FORMAT_VERSION {
        return Err(StoreError::WalCorrupted {
            path: buffer_path(),
            offset: 12,
            reason: format!("Unsupported batch version {}", header.version),
        });
    }

    let payload_end = HEADER_SIZE + header.length as usize;
    if data.len() < payload_end {
        return Err(StoreError::TornWrite {
            path: buffer_path(),
            expected_size: header.length,
            available_bytes: (data.len() - HEADER_SIZE) as u64,
            offset: HEADER_SIZE as u64,
        });
    }

    let payload = &data[HEADER_SIZE..payload_end];
    let computed = crc32c::crc32c(payload);
    if computed != header.checksum {
        return Err(StoreError::ChecksumMismatch {
            path: buffer_path(),
            expected: header.checksum,
            actual: computed,
            offset: HEADER_SIZE as u64,
        });
    }

    let corrupted = |offset: usize, reason: String| StoreError::WalCorrupted {
        path: buffer_path(),
        offset: (HEADER_SIZE + offset) as u64,
        reason,
    };

    if payload.len() < 4 {
        return Err(corrupted(0, "Payload too short for op count".to_string()));
    }
    let op_count = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;

    let mut ops = Vec::with_capacity(op_count.min(payload.len() / OP_HEADER_SIZE));
    let mut pos = 4;
    for _ in 0..op_count {
        if payload.len() < pos + OP_HEADER_SIZE {
            return Err(corrupted(pos, "Payload too short for op header".to_string()));
        }
        let h = &payload[pos..pos + OP_HEADER_SIZE];
        let operation = Operation::from_u8(h[0])
            .ok_or_else(|| corrupted(pos, format!("Invalid operation type: {}", h[0])))?;
        let table_len = u16::from_le_bytes([h[2], h[3]]) as usize;
        let key_len = u16::from_le_bytes([h[4], h[5]]) as usize;
        let value_len = u32::from_le_bytes([h[6], h[7], h[8], h[9]]) as usize;

        let table_start = pos + OP_HEADER_SIZE;
        let key_start = table_start + table_len;
        let value_start = key_start + key_len;
        let end = value_start + value_len;
        if payload.len() < end {
            return Err(corrupted(pos, format!(
                "Payload too short: need {} bytes for table({}) + key({}) + value({})",
                end, table_len, key_len, value_len
            )));
        }

        let table = std::str::from_utf8(&payload[table_start..key_start])
            .map_err(|_| corrupted(table_start, "Table name is not UTF-8".to_string()))?
            .to_string();

        ops.push(WalOp {
            operation,
            table,
            key: payload[key_start..value_start].to_vec(),
            value: payload[value_start..end].to_vec(),
        });
        pos = end;
    }

    Ok(WalBatch { header, ops })
}
