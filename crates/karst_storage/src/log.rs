//! Change log records for the file engine.
//!
//! Every record is framed as:
//!
//! ```text
//! magic (4) | version u16 LE (2) | type u8 (1) | payload len u32 LE (4) | payload | crc32 u32 LE (4)
//! ```
//!
//! The checksum covers the payload. A commit record closes each batch;
//! records after the last commit marker are discarded on replay.

use crate::error::{StorageError, StorageResult};
use crate::memory::StagedOp;
use crate::row::StoredRow;

pub(crate) const LOG_MAGIC: [u8; 4] = *b"KLOG";
pub(crate) const LOG_VERSION: u16 = 1;

/// magic + version + type + payload length.
pub(crate) const RECORD_HEADER_LEN: usize = 11;
pub(crate) const CRC_LEN: usize = 4;

const TYPE_PUT: u8 = 1;
const TYPE_REMOVE: u8 = 2;
const TYPE_REMOVE_COLLECTION: u8 = 3;
const TYPE_COMMIT: u8 = 4;

/// One durable record in the change log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LogRecord {
    Put {
        collection: String,
        key: String,
        row: StoredRow,
    },
    Remove {
        collection: String,
        key: String,
    },
    RemoveCollection {
        collection: String,
    },
    /// Marks the end of a batch and the snapshot it published.
    Commit {
        snapshot: u64,
    },
}

impl LogRecord {
    pub(crate) fn from_staged(op: &StagedOp) -> Self {
        match op {
            StagedOp::Put {
                collection,
                key,
                row,
            } => LogRecord::Put {
                collection: collection.clone(),
                key: key.clone(),
                row: row.clone(),
            },
            StagedOp::Remove { collection, key } => LogRecord::Remove {
                collection: collection.clone(),
                key: key.clone(),
            },
            StagedOp::RemoveCollection { collection } => LogRecord::RemoveCollection {
                collection: collection.clone(),
            },
        }
    }

    /// Converts back into a staged operation; `None` for commit markers.
    pub(crate) fn into_staged(self) -> Option<StagedOp> {
        match self {
            LogRecord::Put {
                collection,
                key,
                row,
            } => Some(StagedOp::Put {
                collection,
                key,
                row,
            }),
            LogRecord::Remove { collection, key } => Some(StagedOp::Remove { collection, key }),
            LogRecord::RemoveCollection { collection } => {
                Some(StagedOp::RemoveCollection { collection })
            }
            LogRecord::Commit { .. } => None,
        }
    }

    fn type_code(&self) -> u8 {
        match self {
            LogRecord::Put { .. } => TYPE_PUT,
            LogRecord::Remove { .. } => TYPE_REMOVE,
            LogRecord::RemoveCollection { .. } => TYPE_REMOVE_COLLECTION,
            LogRecord::Commit { .. } => TYPE_COMMIT,
        }
    }

    /// Appends the framed record to `buffer`.
    pub(crate) fn encode(&self, buffer: &mut Vec<u8>) {
        let mut payload = Vec::new();
        match self {
            LogRecord::Put {
                collection,
                key,
                row,
            } => {
                write_str(&mut payload, collection);
                write_str(&mut payload, key);
                write_bytes(&mut payload, &row.object);
                match &row.metadata {
                    Some(metadata) => {
                        payload.push(1);
                        write_bytes(&mut payload, metadata);
                    }
                    None => payload.push(0),
                }
            }
            LogRecord::Remove { collection, key } => {
                write_str(&mut payload, collection);
                write_str(&mut payload, key);
            }
            LogRecord::RemoveCollection { collection } => {
                write_str(&mut payload, collection);
            }
            LogRecord::Commit { snapshot } => {
                payload.extend_from_slice(&snapshot.to_le_bytes());
            }
        }

        buffer.extend_from_slice(&LOG_MAGIC);
        buffer.extend_from_slice(&LOG_VERSION.to_le_bytes());
        buffer.push(self.type_code());
        buffer.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buffer.extend_from_slice(&payload);
        buffer.extend_from_slice(&crc32(&payload).to_le_bytes());
    }

    /// Decodes one record from the front of `data`.
    ///
    /// Returns the record and the number of bytes consumed, or `None`
    /// when `data` is empty. Any malformed or truncated framing is an
    /// error; the caller decides whether that means a torn tail.
    pub(crate) fn decode(data: &[u8]) -> StorageResult<Option<(LogRecord, usize)>> {
        if data.is_empty() {
            return Ok(None);
        }
        if data.len() < RECORD_HEADER_LEN {
            return Err(StorageError::corrupted("truncated record header"));
        }
        if data[..4] != LOG_MAGIC {
            return Err(StorageError::corrupted("bad record magic"));
        }
        let version = u16::from_le_bytes([data[4], data[5]]);
        if version != LOG_VERSION {
            return Err(StorageError::corrupted(format!(
                "unsupported log version {version}"
            )));
        }
        let type_code = data[6];
        let payload_len = u32::from_le_bytes([data[7], data[8], data[9], data[10]]) as usize;
        let total = RECORD_HEADER_LEN + payload_len + CRC_LEN;
        if data.len() < total {
            return Err(StorageError::corrupted("truncated record body"));
        }

        let payload = &data[RECORD_HEADER_LEN..RECORD_HEADER_LEN + payload_len];
        let stored_crc = u32::from_le_bytes([
            data[total - 4],
            data[total - 3],
            data[total - 2],
            data[total - 1],
        ]);
        if crc32(payload) != stored_crc {
            return Err(StorageError::corrupted("record checksum mismatch"));
        }

        let mut reader = PayloadReader::new(payload);
        let record = match type_code {
            TYPE_PUT => {
                let collection = reader.read_str()?;
                let key = reader.read_str()?;
                let object = reader.read_bytes()?;
                let metadata = match reader.read_u8()? {
                    0 => None,
                    1 => Some(reader.read_bytes()?),
                    flag => {
                        return Err(StorageError::corrupted(format!(
                            "invalid metadata flag {flag}"
                        )))
                    }
                };
                LogRecord::Put {
                    collection,
                    key,
                    row: StoredRow { object, metadata },
                }
            }
            TYPE_REMOVE => LogRecord::Remove {
                collection: reader.read_str()?,
                key: reader.read_str()?,
            },
            TYPE_REMOVE_COLLECTION => LogRecord::RemoveCollection {
                collection: reader.read_str()?,
            },
            TYPE_COMMIT => LogRecord::Commit {
                snapshot: reader.read_u64()?,
            },
            other => {
                return Err(StorageError::corrupted(format!(
                    "unknown record type {other}"
                )))
            }
        };
        if !reader.is_empty() {
            return Err(StorageError::corrupted("trailing bytes in record payload"));
        }
        Ok(Some((record, total)))
    }
}

fn write_str(buffer: &mut Vec<u8>, value: &str) {
    write_bytes(buffer, value.as_bytes());
}

fn write_bytes(buffer: &mut Vec<u8>, value: &[u8]) {
    buffer.extend_from_slice(&(value.len() as u32).to_le_bytes());
    buffer.extend_from_slice(value);
}

struct PayloadReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos == self.data.len()
    }

    fn take(&mut self, len: usize) -> StorageResult<&'a [u8]> {
        if self.data.len() - self.pos < len {
            return Err(StorageError::corrupted("record payload too short"));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_u8(&mut self) -> StorageResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> StorageResult<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_u64(&mut self) -> StorageResult<u64> {
        let bytes = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(raw))
    }

    fn read_bytes(&mut self) -> StorageResult<Vec<u8>> {
        let len = self.read_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn read_str(&mut self) -> StorageResult<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes).map_err(|_| StorageError::corrupted("record string not UTF-8"))
    }
}

/// CRC-32 (IEEE), bit-reflected.
pub(crate) fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        crc ^= u32::from(byte);
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
        }
    }
    !crc
}
