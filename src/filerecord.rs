//! File-Record Service: dispatch for Modbus file read/write function codes
//! to a registered record I/O backend.
//!
//! Only `MODBUS_PACKET_FILE = 16` is predefined; a host that needs other
//! file types extends the type-code check in [`filetype_supported`] and the
//! framing in [`packet_file_read`]/[`packet_file_write`] alongside it.

use std::sync::{Mutex, OnceLock};

use crate::error::StoreError;

pub const MODBUS_PACKET_FILE: u8 = 16;

pub const FILE_REC_MAX_LEN: usize = 255;

/// A record read from or written to a packet file.
#[derive(Debug, Clone)]
pub struct PacketFileRecord {
    pub content: Vec<u8>,
    pub remaining_recs_num: u8,
}

/// Host-provided record I/O backend for one file type. Registered once per
/// type code via [`FileRecordRegistry::register`].
pub trait RecordIo: Send {
    fn read(&mut self, file_number: u16, rec_start: u8, rec_num: usize) -> Result<PacketFileRecord, StoreError>;
    fn write(&mut self, file_number: u16, rec_start: u8, rec_num: usize, record: &PacketFileRecord) -> Result<(), StoreError>;
}

/// Raised by [`FileRecordRegistry::register`] when a backend is already
/// installed for that type code. Registration reports success or failure
/// accurately — a second registration for the same type is the only failure
/// mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("a record I/O backend is already registered for file type {0}")]
pub struct AlreadyRegistered(pub u8);

/// Registry of record I/O backends, keyed by file type code.
///
/// One `Mutex<Option<Box<dyn RecordIo>>>` slot per predefined type; since the
/// only predefined type is `MODBUS_PACKET_FILE`, that is the only slot.
pub struct FileRecordRegistry {
    packet_file: Mutex<Option<Box<dyn RecordIo>>>,
}

static REGISTRY: OnceLock<FileRecordRegistry> = OnceLock::new();

impl FileRecordRegistry {
    fn global() -> &'static FileRecordRegistry {
        REGISTRY.get_or_init(|| FileRecordRegistry { packet_file: Mutex::new(None) })
    }

    /// Install a backend for `type_code`. One-shot: a second registration
    /// for the same type is rejected.
    pub fn register(type_code: u8, io: Box<dyn RecordIo>) -> Result<(), AlreadyRegistered> {
        if type_code != MODBUS_PACKET_FILE {
            return Err(AlreadyRegistered(type_code));
        }
        let mut slot = Self::global().packet_file.lock().unwrap();
        if slot.is_some() {
            return Err(AlreadyRegistered(type_code));
        }
        *slot = Some(io);
        Ok(())
    }

    fn with_backend<R>(type_code: u8, f: impl FnOnce(&mut dyn RecordIo) -> Result<R, StoreError>) -> Result<R, StoreError> {
        if type_code != MODBUS_PACKET_FILE {
            return Err(StoreError::Internal);
        }
        let mut slot = Self::global().packet_file.lock().unwrap();
        match slot.as_mut() {
            Some(backend) => f(backend.as_mut()),
            None => Err(StoreError::Internal),
        }
    }
}

/// Is a type code one the dispatch layer knows how to frame? Only
/// `MODBUS_PACKET_FILE` is predefined.
pub fn filetype_supported(type_code: u8) -> bool {
    type_code == MODBUS_PACKET_FILE
}

/// Packet-file read handler (type 16). Request layout: `[file_hi file_lo a b
/// c d]` (6 bytes). Returns the response body: `[remaining_recs_num,
/// content...]`.
pub fn packet_file_read(type_code: u8, req: &[u8]) -> Result<Vec<u8>, StoreError> {
    if req.len() != 6 {
        return Err(StoreError::DataValue);
    }

    let file_number = u16::from_be_bytes([req[0], req[1]]);
    let packet_id = if req[2] == 0xFF && req[3] == 0xFF { req[5] } else { 0xFF };

    let record = FileRecordRegistry::with_backend(type_code, |backend| backend.read(file_number, packet_id, 1))?;

    let mut response = Vec::with_capacity(1 + record.content.len());
    response.push(record.remaining_recs_num);
    response.extend_from_slice(&record.content);
    Ok(response)
}

/// Packet-file write handler. Request: 6-byte header then content. Returns
/// the fixed 6-byte response `[packet_id, file_hi, file_lo, 0, 0, 0]`.
pub fn packet_file_write(type_code: u8, req: &[u8]) -> Result<Vec<u8>, StoreError> {
    if req.len() < 6 {
        return Err(StoreError::DataValue);
    }

    let file_number = u16::from_be_bytes([req[0], req[1]]);
    let packet_id = if req[2] == 0xFF && req[3] == 0xFF { req[4] } else { 0xFF };

    let record = PacketFileRecord {
        content: req[6..].to_vec(),
        remaining_recs_num: req[5],
    };

    FileRecordRegistry::with_backend(type_code, |backend| backend.write(file_number, packet_id, 1, &record))?;

    Ok(vec![packet_id, (file_number >> 8) as u8, file_number as u8, 0, 0, 0])
}
