//! Central error/exception taxonomy.
//!
//! Two domains, per the protocol: transport-level [`LinkError`] (never
//! answered with a reply frame) and application-level [`ModbusException`]
//! (always answered with a two-byte exception PDU). [`StoreError`] is the
//! error type host [`crate::register::RegisterStore`] and
//! [`crate::filerecord::RecordIo`] implementations return; it converts
//! losslessly into a [`ModbusException`] at the dispatch boundary.

use thiserror::Error;

/// Transport-domain failures surfaced from [`crate::link::SerialLink::frame_delimited`].
///
/// None of these produce a reply frame — a malformed or foreign-address
/// frame is simply dropped, as Modbus RTU requires.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    #[error("frame too short or CRC mismatch")]
    Frame,
    #[error("frame addressed to a different slave")]
    Addr,
    #[error("unrecognized function code")]
    UnknownMessage,
}

/// Application-domain failure, reported to the master as a Modbus exception
/// response (function code with the high bit set, followed by this code).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModbusException {
    #[error("illegal function")]
    IllegalFunction,
    #[error("illegal data address")]
    IllegalDataAddress,
    #[error("illegal data value")]
    IllegalDataValue,
    #[error("server device failure")]
    ServerDeviceFailure,
    /// Any other exception code, including ones a host `RegisterStore` or
    /// `RecordIo` implementation invents for itself (the Modbus spec also
    /// reserves 6 for "server device busy" and 255 for "others").
    #[error("modbus exception {0}")]
    Other(u8),
}

impl ModbusException {
    /// The wire value placed after the function-code-with-high-bit-set byte.
    pub fn code(self) -> u8 {
        match self {
            ModbusException::IllegalFunction => 1,
            ModbusException::IllegalDataAddress => 2,
            ModbusException::IllegalDataValue => 3,
            ModbusException::ServerDeviceFailure => 4,
            ModbusException::Other(code) => code,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            1 => ModbusException::IllegalFunction,
            2 => ModbusException::IllegalDataAddress,
            3 => ModbusException::IllegalDataValue,
            4 => ModbusException::ServerDeviceFailure,
            other => ModbusException::Other(other),
        }
    }
}

/// Error returned by a host-provided [`crate::register::RegisterStore`] or
/// [`crate::filerecord::RecordIo`] callback.
///
/// Propagates verbatim into the response exception code, per spec: "errors
/// from the generic or override callback propagate verbatim as negative
/// codes".
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    #[error("no register at that address")]
    NotFound,
    #[error("value out of range")]
    DataValue,
    #[error("internal store failure")]
    Internal,
    #[error("store error {0}")]
    Other(u8),
}

impl From<StoreError> for ModbusException {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => ModbusException::IllegalDataAddress,
            StoreError::DataValue => ModbusException::IllegalDataValue,
            StoreError::Internal => ModbusException::ServerDeviceFailure,
            StoreError::Other(code) => ModbusException::Other(code),
        }
    }
}

/// Error from the value codec: the `(tag, size)` pair has no registered
/// encoder/decoder.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("unsupported register encoding (size {size})")]
pub struct CodecError {
    pub size: u8,
}
