//! Application Dispatch: PDU parsing, function routing, exception emission.
//!
//! Routing is table-driven over `(code, handler)` pairs rather than a fixed
//! match, so adding a function code is a matter of extending the table via
//! [`Dispatcher::with_handlers`] instead of editing the dispatch logic.

use crate::error::ModbusException;
use crate::filerecord;
use crate::register::{FindOptions, RegisterStore, RegisterTable};

const COILS_REF_FIRST: u16 = 1;
const DISCRETE_INPUT_REF_FIRST: u16 = 10001;
const HOLDING_REGS_REF_FIRST: u16 = 40001;
const REGISTER_SIZE: usize = 2;

pub const FUNC_READ_COILS: u8 = 1;
pub const FUNC_READ_DISCRETE_INPUTS: u8 = 2;
pub const FUNC_READ_HOLDING_REGS: u8 = 3;
pub const FUNC_WRITE_SINGLE_REGISTER: u8 = 6;
pub const FUNC_WRITE_MULTIPLE_REGISTERS: u8 = 16;
pub const FUNC_READ_FILE: u8 = 20;
pub const FUNC_WRITE_FILE: u8 = 21;

type Handler<S> = fn(&mut RegisterTable<S>, u8, &[u8]) -> Result<Vec<u8>, ModbusException>;

/// Routes PDUs to a function-code handler and turns any failure into a
/// two-byte Modbus exception response. One instance wraps one
/// [`RegisterTable`]; function-code routing itself is shared, stateless data
/// (`&'static [(u8, Handler<S>)]`).
pub struct Dispatcher<S: RegisterStore + 'static> {
    handlers: &'static [(u8, Handler<S>)],
}

impl<S: RegisterStore + 'static> Default for Dispatcher<S> {
    fn default() -> Self {
        Dispatcher {
            handlers: &[
                (FUNC_READ_COILS, read_coils_handler as Handler<S>),
                (FUNC_READ_DISCRETE_INPUTS, read_coils_handler as Handler<S>),
                (FUNC_READ_HOLDING_REGS, read_holding_regs_handler as Handler<S>),
                (FUNC_WRITE_SINGLE_REGISTER, write_single_register_handler as Handler<S>),
                (FUNC_WRITE_MULTIPLE_REGISTERS, write_multiple_registers_handler as Handler<S>),
                (FUNC_READ_FILE, read_file_handler as Handler<S>),
                (FUNC_WRITE_FILE, write_file_handler as Handler<S>),
            ],
        }
    }
}

impl<S: RegisterStore + 'static> Dispatcher<S> {
    /// Build a dispatcher over a caller-supplied handler table, for
    /// extending with additional function codes.
    pub fn with_handlers(handlers: &'static [(u8, Handler<S>)]) -> Self {
        Dispatcher { handlers }
    }

    /// Handle one request PDU (`pdu[0]` is the function code) against
    /// `registers`, producing a response PDU (either the normal response or
    /// a two-byte exception PDU — both are "successful" returns; there is no
    /// transport-level failure from this layer).
    pub fn dispatch(&self, registers: &mut RegisterTable<S>, pdu: &[u8]) -> Vec<u8> {
        let Some(&function) = pdu.first() else {
            return exception_response(0, ModbusException::IllegalFunction);
        };
        let body = &pdu[1..];

        match self.handlers.iter().find(|(code, _)| *code == function) {
            Some((_, handler)) => match handler(registers, function, body) {
                Ok(response) => response,
                Err(exception) => exception_response(function, exception),
            },
            None => exception_response(function, ModbusException::IllegalFunction),
        }
    }
}

fn exception_response(function: u8, exception: ModbusException) -> Vec<u8> {
    vec![function | 0x80, exception.code()]
}

fn read_u16(body: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([body[offset], body[offset + 1]])
}

/// Shared by function 1 (coils) and function 2 (discrete inputs): `ref_hi
/// ref_lo cnt_hi cnt_lo` -> `byte_count` then packed bits, LSB-first within
/// each byte.
fn read_coils_handler<S: RegisterStore>(
    registers: &mut RegisterTable<S>, function: u8, body: &[u8],
) -> Result<Vec<u8>, ModbusException> {
    if body.len() != 4 {
        return Err(ModbusException::IllegalDataValue);
    }

    let ref_start = read_u16(body, 0);
    let count = read_u16(body, 2);
    let family_base = if function == FUNC_READ_COILS { COILS_REF_FIRST } else { DISCRETE_INPUT_REF_FIRST };

    let mut bytes = Vec::new();
    load_bitmap(registers, ref_start.wrapping_add(family_base), count, &mut bytes)?;

    let mut response = Vec::with_capacity(2 + bytes.len());
    response.push(function);
    response.push(bytes.len() as u8);
    response.extend_from_slice(&bytes);
    Ok(response)
}

/// Walk `count` coils starting at `start`, packing them LSB-first into
/// `out`, advancing a byte every 8 bits.
fn load_bitmap<S: RegisterStore>(
    registers: &mut RegisterTable<S>, start: u16, count: u16, out: &mut Vec<u8>,
) -> Result<(), ModbusException> {
    let mut reference = start;
    let mut remaining = count;
    let mut bit_offset: u8 = 0;

    if remaining > 0 {
        out.push(0);
    }

    while remaining > 0 {
        let (_, value, mut bits_available) = registers
            .read(reference, FindOptions { bitmap: true })
            .map_err(ModbusException::from)?;
        let mut bits = value.as_i32();

        while bits_available > 0 && remaining > 0 {
            if bits & 1 != 0 {
                *out.last_mut().unwrap() |= 1 << bit_offset;
            }
            bit_offset += 1;
            if bit_offset == 8 {
                bit_offset = 0;
                out.push(0);
            }
            bits >>= 1;
            bits_available -= 1;
            remaining -= 1;
            reference += 1;
        }
    }

    // A trailing zero byte is always queued up for the next bit; drop it if
    // the last bit landed exactly on a byte boundary.
    if bit_offset == 0 && out.last() == Some(&0) && !out.is_empty() {
        let consumed_bytes = (count as usize + 7) / 8;
        out.truncate(consumed_bytes);
    }

    Ok(())
}

fn read_holding_regs_handler<S: RegisterStore>(
    registers: &mut RegisterTable<S>, function: u8, body: &[u8],
) -> Result<Vec<u8>, ModbusException> {
    if body.len() != 4 {
        return Err(ModbusException::IllegalDataValue);
    }

    let ref_start = read_u16(body, 0);
    let count = read_u16(body, 2);
    let mem_len = count as usize * REGISTER_SIZE;

    let mut data = vec![0u8; mem_len];
    load_registers(registers, ref_start.wrapping_add(HOLDING_REGS_REF_FIRST), &mut data)?;

    let mut response = Vec::with_capacity(2 + mem_len);
    response.push(function);
    response.push(mem_len as u8);
    response.extend_from_slice(&data);
    Ok(response)
}

/// Walk `buf` register by register, encoding each into it.
fn load_registers<S: RegisterStore>(registers: &mut RegisterTable<S>, start: u16, buf: &mut [u8]) -> Result<(), ModbusException> {
    let mut reference = start;
    let mut offset = 0usize;

    while offset < buf.len() {
        let descriptor = registers.find(reference, FindOptions::default()).ok_or(ModbusException::IllegalDataAddress)?;
        let span = descriptor.size as usize * REGISTER_SIZE;
        if offset + span > buf.len() {
            return Err(ModbusException::IllegalDataAddress);
        }

        registers.read_encoded(reference, &mut buf[offset..offset + span]).map_err(ModbusException::from)?;
        offset += span;
        reference += descriptor.size as u16;
    }

    Ok(())
}

/// Walk `buf` register by register, decoding and writing each.
fn store_registers<S: RegisterStore>(registers: &mut RegisterTable<S>, start: u16, buf: &[u8]) -> Result<(), ModbusException> {
    let mut reference = start;
    let mut offset = 0usize;

    while offset < buf.len() {
        let descriptor = registers.find(reference, FindOptions::default()).ok_or(ModbusException::IllegalDataAddress)?;
        let span = descriptor.size as usize * REGISTER_SIZE;
        if offset + span > buf.len() {
            return Err(ModbusException::IllegalDataAddress);
        }

        registers.write_encoded(reference, &buf[offset..offset + span]).map_err(ModbusException::from)?;
        offset += span;
        reference += descriptor.size as u16;
    }

    Ok(())
}

fn write_single_register_handler<S: RegisterStore>(
    registers: &mut RegisterTable<S>, function: u8, body: &[u8],
) -> Result<Vec<u8>, ModbusException> {
    if body.len() < 4 {
        return Err(ModbusException::IllegalDataValue);
    }

    let ref_start = read_u16(body, 0);
    store_registers(registers, ref_start.wrapping_add(HOLDING_REGS_REF_FIRST), &body[2..4])?;

    Ok(vec![function, body[0], body[1], body[2], body[3]])
}

fn write_multiple_registers_handler<S: RegisterStore>(
    registers: &mut RegisterTable<S>, function: u8, body: &[u8],
) -> Result<Vec<u8>, ModbusException> {
    if body.len() < 5 {
        return Err(ModbusException::IllegalDataValue);
    }

    let ref_start = read_u16(body, 0);
    let count = read_u16(body, 2);
    let byte_count = body[4] as usize;

    if body.len() < 5 + byte_count || byte_count != count as usize * REGISTER_SIZE {
        return Err(ModbusException::IllegalDataValue);
    }

    store_registers(registers, ref_start.wrapping_add(HOLDING_REGS_REF_FIRST), &body[5..5 + byte_count])?;

    Ok(vec![function, body[0], body[1], body[2], body[3]])
}

fn read_file_handler<S: RegisterStore>(_registers: &mut RegisterTable<S>, function: u8, body: &[u8]) -> Result<Vec<u8>, ModbusException> {
    if body.len() < 2 {
        return Err(ModbusException::IllegalDataValue);
    }

    // body[0] is the wire req_len: the type byte plus the payload that follows it.
    if body[0] as usize != body.len() - 1 {
        return Err(ModbusException::IllegalDataValue);
    }

    let type_code = body[1];
    if !filerecord::filetype_supported(type_code) {
        return Err(ModbusException::IllegalDataAddress);
    }

    let payload = filerecord::packet_file_read(type_code, &body[2..]).map_err(ModbusException::from)?;
    if payload.len() > 255 {
        return Err(ModbusException::ServerDeviceFailure);
    }

    let mut response = Vec::with_capacity(2 + payload.len());
    response.push(function);
    response.push(payload.len() as u8);
    response.extend_from_slice(&payload);
    Ok(response)
}

fn write_file_handler<S: RegisterStore>(_registers: &mut RegisterTable<S>, function: u8, body: &[u8]) -> Result<Vec<u8>, ModbusException> {
    if body.len() < 2 {
        return Err(ModbusException::IllegalDataValue);
    }

    // body[0] is the wire req_len: the type byte plus the payload that follows it.
    if body[0] as usize != body.len() - 1 {
        return Err(ModbusException::IllegalDataValue);
    }

    let type_code = body[1];
    if !filerecord::filetype_supported(type_code) {
        return Err(ModbusException::IllegalDataAddress);
    }

    let payload = filerecord::packet_file_write(type_code, &body[2..]).map_err(ModbusException::from)?;
    if payload.len() > 255 {
        return Err(ModbusException::ServerDeviceFailure);
    }

    let mut response = Vec::with_capacity(2 + payload.len());
    response.push(function);
    response.push(payload.len() as u8);
    response.extend_from_slice(&payload);
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{RegValue, ValueTag};
    use crate::error::StoreError;
    use crate::register::{Permission, Ref, RegisterDescriptor};
    use std::collections::HashMap;

    struct MapStore(HashMap<Ref, RegValue>);

    impl RegisterStore for MapStore {
        fn load(&mut self, reference: Ref, tag: ValueTag) -> Result<RegValue, StoreError> {
            self.0.get(&reference).copied().ok_or(StoreError::Internal).or_else(|_| {
                Ok(match tag {
                    ValueTag::Integer => RegValue::Integer(0),
                    ValueTag::Float => RegValue::Float(0.0),
                })
            })
        }

        fn save(&mut self, reference: Ref, value: RegValue) -> Result<(), StoreError> {
            self.0.insert(reference, value);
            Ok(())
        }
    }

    static HOLDING: [RegisterDescriptor; 1] =
        [RegisterDescriptor::new(40001, 1, ValueTag::Integer, 0, Permission::READ_WRITE)];

    static COILS: [RegisterDescriptor; 1] = [RegisterDescriptor::new(1, 8, ValueTag::Integer, 0, Permission::READ)];

    fn holding_table() -> RegisterTable<MapStore> {
        let mut store = HashMap::new();
        store.insert(40001, RegValue::Integer(0x1234));
        RegisterTable::new(&HOLDING, MapStore(store))
    }

    #[test]
    fn read_holding_register_happy_path() {
        let mut table = holding_table();
        let dispatcher = Dispatcher::default();
        let response = dispatcher.dispatch(&mut table, &[0x03, 0x00, 0x00, 0x00, 0x01]);
        assert_eq!(response, vec![0x03, 0x02, 0x12, 0x34]);
    }

    #[test]
    fn write_single_register() {
        let mut table = RegisterTable::new(&HOLDING, MapStore(HashMap::new()));
        let dispatcher = Dispatcher::default();
        let response = dispatcher.dispatch(&mut table, &[0x06, 0x00, 0x00, 0xAB, 0xCD]);
        assert_eq!(response, vec![0x06, 0x00, 0x00, 0xAB, 0xCD]);
        let (_, value, _) = table.read(40001, FindOptions::default()).unwrap();
        assert_eq!(value, RegValue::Integer(0xABCDu16 as i16 as i32));
    }

    #[test]
    fn unknown_function() {
        let mut table = holding_table();
        let dispatcher = Dispatcher::default();
        let response = dispatcher.dispatch(&mut table, &[0x09, 0x00, 0x00]);
        assert_eq!(response, vec![0x89, 0x01]);
    }

    #[test]
    fn illegal_address() {
        let mut table = holding_table();
        let dispatcher = Dispatcher::default();
        let response = dispatcher.dispatch(&mut table, &[0x03, 0x00, 0x09, 0x00, 0x01]);
        assert_eq!(response, vec![0x83, 0x02]);
    }

    #[test]
    fn range_checked_write_is_rejected() {
        use crate::register::RegisterBounds;
        static BOUNDED: [RegisterDescriptor; 1] = [RegisterDescriptor::new(
            40001,
            1,
            ValueTag::Integer,
            0,
            Permission::READ_WRITE,
        )
        .with_bounds(RegisterBounds { min: Some(0.0), max: None })];
        let mut table = RegisterTable::new(&BOUNDED, MapStore(HashMap::new()));
        let dispatcher = Dispatcher::default();
        let response = dispatcher.dispatch(&mut table, &[0x06, 0x00, 0x00, 0xFF, 0xFF]);
        assert_eq!(response, vec![0x86, 0x03]);
    }

    #[test]
    fn coil_read() {
        let mut store = HashMap::new();
        store.insert(1, RegValue::Integer(0xA5));
        let mut table = RegisterTable::new(&COILS, MapStore(store));
        let dispatcher = Dispatcher::default();
        let response = dispatcher.dispatch(&mut table, &[0x01, 0x00, 0x00, 0x00, 0x08]);
        assert_eq!(response, vec![0x01, 0x01, 0xA5]);
    }

    #[test]
    fn bitmap_packing_is_lsb_first() {
        let mut out = Vec::new();
        let mut store = HashMap::new();
        store.insert(1, RegValue::Integer(0b0000_0110));
        let mut table = RegisterTable::new(&COILS, MapStore(store));
        load_bitmap(&mut table, 1, 3, &mut out).unwrap();
        assert_eq!(out, vec![0b0000_0110]);
    }
}
