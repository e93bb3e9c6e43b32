//! C ABI surface: the serial link and frame I/O only. Register table
//! construction stays in safe Rust (a `RegisterDescriptor` literal array
//! isn't something that can be handed across an FFI boundary without a much
//! larger surface the rest of this crate doesn't need) — an embedding Rust
//! crate calls [`install_descriptors`] once at startup, then the C host
//! drives the link purely through `modbus_slave_*` calls.
//!
//! A `#[repr(C)]` struct of callback function pointers implements the
//! context trait, and a thin wrapper struct is boxed and handed to the C
//! side as an opaque pointer.

use std::sync::OnceLock;

use log::error;

use crate::codec::{RegValue, ValueTag};
use crate::error::StoreError;
use crate::link::{LinkContext, SerialLink};
use crate::register::{RegisterDescriptor, RegisterStore, RegisterTable};

/// A [`RegValue`] shaped for the C ABI: exactly one of `int_value`/
/// `float_value` is meaningful, selected by `tag` (`0` = integer, `1` =
/// float).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct FfiRegValue {
    pub tag: u8,
    pub int_value: i32,
    pub float_value: f32,
}

impl From<RegValue> for FfiRegValue {
    fn from(value: RegValue) -> Self {
        match value {
            RegValue::Integer(n) => FfiRegValue { tag: 0, int_value: n, float_value: 0.0 },
            RegValue::Float(f) => FfiRegValue { tag: 1, int_value: 0, float_value: f },
        }
    }
}

impl FfiRegValue {
    fn into_regvalue(self, tag: ValueTag) -> RegValue {
        match tag {
            ValueTag::Integer => RegValue::Integer(self.int_value),
            ValueTag::Float => RegValue::Float(self.float_value),
        }
    }
}

fn tag_to_u8(tag: ValueTag) -> u8 {
    match tag {
        ValueTag::Integer => 0,
        ValueTag::Float => 1,
    }
}

fn store_error_from_code(code: i32) -> StoreError {
    match code {
        -2 => StoreError::DataValue,
        -3 => StoreError::Internal,
        0 => unreachable!("zero is success, callers must not map it to an error"),
        other => StoreError::Other((-other) as u8),
    }
}

type LoadCallback = unsafe extern "C" fn(reference: u16, tag: u8, out_value: *mut FfiRegValue) -> i32;
type SaveCallback = unsafe extern "C" fn(reference: u16, value: FfiRegValue) -> i32;
type SendFrameCallback = unsafe extern "C" fn(buffer: *const u8, len: usize);

/// Host-provided load/save callbacks, given C ABI shapes. Implements
/// [`RegisterStore`] by forwarding each call across the boundary.
#[repr(C)]
pub struct FfiStoreCallbacks {
    load_cb: LoadCallback,
    save_cb: SaveCallback,
}

impl RegisterStore for FfiStoreCallbacks {
    fn load(&mut self, reference: u16, tag: ValueTag) -> Result<RegValue, StoreError> {
        let mut out = FfiRegValue { tag: 0, int_value: 0, float_value: 0.0 };
        let code = unsafe { (self.load_cb)(reference, tag_to_u8(tag), &mut out as *mut FfiRegValue) };
        if code == 0 {
            Ok(out.into_regvalue(tag))
        } else {
            Err(store_error_from_code(code))
        }
    }

    fn save(&mut self, reference: u16, value: RegValue) -> Result<(), StoreError> {
        let code = unsafe { (self.save_cb)(reference, value.into()) };
        if code == 0 {
            Ok(())
        } else {
            Err(store_error_from_code(code))
        }
    }
}

/// Host-provided send callback, given a C ABI shape. Implements
/// [`LinkContext`].
#[repr(C)]
pub struct FfiLinkContext {
    send_cb: SendFrameCallback,
}

impl LinkContext for FfiLinkContext {
    fn send_frame(&mut self, frame: &[u8]) {
        unsafe { (self.send_cb)(frame.as_ptr(), frame.len()) }
    }
}

type ConcreteLink = SerialLink<FfiStoreCallbacks, FfiLinkContext>;

static DESCRIPTORS: OnceLock<&'static [RegisterDescriptor]> = OnceLock::new();

/// Install the register descriptor table a [`modbus_slave_create`] call will
/// build its [`RegisterTable`] over. Called once, from Rust, by the crate
/// embedding this library as a `staticlib` — never from the C side.
///
/// Returns `false` if a table was already installed.
pub fn install_descriptors(descriptors: &'static [RegisterDescriptor]) -> bool {
    DESCRIPTORS.set(descriptors).is_ok()
}

/// Opaque handle returned to the C caller.
pub struct ModbusSlaveHandle {
    link: ConcreteLink,
}

/// Create a slave link for `slave_id`, backed by the descriptor table
/// previously installed via [`install_descriptors`]. Returns null if no
/// table has been installed.
#[no_mangle]
pub extern "C" fn modbus_slave_create(
    slave_id: u8, load_cb: LoadCallback, save_cb: SaveCallback, send_cb: SendFrameCallback,
) -> *mut ModbusSlaveHandle {
    let Some(descriptors) = DESCRIPTORS.get().copied() else {
        error!("modbus_slave_create: no register descriptor table installed");
        return std::ptr::null_mut();
    };

    let store = FfiStoreCallbacks { load_cb, save_cb };
    let table = RegisterTable::new(descriptors, store);
    let context = FfiLinkContext { send_cb };
    let handle = ModbusSlaveHandle { link: SerialLink::new(slave_id, table, context) };
    Box::into_raw(Box::new(handle))
}

/// # Safety
/// `handle` must be a pointer returned by [`modbus_slave_create`] and not
/// already destroyed.
#[no_mangle]
pub unsafe extern "C" fn modbus_slave_destroy(handle: *mut ModbusSlaveHandle) {
    if !handle.is_null() {
        drop(Box::from_raw(handle));
    }
}

/// # Safety
/// `handle` must be a live pointer from [`modbus_slave_create`].
#[no_mangle]
pub unsafe extern "C" fn modbus_slave_set_send_frame_cb(handle: *mut ModbusSlaveHandle, send_cb: SendFrameCallback) {
    if let Some(handle) = handle.as_mut() {
        handle.link.set_context(FfiLinkContext { send_cb });
    }
}

/// # Safety
/// `handle` must be a live pointer from [`modbus_slave_create`].
#[no_mangle]
pub unsafe extern "C" fn modbus_slave_set_slave_id(handle: *mut ModbusSlaveHandle, slave_id: u8) {
    if let Some(handle) = handle.as_mut() {
        handle.link.set_slave_id(slave_id);
    }
}

/// # Safety
/// `handle` must be a live pointer from [`modbus_slave_create`].
#[no_mangle]
pub unsafe extern "C" fn modbus_slave_putchar(handle: *mut ModbusSlaveHandle, byte: u8) {
    if let Some(handle) = handle.as_mut() {
        handle.link.putchar(byte);
    }
}

/// Drain the receive buffer, validate and dispatch the frame, send the
/// response. Returns `0` on success, or a negative code identifying why the
/// frame was dropped (`-1` = frame too short/bad CRC, `-2` = wrong slave
/// address).
///
/// # Safety
/// `handle` must be a live pointer from [`modbus_slave_create`].
#[no_mangle]
pub unsafe extern "C" fn modbus_slave_frame_delimited(handle: *mut ModbusSlaveHandle) -> i32 {
    let Some(handle) = handle.as_mut() else { return -1 };
    match handle.link.frame_delimited() {
        Ok(()) => 0,
        Err(crate::error::LinkError::Frame) => -1,
        Err(crate::error::LinkError::Addr) => -2,
        Err(crate::error::LinkError::UnknownMessage) => -3,
    }
}
