//! Modbus RTU slave core: application dispatch, register model and serial
//! link state machine, embeddable into non-Rust firmware through [`ffi`].

pub mod app;
pub mod codec;
pub mod crc;
pub mod error;
pub mod ffi;
pub mod filerecord;
pub mod link;
pub mod register;
