//! Register model: an address-indexed table of typed, permission-tagged,
//! scaled register descriptors, delegating load/save to a host-provided
//! [`RegisterStore`].
//!
//! The address space is sparse and host-defined rather than a fixed layout,
//! so lookup is a linear scan over a `&'static` descriptor slice instead of a
//! `match` over compile-time offsets.

use bitflags::bitflags;

use crate::codec::{self, RegValue, ValueTag};
use crate::error::StoreError;

/// Absolute Modbus reference address (e.g. `40001`).
pub type Ref = u16;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Permission: u8 {
        const WRITE = 0b01;
        const READ  = 0b10;
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

/// Lookup options for [`RegisterTable::find`]/[`RegisterTable::read`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FindOptions {
    /// Treat `ref` as falling anywhere inside `[descriptor.reference,
    /// descriptor.reference + descriptor.size)` — the coil/discrete-input
    /// addressing mode — instead of requiring an exact match.
    pub bitmap: bool,
}

/// Inclusive value bounds enforced on write, when present.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegisterBounds {
    pub min: Option<f32>,
    pub max: Option<f32>,
}

type ReadOverride = fn(&RegisterDescriptor) -> Result<RegValue, StoreError>;
type WriteOverride = fn(&RegisterDescriptor, RegValue) -> Result<(), StoreError>;

/// An immutable register descriptor. Program-lifetime; the embedding
/// application builds a `&'static [RegisterDescriptor]` and hands it to
/// [`RegisterTable::new`].
#[derive(Debug, Clone, Copy)]
pub struct RegisterDescriptor {
    pub reference: Ref,
    /// Number of consecutive refs this descriptor spans; only `1` or `2` map
    /// to a codec entry.
    pub size: u8,
    pub tag: ValueTag,
    /// Two's-complement scale in `[-16, 15]`: `wire = host / 10^scale`.
    pub scale: i8,
    pub permission: Permission,
    pub bounds: Option<RegisterBounds>,
    pub read_override: Option<ReadOverride>,
    pub write_override: Option<WriteOverride>,
    pub description: &'static str,
    pub group: &'static str,
}

impl RegisterDescriptor {
    pub const fn new(reference: Ref, size: u8, tag: ValueTag, scale: i8, permission: Permission) -> Self {
        RegisterDescriptor {
            reference,
            size,
            tag,
            scale,
            permission,
            bounds: None,
            read_override: None,
            write_override: None,
            description: "",
            group: "",
        }
    }

    pub const fn with_bounds(mut self, bounds: RegisterBounds) -> Self {
        self.bounds = Some(bounds);
        self
    }

    pub const fn with_description(mut self, description: &'static str, group: &'static str) -> Self {
        self.description = description;
        self.group = group;
        self
    }

    pub const fn with_overrides(mut self, read: Option<ReadOverride>, write: Option<WriteOverride>) -> Self {
        self.read_override = read;
        self.write_override = write;
        self
    }
}

/// Decode the five-bit two's-complement scale field used when a descriptor
/// table is built from raw bytes instead of Rust source (e.g. loaded from
/// flash). `16..=31` map to `-16..=-1`.
pub fn scale_from_five_bits(raw: u8) -> i8 {
    let raw = raw & 0x1F;
    if raw >= 16 {
        (raw as i8) - 32
    } else {
        raw as i8
    }
}

/// Host-provided backing store: reads and writes a register's live value.
/// Installed once via [`RegisterTable::new`] — ownership replaces the C
/// global callback pair, since nothing in safe Rust has ambient mutable
/// globals.
pub trait RegisterStore {
    fn load(&mut self, reference: Ref, tag: ValueTag) -> Result<RegValue, StoreError>;
    fn save(&mut self, reference: Ref, value: RegValue) -> Result<(), StoreError>;
}

/// The register map: a static descriptor table plus the store it reads and
/// writes through.
pub struct RegisterTable<S: RegisterStore> {
    descriptors: &'static [RegisterDescriptor],
    store: S,
}

impl<S: RegisterStore> RegisterTable<S> {
    pub fn new(descriptors: &'static [RegisterDescriptor], store: S) -> Self {
        RegisterTable { descriptors, store }
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Find the descriptor covering `reference`, per `options`.
    pub fn find(&self, reference: Ref, options: FindOptions) -> Option<&'static RegisterDescriptor> {
        if options.bitmap {
            self.descriptors
                .iter()
                .find(|d| reference >= d.reference && reference < d.reference + d.size as u16)
        } else {
            self.descriptors.iter().find(|d| d.reference == reference)
        }
    }

    /// Read the register at `reference`. Returns the matched descriptor, the
    /// value read, and the number of refs the read consumed (for `bitmap`
    /// reads, the remaining bit capacity of the matched descriptor).
    pub fn read(
        &mut self, reference: Ref, options: FindOptions,
    ) -> Result<(&'static RegisterDescriptor, RegValue, u16), StoreError> {
        let descriptor = self.find(reference, options).ok_or(StoreError::NotFound)?;

        if !descriptor.permission.contains(Permission::READ) {
            return Err(StoreError::NotFound);
        }

        let mut value = match descriptor.read_override {
            Some(read) => read(descriptor)?,
            None => self.store.load(descriptor.reference, descriptor.tag)?,
        };

        if options.bitmap {
            let shift = reference - descriptor.reference;
            value = RegValue::Integer(value.as_i32() >> shift);
            Ok((descriptor, value, descriptor.size as u16 - shift))
        } else {
            Ok((descriptor, value, descriptor.size as u16))
        }
    }

    /// Write `value` to the register matched by `descriptor` (as returned by
    /// [`RegisterTable::find`]). Returns the number of refs written.
    pub fn write(&mut self, descriptor: &'static RegisterDescriptor, value: RegValue) -> Result<u16, StoreError> {
        if !descriptor.permission.contains(Permission::WRITE) {
            return Err(StoreError::NotFound);
        }

        if let Some(bounds) = descriptor.bounds {
            let as_f32 = value.as_f32();
            if bounds.min.is_some_and(|min| as_f32 < min) || bounds.max.is_some_and(|max| as_f32 > max) {
                return Err(StoreError::DataValue);
            }
        }

        match descriptor.write_override {
            Some(write) => write(descriptor, value)?,
            None => self.store.save(descriptor.reference, value)?,
        }

        // TODO: no bitmap-aware write path yet. Latent: coil/discrete-input
        // writes aren't reachable through any handler `app::Dispatcher`
        // wires up today (no function 5/15 entry).
        Ok(descriptor.size as u16)
    }

    /// Encode the register at `reference`'s current value per its codec
    /// configuration, returning the descriptor and how many refs were
    /// consumed.
    pub fn read_encoded(
        &mut self, reference: Ref, buf: &mut [u8],
    ) -> Result<(&'static RegisterDescriptor, u16), StoreError> {
        let (descriptor, value, consumed) = self.read(reference, FindOptions::default())?;
        codec::encode(value, descriptor.tag, descriptor.size, descriptor.scale, buf).map_err(|_| StoreError::Internal)?;
        Ok((descriptor, consumed))
    }

    /// Decode `buf` per the register at `reference`'s codec configuration
    /// and write it. Returns how many refs were written.
    pub fn write_encoded(&mut self, reference: Ref, buf: &[u8]) -> Result<u16, StoreError> {
        let descriptor = self.find(reference, FindOptions::default()).ok_or(StoreError::NotFound)?;
        let value =
            codec::decode(buf, descriptor.tag, descriptor.size, descriptor.scale).map_err(|_| StoreError::NotFound)?;
        self.write(descriptor, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapStore(HashMap<Ref, RegValue>);

    impl RegisterStore for MapStore {
        fn load(&mut self, reference: Ref, tag: ValueTag) -> Result<RegValue, StoreError> {
            self.0
                .get(&reference)
                .copied()
                .or(Some(match tag {
                    ValueTag::Integer => RegValue::Integer(0),
                    ValueTag::Float => RegValue::Float(0.0),
                }))
                .ok_or(StoreError::Internal)
        }

        fn save(&mut self, reference: Ref, value: RegValue) -> Result<(), StoreError> {
            self.0.insert(reference, value);
            Ok(())
        }
    }

    static HOLDING: [RegisterDescriptor; 1] =
        [RegisterDescriptor::new(40001, 1, ValueTag::Integer, 0, Permission::READ_WRITE)];

    static READ_ONLY: [RegisterDescriptor; 1] =
        [RegisterDescriptor::new(40001, 1, ValueTag::Integer, 0, Permission::READ)];

    #[test]
    fn scale_five_bit_two_complement() {
        assert_eq!(scale_from_five_bits(0), 0);
        assert_eq!(scale_from_five_bits(15), 15);
        assert_eq!(scale_from_five_bits(16), -16);
        assert_eq!(scale_from_five_bits(31), -1);
    }

    #[test]
    fn read_then_write_idempotence() {
        let mut table = RegisterTable::new(&HOLDING, MapStore(HashMap::new()));
        let descriptor = table.find(40001, FindOptions::default()).unwrap();
        table.write(descriptor, RegValue::Integer(0x1234)).unwrap();
        let (_, value, _) = table.read(40001, FindOptions::default()).unwrap();
        assert_eq!(value, RegValue::Integer(0x1234));
    }

    #[test]
    fn write_to_read_only_is_rejected() {
        let mut table = RegisterTable::new(&READ_ONLY, MapStore(HashMap::new()));
        let descriptor = table.find(40001, FindOptions::default()).unwrap();
        assert_eq!(table.write(descriptor, RegValue::Integer(1)), Err(StoreError::NotFound));
    }

    #[test]
    fn not_found_is_reported() {
        let mut table = RegisterTable::new(&HOLDING, MapStore(HashMap::new()));
        assert!(table.find(40010, FindOptions::default()).is_none());
        assert_eq!(table.read(40010, FindOptions::default()).unwrap_err(), StoreError::NotFound);
    }

    #[test]
    fn bitmap_find_matches_interval() {
        static COILS: [RegisterDescriptor; 1] =
            [RegisterDescriptor::new(1, 8, ValueTag::Integer, 0, Permission::READ_WRITE)];
        let table = RegisterTable::new(&COILS, MapStore(HashMap::new()));
        assert!(table.find(1, FindOptions { bitmap: true }).is_some());
        assert!(table.find(8, FindOptions { bitmap: true }).is_some());
        assert!(table.find(9, FindOptions { bitmap: true }).is_none());
    }

    #[test]
    fn range_bounds_reject_out_of_range_write() {
        static BOUNDED: [RegisterDescriptor; 1] = [RegisterDescriptor::new(
            40001,
            1,
            ValueTag::Integer,
            0,
            Permission::READ_WRITE,
        )
        .with_bounds(RegisterBounds { min: Some(0.0), max: None })];
        let mut table = RegisterTable::new(&BOUNDED, MapStore(HashMap::new()));
        let descriptor = table.find(40001, FindOptions::default()).unwrap();
        assert_eq!(table.write(descriptor, RegValue::Integer(-1)), Err(StoreError::DataValue));
    }
}
