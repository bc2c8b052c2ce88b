// Borrowed, typed views over foreign records described by a `Layout`.
// An overlay never copies or owns the memory it reads; it never checks that
// the base address is sane either, so faults surface at the accessor call.
use serde::Serialize;

use crate::core::error::{Error, ErrorKind};
use crate::core::layout::{BitField, Field, FieldKind, Layout, LayoutSet};
use crate::core::memory::Memory;

pub struct Overlay<'a, M: Memory + ?Sized> {
    memory: &'a M,
    layout: &'a Layout,
    address: u64,
}

impl<'a, M: Memory + ?Sized> Clone for Overlay<'a, M> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, M: Memory + ?Sized> Copy for Overlay<'a, M> {}

impl<'a, M: Memory + ?Sized> Overlay<'a, M> {
    pub fn new(memory: &'a M, layout: &'a Layout, address: u64) -> Self {
        Self {
            memory,
            layout,
            address,
        }
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn layout(&self) -> &'a Layout {
        self.layout
    }

    pub fn field_address(&self, name: &str) -> Result<u64, Error> {
        let field = self.layout.field_named(name)?;
        Ok(self.address.wrapping_add(field.offset))
    }

    pub fn read_u8(&self, name: &str) -> Result<u8, Error> {
        let address = self.typed(name, &[FieldKind::U8, FieldKind::I8])?;
        self.memory.read_u8(address)
    }

    pub fn read_u16(&self, name: &str) -> Result<u16, Error> {
        let address = self.typed(name, &[FieldKind::U16, FieldKind::I16])?;
        self.memory.read_u16(address)
    }

    pub fn read_u32(&self, name: &str) -> Result<u32, Error> {
        let address = self.typed(name, &[FieldKind::U32, FieldKind::I32, FieldKind::F32])?;
        self.memory.read_u32(address)
    }

    pub fn read_u64(&self, name: &str) -> Result<u64, Error> {
        let address = self.typed(name, &[FieldKind::U64, FieldKind::I64, FieldKind::Ptr])?;
        self.memory.read_u64(address)
    }

    pub fn read_i32(&self, name: &str) -> Result<i32, Error> {
        let address = self.typed(name, &[FieldKind::I32])?;
        Ok(self.memory.read_u32(address)? as i32)
    }

    pub fn read_i64(&self, name: &str) -> Result<i64, Error> {
        let address = self.typed(name, &[FieldKind::I64])?;
        Ok(self.memory.read_u64(address)? as i64)
    }

    pub fn read_ptr(&self, name: &str) -> Result<u64, Error> {
        let address = self.typed(name, &[FieldKind::Ptr])?;
        self.memory.read_u64(address)
    }

    pub fn write_u32(&self, name: &str, value: u32) -> Result<(), Error> {
        let address = self.typed(name, &[FieldKind::U32, FieldKind::I32])?;
        self.memory.write_u32(address, value)
    }

    pub fn write_u64(&self, name: &str, value: u64) -> Result<(), Error> {
        let address = self.typed(name, &[FieldKind::U64, FieldKind::I64, FieldKind::Ptr])?;
        self.memory.write_u64(address, value)
    }

    pub fn read_bits(&self, name: &str) -> Result<u64, Error> {
        let bits = self.layout.bits_named(name)?;
        let (parent, _) = self.parent_of(bits)?;
        Ok(bits.extract(self.read_unsigned(parent)?))
    }

    /// Read-modify-write of the parent word; sibling bits are preserved.
    pub fn write_bits(&self, name: &str, value: u64) -> Result<(), Error> {
        let bits = self.layout.bits_named(name)?;
        let (parent, width) = self.parent_of(bits)?;
        let word = bits.insert(self.read_unsigned(parent)?, value)?;
        let address = self.address.wrapping_add(parent.offset);
        let bytes = word.to_le_bytes();
        self.memory.write(address, &bytes[..(width / 8) as usize])
    }

    pub fn read_bytes(&self, name: &str) -> Result<Vec<u8>, Error> {
        let field = self.layout.field_named(name)?;
        match field.kind {
            FieldKind::Bytes(len) | FieldKind::CString(len) => self
                .memory
                .read_bytes(self.address.wrapping_add(field.offset), len as usize),
            _ => Err(self.mismatch(field, "bytes")),
        }
    }

    pub fn read_c_string(&self, name: &str) -> Result<String, Error> {
        let field = self.layout.field_named(name)?;
        match field.kind {
            FieldKind::CString(len) => self
                .memory
                .read_c_string(self.address.wrapping_add(field.offset), len as usize),
            _ => Err(self.mismatch(field, "c_string")),
        }
    }

    /// View of an embedded record field.
    pub fn nested(&self, name: &str, layouts: &'a LayoutSet) -> Result<Overlay<'a, M>, Error> {
        let field = self.layout.field_named(name)?;
        match &field.kind {
            FieldKind::Record(target) => Ok(Overlay::new(
                self.memory,
                layouts.get(target)?,
                self.address.wrapping_add(field.offset),
            )),
            _ => Err(self.mismatch(field, "record")),
        }
    }

    /// View of the record a pointer field points at.
    pub fn follow(&self, name: &str, layout: &'a Layout) -> Result<Overlay<'a, M>, Error> {
        let target = self.read_ptr(name)?;
        Ok(Overlay::new(self.memory, layout, target))
    }

    /// View of element `index` in an array reached through a pointer field,
    /// strided by the element layout's size.
    pub fn element(&self, name: &str, index: u64, layout: &'a Layout) -> Result<Overlay<'a, M>, Error> {
        let items = self.read_ptr(name)?;
        let address = items.wrapping_add(index.wrapping_mul(layout.size));
        Ok(Overlay::new(self.memory, layout, address))
    }

    /// Decodes every field and bit field in declaration order.
    pub fn snapshot(&self, layouts: &'a LayoutSet) -> Result<Vec<FieldValue>, Error> {
        let mut out = Vec::with_capacity(self.layout.fields.len() + self.layout.bits.len());
        for field in &self.layout.fields {
            let address = self.address.wrapping_add(field.offset);
            let value = match &field.kind {
                FieldKind::U8 => Value::Unsigned(self.memory.read_u8(address)?.into()),
                FieldKind::U16 => Value::Unsigned(self.memory.read_u16(address)?.into()),
                FieldKind::U32 => Value::Unsigned(self.memory.read_u32(address)?.into()),
                FieldKind::U64 => Value::Unsigned(self.memory.read_u64(address)?),
                FieldKind::I8 => Value::Signed((self.memory.read_u8(address)? as i8).into()),
                FieldKind::I16 => Value::Signed((self.memory.read_u16(address)? as i16).into()),
                FieldKind::I32 => Value::Signed((self.memory.read_u32(address)? as i32).into()),
                FieldKind::I64 => Value::Signed(self.memory.read_u64(address)? as i64),
                FieldKind::F32 => Value::Float(f32::from_bits(self.memory.read_u32(address)?)),
                FieldKind::Ptr => {
                    Value::Pointer(format!("{:#x}", self.memory.read_u64(address)?))
                }
                FieldKind::Bytes(len) => {
                    Value::Bytes(hex_bytes(&self.memory.read_bytes(address, *len as usize)?))
                }
                FieldKind::CString(len) => {
                    Value::Text(self.memory.read_c_string(address, *len as usize)?)
                }
                FieldKind::Record(_) => Value::Record(self.nested(&field.name, layouts)?.snapshot(layouts)?),
            };
            out.push(FieldValue {
                name: field.name.clone(),
                offset: field.offset,
                value,
            });
        }
        for bits in &self.layout.bits {
            let (parent, _) = self.parent_of(bits)?;
            out.push(FieldValue {
                name: bits.name.clone(),
                offset: parent.offset,
                value: Value::Unsigned(bits.extract(self.read_unsigned(parent)?)),
            });
        }
        Ok(out)
    }

    fn typed(&self, name: &str, accepted: &[FieldKind]) -> Result<u64, Error> {
        let field = self.layout.field_named(name)?;
        if !accepted.contains(&field.kind) {
            let wanted = accepted
                .iter()
                .map(|kind| format!("{kind:?}").to_lowercase())
                .collect::<Vec<_>>()
                .join("|");
            return Err(self.mismatch(field, &wanted));
        }
        Ok(self.address.wrapping_add(field.offset))
    }

    fn parent_of(&self, bits: &BitField) -> Result<(&'a Field, u32), Error> {
        let parent = self.layout.field_named(&bits.parent)?;
        let width = parent
            .kind
            .unsigned_bits()
            .ok_or_else(|| self.mismatch(parent, "unsigned integer"))?;
        Ok((parent, width))
    }

    fn read_unsigned(&self, field: &Field) -> Result<u64, Error> {
        let address = self.address.wrapping_add(field.offset);
        match field.kind {
            FieldKind::U8 => Ok(self.memory.read_u8(address)?.into()),
            FieldKind::U16 => Ok(self.memory.read_u16(address)?.into()),
            FieldKind::U32 => Ok(self.memory.read_u32(address)?.into()),
            FieldKind::U64 => self.memory.read_u64(address),
            _ => Err(self.mismatch(field, "unsigned integer")),
        }
    }

    fn mismatch(&self, field: &Field, wanted: &str) -> Error {
        Error::new(ErrorKind::Layout).with_message(format!(
            "{}.{} is {:?}, not {wanted}",
            self.layout.name, field.name, field.kind
        ))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FieldValue {
    pub name: String,
    #[serde(with = "crate::core::hexint")]
    pub offset: u64,
    pub value: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Unsigned(u64),
    Signed(i64),
    Float(f32),
    Pointer(String),
    Bytes(String),
    Text(String),
    Record(Vec<FieldValue>),
}

fn hex_bytes(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut hex = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}
