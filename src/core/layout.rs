//! Declarative record layouts for memory owned by the host.
//!
//! A [`Layout`] lists every known field with an explicit byte offset, every
//! unknown region as an explicit [`Gap`], and every bit-packed sub-field as a
//! bit range inside a parent integer field. Positions never depend on the
//! target's struct packing rules; a layout change is a data diff.
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::core::error::{Error, ErrorKind};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F32,
    Ptr,
    Bytes(#[serde(with = "crate::core::hexint")] u64),
    CString(#[serde(with = "crate::core::hexint")] u64),
    Record(String),
}

impl FieldKind {
    /// Width in bytes; records are sized by the layout they name.
    pub fn width(&self, layouts: Option<&LayoutSet>) -> Option<u64> {
        match self {
            FieldKind::U8 | FieldKind::I8 => Some(1),
            FieldKind::U16 | FieldKind::I16 => Some(2),
            FieldKind::U32 | FieldKind::I32 | FieldKind::F32 => Some(4),
            FieldKind::U64 | FieldKind::I64 | FieldKind::Ptr => Some(8),
            FieldKind::Bytes(len) | FieldKind::CString(len) => Some(*len),
            FieldKind::Record(name) => layouts
                .and_then(|set| set.find(name))
                .map(|layout| layout.size),
        }
    }

    /// Bit width for unsigned integer kinds, the only valid bit-field parents.
    pub fn unsigned_bits(&self) -> Option<u32> {
        match self {
            FieldKind::U8 => Some(8),
            FieldKind::U16 => Some(16),
            FieldKind::U32 => Some(32),
            FieldKind::U64 => Some(64),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(with = "crate::core::hexint")]
    pub offset: u64,
    pub kind: FieldKind,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gap {
    #[serde(with = "crate::core::hexint")]
    pub offset: u64,
    #[serde(with = "crate::core::hexint")]
    pub len: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitField {
    pub name: String,
    pub parent: String,
    pub bit_offset: u32,
    pub bit_width: u32,
}

impl BitField {
    pub fn mask(&self) -> u64 {
        if self.bit_width >= 64 {
            u64::MAX
        } else {
            ((1u64 << self.bit_width) - 1) << self.bit_offset
        }
    }

    pub fn extract(&self, word: u64) -> u64 {
        (word & self.mask()) >> self.bit_offset
    }

    /// Replaces this field's bits in `word`, leaving every other bit alone.
    pub fn insert(&self, word: u64, value: u64) -> Result<u64, Error> {
        let shifted = value.checked_shl(self.bit_offset).unwrap_or(0);
        if shifted >> self.bit_offset != value || shifted & !self.mask() != 0 {
            return Err(Error::new(ErrorKind::Usage).with_message(format!(
                "value {value} does not fit in {}-bit field {}",
                self.bit_width, self.name
            )));
        }
        Ok((word & !self.mask()) | shifted)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layout {
    pub name: String,
    #[serde(with = "crate::core::hexint")]
    pub size: u64,
    pub fields: Vec<Field>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gaps: Vec<Gap>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bits: Vec<BitField>,
}

impl Layout {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            fields: Vec::new(),
            gaps: Vec::new(),
            bits: Vec::new(),
        }
    }

    pub fn field(mut self, name: impl Into<String>, offset: u64, kind: FieldKind) -> Self {
        self.fields.push(Field {
            name: name.into(),
            offset,
            kind,
        });
        self
    }

    pub fn gap(mut self, offset: u64, len: u64) -> Self {
        self.gaps.push(Gap {
            offset,
            len,
            note: None,
        });
        self
    }

    pub fn bits(
        mut self,
        name: impl Into<String>,
        parent: impl Into<String>,
        bit_offset: u32,
        bit_width: u32,
    ) -> Self {
        self.bits.push(BitField {
            name: name.into(),
            parent: parent.into(),
            bit_offset,
            bit_width,
        });
        self
    }

    pub fn find_field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn find_bits(&self, name: &str) -> Option<&BitField> {
        self.bits.iter().find(|bits| bits.name == name)
    }

    pub fn field_named(&self, name: &str) -> Result<&Field, Error> {
        self.find_field(name).ok_or_else(|| {
            Error::new(ErrorKind::NotFound)
                .with_message(format!("layout {} has no field {name}", self.name))
        })
    }

    pub fn bits_named(&self, name: &str) -> Result<&BitField, Error> {
        self.find_bits(name).ok_or_else(|| {
            Error::new(ErrorKind::NotFound)
                .with_message(format!("layout {} has no bit field {name}", self.name))
        })
    }

    /// Validates the layout on its own; record fields cannot be sized here.
    pub fn validate(&self) -> Result<(), Error> {
        self.validate_in(None)
    }

    pub fn validate_in(&self, layouts: Option<&LayoutSet>) -> Result<(), Error> {
        if self.size == 0 {
            return Err(self.invalid("size is zero".to_string()));
        }
        let mut names = HashSet::new();
        let mut spans: Vec<(u64, u64, String)> = Vec::new();

        for field in &self.fields {
            if !names.insert(field.name.as_str()) {
                return Err(self.invalid(format!("duplicate name {}", field.name)));
            }
            if let FieldKind::Record(target) = &field.kind {
                if *target == self.name {
                    return Err(self.invalid(format!("field {} embeds its own layout", field.name)));
                }
            }
            let width = field.kind.width(layouts).ok_or_else(|| {
                self.invalid(format!("field {} references an unknown layout", field.name))
            })?;
            if width == 0 {
                return Err(self.invalid(format!("field {} has zero width", field.name)));
            }
            spans.push(self.span(field.offset, width, &field.name)?);
        }

        for gap in &self.gaps {
            if gap.len == 0 {
                return Err(self.invalid(format!("gap at {:#x} has zero length", gap.offset)));
            }
            spans.push(self.span(gap.offset, gap.len, &format!("gap@{:#x}", gap.offset))?);
        }

        spans.sort_by_key(|(start, _, _)| *start);
        for pair in spans.windows(2) {
            let (_, prev_end, prev) = &pair[0];
            let (next_start, _, next) = &pair[1];
            if next_start < prev_end {
                return Err(self.invalid(format!("{next} overlaps {prev}")));
            }
        }

        let mut claimed: Vec<(&str, u64)> = Vec::new();
        for bits in &self.bits {
            if !names.insert(bits.name.as_str()) {
                return Err(self.invalid(format!("duplicate name {}", bits.name)));
            }
            let parent = self.find_field(&bits.parent).ok_or_else(|| {
                self.invalid(format!("bit field {} has unknown parent {}", bits.name, bits.parent))
            })?;
            let parent_bits = parent.kind.unsigned_bits().ok_or_else(|| {
                self.invalid(format!(
                    "bit field {} parent {} is not an unsigned integer",
                    bits.name, bits.parent
                ))
            })?;
            if bits.bit_width == 0 {
                return Err(self.invalid(format!("bit field {} has zero width", bits.name)));
            }
            if u64::from(bits.bit_offset) + u64::from(bits.bit_width) > u64::from(parent_bits) {
                return Err(self.invalid(format!(
                    "bit field {} exceeds {parent_bits}-bit parent {}",
                    bits.name, bits.parent
                )));
            }
            let mask = bits.mask();
            if claimed
                .iter()
                .any(|(parent, other)| *parent == bits.parent && other & mask != 0)
            {
                return Err(self.invalid(format!("bit field {} overlaps a sibling", bits.name)));
            }
            claimed.push((bits.parent.as_str(), mask));
        }

        Ok(())
    }

    fn span(&self, offset: u64, width: u64, label: &str) -> Result<(u64, u64, String), Error> {
        let end = offset
            .checked_add(width)
            .filter(|end| *end <= self.size)
            .ok_or_else(|| {
                self.invalid(format!(
                    "{label} at {offset:#x}+{width:#x} exceeds size {:#x}",
                    self.size
                ))
            })?;
        Ok((offset, end, label.to_string()))
    }

    fn invalid(&self, message: String) -> Error {
        Error::new(ErrorKind::Layout).with_message(format!("{}: {message}", self.name))
    }
}

/// Named layouts validated together so record fields can be sized.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LayoutSet {
    layouts: Vec<Layout>,
}

impl LayoutSet {
    pub fn new(layouts: Vec<Layout>) -> Self {
        Self { layouts }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Layout> {
        self.layouts.iter()
    }

    pub fn len(&self) -> usize {
        self.layouts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layouts.is_empty()
    }

    pub fn find(&self, name: &str) -> Option<&Layout> {
        self.layouts.iter().find(|layout| layout.name == name)
    }

    pub fn get(&self, name: &str) -> Result<&Layout, Error> {
        self.find(name).ok_or_else(|| {
            Error::new(ErrorKind::NotFound).with_message(format!("unknown layout {name}"))
        })
    }

    pub fn validate(&self) -> Result<(), Error> {
        let mut names = HashSet::new();
        for layout in &self.layouts {
            if !names.insert(layout.name.as_str()) {
                return Err(Error::new(ErrorKind::Layout)
                    .with_message(format!("duplicate layout {}", layout.name)));
            }
            layout.validate_in(Some(self))?;
        }
        let mut done = HashSet::new();
        for layout in &self.layouts {
            self.check_acyclic(layout, &mut Vec::new(), &mut done)?;
        }
        Ok(())
    }

    // Depth-first walk over record edges; `path` holds the layouts being embedded.
    fn check_acyclic<'a>(
        &'a self,
        layout: &'a Layout,
        path: &mut Vec<&'a str>,
        done: &mut HashSet<&'a str>,
    ) -> Result<(), Error> {
        if done.contains(layout.name.as_str()) {
            return Ok(());
        }
        if path.contains(&layout.name.as_str()) {
            path.push(layout.name.as_str());
            return Err(Error::new(ErrorKind::Layout)
                .with_message(format!("record cycle {}", path.join(" -> "))));
        }
        path.push(layout.name.as_str());
        for field in &layout.fields {
            if let FieldKind::Record(target) = &field.kind {
                if let Some(target) = self.find(target) {
                    self.check_acyclic(target, path, done)?;
                }
            }
        }
        path.pop();
        done.insert(layout.name.as_str());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{FieldKind, Layout, LayoutSet};
    use crate::core::error::ErrorKind;

    fn socket_info() -> Layout {
        Layout::new("BroadcastSocketInfo", 0x10)
            .field("packed", 0x00, FieldKind::U64)
            .field("socket", 0x08, FieldKind::U64)
            .bits("port", "packed", 0, 16)
            .bits("read", "packed", 16, 24)
            .bits("write", "packed", 40, 24)
    }

    #[test]
    fn well_formed_layout_validates() {
        socket_info().validate().expect("valid");
    }

    #[test]
    fn overlapping_fields_are_rejected() {
        let layout = Layout::new("Bad", 0x10)
            .field("a", 0x00, FieldKind::U64)
            .field("b", 0x04, FieldKind::U32);
        let err = layout.validate().expect_err("overlap");
        assert_eq!(err.kind(), ErrorKind::Layout);
        assert!(err.message().unwrap().contains("b overlaps a"));
    }

    #[test]
    fn gaps_participate_in_overlap_checks() {
        let layout = Layout::new("Gappy", 0x20)
            .field("head", 0x00, FieldKind::Ptr)
            .gap(0x08, 0x10)
            .field("tail", 0x10, FieldKind::U64);
        let err = layout.validate().expect_err("gap overlap");
        assert_eq!(err.kind(), ErrorKind::Layout);
    }

    #[test]
    fn fields_past_size_are_rejected() {
        let layout = Layout::new("Short", 0x0c).field("word", 0x08, FieldKind::U64);
        assert_eq!(layout.validate().expect_err("size").kind(), ErrorKind::Layout);
    }

    #[test]
    fn bit_ranges_must_fit_parent_and_not_overlap() {
        let too_wide = Layout::new("Flags", 2)
            .field("flags", 0, FieldKind::U16)
            .bits("unused", "flags", 3, 14);
        assert_eq!(too_wide.validate().expect_err("width").kind(), ErrorKind::Layout);

        let overlapping = Layout::new("Flags", 2)
            .field("flags", 0, FieldKind::U16)
            .bits("owned", "flags", 0, 1)
            .bits("state", "flags", 0, 2);
        assert_eq!(overlapping.validate().expect_err("overlap").kind(), ErrorKind::Layout);

        let signed_parent = Layout::new("Flags", 4)
            .field("flags", 0, FieldKind::I32)
            .bits("owned", "flags", 0, 1);
        assert_eq!(signed_parent.validate().expect_err("signed").kind(), ErrorKind::Layout);
    }

    #[test]
    fn bit_insert_preserves_neighbours_and_rejects_wide_values() {
        let layout = socket_info();
        let read = layout.bits_named("read").expect("bits");
        let word = 0xffff_0000_0000_1234u64;
        let updated = read.insert(word, 0xabcdef).expect("fits");
        assert_eq!(read.extract(updated), 0xabcdef);
        assert_eq!(updated & 0xffff, 0x1234);
        assert_eq!(updated >> 40, word >> 40);
        assert_eq!(read.insert(word, 1 << 24).expect_err("wide").kind(), ErrorKind::Usage);
    }

    #[test]
    fn record_fields_are_sized_by_the_set() {
        let outer = Layout::new("Outer", 0x18)
            .field("id", 0x00, FieldKind::U64)
            .field("socket", 0x08, FieldKind::Record("BroadcastSocketInfo".to_string()));
        assert_eq!(outer.validate().expect_err("unsized").kind(), ErrorKind::Layout);

        let set = LayoutSet::new(vec![socket_info(), outer]);
        set.validate().expect("valid set");
        assert_eq!(set.get("Outer").expect("layout").size, 0x18);
        assert_eq!(set.get("Missing").expect_err("missing").kind(), ErrorKind::NotFound);
    }

    #[test]
    fn mutually_embedded_records_are_rejected() {
        let a = Layout::new("A", 8).field("b", 0, FieldKind::Record("B".to_string()));
        let b = Layout::new("B", 8).field("a", 0, FieldKind::Record("A".to_string()));
        a.validate_in(Some(&LayoutSet::new(vec![a.clone(), b.clone()])))
            .expect("each layout is well formed on its own");
        let err = LayoutSet::new(vec![a, b]).validate().expect_err("cycle");
        assert_eq!(err.kind(), ErrorKind::Layout);
        assert!(err.message().unwrap().contains("A -> B -> A"));
    }

    #[test]
    fn shared_records_are_not_cycles() {
        let outer = Layout::new("Outer", 0x20)
            .field("left", 0x00, FieldKind::Record("BroadcastSocketInfo".to_string()))
            .field("right", 0x10, FieldKind::Record("BroadcastSocketInfo".to_string()));
        LayoutSet::new(vec![outer, socket_info()]).validate().expect("diamond is fine");
    }

    #[test]
    fn zero_size_layout_is_rejected() {
        let err = Layout::new("Empty", 0).validate().expect_err("zero size");
        assert_eq!(err.kind(), ErrorKind::Layout);
        assert!(err.message().unwrap().contains("size is zero"));
    }

    #[test]
    fn layouts_parse_from_json_with_hex_offsets() {
        let json = r#"{
            "name": "TcpPeer",
            "size": "0x8",
            "fields": [
                {"name": "index", "offset": 0, "kind": "u32"},
                {"name": "gen", "offset": "0x4", "kind": "u32"}
            ]
        }"#;
        let layout: Layout = serde_json::from_str(json).expect("parse");
        layout.validate().expect("valid");
        assert_eq!(layout.field_named("gen").expect("field").offset, 4);

        let bytes: FieldKind = serde_json::from_str(r#"{"bytes": "0x80"}"#).expect("parse");
        assert_eq!(bytes, FieldKind::Bytes(0x80));
    }
}
