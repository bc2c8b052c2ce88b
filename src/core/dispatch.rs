// Named dispatch tables: an object whose first word points at an array of
// function pointers, one per declared slot, in declaration order.
use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::core::error::{Error, ErrorKind};
use crate::core::memory::Memory;

const SLOT_WIDTH: u64 = 8;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchTable {
    pub name: String,
    /// Offset inside the object of the table pointer.
    #[serde(default, with = "crate::core::hexint")]
    pub table_offset: u64,
    pub slots: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DispatchEntry {
    pub index: usize,
    pub name: String,
    #[serde(with = "crate::core::hexint")]
    pub slot_address: u64,
    #[serde(with = "crate::core::hexint")]
    pub target: u64,
}

/// A dispatch table resolved against one live object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BoundDispatch {
    pub name: String,
    #[serde(with = "crate::core::hexint")]
    pub object: u64,
    #[serde(with = "crate::core::hexint")]
    pub table: u64,
    pub entries: Vec<DispatchEntry>,
}

impl DispatchTable {
    pub fn new(name: impl Into<String>, slots: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            name: name.into(),
            table_offset: 0,
            slots: slots.into_iter().map(Into::into).collect(),
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.slots.is_empty() {
            return Err(Error::new(ErrorKind::Layout)
                .with_message(format!("dispatch table {} has no slots", self.name)));
        }
        let mut seen = HashSet::new();
        for slot in &self.slots {
            if !seen.insert(slot.as_str()) {
                return Err(Error::new(ErrorKind::Layout)
                    .with_message(format!("dispatch table {}: duplicate slot {slot}", self.name)));
            }
        }
        Ok(())
    }

    pub fn slot_index(&self, name: &str) -> Result<usize, Error> {
        self.slots.iter().position(|slot| slot == name).ok_or_else(|| {
            Error::new(ErrorKind::NotFound)
                .with_message(format!("dispatch table {} has no slot {name}", self.name))
        })
    }

    /// Reads the table pointer from `object` and every slot's target once.
    pub fn bind<M: Memory + ?Sized>(&self, memory: &M, object: u64) -> Result<BoundDispatch, Error> {
        let table = memory.read_u64(object.wrapping_add(self.table_offset))?;
        if table == 0 {
            return Err(Error::new(ErrorKind::Fault)
                .with_message(format!("{} object has a null dispatch table", self.name))
                .with_address(object));
        }
        let mut entries = Vec::with_capacity(self.slots.len());
        for (index, name) in self.slots.iter().enumerate() {
            let slot_address = table.wrapping_add(index as u64 * SLOT_WIDTH);
            let target = memory.read_u64(slot_address)?;
            entries.push(DispatchEntry {
                index,
                name: name.clone(),
                slot_address,
                target,
            });
        }
        Ok(BoundDispatch {
            name: self.name.clone(),
            object,
            table,
            entries,
        })
    }
}

impl BoundDispatch {
    pub fn get(&self, name: &str) -> Result<&DispatchEntry, Error> {
        self.entries.iter().find(|entry| entry.name == name).ok_or_else(|| {
            Error::new(ErrorKind::NotFound)
                .with_message(format!("dispatch table {} has no slot {name}", self.name))
        })
    }

    pub fn get_index(&self, index: usize) -> Result<&DispatchEntry, Error> {
        self.entries.get(index).ok_or_else(|| {
            Error::new(ErrorKind::NotFound).with_message(format!(
                "dispatch table {} has {} slots, not {}",
                self.name,
                self.entries.len(),
                index + 1
            ))
        })
    }
}
