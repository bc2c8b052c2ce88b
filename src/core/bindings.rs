// Host function binding: module base plus per-build offsets, resolved once
// and looked up by name afterwards.
use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::directory::{HostDirectory, PairTable};
use crate::core::error::{Error, ErrorKind};
use crate::core::geometry::PoolGeometry;
use crate::core::profile::Profile;

/// Name of the host's pool item lookup in a profile's function list.
pub const POOL_FIND_ITEM: &str = "PoolFindItem";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionOffset {
    pub name: String,
    #[serde(with = "crate::core::hexint")]
    pub offset: u64,
}

impl FunctionOffset {
    pub fn new(name: impl Into<String>, offset: u64) -> Self {
        Self {
            name: name.into(),
            offset,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BoundFunction {
    pub name: String,
    #[serde(with = "crate::core::hexint")]
    pub offset: u64,
    #[serde(with = "crate::core::hexint")]
    pub address: u64,
}

/// Absolute addresses for one module base, in profile order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct FunctionTable {
    entries: Vec<BoundFunction>,
}

impl FunctionTable {
    pub fn bind(base: u64, offsets: &[FunctionOffset]) -> Result<Self, Error> {
        let mut seen = HashSet::new();
        let mut entries = Vec::with_capacity(offsets.len());
        for function in offsets {
            if !seen.insert(function.name.as_str()) {
                return Err(Error::new(ErrorKind::Layout)
                    .with_message(format!("function {} is listed twice", function.name)));
            }
            let address = base.checked_add(function.offset).ok_or_else(|| {
                Error::new(ErrorKind::Usage).with_message(format!(
                    "base {base:#x} + {} offset {:#x} overflows",
                    function.name, function.offset
                ))
            })?;
            entries.push(BoundFunction {
                name: function.name.clone(),
                offset: function.offset,
                address,
            });
        }
        Ok(Self { entries })
    }

    pub fn address_of(&self, name: &str) -> Result<u64, Error> {
        self.entries
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.address)
            .ok_or_else(|| {
                Error::new(ErrorKind::NotFound)
                    .with_message(format!("no function named {name}"))
                    .with_hint("List bound names with `poolprobe bindings`.")
            })
    }

    pub fn entries(&self) -> &[BoundFunction] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A validated profile bound to one module base address.
#[derive(Clone, Debug)]
pub struct HostContext {
    base: u64,
    functions: FunctionTable,
    profile: Profile,
}

impl HostContext {
    pub fn bind(base: u64, profile: Profile) -> Result<Self, Error> {
        if base == 0 {
            return Err(Error::new(ErrorKind::Usage).with_message("module base address is null"));
        }
        profile.validate()?;
        let functions = FunctionTable::bind(base, &profile.functions)?;
        debug!(
            base,
            profile = %profile.name,
            functions = functions.len(),
            "bound host context"
        );
        Ok(Self {
            base,
            functions,
            profile,
        })
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn functions(&self) -> &FunctionTable {
        &self.functions
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn geometry(&self) -> &PoolGeometry {
        &self.profile.geometry
    }

    pub fn address_of(&self, name: &str) -> Result<u64, Error> {
        self.functions.address_of(name)
    }

    pub fn pair_table(&self) -> PairTable {
        PairTable::new(self.profile.geometry.directory)
    }

    /// # Safety
    ///
    /// The base must be the load address of the module the profile describes,
    /// inside the current process, so the bound pool lookup address is real code.
    pub unsafe fn host_directory(&self) -> Result<HostDirectory, Error> {
        let address = self.address_of(POOL_FIND_ITEM)?;
        unsafe { HostDirectory::from_address(address) }
    }
}

#[cfg(test)]
mod tests {
    use super::{FunctionOffset, FunctionTable, HostContext, POOL_FIND_ITEM};
    use crate::core::error::ErrorKind;
    use crate::core::profile::Profile;

    #[test]
    fn addresses_are_base_plus_offset() {
        let table = FunctionTable::bind(
            0x1_4000_0000,
            &[
                FunctionOffset::new(POOL_FIND_ITEM, 0x2ca9e0),
                FunctionOffset::new("BroadcasterUnlisten", 0xf8df20),
            ],
        )
        .expect("bind");
        assert_eq!(table.address_of(POOL_FIND_ITEM).expect("find"), 0x1_402c_a9e0);
        assert_eq!(table.address_of("BroadcasterUnlisten").expect("find"), 0x1_40f8_df20);
        assert_eq!(table.entries()[1].offset, 0xf8df20);
    }

    #[test]
    fn unknown_name_is_not_found() {
        let table = FunctionTable::bind(0x1000, &[FunctionOffset::new("A", 1)]).expect("bind");
        let err = table.address_of("B").expect_err("missing");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.hint().is_some());
    }

    #[test]
    fn overflow_and_duplicates_are_rejected() {
        let err = FunctionTable::bind(u64::MAX - 4, &[FunctionOffset::new("A", 0x10)])
            .expect_err("overflow");
        assert_eq!(err.kind(), ErrorKind::Usage);

        let err = FunctionTable::bind(
            0x1000,
            &[FunctionOffset::new("A", 1), FunctionOffset::new("A", 2)],
        )
        .expect_err("duplicate");
        assert_eq!(err.kind(), ErrorKind::Layout);
    }

    #[test]
    fn builtin_profile_binds_pool_lookup() {
        let profile = Profile::builtin().expect("builtin");
        let context = HostContext::bind(0x7ff6_0000_0000, profile).expect("bind");
        assert_eq!(
            context.address_of(POOL_FIND_ITEM).expect("find"),
            0x7ff6_0000_0000 + 0x2ca9e0
        );
        assert_eq!(context.geometry().slot_stride, 80);
        assert_eq!(context.functions().len(), context.profile().functions.len());
    }

    #[test]
    fn null_base_is_usage() {
        let profile = Profile::builtin().expect("builtin");
        let err = HostContext::bind(0, profile).expect_err("null");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }
}
