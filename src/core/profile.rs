//! Purpose: Per-build configuration: function offsets, pool geometry, listener pool
//! placement, structure layouts, and dispatch tables.
//! Exports: [`Profile`].
//! Role: Everything that moves between host builds lives here instead of in code.
//! Invariants: A validated profile has unique function names, valid geometry, layouts
//! that fit and do not overlap, and dispatch tables with unique slot names.
//! Invariants: The fingerprint is the SHA-256 of the canonical JSON encoding, so two
//! profiles that differ only in spelling (hex vs decimal, key order) share it.
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::bindings::FunctionOffset;
use crate::core::dispatch::DispatchTable;
use crate::core::error::{Error, ErrorKind};
use crate::core::geometry::PoolGeometry;
use crate::core::layout::LayoutSet;
use crate::core::memory::io_error_kind;

/// Offset of the listener pool header inside a broadcaster's data block.
pub const DEFAULT_LISTENER_POOL_OFFSET: u64 = 352;

const BUILTIN: &str = include_str!("../../profiles/echovr.json");

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    #[serde(default)]
    pub functions: Vec<FunctionOffset>,
    #[serde(default)]
    pub geometry: PoolGeometry,
    #[serde(
        default = "default_listener_pool_offset",
        with = "crate::core::hexint"
    )]
    pub listener_pool_offset: u64,
    #[serde(default)]
    pub layouts: LayoutSet,
    #[serde(default)]
    pub dispatch: Vec<DispatchTable>,
}

fn default_listener_pool_offset() -> u64 {
    DEFAULT_LISTENER_POOL_OFFSET
}

impl Profile {
    /// The profile for the observed host build, compiled into the crate.
    pub fn builtin() -> Result<Self, Error> {
        Self::from_json(BUILTIN)
    }

    pub fn from_json(text: &str) -> Result<Self, Error> {
        serde_json::from_str(text).map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message(format!("invalid profile json: {err}"))
                .with_source(err)
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|err| {
            Error::new(io_error_kind(&err))
                .with_message("failed to read profile")
                .with_path(path)
                .with_source(err)
        })?;
        Self::from_json(&text).map_err(|err| err.with_path(path))
    }

    pub fn validate(&self) -> Result<(), Error> {
        self.geometry.validate()?;
        let mut names = std::collections::HashSet::new();
        for function in &self.functions {
            if !names.insert(function.name.as_str()) {
                return Err(Error::new(ErrorKind::Layout)
                    .with_message(format!("function {} is listed twice", function.name)));
            }
        }
        self.layouts.validate()?;
        let mut tables = std::collections::HashSet::new();
        for table in &self.dispatch {
            if !tables.insert(table.name.as_str()) {
                return Err(Error::new(ErrorKind::Layout)
                    .with_message(format!("dispatch table {} is listed twice", table.name)));
            }
            table.validate()?;
        }
        Ok(())
    }

    pub fn dispatch_table(&self, name: &str) -> Result<&DispatchTable, Error> {
        self.dispatch.iter().find(|table| table.name == name).ok_or_else(|| {
            Error::new(ErrorKind::NotFound).with_message(format!("unknown dispatch table {name}"))
        })
    }

    pub fn to_json(&self) -> Result<String, Error> {
        serde_json::to_string_pretty(self).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to encode profile")
                .with_source(err)
        })
    }

    pub fn fingerprint(&self) -> Result<String, Error> {
        let canonical = serde_json::to_vec(self).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to encode profile")
                .with_source(err)
        })?;
        let digest = Sha256::digest(&canonical);
        let mut hex = String::with_capacity(digest.len() * 2);
        for byte in digest {
            let _ = write!(hex, "{byte:02x}");
        }
        Ok(hex)
    }
}
