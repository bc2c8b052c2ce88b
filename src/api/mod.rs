//! Purpose: Define the stable public Rust API boundary for poolprobe.
//! Exports: Memory backends, layouts and overlays, the slot-pool resolver, profiles,
//! host bindings, and errors.
//! Role: Public, additive-only surface used by the CLI, the C ABI, and embedders.
//! Invariants: Re-exports only; no logic lives here.

#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::bindings::{
    BoundFunction, FunctionOffset, FunctionTable, HostContext, POOL_FIND_ITEM,
};
pub use crate::core::directory::{Directory, HostDirectory, PairTable, PoolFindItemFn};
pub use crate::core::dispatch::{BoundDispatch, DispatchEntry, DispatchTable};
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::geometry::{PairTableGeometry, PoolGeometry};
pub use crate::core::hexint;
pub use crate::core::layout::{BitField, Field, FieldKind, Gap, Layout, LayoutSet};
pub use crate::core::listeners::{listener_pool_header, unlisten};
pub use crate::core::memory::{Memory, ProcessMemory, Segment, SnapshotMemory};
pub use crate::core::overlay::{FieldValue, Overlay, Value};
pub use crate::core::profile::{DEFAULT_LISTENER_POOL_OFFSET, Profile};
pub use crate::core::resolver::{
    DirectoryEntry, Handle, SlotLocation, SlotPool, resolve_and_release,
};
