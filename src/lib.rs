//! Purpose: Library crate behind the `poolprobe` CLI and the C ABI.
//! Exports: `api` (stable re-exports), `abi` (C entry points), `core` (implementation).
//! Role: Resolves slot-pool handles and views foreign records inside a host process or
//! inside memory dumps, driven by per-build profiles.
//! Invariants: Every host-specific constant comes from a `Profile`, never from code paths.
//! Invariants: Core modules prefer explicit inputs/outputs over hidden state.
pub mod abi;
pub mod api;
pub mod core;
