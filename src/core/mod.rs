// Core modules: foreign memory access, declarative layouts, and slot-pool resolution.
pub mod bindings;
pub mod directory;
pub mod dispatch;
pub mod error;
pub mod geometry;
pub mod hexint;
pub mod layout;
pub mod listeners;
pub mod memory;
pub mod overlay;
pub mod profile;
pub mod resolver;
