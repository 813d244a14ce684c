//! Storage backend abstraction for offsync.
//!
//! This module provides a trait-based interface for the key/value stores
//! the sync engine persists into, and a registry for resolving a backend
//! by name and configuration.
//!
//! # Design Principles
//! - Whole-value semantics: a key is always read or replaced as a unit
//! - Async operations: all I/O operations are async
//! - Namespacing: keys are hierarchical so a subsystem can enumerate its own

pub mod backend;
pub mod registry;
pub mod memory;
pub mod local;

pub use backend::StorageBackend;
pub use registry::{BackendFactory, BackendRegistry};
pub use memory::MemoryBackend;
pub use local::LocalBackend;
