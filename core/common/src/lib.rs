//! Common utilities and types shared across offsync crates.
//!
//! This module provides the error type and the identifier types used by the
//! storage layer and the sync engine.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{ItemId, StoreKey};
