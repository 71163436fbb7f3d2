//! Common utilities and types shared across driftsync crates.
//!
//! This crate provides the error taxonomy and the foundational
//! identifier/time types used by the store and the sync engine.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{monotonic_millis, ItemId, Millis};
