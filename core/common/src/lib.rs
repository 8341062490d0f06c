//! Common types shared across the Outbox sync engine crates.
//!
//! This module provides the identifiers, entity taxonomy and error type that
//! the storage, remote and sync layers agree on.

pub mod error;
pub mod schema;
pub mod types;

pub use error::{Error, Result};
pub use schema::{ReferenceField, ReferenceSchema};
pub use types::{EntityType, LocalId, OpId, Payload, ServerId};
