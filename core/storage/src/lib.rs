//! Durable key-value persistence for the Outbox sync engine.
//!
//! The local record store and the mutation queue are both built on the
//! [`KvStore`] trait defined here. Backends:
//! - [`MemoryKv`]: in-process, for tests and ephemeral sessions
//! - [`SqliteKv`]: single-file SQLite database for devices
//!
//! # Durability contract
//! A `put` or `delete` that returns `Ok` has reached durable storage.

pub mod kv;
pub mod memory;
pub mod sqlite;

pub use kv::{KvStore, Namespace};
pub use memory::MemoryKv;
pub use sqlite::SqliteKv;
