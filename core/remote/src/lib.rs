//! Remote API client abstraction for the Outbox sync engine.
//!
//! The engine talks to the server only through the [`RemoteApi`] trait:
//! create, update, delete and list per entity type. Implementations:
//! - [`HttpRemote`]: JSON-over-HTTP client built on reqwest
//! - [`MemoryRemote`]: in-process fake server for tests and demos
//!
//! # Design Principles
//! - Stateless clients: safe to call concurrently from the coordinator
//! - Idempotent writes: every create/update/delete carries a key derived
//!   from the op id, so a replayed request is recognized server-side
//! - Outcome classification lives here, retry policy does not

pub mod api;
pub mod http;
pub mod memory;

pub use api::{
    CreateAck, DeleteAck, IdempotencyKey, RemoteApi, RemoteEntity, RemoteError, RemoteResult,
    UpdateAck,
};
pub use http::HttpRemote;
pub use memory::{CallMethod, MemoryRemote, RemoteCall};
