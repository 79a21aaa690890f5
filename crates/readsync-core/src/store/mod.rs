//! Storage gateways shipped with the engine.
//!
//! `MemoryStore` backs tests and fixture replays; `SledStore` persists to a
//! local sled database.

pub mod memory;
pub mod sled_store;

pub use memory::MemoryStore;
pub use sled_store::SledStore;
