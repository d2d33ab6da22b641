pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod registry;
pub mod storage;

#[cfg(test)]
mod testing;

pub use client::{Client, ClientCell};
pub use config::Config;
pub use db::{Database, DatabaseError, MemoryDatabase};
pub use error::{Error, Result};
pub use registry::{InstanceEvent, Registry, Service};
pub use shared::kv::{Event, EventType, Value, KV};
pub use shared::types::Instance;
pub use storage::{CachedStorage, RemoteStorage, Storage, StorageEvent, Storages};
