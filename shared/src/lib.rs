pub mod kv;
pub mod protocol;
pub mod types;
