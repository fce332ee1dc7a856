//! Durable backends for the capture log.
//!
//! ```text
//! ┌─────────────┐   append/update/remove   ┌──────────────┐
//! │ OpCapture   │ ───────────────────────► │ RocksOpStore │
//! │ (in-memory) │                          │ (RocksDB)    │
//! └──────┬──────┘                          └──────┬───────┘
//!        │ restore_from_store                     │ column families
//!        ▼                                        ▼
//! ┌─────────────┐     ┌──────────────────────────────────────┐
//! │ Capture log │     │ CF "ops"  — LZ4 entries, u64 BE keys │
//! │ (rebuilt)   │     │ CF "meta" — next key, entry count    │
//! └─────────────┘     └──────────────────────────────────────┘
//! ```

pub mod rocks;

pub use rocks::{LogMetadata, RocksOpStore, StoreConfig};
