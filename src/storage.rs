//! Storage subsystem
//!
//! This module provides the durable record store for users, profiles and
//! per-user settings.
//!
//! Components:
//! - `storage_trait`: the Storage trait defining a uniform API.
//! - `types`: record types shared by storage backends and the web layer.
//! - `file_storage`: single JSON document rewritten wholesale on every mutation.

pub mod file_storage;
pub mod storage_trait;
pub mod types;

pub use file_storage::FileStorage;
pub use storage_trait::Storage;
