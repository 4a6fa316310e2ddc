//! Storage Trait
//!
//! This module defines the `Storage` trait, the record-store interface the rest
//! of the crate depends on.
//!
//! Implementors of this trait are responsible for:
//! - Persisting users and their credentials
//! - Creating, reading, updating and deleting profiles scoped by owning user
//! - Persisting per-user settings
//!
//! All methods return a `Result` to handle potential storage errors. Lookups by
//! id return `Ok(None)` for absent records; updates and deletes of absent records
//! fail with `StorageError::NotFound`.

use crate::error_handling::types::StorageError;
use crate::storage::types::{
    NewProfile, NewSettings, NewUser, Profile, ProfileId, ProfileUpdate, Settings, SettingsId,
    SettingsUpdate, User, UserId,
};

pub trait Storage: Send + Sync {
    fn get_user(&self, id: UserId) -> Result<Option<User>, StorageError>;

    fn get_user_by_username(&self, username: &str) -> Result<Option<User>, StorageError>;

    /// Lists every user ordered by id.
    fn list_users(&self) -> Result<Vec<User>, StorageError>;

    fn create_user(&self, user: NewUser) -> Result<User, StorageError>;

    /// Lists the profiles owned by `user_id`, ordered by id.
    fn get_profiles(&self, user_id: UserId) -> Result<Vec<Profile>, StorageError>;

    fn get_profile(&self, id: ProfileId) -> Result<Option<Profile>, StorageError>;

    fn get_profile_by_label(
        &self,
        label: &str,
        user_id: UserId,
    ) -> Result<Option<Profile>, StorageError>;

    /// Creates a profile with status `disconnected` and no session data.
    fn create_profile(&self, profile: NewProfile) -> Result<Profile, StorageError>;

    fn update_profile(&self, id: ProfileId, update: ProfileUpdate)
        -> Result<Profile, StorageError>;

    fn delete_profile(&self, id: ProfileId) -> Result<(), StorageError>;

    fn get_settings(&self, user_id: UserId) -> Result<Option<Settings>, StorageError>;

    fn create_settings(&self, settings: NewSettings) -> Result<Settings, StorageError>;

    fn update_settings(
        &self,
        id: SettingsId,
        update: SettingsUpdate,
    ) -> Result<Settings, StorageError>;
}
