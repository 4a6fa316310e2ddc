use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use log::{debug, error, info};
use serde::{Deserialize, Serialize};

use crate::error_handling::types::StorageError;
use crate::session_management::SessionStatus;
use crate::storage::storage_trait::Storage;
use crate::storage::types::{
    NewProfile, NewSettings, NewUser, Profile, ProfileId, ProfileUpdate, Settings, SettingsId,
    SettingsUpdate, User, UserId,
};

/// Name of the document kept inside the data directory.
pub const DATA_FILE_NAME: &str = "data.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Counters {
    user_current_id: u64,
    profile_current_id: u64,
    settings_current_id: u64,
}

impl Default for Counters {
    fn default() -> Self {
        Self {
            user_current_id: 1,
            profile_current_id: 1,
            settings_current_id: 1,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Document {
    #[serde(default)]
    users: Vec<User>,
    #[serde(default)]
    profiles: Vec<Profile>,
    #[serde(default)]
    settings: Vec<Settings>,
    #[serde(default)]
    counters: Counters,
}

/// JSON-document backed store.
///
/// The whole document is rewritten on every mutation. A mutation is only
/// committed to memory once the file write succeeded, so a failed write never
/// leaves the in-memory view ahead of the disk.
pub struct FileStorage {
    data_file: PathBuf,
    document: Mutex<Document>,
}

impl FileStorage {
    /// Opens (or creates) the store under `base_path`, loading `data.json` when present.
    pub fn new<P: AsRef<Path>>(base_path: P) -> Result<Self, StorageError> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path).map_err(|e| {
            error!("Failed to create data dir {}: {}", base_path.display(), e);
            StorageError::WriteFailed(format!("{}: {}", base_path.display(), e))
        })?;

        let data_file = base_path.join(DATA_FILE_NAME);
        let document = if data_file.exists() {
            Self::load(&data_file)?
        } else {
            Document::default()
        };

        info!(
            "FileStorage initialized at {} ({} user(s), {} profile(s))",
            data_file.display(),
            document.users.len(),
            document.profiles.len()
        );

        Ok(Self {
            data_file,
            document: Mutex::new(document),
        })
    }

    pub fn data_file(&self) -> &Path {
        &self.data_file
    }

    fn load(path: &Path) -> Result<Document, StorageError> {
        let content = fs::read_to_string(path).map_err(|e| {
            error!("Failed to read data file {}: {}", path.display(), e);
            StorageError::ReadFailed(format!("{}: {}", path.display(), e))
        })?;
        let mut document: Document = serde_json::from_str(&content).map_err(|e| {
            error!("Failed to parse data file {}: {}", path.display(), e);
            StorageError::ReadFailed(format!("{}: {}", path.display(), e))
        })?;

        // Counters must stay ahead of every stored id, whatever the file says.
        let next = |ids: &mut dyn Iterator<Item = u64>| ids.max().map_or(1, |max| max + 1);
        let c = &mut document.counters;
        c.user_current_id = c
            .user_current_id
            .max(next(&mut document.users.iter().map(|u| u.id)));
        c.profile_current_id = c
            .profile_current_id
            .max(next(&mut document.profiles.iter().map(|p| p.id)));
        c.settings_current_id = c
            .settings_current_id
            .max(next(&mut document.settings.iter().map(|s| s.id)));

        debug!("Loaded data file {}", path.display());
        Ok(document)
    }

    fn save(&self, document: &Document) -> Result<(), StorageError> {
        let json = serde_json::to_string_pretty(document).map_err(|e| {
            error!("Failed to serialize data document: {}", e);
            StorageError::WriteFailed(e.to_string())
        })?;
        let tmp = self.data_file.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|e| {
            error!("Failed to write {}: {}", tmp.display(), e);
            StorageError::WriteFailed(format!("{}: {}", tmp.display(), e))
        })?;
        fs::rename(&tmp, &self.data_file).map_err(|e| {
            error!("Failed to replace {}: {}", self.data_file.display(), e);
            StorageError::WriteFailed(format!("{}: {}", self.data_file.display(), e))
        })?;
        debug!("Saved data file {}", self.data_file.display());
        Ok(())
    }

    fn read<T>(&self, f: impl FnOnce(&Document) -> T) -> Result<T, StorageError> {
        let document = self
            .document
            .lock()
            .map_err(|_| StorageError::ReadFailed("storage lock poisoned".to_string()))?;
        Ok(f(&document))
    }

    /// Applies `f` to a copy of the document, persists it, then commits it.
    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut Document) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let mut document = self
            .document
            .lock()
            .map_err(|_| StorageError::WriteFailed("storage lock poisoned".to_string()))?;
        let mut draft = document.clone();
        let result = f(&mut draft)?;
        self.save(&draft)?;
        *document = draft;
        Ok(result)
    }
}

impl Storage for FileStorage {
    fn get_user(&self, id: UserId) -> Result<Option<User>, StorageError> {
        self.read(|doc| doc.users.iter().find(|u| u.id == id).cloned())
    }

    fn get_user_by_username(&self, username: &str) -> Result<Option<User>, StorageError> {
        self.read(|doc| doc.users.iter().find(|u| u.username == username).cloned())
    }

    fn list_users(&self) -> Result<Vec<User>, StorageError> {
        self.read(|doc| {
            let mut users = doc.users.clone();
            users.sort_by_key(|u| u.id);
            users
        })
    }

    fn create_user(&self, user: NewUser) -> Result<User, StorageError> {
        let user = self.mutate(|doc| {
            let created = User {
                id: doc.counters.user_current_id,
                username: user.username,
                password: user.password,
            };
            doc.counters.user_current_id += 1;
            doc.users.push(created.clone());
            Ok(created)
        })?;
        info!("Created user {} ({})", user.id, user.username);
        Ok(user)
    }

    fn get_profiles(&self, user_id: UserId) -> Result<Vec<Profile>, StorageError> {
        self.read(|doc| {
            let mut profiles: Vec<Profile> = doc
                .profiles
                .iter()
                .filter(|p| p.user_id == user_id)
                .cloned()
                .collect();
            profiles.sort_by_key(|p| p.id);
            profiles
        })
    }

    fn get_profile(&self, id: ProfileId) -> Result<Option<Profile>, StorageError> {
        self.read(|doc| doc.profiles.iter().find(|p| p.id == id).cloned())
    }

    fn get_profile_by_label(
        &self,
        label: &str,
        user_id: UserId,
    ) -> Result<Option<Profile>, StorageError> {
        self.read(|doc| {
            doc.profiles
                .iter()
                .find(|p| p.label == label && p.user_id == user_id)
                .cloned()
        })
    }

    fn create_profile(&self, profile: NewProfile) -> Result<Profile, StorageError> {
        let profile = self.mutate(|doc| {
            let created = Profile {
                id: doc.counters.profile_current_id,
                label: profile.label,
                phone: profile.phone,
                status: SessionStatus::Disconnected,
                last_active: None,
                session_data: None,
                user_id: profile.user_id,
                created_at: Utc::now(),
            };
            doc.counters.profile_current_id += 1;
            doc.profiles.push(created.clone());
            Ok(created)
        })?;
        info!("Created profile {} ({})", profile.id, profile.label);
        Ok(profile)
    }

    fn update_profile(
        &self,
        id: ProfileId,
        update: ProfileUpdate,
    ) -> Result<Profile, StorageError> {
        self.mutate(|doc| {
            let profile = doc
                .profiles
                .iter_mut()
                .find(|p| p.id == id)
                .ok_or_else(|| StorageError::NotFound(format!("Profile {}", id)))?;
            update.apply_to(profile);
            Ok(profile.clone())
        })
    }

    fn delete_profile(&self, id: ProfileId) -> Result<(), StorageError> {
        self.mutate(|doc| {
            let before = doc.profiles.len();
            doc.profiles.retain(|p| p.id != id);
            if doc.profiles.len() == before {
                return Err(StorageError::NotFound(format!("Profile {}", id)));
            }
            Ok(())
        })?;
        info!("Deleted profile {}", id);
        Ok(())
    }

    fn get_settings(&self, user_id: UserId) -> Result<Option<Settings>, StorageError> {
        self.read(|doc| doc.settings.iter().find(|s| s.user_id == user_id).cloned())
    }

    fn create_settings(&self, settings: NewSettings) -> Result<Settings, StorageError> {
        self.mutate(|doc| {
            let created = Settings {
                id: doc.counters.settings_current_id,
                port: settings.port,
                username: settings.username,
                password: settings.password,
                browser_path: settings.browser_path,
                user_id: settings.user_id,
            };
            doc.counters.settings_current_id += 1;
            doc.settings.push(created.clone());
            Ok(created)
        })
    }

    fn update_settings(
        &self,
        id: SettingsId,
        update: SettingsUpdate,
    ) -> Result<Settings, StorageError> {
        self.mutate(|doc| {
            let settings = doc
                .settings
                .iter_mut()
                .find(|s| s.id == id)
                .ok_or_else(|| StorageError::NotFound(format!("Settings {}", id)))?;
            update.apply_to(settings);
            Ok(settings.clone())
        })
    }
}
