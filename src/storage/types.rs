use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::session_management::SessionStatus;

pub type UserId = u64;
pub type ProfileId = u64;
pub type SettingsId = u64;

/// Port stored in freshly created settings.
pub const DEFAULT_SETTINGS_PORT: u16 = 85;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub username: String,
    /// Argon2 PHC string, never the clear-text password.
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub password: String,
}

/// A user-owned named WhatsApp identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub id: ProfileId,
    pub label: String,
    pub phone: Option<String>,
    /// Coarse mirror of the live session, only written at checkpoints.
    pub status: SessionStatus,
    pub last_active: Option<DateTime<Utc>>,
    /// Opaque credential marker. Presence means "authenticated before".
    pub session_data: Option<String>,
    pub user_id: UserId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewProfile {
    pub label: String,
    pub phone: Option<String>,
    pub user_id: UserId,
}

/// Partial profile update. `None` leaves a field untouched, `Some(None)` clears
/// a nullable field.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileUpdate {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub phone: Option<Option<String>>,
    #[serde(default)]
    pub status: Option<SessionStatus>,
    #[serde(default)]
    pub last_active: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "double_option")]
    pub session_data: Option<Option<String>>,
}

impl ProfileUpdate {
    pub fn status(status: SessionStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn last_active(at: DateTime<Utc>) -> Self {
        Self {
            last_active: Some(at),
            ..Default::default()
        }
    }

    pub fn apply_to(self, profile: &mut Profile) {
        if let Some(label) = self.label {
            profile.label = label;
        }
        if let Some(phone) = self.phone {
            profile.phone = phone;
        }
        if let Some(status) = self.status {
            profile.status = status;
        }
        if let Some(at) = self.last_active {
            profile.last_active = Some(at);
        }
        if let Some(data) = self.session_data {
            profile.session_data = data;
        }
    }
}

/// Per-user configuration. `username`/`password` guard the `/send` endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub id: SettingsId,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub browser_path: Option<String>,
    pub user_id: UserId,
}

impl Settings {
    /// Whether both basic-auth fields are filled in.
    pub fn requires_credentials(&self) -> bool {
        let filled = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.is_empty());
        filled(&self.username) && filled(&self.password)
    }

    pub fn browser_path(&self) -> Option<&str> {
        self.browser_path.as_deref().filter(|p| !p.trim().is_empty())
    }
}

#[derive(Debug, Clone)]
pub struct NewSettings {
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub browser_path: Option<String>,
    pub user_id: UserId,
}

impl NewSettings {
    pub fn defaults_for(user_id: UserId) -> Self {
        Self {
            port: DEFAULT_SETTINGS_PORT,
            username: Some(String::new()),
            password: Some(String::new()),
            browser_path: Some(String::new()),
            user_id,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsUpdate {
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default, deserialize_with = "double_option")]
    pub username: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub password: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub browser_path: Option<Option<String>>,
}

impl SettingsUpdate {
    pub fn apply_to(self, settings: &mut Settings) {
        if let Some(port) = self.port {
            settings.port = port;
        }
        if let Some(username) = self.username {
            settings.username = username;
        }
        if let Some(password) = self.password {
            settings.password = password;
        }
        if let Some(path) = self.browser_path {
            settings.browser_path = path;
        }
    }
}

/// Distinguishes an absent field from an explicit `null`.
fn double_option<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_update_distinguishes_null_from_absent() {
        let update: ProfileUpdate = serde_json::from_str(r#"{"phone": null}"#).unwrap();
        assert_eq!(update.phone, Some(None));
        assert_eq!(update.label, None);

        let update: ProfileUpdate = serde_json::from_str(r#"{"label": "Work"}"#).unwrap();
        assert_eq!(update.phone, None);
        assert_eq!(update.label.as_deref(), Some("Work"));
    }

    #[test]
    fn profile_serializes_camel_case_status() {
        let profile = Profile {
            id: 1,
            label: "Work".into(),
            phone: None,
            status: SessionStatus::QrReady,
            last_active: None,
            session_data: None,
            user_id: 7,
            created_at: Utc::now(),
        };
        let json = serde_json::to_value(&profile).unwrap();
        assert_eq!(json["status"], "qr_ready");
        assert_eq!(json["userId"], 7);
        assert!(json.get("lastActive").is_some());
    }

    #[test]
    fn settings_credentials_require_both_fields() {
        let mut settings = Settings {
            id: 1,
            port: DEFAULT_SETTINGS_PORT,
            username: Some("api".into()),
            password: Some(String::new()),
            browser_path: None,
            user_id: 1,
        };
        assert!(!settings.requires_credentials());
        settings.password = Some("secret".into());
        assert!(settings.requires_credentials());
    }
}
