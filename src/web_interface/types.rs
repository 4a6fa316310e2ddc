//! Request and response bodies of the HTTP API.

use serde::{Deserialize, Serialize};

use crate::messaging::OutgoingMessage;
use crate::storage::types::{Profile, ProfileId, Settings, SettingsId, User, UserId};

/// API error payload
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ApiMessage {
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct CredentialsRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub id: UserId,
    pub username: String,
}

impl From<&User> for UserResponse {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateProfileRequest {
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub phone: Option<String>,
}

/// A profile plus the live status of its session, `"unknown"` when it has
/// none yet.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileResponse {
    #[serde(flatten)]
    pub profile: Profile,
    pub session_status: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qr_code: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SendRequest {
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendByLabelRequest {
    #[serde(default)]
    pub profile_label: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResponse {
    pub success: bool,
    pub message_id: String,
    pub to: String,
    pub message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkSendRequest {
    pub messages: Vec<OutgoingMessage>,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub delay_secs: Option<u64>,
}

/// Settings as shown to their owner. The stored password never leaves the
/// server.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsResponse {
    pub id: SettingsId,
    pub port: u16,
    pub username: Option<String>,
    pub has_password: bool,
    pub browser_path: Option<String>,
    pub user_id: UserId,
}

impl From<Settings> for SettingsResponse {
    fn from(settings: Settings) -> Self {
        Self {
            id: settings.id,
            port: settings.port,
            has_password: settings.password.as_deref().is_some_and(|p| !p.is_empty()),
            username: settings.username,
            browser_path: settings.browser_path,
            user_id: settings.user_id,
        }
    }
}

/// Query of the `/send` convenience endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct SendQuery {
    pub from: Option<String>,
    pub to: Option<String>,
    pub message: Option<String>,
    pub user: Option<String>,
    pub pass: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LiveQuery {
    pub token: Option<String>,
}

/// Commands accepted on the live channel.
#[derive(Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum LiveCommand {
    Reconnect {
        #[serde(rename = "profileId")]
        profile_id: ProfileId,
    },
}
