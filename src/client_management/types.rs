//! Core types used by the client management subsystem.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::client_management::whatsapp_client::WhatsAppClient;
use crate::error_handling::types::ClientError;
use crate::session_management::SessionEvent;
use crate::storage::types::ProfileId;

/// Lifecycle notifications emitted by an automation client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Qr(String),
    Authenticated,
    Ready,
    AuthFailure(String),
    Disconnected(String),
}

impl From<ClientEvent> for SessionEvent {
    fn from(event: ClientEvent) -> Self {
        match event {
            ClientEvent::Qr(payload) => SessionEvent::Qr(payload),
            ClientEvent::Authenticated => SessionEvent::Authenticated,
            ClientEvent::Ready => SessionEvent::Ready,
            ClientEvent::AuthFailure(reason) => SessionEvent::AuthFailure(reason),
            ClientEvent::Disconnected(reason) => SessionEvent::Disconnected(reason),
        }
    }
}

/// What a factory needs to build a client for one profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSpec {
    pub profile_id: ProfileId,
    /// Name of the client's local credential store.
    pub session_key: String,
    pub browser_path: Option<String>,
}

/// Name of a profile's credential store, also persisted as its session marker.
pub fn session_key_for(profile_id: ProfileId) -> String {
    format!("profile-{}", profile_id)
}

impl ClientSpec {
    pub fn new(profile_id: ProfileId, browser_path: Option<String>) -> Self {
        Self {
            profile_id,
            session_key: session_key_for(profile_id),
            browser_path,
        }
    }
}

/// A freshly built client and the receiving end of its event stream.
pub struct ClientParts {
    pub client: Arc<dyn WhatsAppClient>,
    pub events: mpsc::UnboundedReceiver<ClientEvent>,
}

/// Handle describing one live client owned by the supervisor.
///
/// Every handle gets a fresh `id`, so a handle created by a reconnect is never
/// mistaken for the one it replaced.
#[derive(Clone)]
pub struct ClientHandle {
    id: Uuid,
    profile_id: ProfileId,
    session_key: String,
    created_at: DateTime<Utc>,
    client: Arc<dyn WhatsAppClient>,
}

impl ClientHandle {
    pub(crate) fn new(spec: &ClientSpec, client: Arc<dyn WhatsAppClient>) -> Self {
        Self {
            id: Uuid::new_v4(),
            profile_id: spec.profile_id,
            session_key: spec.session_key.clone(),
            created_at: Utc::now(),
            client,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn profile_id(&self) -> ProfileId {
        self.profile_id
    }

    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub async fn initialize(&self) -> Result<(), ClientError> {
        self.client.initialize().await
    }

    pub async fn is_registered_user(&self, chat_id: &str) -> Result<bool, ClientError> {
        self.client.is_registered_user(chat_id).await
    }

    pub async fn send_message(&self, chat_id: &str, text: &str) -> Result<String, ClientError> {
        self.client.send_message(chat_id, text).await
    }

    /// Only the supervisor tears clients down.
    pub(super) async fn destroy(&self) -> Result<(), ClientError> {
        self.client.destroy().await
    }
}

impl fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandle")
            .field("id", &self.id)
            .field("profile_id", &self.profile_id)
            .field("session_key", &self.session_key)
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Aggregate counters describing the current and historical client state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientStats {
    /// Number of handles currently alive.
    pub active_count: usize,
    /// Total number of handles created since startup.
    pub total_created: u64,
    /// Number of teardowns that failed or timed out.
    pub failed_count: u64,
}
