use async_trait::async_trait;

use crate::client_management::types::{ClientParts, ClientSpec};
use crate::error_handling::types::ClientError;

/// The browser-automation capability driven by the session engine.
///
/// Lifecycle events are not part of this trait; they arrive on the channel
/// returned alongside the client in [`ClientParts`].
#[async_trait]
pub trait WhatsAppClient: Send + Sync {
    /// Starts the client. Resolves once startup is underway, before any QR
    /// code has been scanned.
    async fn initialize(&self) -> Result<(), ClientError>;

    async fn is_registered_user(&self, chat_id: &str) -> Result<bool, ClientError>;

    /// Sends `text` to `chat_id` and returns the provider-assigned message id.
    async fn send_message(&self, chat_id: &str, text: &str) -> Result<String, ClientError>;

    async fn destroy(&self) -> Result<(), ClientError>;
}

/// Builds clients. Creation must not block; startup happens in `initialize`.
pub trait ClientFactory: Send + Sync {
    fn create(&self, spec: ClientSpec) -> Result<ClientParts, ClientError>;
}
