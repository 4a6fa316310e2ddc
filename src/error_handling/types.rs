use std::fmt;

use crate::storage::types::ProfileId;

#[derive(Debug)]
pub enum ConfigError {
    IoError(std::io::Error),
    TomlError(String),
    InvalidValue(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {}", e),
            ConfigError::TomlError(e) => write!(f, "TOML parsing error: {}", e),
            ConfigError::InvalidValue(e) => write!(f, "Invalid configuration value: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::IoError(err)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StorageError {
    ReadFailed(String),
    WriteFailed(String),
    NotFound(String),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::ReadFailed(e) => write!(f, "Storage read failed: {}", e),
            StorageError::WriteFailed(e) => write!(f, "Storage write failed: {}", e),
            StorageError::NotFound(e) => write!(f, "Record not found: {}", e),
        }
    }
}

impl std::error::Error for StorageError {}

/// Failures reported by the underlying automation client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientError {
    SpawnFailed(String),
    InitFailed(String),
    RequestFailed(String),
    Timeout(String),
    Closed,
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::SpawnFailed(e) => write!(f, "Client spawn failed: {}", e),
            ClientError::InitFailed(e) => write!(f, "Client initialization failed: {}", e),
            ClientError::RequestFailed(e) => write!(f, "Client request failed: {}", e),
            ClientError::Timeout(e) => write!(f, "Client request timed out: {}", e),
            ClientError::Closed => write!(f, "Client connection closed"),
        }
    }
}

impl std::error::Error for ClientError {}

/// Failures surfaced by the connection orchestrator to its callers.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    NotFound(String),
    Forbidden,
    ValidationError(String),
    NotConnected(ProfileId),
    RecipientUnregistered(String),
    SendFailed(String),
    InitFailed(String),
    PersistenceError(StorageError),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::NotFound(e) => write!(f, "{} not found", e),
            SessionError::Forbidden => write!(f, "Access denied"),
            SessionError::ValidationError(e) => write!(f, "{}", e),
            SessionError::NotConnected(id) => {
                write!(f, "WhatsApp client for profile {} is not initialized", id)
            }
            SessionError::RecipientUnregistered(to) => {
                write!(f, "The number {} is not registered on WhatsApp", to)
            }
            SessionError::SendFailed(e) => write!(f, "Failed to send message: {}", e),
            SessionError::InitFailed(e) => write!(f, "Failed to initialize client: {}", e),
            SessionError::PersistenceError(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<StorageError> for SessionError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(what) => SessionError::NotFound(what),
            other => SessionError::PersistenceError(other),
        }
    }
}

/// Failures of the login gate.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthError {
    MissingFields,
    InvalidCredentials,
    UsernameTaken,
    HashingFailed(String),
    Storage(StorageError),
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::MissingFields => write!(f, "Username and password are required"),
            AuthError::InvalidCredentials => write!(f, "Invalid username or password"),
            AuthError::UsernameTaken => write!(f, "Username already exists"),
            AuthError::HashingFailed(e) => write!(f, "Password hashing failed: {}", e),
            AuthError::Storage(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for AuthError {}

impl From<StorageError> for AuthError {
    fn from(err: StorageError) -> Self {
        AuthError::Storage(err)
    }
}

#[derive(Debug)]
pub enum WebError {
    BindFailed(String),
}

impl fmt::Display for WebError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WebError::BindFailed(e) => write!(f, "Web server bind failed: {}", e),
        }
    }
}

impl std::error::Error for WebError {}

#[derive(Debug)]
pub enum ControllerError {
    ConfigurationError(ConfigError),
    StorageError(StorageError),
    WebError(WebError),
    InitializationFailed(String),
}

impl fmt::Display for ControllerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerError::ConfigurationError(e) => write!(f, "Configuration error: {}", e),
            ControllerError::StorageError(e) => write!(f, "Storage error: {}", e),
            ControllerError::WebError(e) => write!(f, "Web error: {}", e),
            ControllerError::InitializationFailed(e) => write!(f, "Initialization failed: {}", e),
        }
    }
}

impl std::error::Error for ControllerError {}

impl From<ConfigError> for ControllerError {
    fn from(err: ConfigError) -> Self {
        ControllerError::ConfigurationError(err)
    }
}

impl From<StorageError> for ControllerError {
    fn from(err: StorageError) -> Self {
        ControllerError::StorageError(err)
    }
}

impl From<WebError> for ControllerError {
    fn from(err: WebError) -> Self {
        ControllerError::WebError(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_not_found_maps_to_session_not_found() {
        let err: SessionError = StorageError::NotFound("Profile 4".to_string()).into();
        assert_eq!(err, SessionError::NotFound("Profile 4".to_string()));
        assert_eq!(err.to_string(), "Profile 4 not found");
    }

    #[test]
    fn storage_write_failure_maps_to_persistence_error() {
        let err: SessionError = StorageError::WriteFailed("disk full".to_string()).into();
        assert!(matches!(err, SessionError::PersistenceError(_)));
    }
}
