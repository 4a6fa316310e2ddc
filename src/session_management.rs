//! Session management core module.
//!
//! This module provides the connection-state machine and the components that
//! keep it in sync across concurrent profiles:
//! - `session`: the pure transition function over [`SessionStatus`]
//! - `session_registry`: where every profile's connection is right now
//! - `event_broadcaster`: fan-out of registry changes to live observers
//! - `orchestrator`: the public operations sequencing clients, registry and observers

use std::fmt;

use serde::{Deserialize, Serialize};

/// Submodule for live observer fan-out.
pub mod event_broadcaster;
/// Submodule for the coordinating façade.
pub mod orchestrator;
/// Submodule for session data structures and transitions.
pub mod session;
/// Submodule for the in-memory session map.
pub mod session_registry;

pub use event_broadcaster::{EventBroadcaster, LiveMessage, ObserverId};
pub use orchestrator::{ConnectionOrchestrator, InitOutcome, OrchestratorOptions};
pub use session::{Checkpoint, Session, SessionEvent, Transition};
pub use session_registry::SessionRegistry;

/// Represents the connection status of a profile.
///
/// Variants:
/// - `Initializing`: a client was created and is starting up.
/// - `QrReady`: waiting for the QR code to be scanned.
/// - `Authenticated`: credentials accepted, client not ready yet.
/// - `Connected`: the client can send messages.
/// - `Disconnected`: the client is gone; only a reconnect brings it back.
/// - `Error`: client startup failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Initializing,
    QrReady,
    Authenticated,
    Connected,
    Disconnected,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Initializing => "initializing",
            SessionStatus::QrReady => "qr_ready",
            SessionStatus::Authenticated => "authenticated",
            SessionStatus::Connected => "connected",
            SessionStatus::Disconnected => "disconnected",
            SessionStatus::Error => "error",
        }
    }

    /// Terminal states are left only through an explicit reconnect.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Disconnected | SessionStatus::Error)
    }

    /// Startup has not completed yet.
    pub fn is_pending(&self) -> bool {
        matches!(self, SessionStatus::Initializing | SessionStatus::QrReady)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
