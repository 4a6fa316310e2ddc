//! Connection-state machine.
//!
//! ```text
//! (none) --initialize--> initializing
//! initializing|qr_ready --qr--> qr_ready
//! initializing|qr_ready --authenticated--> authenticated
//! authenticated --ready--> connected
//! initializing|qr_ready|authenticated|connected --auth_failure|disconnected--> disconnected
//! initializing|qr_ready|authenticated --init failure--> error
//! ```
//!
//! Everything here is pure; the orchestrator decides what to do with a
//! [`Transition`].

use serde::{Deserialize, Serialize};

use crate::session_management::SessionStatus;
use crate::storage::types::ProfileId;

/// Ephemeral connection state of one profile.
///
/// `qr_code` is only ever present while `status` is `QrReady`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub profile_id: ProfileId,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qr_code: Option<String>,
}

/// Inputs of the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Qr(String),
    Authenticated,
    Ready,
    AuthFailure(String),
    Disconnected(String),
    InitFailed(String),
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::Qr(_) => "qr",
            SessionEvent::Authenticated => "authenticated",
            SessionEvent::Ready => "ready",
            SessionEvent::AuthFailure(_) => "auth_failure",
            SessionEvent::Disconnected(_) => "disconnected",
            SessionEvent::InitFailed(_) => "init_failure",
        }
    }
}

/// Durable write owed to the profile store after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    None,
    Connected,
    Disconnected { clear_credentials: bool },
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub session: Session,
    pub checkpoint: Checkpoint,
}

/// Returns the status reached from `current` on `event`, or `None` when the
/// event is not accepted in that state.
pub fn next_status(current: SessionStatus, event: &SessionEvent) -> Option<SessionStatus> {
    use SessionStatus::*;

    match (current, event) {
        (Initializing | QrReady, SessionEvent::Qr(_)) => Some(QrReady),
        (Initializing | QrReady, SessionEvent::Authenticated) => Some(Authenticated),
        (Authenticated, SessionEvent::Ready) => Some(Connected),
        (
            Initializing | QrReady | Authenticated | Connected,
            SessionEvent::AuthFailure(_) | SessionEvent::Disconnected(_),
        ) => Some(Disconnected),
        (Initializing | QrReady | Authenticated, SessionEvent::InitFailed(_)) => Some(Error),
        _ => None,
    }
}

impl Session {
    pub fn new(profile_id: ProfileId, status: SessionStatus) -> Self {
        Self {
            profile_id,
            status,
            qr_code: None,
        }
    }

    pub fn initializing(profile_id: ProfileId) -> Self {
        Self::new(profile_id, SessionStatus::Initializing)
    }

    pub fn disconnected(profile_id: ProfileId) -> Self {
        Self::new(profile_id, SessionStatus::Disconnected)
    }

    /// Applies `event`, producing the replacement session and its checkpoint.
    pub fn apply(&self, event: &SessionEvent) -> Option<Transition> {
        let status = next_status(self.status, event)?;

        let qr_code = match event {
            SessionEvent::Qr(payload) => Some(payload.clone()),
            _ => None,
        };

        let checkpoint = match (status, event) {
            (SessionStatus::Connected, _) => Checkpoint::Connected,
            (SessionStatus::Disconnected, SessionEvent::AuthFailure(_)) => {
                Checkpoint::Disconnected {
                    clear_credentials: true,
                }
            }
            (SessionStatus::Disconnected, _) => Checkpoint::Disconnected {
                clear_credentials: false,
            },
            (SessionStatus::Error, _) => Checkpoint::Failed,
            _ => Checkpoint::None,
        };

        Some(Transition {
            session: Session {
                profile_id: self.profile_id,
                status,
                qr_code,
            },
            checkpoint,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATES: [SessionStatus; 6] = [
        SessionStatus::Initializing,
        SessionStatus::QrReady,
        SessionStatus::Authenticated,
        SessionStatus::Connected,
        SessionStatus::Disconnected,
        SessionStatus::Error,
    ];

    fn all_events() -> Vec<SessionEvent> {
        vec![
            SessionEvent::Qr("2@abc".into()),
            SessionEvent::Authenticated,
            SessionEvent::Ready,
            SessionEvent::AuthFailure("bad creds".into()),
            SessionEvent::Disconnected("NAVIGATION".into()),
            SessionEvent::InitFailed("browser crashed".into()),
        ]
    }

    #[test]
    fn qr_code_only_present_in_qr_ready() {
        for status in ALL_STATES {
            let session = Session {
                profile_id: 1,
                status,
                qr_code: (status == SessionStatus::QrReady).then(|| "old".to_string()),
            };
            for event in all_events() {
                if let Some(t) = session.apply(&event) {
                    assert_eq!(
                        t.session.qr_code.is_some(),
                        t.session.status == SessionStatus::QrReady,
                        "{:?} + {:?}",
                        status,
                        event
                    );
                }
            }
        }
    }

    #[test]
    fn terminal_states_accept_nothing() {
        for status in [SessionStatus::Disconnected, SessionStatus::Error] {
            let session = Session::new(1, status);
            for event in all_events() {
                assert!(session.apply(&event).is_none(), "{:?} + {:?}", status, event);
            }
        }
    }

    #[test]
    fn happy_path_reaches_connected_with_checkpoint() {
        let s = Session::initializing(3);
        let t = s.apply(&SessionEvent::Qr("QR-1".into())).unwrap();
        assert_eq!(t.session.status, SessionStatus::QrReady);
        assert_eq!(t.session.qr_code.as_deref(), Some("QR-1"));
        assert_eq!(t.checkpoint, Checkpoint::None);

        // the QR payload rotates while waiting for a scan
        let t = t.session.apply(&SessionEvent::Qr("QR-2".into())).unwrap();
        assert_eq!(t.session.qr_code.as_deref(), Some("QR-2"));

        let t = t.session.apply(&SessionEvent::Authenticated).unwrap();
        assert_eq!(t.session.status, SessionStatus::Authenticated);
        assert_eq!(t.session.qr_code, None);
        assert_eq!(t.checkpoint, Checkpoint::None);

        let t = t.session.apply(&SessionEvent::Ready).unwrap();
        assert_eq!(t.session.status, SessionStatus::Connected);
        assert_eq!(t.checkpoint, Checkpoint::Connected);
    }

    #[test]
    fn ready_requires_authentication_first() {
        assert!(Session::initializing(1).apply(&SessionEvent::Ready).is_none());
        assert!(Session::new(1, SessionStatus::QrReady)
            .apply(&SessionEvent::Ready)
            .is_none());
    }

    #[test]
    fn auth_failure_clears_credentials_but_disconnect_does_not() {
        let connected = Session::new(1, SessionStatus::Connected);
        let t = connected
            .apply(&SessionEvent::AuthFailure("revoked".into()))
            .unwrap();
        assert_eq!(t.session.status, SessionStatus::Disconnected);
        assert_eq!(
            t.checkpoint,
            Checkpoint::Disconnected {
                clear_credentials: true
            }
        );

        let t = connected
            .apply(&SessionEvent::Disconnected("LOGOUT".into()))
            .unwrap();
        assert_eq!(
            t.checkpoint,
            Checkpoint::Disconnected {
                clear_credentials: false
            }
        );
    }

    #[test]
    fn init_failure_only_before_connected() {
        let t = Session::new(1, SessionStatus::QrReady)
            .apply(&SessionEvent::InitFailed("boom".into()))
            .unwrap();
        assert_eq!(t.session.status, SessionStatus::Error);
        assert_eq!(t.session.qr_code, None);
        assert_eq!(t.checkpoint, Checkpoint::Failed);

        assert!(Session::new(1, SessionStatus::Connected)
            .apply(&SessionEvent::InitFailed("late".into()))
            .is_none());
    }

    #[test]
    fn session_json_omits_absent_qr() {
        let json = serde_json::to_value(Session::initializing(9)).unwrap();
        assert_eq!(json, serde_json::json!({"profileId": 9, "status": "initializing"}));
    }
}
