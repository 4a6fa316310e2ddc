use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::session_management::session::Session;
use crate::storage::types::ProfileId;

/// In-memory map from profile id to its current [`Session`].
///
/// The registry never notifies anyone; callers pair every `set` with a
/// broadcast.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<ProfileId, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, profile_id: ProfileId) -> Option<Session> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&profile_id)
            .cloned()
    }

    /// Upserts by profile id, replacing the previous session wholesale.
    pub fn set(&self, session: Session) {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session.profile_id, session);
    }

    /// All sessions ordered by profile id.
    pub fn all(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.profile_id);
        sessions
    }

    pub fn remove(&self, profile_id: ProfileId) -> Option<Session> {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&profile_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session_management::SessionStatus;

    #[test]
    fn set_replaces_in_place() {
        let registry = SessionRegistry::new();
        registry.set(Session::initializing(2));
        registry.set(Session {
            profile_id: 2,
            status: SessionStatus::QrReady,
            qr_code: Some("qr".into()),
        });
        registry.set(Session::initializing(1));

        let all = registry.all();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].profile_id, 1);
        assert_eq!(all[1].status, SessionStatus::QrReady);
        assert_eq!(registry.get(2).unwrap().qr_code.as_deref(), Some("qr"));
        assert!(registry.get(3).is_none());
    }

    #[test]
    fn remove_drops_entry() {
        let registry = SessionRegistry::new();
        registry.set(Session::disconnected(5));
        assert!(registry.remove(5).is_some());
        assert!(registry.all().is_empty());
    }
}
