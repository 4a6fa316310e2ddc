//! Fan-out of session changes to live observers.
//!
//! Every observer owns a bounded channel. A subscriber first receives the
//! full snapshot, then one `session-update` per committed change. Observers
//! that are gone or cannot keep up are dropped rather than blocking the
//! publisher.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, warn};
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

use crate::session_management::session::Session;
use crate::session_management::session_registry::SessionRegistry;
use crate::storage::types::ProfileId;

pub type ObserverId = Uuid;

/// Decides which profiles an observer may see.
pub type ProfileFilter = Arc<dyn Fn(ProfileId) -> bool + Send + Sync>;

/// Messages pushed to observers, serialized as `{"type": ..., "data": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum LiveMessage {
    Sessions(Vec<Session>),
    SessionUpdate(Session),
}

struct Observer {
    sender: mpsc::Sender<LiveMessage>,
    filter: Option<ProfileFilter>,
}

impl Observer {
    fn accepts(&self, profile_id: ProfileId) -> bool {
        self.filter.as_ref().map_or(true, |f| f(profile_id))
    }
}

pub struct EventBroadcaster {
    registry: Arc<SessionRegistry>,
    observers: Mutex<HashMap<ObserverId, Observer>>,
    buffer: usize,
}

impl EventBroadcaster {
    pub fn new(registry: Arc<SessionRegistry>, buffer: usize) -> Self {
        Self {
            registry,
            observers: Mutex::new(HashMap::new()),
            buffer: buffer.max(1),
        }
    }

    /// Registers an observer and queues the current snapshot as its first
    /// message.
    ///
    /// The snapshot is taken while holding the observer lock, so no publish
    /// can slip in between the snapshot and the registration.
    pub fn subscribe(
        &self,
        filter: Option<ProfileFilter>,
    ) -> (ObserverId, mpsc::Receiver<LiveMessage>) {
        let (sender, receiver) = mpsc::channel(self.buffer);
        let id = Uuid::new_v4();
        let observer = Observer { sender, filter };

        let mut observers = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
        let snapshot: Vec<Session> = self
            .registry
            .all()
            .into_iter()
            .filter(|s| observer.accepts(s.profile_id))
            .collect();
        // A fresh channel always has room for one message.
        let _ = observer.sender.try_send(LiveMessage::Sessions(snapshot));
        observers.insert(id, observer);

        debug!("Observer {} subscribed ({} total)", id, observers.len());
        (id, receiver)
    }

    pub fn unsubscribe(&self, id: ObserverId) {
        let mut observers = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
        if observers.remove(&id).is_some() {
            debug!("Observer {} unsubscribed ({} left)", id, observers.len());
        }
    }

    /// Delivers `session` to every interested observer.
    pub fn publish(&self, session: &Session) {
        let mut observers = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut dropped = Vec::new();

        for (id, observer) in observers.iter() {
            if !observer.accepts(session.profile_id) {
                continue;
            }
            match observer
                .sender
                .try_send(LiveMessage::SessionUpdate(session.clone()))
            {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("Observer {} is not keeping up, dropping it", id);
                    dropped.push(*id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Observer {} went away", id);
                    dropped.push(*id);
                }
            }
        }

        for id in dropped {
            observers.remove(&id);
        }
    }

    pub fn observer_count(&self) -> usize {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session_management::SessionStatus;

    fn broadcaster(buffer: usize) -> (Arc<SessionRegistry>, EventBroadcaster) {
        let registry = Arc::new(SessionRegistry::new());
        let broadcaster = EventBroadcaster::new(registry.clone(), buffer);
        (registry, broadcaster)
    }

    #[tokio::test]
    async fn snapshot_comes_first() {
        let (registry, broadcaster) = broadcaster(8);
        registry.set(Session::initializing(1));
        registry.set(Session::disconnected(2));

        let (_, mut rx) = broadcaster.subscribe(None);
        let update = Session::new(1, SessionStatus::Authenticated);
        broadcaster.publish(&update);

        match rx.recv().await.unwrap() {
            LiveMessage::Sessions(all) => assert_eq!(all.len(), 2),
            other => panic!("unexpected first message {:?}", other),
        }
        assert_eq!(rx.recv().await.unwrap(), LiveMessage::SessionUpdate(update));
    }

    #[tokio::test]
    async fn filter_scopes_snapshot_and_updates() {
        let (registry, broadcaster) = broadcaster(8);
        registry.set(Session::initializing(1));
        registry.set(Session::initializing(2));

        let (_, mut rx) = broadcaster.subscribe(Some(Arc::new(|pid| pid == 2)));
        broadcaster.publish(&Session::disconnected(1));
        broadcaster.publish(&Session::disconnected(2));

        assert_eq!(
            rx.recv().await.unwrap(),
            LiveMessage::Sessions(vec![Session::initializing(2)])
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            LiveMessage::SessionUpdate(Session::disconnected(2))
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_observer_is_removed() {
        let (_, broadcaster) = broadcaster(8);
        let (_, rx) = broadcaster.subscribe(None);
        let (_, mut alive) = broadcaster.subscribe(None);
        drop(rx);

        broadcaster.publish(&Session::initializing(4));
        assert_eq!(broadcaster.observer_count(), 1);

        let _ = alive.recv().await;
        assert_eq!(
            alive.recv().await.unwrap(),
            LiveMessage::SessionUpdate(Session::initializing(4))
        );
    }

    #[tokio::test]
    async fn slow_observer_does_not_block_others() {
        let (_, broadcaster) = broadcaster(1);
        let (_, _stalled) = broadcaster.subscribe(None);
        // snapshot already fills the single slot
        broadcaster.publish(&Session::initializing(1));
        assert_eq!(broadcaster.observer_count(), 0);
    }

    #[test]
    fn wire_format() {
        let json =
            serde_json::to_value(LiveMessage::SessionUpdate(Session::disconnected(3))).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "session-update", "data": {"profileId": 3, "status": "disconnected"}})
        );
        let json = serde_json::to_value(LiveMessage::Sessions(vec![])).unwrap();
        assert_eq!(json, serde_json::json!({"type": "sessions", "data": []}));
    }
}
