//! The connection orchestrator.
//!
//! Every operation that changes a profile's connection goes through here. Work
//! on one profile is serialized by a per-profile async mutex; different
//! profiles never wait on each other. The mutex is held while handles are
//! created or removed and while client events are applied, but never across
//! the (slow) client startup itself.
//!
//! Each client handle carries a unique id. Events, startup failures and QR
//! expiry only take effect while their handle is still the live one, so a
//! client that was replaced by a reconnect cannot move the new session.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::client_management::types::{session_key_for, ClientEvent, ClientHandle, ClientSpec, ClientStats};
use crate::client_management::{ClientFactory, ClientSupervisor};
use crate::error_handling::types::{SessionError, StorageError};
use crate::messaging::{normalize_recipient, BulkOutcome, BulkReport, OutgoingMessage};
use crate::session_management::event_broadcaster::{
    EventBroadcaster, LiveMessage, ObserverId, ProfileFilter,
};
use crate::session_management::session::{Checkpoint, Session, SessionEvent, Transition};
use crate::session_management::session_registry::SessionRegistry;
use crate::session_management::SessionStatus;
use crate::storage::types::{Profile, ProfileId, ProfileUpdate, UserId};
use crate::storage::Storage;

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Give up on a profile stuck before authentication after this long.
    /// `None` waits forever.
    pub qr_timeout: Option<Duration>,
    pub destroy_timeout: Duration,
    pub observer_buffer: usize,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            qr_timeout: None,
            destroy_timeout: Duration::from_secs(10),
            observer_buffer: 64,
        }
    }
}

/// Result of a successful `initialize`/`reconnect` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitOutcome {
    /// A new client was started. Carries the QR code if one already arrived.
    Started { qr_code: Option<String> },
    /// A client is already live for the profile; nothing was done.
    AlreadyInProgress,
    /// The client failed to start but had already been replaced by a newer one.
    Superseded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageReceipt {
    pub message_id: String,
    /// Normalized chat id the message went to.
    pub recipient: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkInitReport {
    /// Profiles with saved credentials.
    pub attempted: usize,
    pub started: usize,
    pub already_running: usize,
    pub failed: usize,
    /// Profiles without saved credentials.
    pub skipped: usize,
}

#[derive(Default)]
struct ProfileLocks {
    locks: Mutex<HashMap<ProfileId, Arc<tokio::sync::Mutex<()>>>>,
}

impl ProfileLocks {
    fn get(&self, profile_id: ProfileId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(profile_id).or_default())
    }

    fn forget(&self, profile_id: ProfileId) {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&profile_id);
    }

    fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[derive(Clone)]
pub struct ConnectionOrchestrator {
    storage: Arc<dyn Storage>,
    registry: Arc<SessionRegistry>,
    broadcaster: Arc<EventBroadcaster>,
    supervisor: Arc<ClientSupervisor>,
    locks: Arc<ProfileLocks>,
    qr_timeout: Option<Duration>,
}

impl ConnectionOrchestrator {
    pub fn new(
        storage: Arc<dyn Storage>,
        factory: Arc<dyn ClientFactory>,
        options: OrchestratorOptions,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let broadcaster = Arc::new(EventBroadcaster::new(
            Arc::clone(&registry),
            options.observer_buffer,
        ));
        let supervisor = Arc::new(ClientSupervisor::new(factory, options.destroy_timeout));

        Self {
            storage,
            registry,
            broadcaster,
            supervisor,
            locks: Arc::new(ProfileLocks::default()),
            qr_timeout: options.qr_timeout.filter(|t| !t.is_zero()),
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    fn load_profile(&self, profile_id: ProfileId) -> Result<Profile, SessionError> {
        self.storage
            .get_profile(profile_id)?
            .ok_or_else(|| SessionError::NotFound("Profile".to_string()))
    }

    /// Loads a profile on behalf of `caller`, failing unless they own it.
    pub fn authorize(&self, caller: UserId, profile_id: ProfileId) -> Result<Profile, SessionError> {
        let profile = self.load_profile(profile_id)?;
        if profile.user_id != caller {
            warn!(
                "User {} denied access to profile {} owned by {}",
                caller, profile_id, profile.user_id
            );
            return Err(SessionError::Forbidden);
        }
        Ok(profile)
    }

    pub fn owns(&self, caller: UserId, profile_id: ProfileId) -> bool {
        matches!(self.storage.get_profile(profile_id), Ok(Some(p)) if p.user_id == caller)
    }

    fn browser_path_for(&self, user_id: UserId) -> Option<String> {
        match self.storage.get_settings(user_id) {
            Ok(settings) => settings.and_then(|s| s.browser_path().map(str::to_string)),
            Err(e) => {
                warn!("Could not read settings of user {}: {}", user_id, e);
                None
            }
        }
    }

    /// Stores and announces `session` as one step.
    fn commit(&self, session: Session) {
        debug!(
            "Session of profile {} is now {}",
            session.profile_id, session.status
        );
        self.registry.set(session.clone());
        self.broadcaster.publish(&session);
    }

    /// Runs `event` through the state machine and commits the result.
    fn apply_event(&self, profile_id: ProfileId, event: SessionEvent) -> Option<Transition> {
        let current = match self.registry.get(profile_id) {
            Some(session) => session,
            None => {
                debug!("No session for profile {}, dropping {}", profile_id, event.name());
                return None;
            }
        };

        match current.apply(&event) {
            Some(transition) => {
                info!(
                    "Profile {}: {} -> {} ({})",
                    profile_id,
                    current.status,
                    transition.session.status,
                    event.name()
                );
                self.commit(transition.session.clone());
                Some(transition)
            }
            None => {
                warn!(
                    "Profile {}: ignoring {} while {}",
                    profile_id,
                    event.name(),
                    current.status
                );
                None
            }
        }
    }

    /// Writes a durable profile update. A profile deleted in the meantime is
    /// not an error.
    fn checkpoint(&self, profile_id: ProfileId, update: ProfileUpdate) -> Result<(), SessionError> {
        match self.storage.update_profile(profile_id, update) {
            Ok(_) => Ok(()),
            Err(StorageError::NotFound(_)) => {
                debug!("Profile {} is gone, skipping checkpoint", profile_id);
                Ok(())
            }
            Err(e) => {
                error!("Failed to persist profile {}: {}", profile_id, e);
                Err(SessionError::PersistenceError(e))
            }
        }
    }

    fn persist(&self, profile_id: ProfileId, checkpoint: Checkpoint) -> Result<(), SessionError> {
        let update = match checkpoint {
            Checkpoint::None => return Ok(()),
            Checkpoint::Connected => {
                let mut update = ProfileUpdate::status(SessionStatus::Connected);
                update.last_active = Some(Utc::now());
                let has_marker = self
                    .storage
                    .get_profile(profile_id)?
                    .map_or(true, |p| p.session_data.is_some());
                if !has_marker {
                    update.session_data = Some(Some(session_key_for(profile_id)));
                }
                update
            }
            Checkpoint::Disconnected { clear_credentials } => {
                let mut update = ProfileUpdate::status(SessionStatus::Disconnected);
                if clear_credentials {
                    update.session_data = Some(None);
                }
                update
            }
            Checkpoint::Failed => ProfileUpdate::status(SessionStatus::Error),
        };
        self.checkpoint(profile_id, update)
    }

    /// Creates the profile's client unless one is live. Must be called with
    /// the profile lock held.
    fn start_client(&self, profile: &Profile) -> Result<Option<ClientHandle>, SessionError> {
        let spec = ClientSpec::new(profile.id, self.browser_path_for(profile.user_id));

        match self.supervisor.create_client(spec) {
            Ok(None) => {
                debug!("Profile {} already has a live client", profile.id);
                Ok(None)
            }
            Ok(Some((handle, events))) => {
                self.commit(Session::initializing(profile.id));
                self.spawn_event_pump(profile.id, handle.id(), events);
                if let Some(timeout) = self.qr_timeout {
                    self.spawn_qr_expiry(profile.id, handle.id(), timeout);
                }
                Ok(Some(handle))
            }
            Err(e) => {
                self.commit(Session::initializing(profile.id));
                if let Some(t) = self.apply_event(profile.id, SessionEvent::InitFailed(e.to_string())) {
                    let _ = self.persist(profile.id, t.checkpoint);
                }
                Err(SessionError::InitFailed(e.to_string()))
            }
        }
    }

    /// Runs client startup outside the profile lock.
    async fn await_startup(&self, handle: ClientHandle) -> Result<InitOutcome, SessionError> {
        let profile_id = handle.profile_id();

        match handle.initialize().await {
            Ok(()) => {
                info!("Client {} for profile {} started", handle.id(), profile_id);
                let qr_code = self.registry.get(profile_id).and_then(|s| s.qr_code);
                Ok(InitOutcome::Started { qr_code })
            }
            Err(e) => {
                error!(
                    "Error initializing client for profile {}: {}",
                    profile_id, e
                );
                self.fail_startup(&handle, e.to_string()).await
            }
        }
    }

    async fn fail_startup(
        &self,
        handle: &ClientHandle,
        reason: String,
    ) -> Result<InitOutcome, SessionError> {
        let profile_id = handle.profile_id();
        let lock = self.locks.get(profile_id);
        let _guard = lock.lock().await;

        if self.supervisor.is_current(profile_id, handle.id()) {
            let failure = SessionEvent::InitFailed(reason.clone());
            if let Some(session) = self
                .registry
                .get(profile_id)
                .filter(|s| s.apply(&failure).is_none())
            {
                // the client reached a state startup failures cannot undo
                warn!(
                    "Late startup failure of client {} for profile {} ignored ({}): {}",
                    handle.id(),
                    profile_id,
                    session.status,
                    reason
                );
                return Ok(InitOutcome::Started {
                    qr_code: session.qr_code,
                });
            }
        }

        match self.supervisor.detach_if_current(profile_id, handle.id()) {
            Some(detached) => {
                self.supervisor.discard(detached);
                if let Some(t) = self.apply_event(profile_id, SessionEvent::InitFailed(reason.clone())) {
                    let _ = self.persist(profile_id, t.checkpoint);
                }
                Err(SessionError::InitFailed(reason))
            }
            None if self.supervisor.get_client(profile_id).is_some() => {
                info!(
                    "Startup failure of replaced client {} for profile {} ignored",
                    handle.id(),
                    profile_id
                );
                Ok(InitOutcome::Superseded)
            }
            None => Err(SessionError::InitFailed(reason)),
        }
    }

    fn spawn_event_pump(
        &self,
        profile_id: ProfileId,
        handle_id: Uuid,
        mut events: mpsc::UnboundedReceiver<ClientEvent>,
    ) {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if !orchestrator
                    .handle_client_event(profile_id, handle_id, event)
                    .await
                {
                    break;
                }
            }
            debug!("Event pump for client {} ended", handle_id);
        });
    }

    /// Applies one client event. Returns false once the client is no longer
    /// the profile's live handle.
    async fn handle_client_event(
        &self,
        profile_id: ProfileId,
        handle_id: Uuid,
        event: ClientEvent,
    ) -> bool {
        let lock = self.locks.get(profile_id);
        let _guard = lock.lock().await;

        if !self.supervisor.is_current(profile_id, handle_id) {
            debug!(
                "Ignoring {:?} from stale client {} of profile {}",
                event, handle_id, profile_id
            );
            return false;
        }

        let Some(transition) = self.apply_event(profile_id, event.into()) else {
            return true;
        };

        let still_live = !matches!(transition.checkpoint, Checkpoint::Disconnected { .. });
        if !still_live {
            if let Some(handle) = self.supervisor.detach_if_current(profile_id, handle_id) {
                self.supervisor.discard(handle);
            }
        }
        let _ = self.persist(profile_id, transition.checkpoint);
        still_live
    }

    fn spawn_qr_expiry(&self, profile_id: ProfileId, handle_id: Uuid, timeout: Duration) {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            orchestrator.expire_pending(profile_id, handle_id, timeout).await;
        });
    }

    async fn expire_pending(&self, profile_id: ProfileId, handle_id: Uuid, timeout: Duration) {
        let lock = self.locks.get(profile_id);
        let _guard = lock.lock().await;

        let pending = self
            .registry
            .get(profile_id)
            .map_or(false, |s| s.status.is_pending());
        if !pending || !self.supervisor.is_current(profile_id, handle_id) {
            return;
        }

        warn!(
            "Profile {} not authenticated within {:?}, tearing down client",
            profile_id, timeout
        );
        if let Some(handle) = self.supervisor.detach_if_current(profile_id, handle_id) {
            self.supervisor.discard(handle);
        }
        let reason = format!("QR code not scanned within {:?}", timeout);
        if let Some(t) = self.apply_event(profile_id, SessionEvent::Disconnected(reason)) {
            let _ = self.persist(profile_id, t.checkpoint);
        }
    }

    /// Starts a client for `profile`. Calling it again while a client is live
    /// is a no-op returning [`InitOutcome::AlreadyInProgress`].
    pub async fn initialize(&self, profile: &Profile) -> Result<InitOutcome, SessionError> {
        let lock = self.locks.get(profile.id);
        let guard = lock.lock().await;

        // the profile may have been deleted while we waited for the lock
        self.load_profile(profile.id)?;
        let started = self.start_client(profile)?;
        drop(guard);

        match started {
            Some(handle) => self.await_startup(handle).await,
            None => Ok(InitOutcome::AlreadyInProgress),
        }
    }

    /// Replaces the profile's client with a fresh one. A failing teardown of
    /// the old client is logged and does not stop the reconnect.
    pub async fn reconnect(&self, profile_id: ProfileId) -> Result<InitOutcome, SessionError> {
        let lock = self.locks.get(profile_id);
        let guard = lock.lock().await;

        let profile = self.load_profile(profile_id)?;
        if let Some(old) = self.supervisor.detach(profile_id) {
            info!(
                "Reconnecting profile {}, tearing down client {}",
                profile_id,
                old.id()
            );
            if let Err(e) = self.supervisor.destroy(old).await {
                warn!(
                    "Error destroying client for profile {}, reconnecting anyway: {}",
                    profile_id, e
                );
            }
        }
        let started = self.start_client(&profile)?;
        drop(guard);

        match started {
            Some(handle) => self.await_startup(handle).await,
            None => Ok(InitOutcome::AlreadyInProgress),
        }
    }

    /// Tears down the profile's client. Caller holds the profile lock.
    async fn teardown(&self, profile_id: ProfileId) -> Result<(), SessionError> {
        let Some(handle) = self.supervisor.detach(profile_id) else {
            debug!("No client to destroy for profile {}", profile_id);
            return Ok(());
        };

        if let Err(e) = self.supervisor.destroy(handle).await {
            warn!("Error destroying client for profile {}: {}", profile_id, e);
        }
        self.commit(Session::disconnected(profile_id));
        self.checkpoint(profile_id, ProfileUpdate::status(SessionStatus::Disconnected))
    }

    pub async fn destroy_client(&self, profile_id: ProfileId) -> Result<(), SessionError> {
        let lock = self.locks.get(profile_id);
        let _guard = lock.lock().await;
        self.teardown(profile_id).await
    }

    /// Destroys the profile's client, then deletes the record and forgets its
    /// session.
    pub async fn delete_profile(&self, profile_id: ProfileId) -> Result<(), SessionError> {
        let lock = self.locks.get(profile_id);
        let _guard = lock.lock().await;

        self.teardown(profile_id).await?;
        self.storage.delete_profile(profile_id)?;
        self.registry.remove(profile_id);
        self.locks.forget(profile_id);
        info!("Deleted profile {}", profile_id);
        Ok(())
    }

    pub async fn send_message(
        &self,
        profile_id: ProfileId,
        to: &str,
        text: &str,
    ) -> Result<MessageReceipt, SessionError> {
        self.load_profile(profile_id)?;
        let handle = self
            .supervisor
            .get_client(profile_id)
            .ok_or(SessionError::NotConnected(profile_id))?;

        let recipient = normalize_recipient(to).ok_or_else(|| {
            SessionError::ValidationError(format!("Invalid recipient number: {}", to))
        })?;
        if text.trim().is_empty() {
            return Err(SessionError::ValidationError(
                "Message text is empty".to_string(),
            ));
        }

        let registered = handle
            .is_registered_user(&recipient)
            .await
            .map_err(|e| SessionError::SendFailed(e.to_string()))?;
        if !registered {
            return Err(SessionError::RecipientUnregistered(to.to_string()));
        }

        let message_id = handle.send_message(&recipient, text).await.map_err(|e| {
            error!("Error sending message from profile {}: {}", profile_id, e);
            SessionError::SendFailed(e.to_string())
        })?;
        info!(
            "Profile {} sent message {} to {}",
            profile_id, message_id, recipient
        );

        if let Err(e) = self
            .storage
            .update_profile(profile_id, ProfileUpdate::last_active(Utc::now()))
        {
            warn!("Could not record activity of profile {}: {}", profile_id, e);
        }

        Ok(MessageReceipt {
            message_id,
            recipient,
        })
    }

    /// Sends every row in order, waiting `delay` between rows. Row failures
    /// are reported, not raised.
    pub async fn send_bulk(
        &self,
        profile_id: ProfileId,
        rows: &[OutgoingMessage],
        template: Option<&str>,
        delay: Duration,
    ) -> Result<BulkReport, SessionError> {
        self.load_profile(profile_id)?;
        if self.supervisor.get_client(profile_id).is_none() {
            return Err(SessionError::NotConnected(profile_id));
        }
        if rows.is_empty() {
            return Err(SessionError::ValidationError(
                "No messages to send".to_string(),
            ));
        }

        let mut report = BulkReport::default();
        for (index, row) in rows.iter().enumerate() {
            if index > 0 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let outcome = match row.text(template) {
                None => BulkOutcome::Failed {
                    error: "Missing message text".to_string(),
                },
                Some(text) => match self.send_message(profile_id, &row.to, &text).await {
                    Ok(receipt) => BulkOutcome::Sent {
                        message_id: receipt.message_id,
                    },
                    Err(e) => BulkOutcome::Failed {
                        error: e.to_string(),
                    },
                },
            };
            report.record(&row.to, outcome);
        }

        info!(
            "Bulk send from profile {}: {} sent, {} failed",
            profile_id, report.sent, report.failed
        );
        Ok(report)
    }

    /// Starts every profile of `user_id` that authenticated before. One
    /// profile failing does not affect the others.
    pub async fn initialize_all_saved(&self, user_id: UserId) -> Result<BulkInitReport, SessionError> {
        let profiles = self.storage.get_profiles(user_id)?;
        let (saved, unsaved): (Vec<Profile>, Vec<Profile>) = profiles
            .into_iter()
            .partition(|p| p.session_data.is_some());

        let mut report = BulkInitReport {
            attempted: saved.len(),
            skipped: unsaved.len(),
            ..Default::default()
        };

        let results = join_all(saved.iter().map(|profile| async move {
            info!("Auto-connecting profile: {}", profile.label);
            (profile.id, self.initialize(profile).await)
        }))
        .await;

        for (profile_id, result) in results {
            match result {
                Ok(InitOutcome::Started { .. }) => report.started += 1,
                Ok(_) => report.already_running += 1,
                Err(e) => {
                    error!("Error auto-connecting profile {}: {}", profile_id, e);
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Destroys every live client and records the profiles as disconnected.
    pub async fn shutdown(&self) {
        for profile_id in self.supervisor.destroy_all().await {
            self.commit(Session::disconnected(profile_id));
            let _ = self.checkpoint(profile_id, ProfileUpdate::status(SessionStatus::Disconnected));
        }
    }

    pub fn session(&self, profile_id: ProfileId) -> Option<Session> {
        self.registry.get(profile_id)
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.registry.all()
    }

    /// Sessions of the profiles owned by `user_id`.
    pub fn sessions_for(&self, user_id: UserId) -> Result<Vec<Session>, SessionError> {
        let owned: Vec<ProfileId> = self
            .storage
            .get_profiles(user_id)?
            .iter()
            .map(|p| p.id)
            .collect();
        Ok(self
            .registry
            .all()
            .into_iter()
            .filter(|s| owned.contains(&s.profile_id))
            .collect())
    }

    pub fn client(&self, profile_id: ProfileId) -> Option<ClientHandle> {
        self.supervisor.get_client(profile_id)
    }

    /// Number of profiles with a lock entry.
    pub fn tracked_profiles(&self) -> usize {
        self.locks.len()
    }

    pub fn client_stats(&self) -> ClientStats {
        self.supervisor.get_client_stats()
    }

    pub fn subscribe(
        &self,
        filter: Option<ProfileFilter>,
    ) -> (ObserverId, mpsc::Receiver<LiveMessage>) {
        self.broadcaster.subscribe(filter)
    }

    pub fn unsubscribe(&self, id: ObserverId) {
        self.broadcaster.unsubscribe(id)
    }
}
