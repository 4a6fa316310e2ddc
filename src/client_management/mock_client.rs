//! Scripted in-process client used by tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::client_management::types::{ClientEvent, ClientParts, ClientSpec};
use crate::client_management::whatsapp_client::{ClientFactory, WhatsAppClient};
use crate::error_handling::types::ClientError;
use crate::session_management::{ConnectionOrchestrator, SessionStatus};
use crate::storage::types::ProfileId;

#[derive(Default)]
struct MockState {
    fail_create: bool,
    fail_init: HashSet<ProfileId>,
    ready_then_fail: HashSet<ProfileId>,
    fail_destroy: bool,
    fail_send: Option<String>,
    unregistered: HashSet<String>,
    qr_on_init: Option<String>,
    senders: HashMap<ProfileId, Vec<mpsc::UnboundedSender<ClientEvent>>>,
    created: usize,
    destroyed: usize,
    sent: Vec<(ProfileId, String, String)>,
}

#[derive(Clone, Default)]
pub struct MockClientFactory {
    state: Arc<Mutex<MockState>>,
}

impl MockClientFactory {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn fail_create(&self, fail: bool) {
        self.state().fail_create = fail;
    }

    pub fn fail_init_for(&self, profile_id: ProfileId) {
        self.state().fail_init.insert(profile_id);
    }

    /// Makes the client report `authenticated` and `ready`, then fail its
    /// startup call anyway.
    pub fn ready_then_fail_for(&self, profile_id: ProfileId) {
        self.state().ready_then_fail.insert(profile_id);
    }

    pub fn fail_destroy(&self, fail: bool) {
        self.state().fail_destroy = fail;
    }

    pub fn fail_send(&self, reason: &str) {
        self.state().fail_send = Some(reason.to_string());
    }

    pub fn unregister(&self, chat_id: &str) {
        self.state().unregistered.insert(chat_id.to_string());
    }

    /// Makes every client emit a QR event while initializing.
    pub fn qr_on_init(&self, payload: &str) {
        self.state().qr_on_init = Some(payload.to_string());
    }

    /// Emits `event` from the most recent client created for `profile_id`.
    pub fn emit(&self, profile_id: ProfileId, event: ClientEvent) {
        let generation = self.generations(profile_id).saturating_sub(1);
        self.emit_from(profile_id, generation, event);
    }

    /// Emits `event` from the `generation`-th client ever created for
    /// `profile_id`, counting from zero.
    pub fn emit_from(&self, profile_id: ProfileId, generation: usize, event: ClientEvent) {
        let state = self.state();
        let sender = state
            .senders
            .get(&profile_id)
            .and_then(|senders| senders.get(generation))
            .unwrap_or_else(|| panic!("no client {} for profile {}", generation, profile_id));
        let _ = sender.send(event);
    }

    pub fn generations(&self, profile_id: ProfileId) -> usize {
        self.state().senders.get(&profile_id).map_or(0, Vec::len)
    }

    pub fn created_count(&self) -> usize {
        self.state().created
    }

    pub fn destroyed_count(&self) -> usize {
        self.state().destroyed
    }

    pub fn sent(&self) -> Vec<(ProfileId, String, String)> {
        self.state().sent.clone()
    }
}

impl ClientFactory for MockClientFactory {
    fn create(&self, spec: ClientSpec) -> Result<ClientParts, ClientError> {
        let mut state = self.state();
        if state.fail_create {
            return Err(ClientError::SpawnFailed("mock spawn refused".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state
            .senders
            .entry(spec.profile_id)
            .or_default()
            .push(tx.clone());
        state.created += 1;

        Ok(ClientParts {
            client: Arc::new(MockClient {
                profile_id: spec.profile_id,
                events: tx,
                state: Arc::clone(&self.state),
            }),
            events: rx,
        })
    }
}

struct MockClient {
    profile_id: ProfileId,
    events: mpsc::UnboundedSender<ClientEvent>,
    state: Arc<Mutex<MockState>>,
}

#[async_trait]
impl WhatsAppClient for MockClient {
    async fn initialize(&self) -> Result<(), ClientError> {
        let (fail, late_fail, qr) = {
            let state = self.state.lock().unwrap();
            (
                state.fail_init.contains(&self.profile_id),
                state.ready_then_fail.contains(&self.profile_id),
                state.qr_on_init.clone(),
            )
        };
        if late_fail {
            let _ = self.events.send(ClientEvent::Authenticated);
            let _ = self.events.send(ClientEvent::Ready);
            tokio::time::sleep(Duration::from_millis(100)).await;
            return Err(ClientError::Timeout("initialize".to_string()));
        }
        tokio::task::yield_now().await;
        if fail {
            return Err(ClientError::InitFailed("browser failed to launch".to_string()));
        }
        if let Some(qr) = qr {
            let _ = self.events.send(ClientEvent::Qr(qr));
        }
        Ok(())
    }

    async fn is_registered_user(&self, chat_id: &str) -> Result<bool, ClientError> {
        Ok(!self.state.lock().unwrap().unregistered.contains(chat_id))
    }

    async fn send_message(&self, chat_id: &str, text: &str) -> Result<String, ClientError> {
        let mut state = self.state.lock().unwrap();
        if let Some(reason) = &state.fail_send {
            return Err(ClientError::RequestFailed(reason.clone()));
        }
        state
            .sent
            .push((self.profile_id, chat_id.to_string(), text.to_string()));
        Ok(format!("true_{}_{}", chat_id, state.sent.len()))
    }

    async fn destroy(&self) -> Result<(), ClientError> {
        let mut state = self.state.lock().unwrap();
        state.destroyed += 1;
        if state.fail_destroy {
            return Err(ClientError::RequestFailed("target closed".to_string()));
        }
        Ok(())
    }
}

/// Polls until the registry reports `status` for `profile_id`.
pub async fn wait_for_status(
    orchestrator: &ConnectionOrchestrator,
    profile_id: ProfileId,
    status: SessionStatus,
) {
    for _ in 0..200 {
        if orchestrator.session(profile_id).map(|s| s.status) == Some(status) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "profile {} never reached {} (last: {:?})",
        profile_id,
        status,
        orchestrator.session(profile_id)
    );
}
