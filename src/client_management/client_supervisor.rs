use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::client_management::types::{ClientEvent, ClientHandle, ClientSpec, ClientStats};
use crate::client_management::whatsapp_client::ClientFactory;
use crate::error_handling::types::ClientError;
use crate::storage::types::ProfileId;

/// Owns every live automation client, at most one per profile.
///
/// The supervisor never changes session state itself; it only answers
/// "which handle is live for this profile" and is the single place that
/// calls `destroy` on a client.
pub struct ClientSupervisor {
    factory: Arc<dyn ClientFactory>,
    handles: Mutex<HashMap<ProfileId, ClientHandle>>,
    stats: Mutex<ClientStats>,
    destroy_timeout: Duration,
}

impl ClientSupervisor {
    pub fn new(factory: Arc<dyn ClientFactory>, destroy_timeout: Duration) -> Self {
        info!("Initializing ClientSupervisor");
        Self {
            factory,
            handles: Mutex::new(HashMap::new()),
            stats: Mutex::new(ClientStats::default()),
            destroy_timeout,
        }
    }

    fn handles(&self) -> MutexGuard<'_, HashMap<ProfileId, ClientHandle>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stats_mut(&self) -> MutexGuard<'_, ClientStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates and registers a client for `spec.profile_id`.
    ///
    /// Returns `Ok(None)` without touching the factory when a handle already
    /// exists for the profile.
    pub fn create_client(
        &self,
        spec: ClientSpec,
    ) -> Result<Option<(ClientHandle, mpsc::UnboundedReceiver<ClientEvent>)>, ClientError> {
        let profile_id = spec.profile_id;
        let mut handles = self.handles();

        if let Some(existing) = handles.get(&profile_id) {
            debug!(
                "Client {} already live for profile {}, not creating another",
                existing.id(),
                profile_id
            );
            return Ok(None);
        }

        info!(
            "Creating client for profile {} (session {})",
            profile_id, spec.session_key
        );
        let parts = self.factory.create(spec.clone()).map_err(|e| {
            error!("Failed to create client for profile {}: {}", profile_id, e);
            self.stats_mut().failed_count += 1;
            e
        })?;

        let handle = ClientHandle::new(&spec, parts.client);
        handles.insert(profile_id, handle.clone());
        self.stats_mut().total_created += 1;

        info!(
            "Registered client {} for profile {}",
            handle.id(),
            profile_id
        );
        Ok(Some((handle, parts.events)))
    }

    pub fn get_client(&self, profile_id: ProfileId) -> Option<ClientHandle> {
        let result = self.handles().get(&profile_id).cloned();
        debug!(
            "Client lookup for profile {}: {}",
            profile_id,
            if result.is_some() { "found" } else { "not found" }
        );
        result
    }

    /// True when `handle_id` is the live handle of `profile_id`.
    pub fn is_current(&self, profile_id: ProfileId, handle_id: Uuid) -> bool {
        self.handles()
            .get(&profile_id)
            .map_or(false, |h| h.id() == handle_id)
    }

    /// Removes the profile's handle from the map and hands it to the caller.
    pub fn detach(&self, profile_id: ProfileId) -> Option<ClientHandle> {
        let handle = self.handles().remove(&profile_id);
        if let Some(h) = &handle {
            debug!("Detached client {} from profile {}", h.id(), profile_id);
        }
        handle
    }

    /// Like [`detach`](Self::detach), but only if `handle_id` is still the
    /// live handle.
    pub fn detach_if_current(&self, profile_id: ProfileId, handle_id: Uuid) -> Option<ClientHandle> {
        let mut handles = self.handles();
        match handles.get(&profile_id) {
            Some(h) if h.id() == handle_id => {
                debug!("Detached client {} from profile {}", handle_id, profile_id);
                handles.remove(&profile_id)
            }
            _ => None,
        }
    }

    /// Tears down a detached client, bounded by the destroy timeout.
    pub async fn destroy(&self, handle: ClientHandle) -> Result<(), ClientError> {
        info!(
            "Destroying client {} of profile {}",
            handle.id(),
            handle.profile_id()
        );

        let result = match tokio::time::timeout(self.destroy_timeout, handle.destroy()).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout(format!(
                "destroy of client {} after {:?}",
                handle.id(),
                self.destroy_timeout
            ))),
        };

        match &result {
            Ok(()) => debug!("Client {} destroyed", handle.id()),
            Err(e) => {
                warn!("Failed to destroy client {}: {}", handle.id(), e);
                self.stats_mut().failed_count += 1;
            }
        }
        result
    }

    /// Destroys a detached client in the background, logging failures.
    pub fn discard(self: &Arc<Self>, handle: ClientHandle) {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let _ = supervisor.destroy(handle).await;
        });
    }

    /// Detaches and destroys every live client, continuing on errors.
    ///
    /// Returns the profiles whose clients were torn down.
    pub async fn destroy_all(&self) -> Vec<ProfileId> {
        let drained: Vec<ClientHandle> = self.handles().drain().map(|(_, h)| h).collect();
        info!("Starting teardown of {} active clients", drained.len());

        let profile_ids: Vec<ProfileId> = drained.iter().map(|h| h.profile_id()).collect();
        let results = join_all(drained.into_iter().map(|h| self.destroy(h))).await;
        let failures = results.iter().filter(|r| r.is_err()).count();

        info!(
            "Completed teardown of all clients (failures: {})",
            failures
        );
        profile_ids
    }

    /// Returns a snapshot of current counters. `active_count` is recomputed
    /// from the handle map.
    pub fn get_client_stats(&self) -> ClientStats {
        let mut stats = self.stats_mut().clone();
        stats.active_count = self.handles().len();
        debug!(
            "Retrieved client stats: active={}, total={}, failed={}",
            stats.active_count, stats.total_created, stats.failed_count
        );
        stats
    }

    pub fn list_active_clients(&self) -> Vec<ProfileId> {
        let mut ids: Vec<ProfileId> = self.handles().keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
