mod availability;
mod conflict;
mod error;
mod lifecycle;
mod mutations;
mod queries;
mod store;
mod validate;

pub use availability::{
    day_of_week, generate_slots, is_offered, local_date, open_slots, resolve_local, resolve_local_or_next,
};
pub use conflict::find_conflict;
pub use error::{EngineError, FieldError, Unavailable};
pub use lifecycle::{allowed_transitions, can_transition};
pub use store::InMemoryStore;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::{Wal, WalHandle};

pub type SharedServiceState = Arc<RwLock<ServiceState>>;

/// How long a reservation waits for its service lock before giving up.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

pub struct Engine {
    pub(super) store: InMemoryStore,
    pub(super) wal: WalHandle,
    pub notify: Arc<NotifyHub>,
    pub(super) lock_timeout: Duration,
    /// Held shared by every mutation and exclusively by compaction, so a
    /// snapshot never misses an event that lands in the old log.
    pub(super) commit_gate: RwLock<()>,
}

impl Engine {
    /// Replay the WAL at `wal_path` and start its writer task. Must be called
    /// inside a tokio runtime.
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let store = InMemoryStore::from_events(&events);
        let wal = WalHandle::spawn(Wal::open(&wal_path)?);
        tracing::info!(
            path = %wal_path.display(),
            events = events.len(),
            workspaces = store.workspace_count(),
            "engine state restored"
        );
        Ok(Self {
            store,
            wal,
            notify,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            commit_gate: RwLock::new(()),
        })
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    pub fn get_service(&self, id: &Ulid) -> Option<SharedServiceState> {
        self.store.get_service(id)
    }

    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        self.wal
            .append(event)
            .await
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Make `event` durable, then apply it to the locked service state.
    pub(super) async fn persist_and_apply(
        &self,
        state: &mut ServiceState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.store.apply_event(state, event);
        Ok(())
    }

    /// Durable, then visible, for events outside any service lock.
    pub(super) async fn persist_global(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.store.apply_global(event);
        Ok(())
    }

    /// Look up the service owning `entity_id` and take its write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<(Ulid, OwnedRwLockWriteGuard<ServiceState>), EngineError> {
        let service_type_id = self
            .store
            .service_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        let shared = self
            .store
            .get_service(&service_type_id)
            .ok_or(EngineError::NotFound(service_type_id))?;
        Ok((service_type_id, shared.write_owned().await))
    }
}
