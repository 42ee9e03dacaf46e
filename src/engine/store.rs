use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use tracing::warn;
use ulid::Ulid;

use crate::model::*;

use super::SharedServiceState;

/// In-memory materialization of the WAL.
///
/// Workspaces and contacts are plain map entries. Everything a reservation
/// touches lives in a per-service `ServiceState` behind its own lock.
pub struct InMemoryStore {
    workspaces: DashMap<Ulid, Workspace>,
    services: DashMap<Ulid, SharedServiceState>,
    /// workspace id → service type ids
    workspace_services: DashMap<Ulid, Vec<Ulid>>,
    /// rule or booking id → service type id
    entity_to_service: DashMap<Ulid, Ulid>,
    contacts: DashMap<Ulid, Contact>,
    contacts_by_email: DashMap<(Ulid, String), Ulid>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            workspaces: DashMap::new(),
            services: DashMap::new(),
            workspace_services: DashMap::new(),
            entity_to_service: DashMap::new(),
            contacts: DashMap::new(),
            contacts_by_email: DashMap::new(),
        }
    }

    /// Rebuild from a replayed event log. Service states are assembled unlocked
    /// and wrapped once every event has been applied.
    pub fn from_events(events: &[Event]) -> Self {
        let store = Self::new();
        let mut states: HashMap<Ulid, ServiceState> = HashMap::new();

        for event in events {
            match event {
                Event::ServiceTypeCreated { service } => {
                    store.index_service(service.workspace_id, service.id);
                    states.insert(service.id, ServiceState::new(service.clone()));
                }
                other => match other.service_type_id() {
                    Some(service_type_id) => match states.get_mut(&service_type_id) {
                        Some(state) => store.apply_event(state, other),
                        None => warn!(%service_type_id, "replay: event for unknown service type skipped"),
                    },
                    None => store.apply_global(other),
                },
            }
        }

        for (id, state) in states {
            store.services.insert(id, Arc::new(RwLock::new(state)));
        }
        store
    }

    // ── Workspaces ───────────────────────────────────────────

    pub fn workspace_count(&self) -> usize {
        self.workspaces.len()
    }

    pub fn get_workspace(&self, id: &Ulid) -> Option<Workspace> {
        self.workspaces.get(id).map(|e| e.value().clone())
    }

    pub fn contains_workspace(&self, id: &Ulid) -> bool {
        self.workspaces.contains_key(id)
    }

    pub fn workspaces(&self) -> Vec<Workspace> {
        self.workspaces.iter().map(|e| e.value().clone()).collect()
    }

    // ── Service types ────────────────────────────────────────

    pub fn contains_service(&self, id: &Ulid) -> bool {
        self.services.contains_key(id)
    }

    pub fn get_service(&self, id: &Ulid) -> Option<SharedServiceState> {
        self.services.get(id).map(|e| e.value().clone())
    }

    pub fn insert_service(&self, service: ServiceType) {
        self.index_service(service.workspace_id, service.id);
        self.services
            .insert(service.id, Arc::new(RwLock::new(ServiceState::new(service))));
    }

    fn index_service(&self, workspace_id: Ulid, service_type_id: Ulid) {
        self.workspace_services
            .entry(workspace_id)
            .or_default()
            .push(service_type_id);
    }

    pub fn service_ids(&self, workspace_id: &Ulid) -> Vec<Ulid> {
        self.workspace_services
            .get(workspace_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    pub fn service_count(&self, workspace_id: &Ulid) -> usize {
        self.workspace_services
            .get(workspace_id)
            .map_or(0, |e| e.value().len())
    }

    pub fn service_in_workspace(&self, workspace_id: &Ulid, service_type_id: &Ulid) -> bool {
        self.workspace_services
            .get(workspace_id)
            .is_some_and(|ids| ids.contains(service_type_id))
    }

    pub fn all_service_ids(&self) -> Vec<Ulid> {
        self.services.iter().map(|e| *e.key()).collect()
    }

    // ── Entity index ─────────────────────────────────────────

    pub fn service_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_service.get(entity_id).map(|e| *e.value())
    }

    fn map_entity(&self, entity_id: Ulid, service_type_id: Ulid) {
        self.entity_to_service.insert(entity_id, service_type_id);
    }

    fn unmap_entity(&self, entity_id: &Ulid) {
        self.entity_to_service.remove(entity_id);
    }

    // ── Contacts ─────────────────────────────────────────────

    pub fn get_contact(&self, id: &Ulid) -> Option<Contact> {
        self.contacts.get(id).map(|e| e.value().clone())
    }

    pub fn contact_by_email(&self, workspace_id: Ulid, email: &str) -> Option<Ulid> {
        self.contacts_by_email
            .get(&(workspace_id, email.to_string()))
            .map(|e| *e.value())
    }

    /// Reserve `(workspace, email)` for `id`. Returns the id already holding
    /// the address if another caller got there first.
    pub fn claim_contact_email(&self, workspace_id: Ulid, email: &str, id: Ulid) -> Option<Ulid> {
        match self.contacts_by_email.entry((workspace_id, email.to_string())) {
            Entry::Occupied(e) => Some(*e.get()),
            Entry::Vacant(e) => {
                e.insert(id);
                None
            }
        }
    }

    pub fn release_contact_email(&self, workspace_id: Ulid, email: &str) {
        self.contacts_by_email
            .remove(&(workspace_id, email.to_string()));
    }

    fn insert_contact(&self, contact: Contact) {
        self.contacts_by_email
            .insert((contact.workspace_id, contact.email.clone()), contact.id);
        self.contacts.insert(contact.id, contact);
    }

    pub fn contacts(&self) -> Vec<Contact> {
        self.contacts.iter().map(|e| e.value().clone()).collect()
    }

    // ── Event application ────────────────────────────────────

    /// Apply a service-scoped event. The caller holds that service's write lock.
    pub fn apply_event(&self, state: &mut ServiceState, event: &Event) {
        match event {
            Event::ServiceTypeUpdated { service } => {
                state.service = service.clone();
            }
            Event::RuleAdded { rule } => {
                self.map_entity(rule.id, rule.service_type_id);
                state.insert_rule(rule.clone());
            }
            Event::RuleRemoved { id, .. } => {
                state.remove_rule(*id);
                self.unmap_entity(id);
            }
            Event::BookingCreated { booking, contact } => {
                if let Some(contact) = contact {
                    self.insert_contact(contact.clone());
                }
                self.map_entity(booking.id, booking.service_type_id);
                state.insert_booking(booking.clone());
            }
            Event::BookingStatusChanged { id, status, at, .. } => {
                if let Some(booking) = state.booking_mut(id) {
                    booking.status = *status;
                    booking.updated_at = *at;
                }
            }
            Event::ServiceTypeCreated { .. }
            | Event::WorkspaceCreated { .. }
            | Event::WorkspaceUpdated { .. }
            | Event::ContactCreated { .. } => {}
        }
    }

    /// Apply an event that lives outside any service lock.
    pub fn apply_global(&self, event: &Event) {
        match event {
            Event::WorkspaceCreated { workspace } | Event::WorkspaceUpdated { workspace } => {
                self.workspaces.insert(workspace.id, workspace.clone());
            }
            Event::ContactCreated { contact } => self.insert_contact(contact.clone()),
            Event::ServiceTypeCreated { service } => self.insert_service(service.clone()),
            _ => {}
        }
    }
}
