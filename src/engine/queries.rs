use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::{day_of_week, generate_slots, open_slots};
use super::conflict::now_ms;
use super::{Engine, EngineError};

impl Engine {
    pub fn get_workspace(&self, id: &Ulid) -> Option<Workspace> {
        self.store.get_workspace(id)
    }

    pub fn get_contact(&self, id: &Ulid) -> Option<Contact> {
        self.store.get_contact(id)
    }

    /// Open slots for one service on one workspace-local date, ascending.
    ///
    /// Each slot is a generated candidate that no pending or confirmed booking
    /// overlaps. An inactive service or workspace offers nothing.
    pub async fn available_slots(
        &self,
        workspace_id: Ulid,
        service_type_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<Span>, EngineError> {
        let workspace = self
            .store
            .get_workspace(&workspace_id)
            .ok_or(EngineError::NotFound(workspace_id))?;
        if !self.store.service_in_workspace(&workspace_id, &service_type_id) {
            return Err(EngineError::NotFound(service_type_id));
        }
        let shared = self
            .store
            .get_service(&service_type_id)
            .ok_or(EngineError::NotFound(service_type_id))?;
        let state = shared.read().await;
        if !workspace.active || !state.service.active {
            return Ok(Vec::new());
        }

        let candidates = generate_slots(
            state.rules_on(day_of_week(date)),
            date,
            workspace.timezone,
            state.service.duration_minutes,
            now_ms(),
        );
        Ok(open_slots(&state, candidates))
    }

    /// Bookings in a workspace matching `filter`, ordered by start time.
    pub async fn list_bookings(&self, workspace_id: Ulid, filter: &BookingFilter) -> Result<Vec<Booking>, EngineError> {
        if !self.store.contains_workspace(&workspace_id) {
            return Err(EngineError::NotFound(workspace_id));
        }
        if let (Some(from), Some(to)) = (filter.from, filter.to) {
            if from > to {
                return Err(EngineError::invalid("scheduled_at", "range start is after range end"));
            }
            if to - from > MAX_LIST_RANGE_MS {
                return Err(EngineError::LimitExceeded("listing range too wide"));
            }
        }

        let mut out = Vec::new();
        for service_type_id in self.store.service_ids(&workspace_id) {
            let Some(shared) = self.store.get_service(&service_type_id) else {
                continue;
            };
            let state = shared.read().await;
            let window = match (filter.from, filter.to) {
                (Some(from), Some(to)) => {
                    let lo = state.bookings.partition_point(|b| b.scheduled_at < from);
                    let hi = state.bookings.partition_point(|b| b.scheduled_at <= to);
                    &state.bookings[lo..hi.max(lo)]
                }
                _ => &state.bookings[..],
            };
            out.extend(window.iter().filter(|b| filter.matches(b)).cloned());
        }
        out.sort_by(|a, b| a.scheduled_at.cmp(&b.scheduled_at).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let service_type_id = self
            .store
            .service_for_entity(&id)
            .ok_or(EngineError::NotFound(id))?;
        let shared = self
            .store
            .get_service(&service_type_id)
            .ok_or(EngineError::NotFound(id))?;
        let state = shared.read().await;
        state.booking(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    pub async fn get_service_type(&self, id: Ulid) -> Result<ServiceType, EngineError> {
        let shared = self.store.get_service(&id).ok_or(EngineError::NotFound(id))?;
        let state = shared.read().await;
        Ok(state.service.clone())
    }

    /// Service types of a workspace, in creation order.
    pub async fn list_service_types(&self, workspace_id: Ulid) -> Result<Vec<ServiceType>, EngineError> {
        if !self.store.contains_workspace(&workspace_id) {
            return Err(EngineError::NotFound(workspace_id));
        }
        let mut out = Vec::new();
        for id in self.store.service_ids(&workspace_id) {
            if let Some(shared) = self.store.get_service(&id) {
                out.push(shared.read().await.service.clone());
            }
        }
        Ok(out)
    }

    /// Rules of a service, ordered by day then start time.
    pub async fn get_rules(&self, service_type_id: Ulid) -> Result<Vec<AvailabilityRule>, EngineError> {
        let shared = self
            .store
            .get_service(&service_type_id)
            .ok_or(EngineError::NotFound(service_type_id))?;
        let state = shared.read().await;
        Ok(state.rules().cloned().collect())
    }
}
