use std::time::Instant;

use chrono::NaiveTime;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::NoticeKind;
use crate::observability;

use super::availability::is_offered;
use super::conflict::{check_no_conflict, now_ms};
use super::lifecycle::check_transition;
use super::validate::{self, normalize_email};
use super::{Engine, EngineError, Unavailable};

fn rejected(reason: &'static str) {
    metrics::counter!(observability::RESERVATIONS_REJECTED_TOTAL, "reason" => reason).increment(1);
}

fn trimmed(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl Engine {
    // ── Workspaces ───────────────────────────────────────────

    pub async fn create_workspace(&self, id: Ulid, name: &str, timezone: &str) -> Result<Workspace, EngineError> {
        validate::name("name", name)?;
        let timezone = validate::timezone(timezone)?;
        let _gate = self.commit_gate.read().await;
        if self.store.workspace_count() >= MAX_WORKSPACES {
            return Err(EngineError::LimitExceeded("too many workspaces"));
        }
        if self.store.contains_workspace(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let workspace = Workspace {
            id,
            name: name.trim().to_string(),
            timezone,
            active: true,
        };
        self.persist_global(&Event::WorkspaceCreated { workspace: workspace.clone() })
            .await?;
        info!(workspace_id = %id, timezone = %workspace.timezone, "workspace created");
        Ok(workspace)
    }

    pub async fn update_workspace(&self, id: Ulid, patch: WorkspacePatch) -> Result<Workspace, EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut workspace = self.store.get_workspace(&id).ok_or(EngineError::NotFound(id))?;
        if let Some(name) = patch.name {
            validate::name("name", &name)?;
            workspace.name = name.trim().to_string();
        }
        if let Some(tz) = patch.timezone {
            workspace.timezone = validate::timezone(&tz)?;
        }
        if let Some(active) = patch.active {
            workspace.active = active;
        }
        self.persist_global(&Event::WorkspaceUpdated { workspace: workspace.clone() })
            .await?;
        Ok(workspace)
    }

    // ── Service types ────────────────────────────────────────

    pub async fn create_service_type(
        &self,
        id: Ulid,
        workspace_id: Ulid,
        name: &str,
        duration_minutes: u32,
        location: Option<String>,
        description: Option<String>,
    ) -> Result<ServiceType, EngineError> {
        validate::name("name", name)?;
        validate::duration(duration_minutes)?;
        validate::optional_text("location", location.as_deref())?;
        validate::optional_text("description", description.as_deref())?;

        let _gate = self.commit_gate.read().await;
        if !self.store.contains_workspace(&workspace_id) {
            return Err(EngineError::NotFound(workspace_id));
        }
        if self.store.service_count(&workspace_id) >= MAX_SERVICE_TYPES_PER_WORKSPACE {
            return Err(EngineError::LimitExceeded("too many service types in workspace"));
        }
        if self.store.contains_service(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let service = ServiceType {
            id,
            workspace_id,
            name: name.trim().to_string(),
            description: trimmed(description),
            duration_minutes,
            location: trimmed(location),
            active: true,
        };
        self.persist_global(&Event::ServiceTypeCreated { service: service.clone() })
            .await?;
        debug!(service_type_id = %id, %workspace_id, duration_minutes, "service type created");
        Ok(service)
    }

    /// A duration change applies to future candidates only; existing bookings
    /// keep the duration they were made with.
    pub async fn update_service_type(&self, id: Ulid, patch: ServiceTypePatch) -> Result<ServiceType, EngineError> {
        if let Some(name) = &patch.name {
            validate::name("name", name)?;
        }
        if let Some(minutes) = patch.duration_minutes {
            validate::duration(minutes)?;
        }
        if let Some(Some(location)) = &patch.location {
            validate::optional_text("location", Some(location))?;
        }
        if let Some(Some(description)) = &patch.description {
            validate::optional_text("description", Some(description))?;
        }

        let _gate = self.commit_gate.read().await;
        let shared = self.store.get_service(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = shared.write().await;

        let mut service = guard.service.clone();
        if let Some(name) = patch.name {
            service.name = name.trim().to_string();
        }
        if let Some(description) = patch.description {
            service.description = trimmed(description);
        }
        if let Some(location) = patch.location {
            service.location = trimmed(location);
        }
        if let Some(minutes) = patch.duration_minutes {
            service.duration_minutes = minutes;
        }
        if let Some(active) = patch.active {
            service.active = active;
        }

        let event = Event::ServiceTypeUpdated { service: service.clone() };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(service)
    }

    // ── Availability rules ───────────────────────────────────

    pub async fn add_rule(
        &self,
        id: Ulid,
        service_type_id: Ulid,
        day_of_week: u8,
        start_time: NaiveTime,
        end_time: NaiveTime,
        resource: Option<String>,
    ) -> Result<AvailabilityRule, EngineError> {
        let resource = trimmed(resource);
        validate::rule_window(day_of_week, start_time, end_time, resource.as_deref())?;

        let _gate = self.commit_gate.read().await;
        let shared = self
            .store
            .get_service(&service_type_id)
            .ok_or(EngineError::NotFound(service_type_id))?;
        let mut guard = shared.write().await;
        if guard.rule_count() >= MAX_RULES_PER_SERVICE {
            return Err(EngineError::LimitExceeded("too many rules on service type"));
        }
        if self.store.service_for_entity(&id).is_some() {
            return Err(EngineError::AlreadyExists(id));
        }

        let rule = AvailabilityRule {
            id,
            service_type_id,
            day_of_week,
            start_time,
            end_time,
            resource,
        };
        self.persist_and_apply(&mut guard, &Event::RuleAdded { rule: rule.clone() })
            .await?;
        Ok(rule)
    }

    /// Existing bookings made inside the removed window are kept.
    pub async fn remove_rule(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let _gate = self.commit_gate.read().await;
        let (service_type_id, mut guard) = self.resolve_entity_write(&id).await?;
        if !guard.rules().any(|r| r.id == id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::RuleRemoved { id, service_type_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(service_type_id)
    }

    // ── Reservation ──────────────────────────────────────────

    /// Reserve the requested slot.
    ///
    /// Everything from the offered-slot check to the WAL append runs under the
    /// service's write lock, so of any number of concurrent requests for
    /// overlapping intervals at most one succeeds. A request that cannot get the
    /// lock within the engine's lock timeout fails with `Timeout` and changes
    /// nothing.
    pub async fn create_booking(&self, request: BookingRequest) -> Result<Booking, EngineError> {
        let status = validate::booking_request(&request).inspect_err(|_| rejected("validation"))?;

        let workspace = self
            .store
            .get_workspace(&request.workspace_id)
            .ok_or_else(|| EngineError::invalid("workspace_id", "unknown workspace"))?;
        if !workspace.active {
            return Err(EngineError::invalid("workspace_id", "workspace is not accepting bookings"));
        }
        if !self
            .store
            .service_in_workspace(&request.workspace_id, &request.service_type_id)
        {
            return Err(EngineError::invalid(
                "service_type_id",
                "unknown service type for this workspace",
            ));
        }
        let shared = self
            .store
            .get_service(&request.service_type_id)
            .ok_or_else(|| EngineError::invalid("service_type_id", "unknown service type"))?;

        let waited = Instant::now();
        let acquire = async {
            let gate = self.commit_gate.read().await;
            let guard = shared.write_owned().await;
            (gate, guard)
        };
        let (_gate, mut guard) = match tokio::time::timeout(self.lock_timeout, acquire).await {
            Ok(locked) => locked,
            Err(_) => {
                rejected("timeout");
                debug!(service_type_id = %request.service_type_id, "reservation lock timed out");
                return Err(EngineError::Timeout(self.lock_timeout));
            }
        };
        metrics::histogram!(observability::LOCK_WAIT_SECONDS).record(waited.elapsed().as_secs_f64());

        if !guard.service.active {
            return Err(EngineError::invalid("service_type_id", "service type is not active"));
        }
        if self.store.service_for_entity(&request.id).is_some() {
            return Err(EngineError::AlreadyExists(request.id));
        }
        if guard.bookings.len() >= MAX_BOOKINGS_PER_SERVICE {
            return Err(EngineError::LimitExceeded("too many bookings on service type"));
        }

        let now = now_ms();
        if !is_offered(&guard, workspace.timezone, request.requested_at, now) {
            rejected("not_offered");
            return Err(EngineError::SlotUnavailable {
                service_type_id: request.service_type_id,
                requested_at: request.requested_at,
                reason: Unavailable::NotOffered,
            });
        }
        let span = Span::new(
            request.requested_at,
            request.requested_at + guard.service.duration_ms(),
        );
        check_no_conflict(&guard, &span).inspect_err(|_| rejected("taken"))?;

        let (contact_id, new_contact) = self.resolve_contact(request.workspace_id, &request.contact);
        let booking = Booking {
            id: request.id,
            workspace_id: request.workspace_id,
            service_type_id: request.service_type_id,
            contact_id,
            scheduled_at: request.requested_at,
            duration_minutes: guard.service.duration_minutes,
            status,
            notes: trimmed(request.notes),
            created_at: now,
            updated_at: now,
        };
        let event = Event::BookingCreated {
            booking: booking.clone(),
            contact: new_contact.clone(),
        };
        if let Err(e) = self.persist_and_apply(&mut guard, &event).await {
            if let Some(contact) = &new_contact {
                self.store.release_contact_email(contact.workspace_id, &contact.email);
            }
            return Err(e);
        }
        drop(guard);

        metrics::counter!(observability::BOOKINGS_CREATED_TOTAL, "status" => status.as_str()).increment(1);
        debug!(booking_id = %booking.id, service_type_id = %booking.service_type_id, at = booking.scheduled_at, "booking created");
        self.notify.send(NoticeKind::Created, &booking);
        Ok(booking)
    }

    /// Reuse the workspace's contact with this email, or claim the email for a
    /// new contact. A new contact is returned so it can be written with the
    /// booking; the claim must be released if that write fails.
    fn resolve_contact(&self, workspace_id: Ulid, input: &ContactInput) -> (Ulid, Option<Contact>) {
        let email = normalize_email(&input.email);
        if let Some(id) = self.store.contact_by_email(workspace_id, &email) {
            return (id, None);
        }
        let contact = Contact {
            id: Ulid::new(),
            workspace_id,
            name: input.name.trim().to_string(),
            email,
            phone: trimmed(input.phone.clone()),
        };
        match self
            .store
            .claim_contact_email(workspace_id, &contact.email, contact.id)
        {
            Some(existing) => (existing, None),
            None => (contact.id, Some(contact)),
        }
    }

    // ── Lifecycle ────────────────────────────────────────────

    /// Move a booking to `to`. Leaving an occupying status frees the interval
    /// for the very next reservation.
    pub async fn update_booking_status(&self, booking_id: Ulid, to: BookingStatus) -> Result<Booking, EngineError> {
        let _gate = self.commit_gate.read().await;
        let (service_type_id, mut guard) = self.resolve_entity_write(&booking_id).await?;
        let booking = guard
            .booking(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        check_transition(booking, to)?;
        let from = booking.status;

        let event = Event::BookingStatusChanged {
            id: booking_id,
            service_type_id,
            status: to,
            at: now_ms(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        let updated = guard
            .booking(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        drop(guard);

        metrics::counter!(observability::STATUS_TRANSITIONS_TOTAL, "to" => to.as_str()).increment(1);
        debug!(%booking_id, %from, %to, "booking status changed");
        if let Some(kind) = NoticeKind::for_status(to) {
            self.notify.send(kind, &updated);
        }
        Ok(updated)
    }

    // ── Compaction ───────────────────────────────────────────

    /// Rewrite the WAL as the minimal event list that rebuilds current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;

        let mut events = Vec::new();
        for workspace in self.store.workspaces() {
            events.push(Event::WorkspaceCreated { workspace });
        }
        for contact in self.store.contacts() {
            events.push(Event::ContactCreated { contact });
        }
        for id in self.store.all_service_ids() {
            let Some(shared) = self.store.get_service(&id) else {
                continue;
            };
            let state = shared.read().await;
            events.push(Event::ServiceTypeCreated {
                service: state.service.clone(),
            });
            for rule in state.rules() {
                events.push(Event::RuleAdded { rule: rule.clone() });
            }
            for booking in &state.bookings {
                events.push(Event::BookingCreated {
                    booking: booking.clone(),
                    contact: None,
                });
            }
        }

        let count = events.len();
        self.wal
            .compact(events)
            .await
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        metrics::counter!(observability::WAL_COMPACTIONS_TOTAL).increment(1);
        info!(events = count, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        self.wal.appends_since_compact().await.unwrap_or(0)
    }
}
