use std::collections::HashSet;
use std::future::Future;
use std::time::Instant;

use chrono::{NaiveDate, NaiveDateTime};
use tokio::sync::oneshot;
use tracing::info;
use ulid::Ulid;

use crate::limits::MAX_CHAIN_WALK;
use crate::model::*;
use crate::observability;

use super::store::DayState;
use super::{conflict, slots, store, BookingError, Engine, WalCommand};

/// Wrap an orchestrator operation with its RED metrics.
async fn timed<T>(
    op: &'static str,
    fut: impl Future<Output = Result<T, BookingError>>,
) -> Result<T, BookingError> {
    let started = Instant::now();
    let result = fut.await;
    observability::record_op(op, started, result.as_ref().err().map(BookingError::code));
    result
}

/// Availability gate plus the three conflict predicates, evaluated over
/// candidate sets drawn from the locked day. Called twice per create:
/// once as the optimistic pre-check (read lock), once as the final check
/// inside the committing write lock.
fn verify_booking(
    day: &DayState,
    slot: &TimeSlot,
    vehicle_id: Ulid,
    technician_id: Option<Ulid>,
    center_id: Ulid,
    exclude: Option<Ulid>,
    now: NaiveDateTime,
) -> Result<(), BookingError> {
    conflict::check_slot_open(slot, center_id, now)?;
    let vehicle_candidates = day.active_for_vehicle(vehicle_id, exclude);
    let technician_candidates = match technician_id {
        Some(t) => day.active_for_technician(t, center_id, exclude),
        None => Vec::new(),
    };
    let slot_active = day.active_count_for_slot(&slot.id, exclude);
    conflict::check_no_conflict(
        vehicle_id,
        technician_id,
        &slot.window,
        slot,
        &vehicle_candidates,
        &technician_candidates,
        slot_active,
    )
}

impl Engine {
    // ── Booking ──────────────────────────────────────────────

    /// Book a slot: validate, conflict-check, commit. A racing create for
    /// the last place in a slot serializes on the day lock and fails
    /// cleanly with `CapacityExceeded` instead of overbooking.
    pub async fn create_appointment(
        &self,
        req: BookingRequest,
    ) -> Result<Appointment, BookingError> {
        timed("create", self.create_appointment_inner(req)).await
    }

    async fn create_appointment_inner(
        &self,
        req: BookingRequest,
    ) -> Result<Appointment, BookingError> {
        let BookingRequest {
            customer_id,
            vehicle_id,
            technician_id,
            center_id,
            slot_id,
            services,
        } = req;
        let services = conflict::normalize_services(services)?;
        let date = self.day_of_slot(&slot_id)?;
        let day = self.day_get(&date).ok_or(BookingError::NotFound(slot_id))?;

        // Optimistic pre-check under the read lock: turn away obvious
        // losers without contending with writers.
        {
            let guard = day.read().await;
            let slot = guard
                .slots
                .get(&slot_id)
                .ok_or(BookingError::NotFound(slot_id))?;
            verify_booking(
                &guard,
                slot,
                vehicle_id,
                technician_id,
                center_id,
                None,
                conflict::now(),
            )?;
        }

        // Final verification inside the committing write lock. The
        // pre-check is an optimization; this is the source of truth.
        let mut guard = day.write_owned().await;
        let slot = guard
            .slots
            .get(&slot_id)
            .ok_or(BookingError::NotFound(slot_id))?
            .clone();
        verify_booking(
            &guard,
            &slot,
            vehicle_id,
            technician_id,
            center_id,
            None,
            conflict::now(),
        )?;

        let id = Ulid::new();
        let appointment = Appointment {
            id,
            code: booking_code(&id),
            customer_id,
            vehicle_id,
            technician_id,
            center_id,
            slot_id,
            date: slot.date,
            window: slot.window,
            status: AppointmentStatus::Pending,
            services,
            rescheduled_from: None,
            rescheduled_to: None,
            services_amended: false,
        };
        let event = Event::AppointmentCreated {
            appointment: appointment.clone(),
        };
        self.persist_and_apply(center_id, &mut guard, &event).await?;
        info!(%id, code = %appointment.code, slot = %slot_id, "appointment created");
        Ok(appointment)
    }

    // ── Status transitions ───────────────────────────────────

    pub async fn confirm(&self, id: Ulid) -> Result<Appointment, BookingError> {
        self.transition(id, AppointmentStatus::Confirmed, "confirm").await
    }

    pub async fn check_in(&self, id: Ulid) -> Result<Appointment, BookingError> {
        self.transition(id, AppointmentStatus::CheckedIn, "check_in").await
    }

    pub async fn start_service(&self, id: Ulid) -> Result<Appointment, BookingError> {
        self.transition(id, AppointmentStatus::InProgress, "start_service")
            .await
    }

    pub async fn complete(&self, id: Ulid) -> Result<Appointment, BookingError> {
        self.transition(id, AppointmentStatus::Completed, "complete").await
    }

    pub async fn cancel(&self, id: Ulid) -> Result<Appointment, BookingError> {
        self.transition(id, AppointmentStatus::Cancelled, "cancel").await
    }

    pub async fn mark_no_show(&self, id: Ulid) -> Result<Appointment, BookingError> {
        self.transition(id, AppointmentStatus::NoShow, "mark_no_show").await
    }

    /// Generic status update. `Rescheduled` is unreachable here — that
    /// status is owned by the reschedule operation.
    pub async fn update_status(
        &self,
        id: Ulid,
        to: AppointmentStatus,
    ) -> Result<Appointment, BookingError> {
        if to == AppointmentStatus::Rescheduled {
            return Err(BookingError::Validation(
                "status Rescheduled is set by the reschedule operation",
            ));
        }
        self.transition(id, to, "update_status").await
    }

    async fn transition(
        &self,
        id: Ulid,
        to: AppointmentStatus,
        op: &'static str,
    ) -> Result<Appointment, BookingError> {
        timed(op, async {
            let (date, mut guard) = self.resolve_appointment_write(&id).await?;
            let appt = guard
                .appointments
                .get(&id)
                .ok_or(BookingError::NotFound(id))?;
            store::check_transition(appt, to)?;
            let center_id = appt.center_id;
            let event = Event::StatusChanged {
                id,
                date,
                from: appt.status,
                to,
            };
            self.persist_and_apply(center_id, &mut guard, &event).await?;
            info!(%id, %to, "appointment status changed");
            Ok(guard
                .appointments
                .get(&id)
                .expect("present: just transitioned")
                .clone())
        })
        .await
    }

    // ── Service lines ────────────────────────────────────────

    /// Replace the full set of line items. Wholesale: the previous set is
    /// gone, the deduplicated new set stands, nothing is appended.
    pub async fn replace_services(
        &self,
        id: Ulid,
        services: Vec<ServiceLine>,
    ) -> Result<Appointment, BookingError> {
        timed("replace_services", async {
            let services = conflict::normalize_services(services)?;
            let (date, mut guard) = self.resolve_appointment_write(&id).await?;
            let appt = guard
                .appointments
                .get(&id)
                .ok_or(BookingError::NotFound(id))?;
            if appt.status.is_terminal() {
                return Err(BookingError::Validation(
                    "cannot amend services on a closed appointment",
                ));
            }
            let center_id = appt.center_id;
            let event = Event::ServicesReplaced { id, date, services };
            self.persist_and_apply(center_id, &mut guard, &event).await?;
            Ok(guard
                .appointments
                .get(&id)
                .expect("present: just amended")
                .clone())
        })
        .await
    }

    // ── Hard delete ──────────────────────────────────────────

    /// Hard-delete, permitted only while the appointment is still in its
    /// freshly created shape: Pending, unamended services, not part of a
    /// reschedule chain. Anything else is cancelled, not deleted.
    pub async fn delete_pending(&self, id: Ulid) -> Result<(), BookingError> {
        timed("delete", async {
            let (date, mut guard) = self.resolve_appointment_write(&id).await?;
            let appt = guard
                .appointments
                .get(&id)
                .ok_or(BookingError::NotFound(id))?;
            if appt.status != AppointmentStatus::Pending {
                return Err(BookingError::Validation(
                    "only pending appointments may be hard-deleted",
                ));
            }
            if appt.services_amended {
                return Err(BookingError::Validation(
                    "services were amended; cancel instead of deleting",
                ));
            }
            if appt.rescheduled_from.is_some() {
                return Err(BookingError::Validation(
                    "appointment belongs to a reschedule chain; cancel instead",
                ));
            }
            let center_id = appt.center_id;
            let event = Event::AppointmentDeleted { id, date };
            self.persist_and_apply(center_id, &mut guard, &event).await?;
            info!(%id, "pending appointment deleted");
            Ok(())
        })
        .await
    }

    // ── Reschedule ───────────────────────────────────────────

    /// Replace an appointment with a new one on another slot. One atomic
    /// record marks the old appointment Rescheduled, links the chain in
    /// both directions and inserts the replacement, so the old slot
    /// binding is released in the same step the new one is acquired.
    pub async fn reschedule(
        &self,
        old_id: Ulid,
        req: RescheduleRequest,
    ) -> Result<Appointment, BookingError> {
        timed("reschedule", self.reschedule_inner(old_id, req)).await
    }

    async fn reschedule_inner(
        &self,
        old_id: Ulid,
        req: RescheduleRequest,
    ) -> Result<Appointment, BookingError> {
        let RescheduleRequest {
            slot_id,
            technician_id,
            services,
        } = req;
        let services = conflict::normalize_services(services)?;

        // Depth check before locking: every predecessor is terminal, so
        // the chain behind old_id cannot change underneath us.
        let depth = self.chain_depth(&old_id).await?;
        if depth >= self.config.max_reschedule_depth {
            return Err(BookingError::ChainDepthExceeded { id: old_id, depth });
        }

        let old_date = self.day_of_appointment(&old_id)?;
        let new_date = self.day_of_slot(&slot_id)?;

        if old_date == new_date {
            let day = self.day_get(&old_date).ok_or(BookingError::NotFound(old_id))?;
            let mut guard = day.write_owned().await;
            self.reschedule_locked(&mut guard, None, old_id, old_date, slot_id, technician_id, services)
                .await
        } else {
            // Two shards: acquire in date order so a reschedule running
            // the other way cannot deadlock us.
            let day_old = self.day_get(&old_date).ok_or(BookingError::NotFound(old_id))?;
            let day_new = self.day_get(&new_date).ok_or(BookingError::NotFound(slot_id))?;
            let (mut guard_old, mut guard_new);
            if old_date < new_date {
                guard_old = day_old.write_owned().await;
                guard_new = day_new.write_owned().await;
            } else {
                guard_new = day_new.write_owned().await;
                guard_old = day_old.write_owned().await;
            }
            self.reschedule_locked(
                &mut guard_old,
                Some(&mut guard_new),
                old_id,
                old_date,
                slot_id,
                technician_id,
                services,
            )
            .await
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn reschedule_locked(
        &self,
        old_day: &mut DayState,
        new_day: Option<&mut DayState>,
        old_id: Ulid,
        old_date: NaiveDate,
        slot_id: Ulid,
        technician_id: Option<Ulid>,
        services: Vec<ServiceLine>,
    ) -> Result<Appointment, BookingError> {
        let old = old_day
            .appointments
            .get(&old_id)
            .ok_or(BookingError::NotFound(old_id))?
            .clone();
        store::check_transition(&old, AppointmentStatus::Rescheduled)?;

        let slot = {
            let target = new_day.as_deref().unwrap_or(&*old_day);
            let slot = target
                .slots
                .get(&slot_id)
                .ok_or(BookingError::NotFound(slot_id))?
                .clone();
            if !self.config.allow_cross_center_reschedule && slot.center_id != old.center_id {
                return Err(BookingError::Validation("cross-center reschedule is disabled"));
            }
            // The old appointment is excluded from every candidate set:
            // its bindings are released by the very record committed here.
            verify_booking(
                target,
                &slot,
                old.vehicle_id,
                technician_id,
                slot.center_id,
                Some(old_id),
                conflict::now(),
            )?;
            slot
        };

        let id = Ulid::new();
        let replacement = Appointment {
            id,
            code: booking_code(&id),
            customer_id: old.customer_id,
            vehicle_id: old.vehicle_id,
            technician_id,
            center_id: slot.center_id,
            slot_id,
            date: slot.date,
            window: slot.window,
            status: AppointmentStatus::Pending,
            services,
            rescheduled_from: Some(old_id),
            rescheduled_to: None,
            services_amended: false,
        };
        let event = Event::Rescheduled {
            old_id,
            old_date,
            replacement: replacement.clone(),
        };
        self.wal_append(&event).await?;
        store::apply_event(old_day, &event, &self.appt_index, &self.slot_index);
        if let Some(new_day) = new_day {
            store::apply_event(new_day, &event, &self.appt_index, &self.slot_index);
        }
        self.notify.send(old.center_id, &event);
        if slot.center_id != old.center_id {
            self.notify.send(slot.center_id, &event);
        }
        info!(old = %old_id, new = %id, "appointment rescheduled");
        Ok(replacement)
    }

    /// Number of predecessors behind an appointment, via read locks only.
    async fn chain_depth(&self, id: &Ulid) -> Result<u32, BookingError> {
        let mut depth = 0u32;
        let mut visited = HashSet::new();
        let mut cursor = *id;
        loop {
            if !visited.insert(cursor) || visited.len() > MAX_CHAIN_WALK {
                return Err(BookingError::LimitExceeded("reschedule chain walk"));
            }
            let date = self.day_of_appointment(&cursor)?;
            let day = self.day_get(&date).ok_or(BookingError::NotFound(cursor))?;
            let guard = day.read().await;
            let appt = guard
                .appointments
                .get(&cursor)
                .ok_or(BookingError::NotFound(cursor))?;
            match appt.rescheduled_from {
                Some(prev) => {
                    depth += 1;
                    cursor = prev;
                }
                None => return Ok(depth),
            }
        }
    }

    // ── Slot maintenance ─────────────────────────────────────

    /// Bulk-generate slots over a date range. Validation for the whole
    /// range runs with every affected day lock held, in date order, so an
    /// overlap anywhere means zero slots created.
    pub async fn generate_slots(&self, req: SlotGenerationRequest) -> Result<u32, BookingError> {
        timed("generate_slots", self.generate_slots_inner(req)).await
    }

    async fn generate_slots_inner(
        &self,
        req: SlotGenerationRequest,
    ) -> Result<u32, BookingError> {
        let plan = slots::plan_generation(&req)?;

        let mut guards = Vec::with_capacity(plan.len());
        for (date, _) in &plan {
            let day = self.day_entry(*date);
            guards.push(day.write_owned().await);
        }

        // Phase 1: validate the whole range against existing slots.
        let mut replaced_per_day: Vec<Vec<Ulid>> = Vec::with_capacity(plan.len());
        for ((date, windows), guard) in plan.iter().zip(&guards) {
            let mut replaced = Vec::new();
            for window in windows {
                for existing in guard.center_slots_overlapping(req.center_id, window) {
                    if !req.overwrite {
                        return Err(BookingError::SlotOverlap {
                            center_id: req.center_id,
                            date: *date,
                            existing: existing.id,
                        });
                    }
                    if guard.active_count_for_slot(&existing.id, None) > 0 {
                        return Err(BookingError::SlotUnavailable {
                            slot_id: existing.id,
                            reason: "overwrite would orphan active bookings",
                        });
                    }
                    replaced.push(existing.id);
                }
            }
            replaced.sort_unstable();
            replaced.dedup();
            replaced_per_day.push(replaced);
        }

        // Phase 2: commit, one atomic event per day.
        let mut created = 0u32;
        for (((date, windows), guard), replaced) in
            plan.into_iter().zip(guards.iter_mut()).zip(replaced_per_day)
        {
            let new_slots: Vec<TimeSlot> = windows
                .into_iter()
                .map(|window| TimeSlot {
                    id: Ulid::new(),
                    center_id: req.center_id,
                    date,
                    window,
                    max_bookings: req.max_bookings,
                    blocked: false,
                    kind: req.kind,
                })
                .collect();
            created += new_slots.len() as u32;
            let event = Event::SlotsGenerated {
                date,
                replaced,
                slots: new_slots,
            };
            self.persist_and_apply(req.center_id, &mut **guard, &event).await?;
        }
        info!(center = %req.center_id, created, "slots generated");
        Ok(created)
    }

    pub async fn block_slot(&self, slot_id: Ulid) -> Result<(), BookingError> {
        self.set_slot_blocked(slot_id, true, "block_slot").await
    }

    pub async fn unblock_slot(&self, slot_id: Ulid) -> Result<(), BookingError> {
        self.set_slot_blocked(slot_id, false, "unblock_slot").await
    }

    async fn set_slot_blocked(
        &self,
        slot_id: Ulid,
        blocked: bool,
        op: &'static str,
    ) -> Result<(), BookingError> {
        timed(op, async {
            let date = self.day_of_slot(&slot_id)?;
            let day = self.day_get(&date).ok_or(BookingError::NotFound(slot_id))?;
            let mut guard = day.write_owned().await;
            let slot = guard
                .slots
                .get(&slot_id)
                .ok_or(BookingError::NotFound(slot_id))?;
            if slot.blocked == blocked {
                return Ok(()); // already in the requested state
            }
            let center_id = slot.center_id;
            let event = if blocked {
                Event::SlotBlocked { id: slot_id, date }
            } else {
                Event::SlotUnblocked { id: slot_id, date }
            };
            self.persist_and_apply(center_id, &mut guard, &event).await
        })
        .await
    }

    /// Delete a center's slots on a date that have zero active bookings.
    /// Occupied slots are skipped, never an error. Returns how many went.
    pub async fn purge_empty_slots(
        &self,
        center_id: Ulid,
        date: NaiveDate,
    ) -> Result<u32, BookingError> {
        timed("purge_slots", async {
            let Some(day) = self.day_get(&date) else {
                return Ok(0);
            };
            let mut guard = day.write_owned().await;
            let ids = slots::purgeable_slots(&guard, center_id);
            if ids.is_empty() {
                return Ok(0);
            }
            let count = ids.len() as u32;
            let event = Event::SlotsPurged { date, ids };
            self.persist_and_apply(center_id, &mut guard, &event).await?;
            info!(center = %center_id, %date, count, "empty slots purged");
            Ok(count)
        })
        .await
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL down to the events that recreate current state.
    /// The embedding application decides when, typically once
    /// `wal_appends_since_compact` crosses its threshold.
    pub async fn compact_wal(&self) -> Result<(), BookingError> {
        let mut dates: Vec<NaiveDate> = self.days.iter().map(|e| *e.key()).collect();
        dates.sort_unstable();

        let mut events = Vec::new();
        for date in dates {
            let Some(day) = self.day_get(&date) else { continue };
            let guard = day.read().await;
            if !guard.slots.is_empty() {
                events.push(Event::SlotsGenerated {
                    date,
                    replaced: Vec::new(),
                    slots: guard.slots.values().cloned().collect(),
                });
            }
            // Full appointment records carry status and chain links, so
            // replaying them recreates history exactly.
            for appt in guard.appointments.values() {
                events.push(Event::AppointmentCreated {
                    appointment: appt.clone(),
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| BookingError::TransientStore("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| BookingError::TransientStore("WAL writer dropped response".into()))?
            .map_err(|e| BookingError::TransientStore(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
