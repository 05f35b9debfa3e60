use std::collections::HashSet;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{conflict, slots, BookingError, Engine, SharedDayState};

/// Filter for the paged appointment listing. Unset fields match all.
#[derive(Debug, Clone, Default)]
pub struct AppointmentFilter {
    pub center_id: Option<Ulid>,
    pub customer_id: Option<Ulid>,
    pub vehicle_id: Option<Ulid>,
    pub status: Option<AppointmentStatus>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

impl AppointmentFilter {
    fn matches(&self, a: &Appointment) -> bool {
        self.center_id.is_none_or(|c| a.center_id == c)
            && self.customer_id.is_none_or(|c| a.customer_id == c)
            && self.vehicle_id.is_none_or(|v| a.vehicle_id == v)
            && self.status.is_none_or(|s| a.status == s)
            && self.from.is_none_or(|d| a.date >= d)
            && self.to.is_none_or(|d| a.date <= d)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: DEFAULT_PAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PagedAppointments {
    pub items: Vec<Appointment>,
    pub total: usize,
}

impl Engine {
    /// Loaded day shards in date order. Handles are cloned out first so
    /// no map entry is held across an await.
    fn loaded_days(&self) -> Vec<(NaiveDate, SharedDayState)> {
        let mut days: Vec<_> = self
            .days
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        days.sort_by_key(|(d, _)| *d);
        days
    }

    pub async fn get_appointment(&self, id: Ulid) -> Result<Appointment, BookingError> {
        let date = self.day_of_appointment(&id)?;
        let day = self.day_get(&date).ok_or(BookingError::NotFound(id))?;
        let guard = day.read().await;
        guard
            .appointments
            .get(&id)
            .cloned()
            .ok_or(BookingError::NotFound(id))
    }

    /// Paged, filtered listing in deterministic order: date, start
    /// time, id. The page size is clamped, never an error.
    pub async fn list_appointments(
        &self,
        filter: &AppointmentFilter,
        page: Page,
    ) -> PagedAppointments {
        let limit = page.limit.clamp(1, MAX_PAGE_SIZE);
        let mut matched = Vec::new();
        for (date, day) in self.loaded_days() {
            if filter.from.is_some_and(|d| date < d) || filter.to.is_some_and(|d| date > d) {
                continue;
            }
            let guard = day.read().await;
            matched.extend(
                guard
                    .appointments
                    .values()
                    .filter(|a| filter.matches(a))
                    .cloned(),
            );
        }
        matched.sort_by_key(|a| (a.date, a.window.start, a.id));
        let total = matched.len();
        let items = matched.into_iter().skip(page.offset).take(limit).collect();
        PagedAppointments { items, total }
    }

    /// A customer's active appointments from now on, soonest first.
    pub async fn upcoming_for_customer(&self, customer_id: Ulid, limit: usize) -> Vec<Appointment> {
        let now = conflict::now();
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        let mut upcoming = Vec::new();
        for (date, day) in self.loaded_days() {
            if date < now.date() {
                continue;
            }
            let guard = day.read().await;
            upcoming.extend(
                guard
                    .appointments
                    .values()
                    .filter(|a| {
                        a.customer_id == customer_id && a.is_active() && a.starts_at() > now
                    })
                    .cloned(),
            );
        }
        upcoming.sort_by_key(|a| (a.date, a.window.start, a.id));
        upcoming.truncate(limit);
        upcoming
    }

    pub async fn appointments_for_center(
        &self,
        center_id: Ulid,
        date: NaiveDate,
    ) -> Vec<Appointment> {
        let Some(day) = self.day_get(&date) else {
            return Vec::new();
        };
        let guard = day.read().await;
        let mut out: Vec<_> = guard
            .appointments
            .values()
            .filter(|a| a.center_id == center_id)
            .cloned()
            .collect();
        out.sort_by_key(|a| (a.window.start, a.id));
        out
    }

    /// Every appointment ever bound to a slot, any status.
    pub async fn appointments_for_slot(
        &self,
        slot_id: Ulid,
    ) -> Result<Vec<Appointment>, BookingError> {
        let date = self.day_of_slot(&slot_id)?;
        let day = self.day_get(&date).ok_or(BookingError::NotFound(slot_id))?;
        let guard = day.read().await;
        Ok(guard
            .appointments
            .values()
            .filter(|a| a.slot_id == slot_id)
            .cloned()
            .collect())
    }

    /// Live active-booking count for a slot.
    pub async fn active_count_for_slot(&self, slot_id: Ulid) -> Result<u32, BookingError> {
        let date = self.day_of_slot(&slot_id)?;
        let day = self.day_get(&date).ok_or(BookingError::NotFound(slot_id))?;
        let guard = day.read().await;
        Ok(guard.active_count_for_slot(&slot_id, None))
    }

    /// The reschedule chain containing `id`: original first, latest
    /// replacement last. The walk is bounded and cycle-guarded in both
    /// directions.
    pub async fn reschedule_chain(&self, id: Ulid) -> Result<Vec<Appointment>, BookingError> {
        // Back to the original.
        let mut visited = HashSet::new();
        let mut cursor = id;
        loop {
            if !visited.insert(cursor) || visited.len() > MAX_CHAIN_WALK {
                return Err(BookingError::LimitExceeded("reschedule chain walk"));
            }
            let appt = self.get_appointment(cursor).await?;
            match appt.rescheduled_from {
                Some(prev) => cursor = prev,
                None => break,
            }
        }

        // Forward, collecting.
        let mut chain = Vec::new();
        loop {
            if chain.len() > MAX_CHAIN_WALK {
                return Err(BookingError::LimitExceeded("reschedule chain walk"));
            }
            let appt = self.get_appointment(cursor).await?;
            let next = appt.rescheduled_to;
            chain.push(appt);
            match next {
                Some(n) => {
                    if chain.iter().any(|a| a.id == n) {
                        return Err(BookingError::LimitExceeded("reschedule chain cycle"));
                    }
                    cursor = n;
                }
                None => break,
            }
        }
        Ok(chain)
    }

    /// Has this appointment been replaced by a reschedule?
    pub async fn is_superseded(&self, id: Ulid) -> Result<bool, BookingError> {
        Ok(self.get_appointment(id).await?.rescheduled_to.is_some())
    }

    /// The same-day candidate sets the conflict checker evaluates, as an
    /// externally consumable view.
    pub async fn collision_sets(
        &self,
        date: NaiveDate,
        vehicle_id: Ulid,
        technician_id: Option<Ulid>,
        center_id: Ulid,
    ) -> CollisionSets {
        let Some(day) = self.day_get(&date) else {
            return CollisionSets::default();
        };
        let guard = day.read().await;
        CollisionSets {
            vehicle: guard
                .active_for_vehicle(vehicle_id, None)
                .into_iter()
                .cloned()
                .collect(),
            technician: technician_id
                .map(|t| {
                    guard
                        .active_for_technician(t, center_id, None)
                        .into_iter()
                        .cloned()
                        .collect()
                })
                .unwrap_or_default(),
            center: guard
                .active_for_center(center_id)
                .into_iter()
                .cloned()
                .collect(),
        }
    }

    // ── Slot views ───────────────────────────────────────────

    pub async fn slots_for_center(&self, center_id: Ulid, date: NaiveDate) -> Vec<SlotView> {
        let Some(day) = self.day_get(&date) else {
            return Vec::new();
        };
        let guard = day.read().await;
        let now = conflict::now();
        let mut views: Vec<SlotView> = guard
            .slots_for_center(center_id)
            .map(|s| slots::slot_view(s, &guard, now))
            .collect();
        views.sort_by_key(|v| (v.slot.window.start, v.slot.id));
        views
    }

    pub async fn slots_in_range(
        &self,
        center_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<SlotView>, BookingError> {
        if from > to {
            return Err(BookingError::Validation("date range is inverted"));
        }
        if to.signed_duration_since(from).num_days() + 1 > MAX_QUERY_WINDOW_DAYS {
            return Err(BookingError::LimitExceeded("query window too wide"));
        }
        let now = conflict::now();
        let mut views = Vec::new();
        for (date, day) in self.loaded_days() {
            if date < from || date > to {
                continue;
            }
            let guard = day.read().await;
            views.extend(
                guard
                    .slots_for_center(center_id)
                    .map(|s| slots::slot_view(s, &guard, now)),
            );
        }
        views.sort_by_key(|v| (v.slot.date, v.slot.window.start, v.slot.id));
        Ok(views)
    }

    pub async fn slot_view(&self, slot_id: Ulid) -> Result<SlotView, BookingError> {
        let date = self.day_of_slot(&slot_id)?;
        let day = self.day_get(&date).ok_or(BookingError::NotFound(slot_id))?;
        let guard = day.read().await;
        let slot = guard
            .slots
            .get(&slot_id)
            .ok_or(BookingError::NotFound(slot_id))?;
        Ok(slots::slot_view(slot, &guard, conflict::now()))
    }
}
