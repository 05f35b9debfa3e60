use std::collections::BTreeMap;

use chrono::NaiveDate;
use dashmap::DashMap;
use ulid::Ulid;

use crate::model::*;

use super::BookingError;

/// Legal status transitions. This table is the sole authority; every
/// transition request goes through it.
pub fn transition_allowed(from: AppointmentStatus, to: AppointmentStatus) -> bool {
    use AppointmentStatus::*;
    matches!(
        (from, to),
        (Pending, Confirmed)
            | (Pending, Cancelled)
            | (Pending, Rescheduled)
            | (Confirmed, CheckedIn)
            | (Confirmed, Cancelled)
            | (Confirmed, NoShow)
            | (Confirmed, Rescheduled)
            | (CheckedIn, InProgress)
            | (InProgress, Completed)
    )
}

pub(super) fn check_transition(
    appt: &Appointment,
    to: AppointmentStatus,
) -> Result<(), BookingError> {
    if transition_allowed(appt.status, to) {
        Ok(())
    } else {
        Err(BookingError::InvalidTransition {
            id: appt.id,
            from: appt.status,
            to,
        })
    }
}

/// Every slot and appointment for one calendar day, across all centers.
///
/// The day is the unit of mutual exclusion: all three conflict dimensions
/// of a proposed booking (vehicle, technician, slot capacity) are
/// same-date predicates, so one day write lock covers the whole atomic
/// check-and-insert.
#[derive(Debug, Clone)]
pub struct DayState {
    pub date: NaiveDate,
    pub slots: BTreeMap<Ulid, TimeSlot>,
    pub appointments: BTreeMap<Ulid, Appointment>,
}

impl DayState {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            slots: BTreeMap::new(),
            appointments: BTreeMap::new(),
        }
    }

    /// Live COUNT of active appointments bound to a slot. Never cached.
    /// `exclude` drops the appointment a reschedule is about to release.
    pub fn active_count_for_slot(&self, slot_id: &Ulid, exclude: Option<Ulid>) -> u32 {
        self.appointments
            .values()
            .filter(|a| a.slot_id == *slot_id && a.is_active() && Some(a.id) != exclude)
            .count() as u32
    }

    /// Active appointments for a vehicle this day, any center.
    pub fn active_for_vehicle(&self, vehicle_id: Ulid, exclude: Option<Ulid>) -> Vec<&Appointment> {
        self.appointments
            .values()
            .filter(|a| a.vehicle_id == vehicle_id && a.is_active() && Some(a.id) != exclude)
            .collect()
    }

    /// Active appointments for a technician at one center this day.
    pub fn active_for_technician(
        &self,
        technician_id: Ulid,
        center_id: Ulid,
        exclude: Option<Ulid>,
    ) -> Vec<&Appointment> {
        self.appointments
            .values()
            .filter(|a| {
                a.technician_id == Some(technician_id)
                    && a.center_id == center_id
                    && a.is_active()
                    && Some(a.id) != exclude
            })
            .collect()
    }

    /// Active appointments at one center this day.
    pub fn active_for_center(&self, center_id: Ulid) -> Vec<&Appointment> {
        self.appointments
            .values()
            .filter(|a| a.center_id == center_id && a.is_active())
            .collect()
    }

    pub fn slots_for_center(&self, center_id: Ulid) -> impl Iterator<Item = &TimeSlot> {
        self.slots.values().filter(move |s| s.center_id == center_id)
    }

    /// Existing slots of a center whose windows overlap `window`.
    pub fn center_slots_overlapping(
        &self,
        center_id: Ulid,
        window: &TimeWindow,
    ) -> Vec<&TimeSlot> {
        self.slots
            .values()
            .filter(|s| s.center_id == center_id && s.window.overlaps(window))
            .collect()
    }
}

/// Apply a committed event to a day (caller holds the write lock) and
/// keep the id→date indexes current. This is the only code path that
/// mutates a `DayState`.
///
/// `Rescheduled` may touch two days; each side applies the part that
/// belongs to it, so calling this once per affected day is correct
/// whether or not the dates differ.
pub(super) fn apply_event(
    day: &mut DayState,
    event: &Event,
    appt_index: &DashMap<Ulid, NaiveDate>,
    slot_index: &DashMap<Ulid, NaiveDate>,
) {
    match event {
        Event::SlotsGenerated {
            replaced, slots, ..
        } => {
            for id in replaced {
                day.slots.remove(id);
                slot_index.remove(id);
            }
            for slot in slots {
                slot_index.insert(slot.id, slot.date);
                day.slots.insert(slot.id, slot.clone());
            }
        }
        Event::SlotBlocked { id, .. } => {
            if let Some(slot) = day.slots.get_mut(id) {
                slot.blocked = true;
            }
        }
        Event::SlotUnblocked { id, .. } => {
            if let Some(slot) = day.slots.get_mut(id) {
                slot.blocked = false;
            }
        }
        Event::SlotsPurged { ids, .. } => {
            for id in ids {
                day.slots.remove(id);
                slot_index.remove(id);
            }
        }
        Event::AppointmentCreated { appointment } => {
            appt_index.insert(appointment.id, appointment.date);
            day.appointments.insert(appointment.id, appointment.clone());
        }
        Event::ServicesReplaced { id, services, .. } => {
            if let Some(appt) = day.appointments.get_mut(id) {
                appt.services = services.clone();
                appt.services_amended = true;
            }
        }
        Event::StatusChanged { id, to, .. } => {
            if let Some(appt) = day.appointments.get_mut(id) {
                appt.status = *to;
            }
        }
        Event::Rescheduled {
            old_id,
            replacement,
            ..
        } => {
            if let Some(old) = day.appointments.get_mut(old_id) {
                old.status = AppointmentStatus::Rescheduled;
                old.rescheduled_to = Some(replacement.id);
            }
            if replacement.date == day.date {
                appt_index.insert(replacement.id, replacement.date);
                day.appointments.insert(replacement.id, replacement.clone());
            }
        }
        Event::AppointmentDeleted { id, .. } => {
            day.appointments.remove(id);
            appt_index.remove(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2030, 6, 1).unwrap()
    }

    fn slot(center_id: Ulid, start: NaiveTime, end: NaiveTime) -> TimeSlot {
        TimeSlot {
            id: Ulid::new(),
            center_id,
            date: date(),
            window: TimeWindow::new(start, end),
            max_bookings: 2,
            blocked: false,
            kind: SlotKind::Standard,
        }
    }

    fn appt(slot: &TimeSlot, vehicle_id: Ulid, status: AppointmentStatus) -> Appointment {
        let id = Ulid::new();
        Appointment {
            id,
            code: booking_code(&id),
            customer_id: Ulid::new(),
            vehicle_id,
            technician_id: None,
            center_id: slot.center_id,
            slot_id: slot.id,
            date: slot.date,
            window: slot.window,
            status,
            services: vec![ServiceLine {
                service_id: Ulid::new(),
                label: None,
            }],
            rescheduled_from: None,
            rescheduled_to: None,
            services_amended: false,
        }
    }

    #[test]
    fn transition_table_legal_paths() {
        use AppointmentStatus::*;
        let legal = [
            (Pending, Confirmed),
            (Pending, Cancelled),
            (Pending, Rescheduled),
            (Confirmed, CheckedIn),
            (Confirmed, Cancelled),
            (Confirmed, NoShow),
            (Confirmed, Rescheduled),
            (CheckedIn, InProgress),
            (InProgress, Completed),
        ];
        for (from, to) in legal {
            assert!(transition_allowed(from, to), "{from} -> {to} should be legal");
        }
    }

    #[test]
    fn transition_table_rejects_everything_else() {
        use AppointmentStatus::*;
        let all = [
            Pending, Confirmed, CheckedIn, InProgress, Completed, Cancelled, Rescheduled, NoShow,
        ];
        let legal = [
            (Pending, Confirmed),
            (Pending, Cancelled),
            (Pending, Rescheduled),
            (Confirmed, CheckedIn),
            (Confirmed, Cancelled),
            (Confirmed, NoShow),
            (Confirmed, Rescheduled),
            (CheckedIn, InProgress),
            (InProgress, Completed),
        ];
        for from in all {
            for to in all {
                let expect = legal.contains(&(from, to));
                assert_eq!(
                    transition_allowed(from, to),
                    expect,
                    "{from} -> {to} legality mismatch"
                );
            }
        }
    }

    #[test]
    fn terminal_states_take_no_transitions() {
        use AppointmentStatus::*;
        let all = [
            Pending, Confirmed, CheckedIn, InProgress, Completed, Cancelled, Rescheduled, NoShow,
        ];
        for from in [Completed, Cancelled, Rescheduled, NoShow] {
            for to in all {
                assert!(!transition_allowed(from, to), "{from} -> {to} from terminal");
            }
        }
    }

    #[test]
    fn active_count_is_derived_from_status() {
        let center = Ulid::new();
        let s = slot(center, t(9, 0), t(10, 0));
        let mut day = DayState::new(date());
        day.slots.insert(s.id, s.clone());

        let a = appt(&s, Ulid::new(), AppointmentStatus::Pending);
        let b = appt(&s, Ulid::new(), AppointmentStatus::Cancelled);
        let c = appt(&s, Ulid::new(), AppointmentStatus::Completed);
        for x in [&a, &b, &c] {
            day.appointments.insert(x.id, x.clone());
        }

        // Cancelled does not count; Pending and Completed do.
        assert_eq!(day.active_count_for_slot(&s.id, None), 2);
        // Excluding one active booking drops the count.
        assert_eq!(day.active_count_for_slot(&s.id, Some(a.id)), 1);
    }

    #[test]
    fn vehicle_candidates_exclude_requested_id() {
        let center = Ulid::new();
        let vehicle = Ulid::new();
        let s = slot(center, t(9, 0), t(10, 0));
        let mut day = DayState::new(date());

        let a = appt(&s, vehicle, AppointmentStatus::Confirmed);
        let b = appt(&s, vehicle, AppointmentStatus::Confirmed);
        day.appointments.insert(a.id, a.clone());
        day.appointments.insert(b.id, b.clone());

        let all = day.active_for_vehicle(vehicle, None);
        assert_eq!(all.len(), 2);
        let without_a = day.active_for_vehicle(vehicle, Some(a.id));
        assert_eq!(without_a.len(), 1);
        assert_eq!(without_a[0].id, b.id);
    }

    #[test]
    fn technician_candidates_are_center_scoped() {
        let tech = Ulid::new();
        let center_a = Ulid::new();
        let center_b = Ulid::new();
        let s_a = slot(center_a, t(9, 0), t(10, 0));
        let s_b = slot(center_b, t(9, 0), t(10, 0));
        let mut day = DayState::new(date());

        let mut a = appt(&s_a, Ulid::new(), AppointmentStatus::Confirmed);
        a.technician_id = Some(tech);
        let mut b = appt(&s_b, Ulid::new(), AppointmentStatus::Confirmed);
        b.technician_id = Some(tech);
        day.appointments.insert(a.id, a.clone());
        day.appointments.insert(b.id, b.clone());

        let at_a = day.active_for_technician(tech, center_a, None);
        assert_eq!(at_a.len(), 1);
        assert_eq!(at_a[0].id, a.id);
    }

    #[test]
    fn apply_reschedule_same_day_links_both_sides() {
        let center = Ulid::new();
        let s1 = slot(center, t(9, 0), t(10, 0));
        let s2 = slot(center, t(14, 0), t(15, 0));
        let mut day = DayState::new(date());
        day.slots.insert(s1.id, s1.clone());
        day.slots.insert(s2.id, s2.clone());

        let old = appt(&s1, Ulid::new(), AppointmentStatus::Confirmed);
        day.appointments.insert(old.id, old.clone());

        let mut replacement = appt(&s2, old.vehicle_id, AppointmentStatus::Pending);
        replacement.rescheduled_from = Some(old.id);

        let appt_index = DashMap::new();
        let slot_index = DashMap::new();
        apply_event(
            &mut day,
            &Event::Rescheduled {
                old_id: old.id,
                old_date: date(),
                replacement: replacement.clone(),
            },
            &appt_index,
            &slot_index,
        );

        let stored_old = &day.appointments[&old.id];
        assert_eq!(stored_old.status, AppointmentStatus::Rescheduled);
        assert_eq!(stored_old.rescheduled_to, Some(replacement.id));
        assert!(day.appointments.contains_key(&replacement.id));
        // Old slot released, new slot acquired, in the same application.
        assert_eq!(day.active_count_for_slot(&s1.id, None), 0);
        assert_eq!(day.active_count_for_slot(&s2.id, None), 1);
    }

    #[test]
    fn apply_services_replacement_marks_amended() {
        let center = Ulid::new();
        let s = slot(center, t(9, 0), t(10, 0));
        let mut day = DayState::new(date());
        let a = appt(&s, Ulid::new(), AppointmentStatus::Pending);
        day.appointments.insert(a.id, a.clone());

        let new_lines = vec![
            ServiceLine {
                service_id: Ulid::new(),
                label: Some("brake inspection".into()),
            },
            ServiceLine {
                service_id: Ulid::new(),
                label: None,
            },
        ];
        apply_event(
            &mut day,
            &Event::ServicesReplaced {
                id: a.id,
                date: date(),
                services: new_lines.clone(),
            },
            &DashMap::new(),
            &DashMap::new(),
        );

        let stored = &day.appointments[&a.id];
        assert_eq!(stored.services, new_lines);
        assert!(stored.services_amended);
    }

    #[test]
    fn apply_overwrite_generation_swaps_slots() {
        let center = Ulid::new();
        let old_slot = slot(center, t(9, 0), t(10, 0));
        let new_slot = slot(center, t(9, 0), t(9, 45));
        let mut day = DayState::new(date());
        let slot_index = DashMap::new();
        day.slots.insert(old_slot.id, old_slot.clone());
        slot_index.insert(old_slot.id, date());

        apply_event(
            &mut day,
            &Event::SlotsGenerated {
                date: date(),
                replaced: vec![old_slot.id],
                slots: vec![new_slot.clone()],
            },
            &DashMap::new(),
            &slot_index,
        );

        assert!(!day.slots.contains_key(&old_slot.id));
        assert!(day.slots.contains_key(&new_slot.id));
        assert!(!slot_index.contains_key(&old_slot.id));
        assert_eq!(*slot_index.get(&new_slot.id).unwrap(), date());
    }
}
