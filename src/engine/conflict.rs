use std::collections::HashSet;

use chrono::NaiveDateTime;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::BookingError;

pub(crate) fn now() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}

/// Validate and normalize requested service lines: non-empty, bounded,
/// deduplicated by service id (first occurrence wins — a replacement
/// never appends duplicates).
pub(crate) fn normalize_services(
    lines: Vec<ServiceLine>,
) -> Result<Vec<ServiceLine>, BookingError> {
    if lines.is_empty() {
        return Err(BookingError::Validation("at least one service is required"));
    }
    if lines.len() > MAX_SERVICES_PER_APPOINTMENT {
        return Err(BookingError::LimitExceeded("too many service lines"));
    }
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(lines.len());
    for line in lines {
        if let Some(ref label) = line.label
            && label.len() > MAX_SERVICE_LABEL_LEN
        {
            return Err(BookingError::LimitExceeded("service label too long"));
        }
        if seen.insert(line.service_id) {
            out.push(line);
        }
    }
    Ok(out)
}

/// Availability gate for a slot: wrong center, manually blocked, or
/// already started. Capacity is the conflict checker's third predicate,
/// not this gate's concern.
pub(crate) fn check_slot_open(
    slot: &TimeSlot,
    center_id: Ulid,
    now: NaiveDateTime,
) -> Result<(), BookingError> {
    if slot.center_id != center_id {
        return Err(BookingError::SlotUnavailable {
            slot_id: slot.id,
            reason: "slot belongs to a different center",
        });
    }
    if slot.blocked {
        return Err(BookingError::SlotUnavailable {
            slot_id: slot.id,
            reason: "slot is blocked",
        });
    }
    if slot.is_past(now) {
        return Err(BookingError::SlotUnavailable {
            slot_id: slot.id,
            reason: "slot has already started",
        });
    }
    Ok(())
}

/// The three independent booking predicates, evaluated fail-fast in a
/// fixed order over the provided same-day candidate sets:
///
/// 1. vehicle overlap (any center),
/// 2. technician overlap (same center),
/// 3. slot capacity.
///
/// The first violation is returned with the offending record; the checks
/// are never coalesced into a bare boolean. Pure over its inputs, so the
/// orchestrator runs it twice per create — optimistic pre-check under the
/// read lock, final check inside the committing write lock.
pub(crate) fn check_no_conflict(
    vehicle_id: Ulid,
    technician_id: Option<Ulid>,
    window: &TimeWindow,
    slot: &TimeSlot,
    vehicle_candidates: &[&Appointment],
    technician_candidates: &[&Appointment],
    slot_active: u32,
) -> Result<(), BookingError> {
    for other in vehicle_candidates {
        if other.window.overlaps(window) {
            return Err(BookingError::VehicleConflict {
                vehicle_id,
                other: other.id,
            });
        }
    }
    if let Some(technician_id) = technician_id {
        for other in technician_candidates {
            if other.window.overlaps(window) {
                return Err(BookingError::TechnicianConflict {
                    technician_id,
                    other: other.id,
                });
            }
        }
    }
    if slot_active >= slot.max_bookings {
        return Err(BookingError::CapacityExceeded {
            slot_id: slot.id,
            max_bookings: slot.max_bookings,
        });
    }
    Ok(())
}
