use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::store::DayState;
use super::BookingError;

// ── Slot generation planning ─────────────────────────────────────

fn minute_of_day(t: NaiveTime) -> u32 {
    t.num_seconds_from_midnight() / 60
}

fn time_at_minute(m: u32) -> NaiveTime {
    NaiveTime::from_num_seconds_from_midnight_opt(m * 60, 0)
        .expect("minute computed within the day")
}

/// The windows one generated day gets: step `slot_minutes` from
/// `day_open` for as long as a whole window still fits before
/// `day_close`. A trailing remainder shorter than one slot is dropped.
pub fn day_windows(day_open: NaiveTime, day_close: NaiveTime, slot_minutes: u32) -> Vec<TimeWindow> {
    let close = minute_of_day(day_close);
    let mut windows = Vec::new();
    let mut start = minute_of_day(day_open);
    while start + slot_minutes <= close {
        let end = start + slot_minutes;
        windows.push(TimeWindow::new(time_at_minute(start), time_at_minute(end)));
        start = end;
    }
    windows
}

/// The dates a generation request covers, bounds-checked.
pub fn generation_dates(from: NaiveDate, to: NaiveDate) -> Result<Vec<NaiveDate>, BookingError> {
    if from > to {
        return Err(BookingError::Validation("date range is inverted"));
    }
    if to.signed_duration_since(from).num_days() + 1 > MAX_GENERATION_DAYS {
        return Err(BookingError::LimitExceeded("generation date range too long"));
    }
    let mut dates = Vec::new();
    let mut d = from;
    while d <= to {
        dates.push(d);
        d = d.succ_opt().ok_or(BookingError::Validation("date out of range"))?;
    }
    Ok(dates)
}

/// Validate a generation request and lay out its per-day windows. Pure;
/// the orchestrator still checks the plan against existing slots under
/// the day locks.
pub fn plan_generation(
    req: &SlotGenerationRequest,
) -> Result<Vec<(NaiveDate, Vec<TimeWindow>)>, BookingError> {
    if req.slot_minutes < MIN_SLOT_MINUTES || req.slot_minutes > MAX_SLOT_MINUTES {
        return Err(BookingError::Validation("slot duration out of range"));
    }
    if req.max_bookings == 0 {
        return Err(BookingError::Validation("max bookings must be positive"));
    }
    if req.day_open >= req.day_close {
        return Err(BookingError::Validation("working window is inverted"));
    }

    let dates = generation_dates(req.from, req.to)?;
    let windows = day_windows(req.day_open, req.day_close, req.slot_minutes);
    if windows.is_empty() {
        return Err(BookingError::Validation("no slot fits the working window"));
    }
    if dates.len() * windows.len() > MAX_SLOTS_PER_GENERATION {
        return Err(BookingError::LimitExceeded("generation would create too many slots"));
    }

    Ok(dates.into_iter().map(|d| (d, windows.clone())).collect())
}

// ── Derived slot views ───────────────────────────────────────────

/// Assemble the occupancy view for one slot, counts derived live.
pub fn slot_view(slot: &TimeSlot, day: &DayState, now: NaiveDateTime) -> SlotView {
    let active = day.active_count_for_slot(&slot.id, None);
    SlotView {
        slot: slot.clone(),
        active,
        remaining: slot.remaining(active),
        available: slot.is_available(active, now),
    }
}

/// Slot ids of a center on a day with zero active bookings — the only
/// slots purge may touch. Slots still carrying active bookings are
/// skipped, never an error.
pub fn purgeable_slots(day: &DayState, center_id: Ulid) -> Vec<Ulid> {
    day.slots_for_center(center_id)
        .filter(|s| day.active_count_for_slot(&s.id, None) == 0)
        .map(|s| s.id)
        .collect()
}
