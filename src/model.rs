use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Half-open time-of-day window `[start, end)`. Windows never cross
/// midnight; the calendar date lives on the slot or appointment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        debug_assert!(start < end, "window start must be before end");
        Self { start, end }
    }

    pub fn duration_minutes(&self) -> i64 {
        self.end.signed_duration_since(self.start).num_minutes()
    }

    pub fn overlaps(&self, other: &TimeWindow) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains(&self, t: NaiveTime) -> bool {
        self.start <= t && t < self.end
    }
}

/// What kind of work a slot is cut for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotKind {
    Standard,
    Express,
    Diagnostic,
}

/// A bookable window at a service center on one calendar day.
///
/// The active booking count is never stored here — it is always derived
/// from the appointments currently bound to the slot, at the point of
/// decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlot {
    pub id: Ulid,
    pub center_id: Ulid,
    pub date: NaiveDate,
    pub window: TimeWindow,
    /// Max concurrent active bookings.
    pub max_bookings: u32,
    /// Manual override: a blocked slot takes no new bookings.
    pub blocked: bool,
    pub kind: SlotKind,
}

impl TimeSlot {
    pub fn starts_at(&self) -> NaiveDateTime {
        self.date.and_time(self.window.start)
    }

    /// A slot is past once its start instant has been reached.
    pub fn is_past(&self, now: NaiveDateTime) -> bool {
        self.starts_at() <= now
    }

    pub fn remaining(&self, active: u32) -> u32 {
        self.max_bookings.saturating_sub(active)
    }

    pub fn is_available(&self, active: u32, now: NaiveDateTime) -> bool {
        !self.blocked && !self.is_past(now) && active < self.max_bookings
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Pending,
    Confirmed,
    CheckedIn,
    InProgress,
    Completed,
    Cancelled,
    Rescheduled,
    NoShow,
}

impl AppointmentStatus {
    /// Terminal states take no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Cancelled | Self::Rescheduled | Self::NoShow
        )
    }

    /// Active appointments count toward slot capacity and overlap checks.
    pub fn is_active(self) -> bool {
        !matches!(self, Self::Cancelled | Self::Rescheduled | Self::NoShow)
    }
}

impl std::fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::CheckedIn => "checked_in",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Rescheduled => "rescheduled",
            Self::NoShow => "no_show",
        };
        f.write_str(s)
    }
}

/// One requested maintenance service on an appointment. Pricing and
/// source tagging belong to the invoicing side, not this core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceLine {
    pub service_id: Ulid,
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    /// Human-readable booking code, derived from the id.
    pub code: String,
    pub customer_id: Ulid,
    pub vehicle_id: Ulid,
    pub technician_id: Option<Ulid>,
    pub center_id: Ulid,
    pub slot_id: Ulid,
    /// Copied from the slot at commit time so history stays readable
    /// after emptied slots are purged.
    pub date: NaiveDate,
    pub window: TimeWindow,
    pub status: AppointmentStatus,
    pub services: Vec<ServiceLine>,
    /// Predecessor in the reschedule chain (always terminal-Rescheduled).
    pub rescheduled_from: Option<Ulid>,
    /// Successor that replaced this appointment, once rescheduled away.
    pub rescheduled_to: Option<Ulid>,
    /// Set once the service lines were replaced after creation; gates
    /// hard deletion.
    pub services_amended: bool,
}

impl Appointment {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn starts_at(&self) -> NaiveDateTime {
        self.date.and_time(self.window.start)
    }
}

/// Booking codes are unique because the id is.
pub fn booking_code(id: &Ulid) -> String {
    format!("APT-{id}")
}

// ── Requests ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BookingRequest {
    pub customer_id: Ulid,
    pub vehicle_id: Ulid,
    pub technician_id: Option<Ulid>,
    pub center_id: Ulid,
    pub slot_id: Ulid,
    pub services: Vec<ServiceLine>,
}

#[derive(Debug, Clone)]
pub struct RescheduleRequest {
    pub slot_id: Ulid,
    pub technician_id: Option<Ulid>,
    pub services: Vec<ServiceLine>,
}

#[derive(Debug, Clone)]
pub struct SlotGenerationRequest {
    pub center_id: Ulid,
    /// Inclusive date range.
    pub from: NaiveDate,
    pub to: NaiveDate,
    /// Daily working window slots are cut from.
    pub day_open: NaiveTime,
    pub day_close: NaiveTime,
    pub slot_minutes: u32,
    pub max_bookings: u32,
    pub kind: SlotKind,
    /// Replace overlapping existing slots instead of rejecting.
    pub overwrite: bool,
}

// ── WAL record format ────────────────────────────────────────────

/// The event types. One event per committed mutation; everything an event
/// carries is applied together or not at all, which is what makes
/// create-with-services and reschedule atomic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SlotsGenerated {
        date: NaiveDate,
        /// Existing slots removed by an overwrite generation, in the
        /// same atomic record as their replacements.
        replaced: Vec<Ulid>,
        slots: Vec<TimeSlot>,
    },
    SlotBlocked {
        id: Ulid,
        date: NaiveDate,
    },
    SlotUnblocked {
        id: Ulid,
        date: NaiveDate,
    },
    SlotsPurged {
        date: NaiveDate,
        ids: Vec<Ulid>,
    },
    AppointmentCreated {
        appointment: Appointment,
    },
    ServicesReplaced {
        id: Ulid,
        date: NaiveDate,
        services: Vec<ServiceLine>,
    },
    StatusChanged {
        id: Ulid,
        date: NaiveDate,
        from: AppointmentStatus,
        to: AppointmentStatus,
    },
    /// Marks `old_id` Rescheduled and inserts the replacement in one
    /// record, releasing the old slot binding and acquiring the new one
    /// in the same atomic step.
    Rescheduled {
        old_id: Ulid,
        old_date: NaiveDate,
        replacement: Appointment,
    },
    AppointmentDeleted {
        id: Ulid,
        date: NaiveDate,
    },
}

impl Event {
    /// The day this event routes to on replay. `Rescheduled` also touches
    /// its replacement's date; replay handles that case explicitly.
    pub(crate) fn date(&self) -> NaiveDate {
        match self {
            Event::SlotsGenerated { date, .. }
            | Event::SlotBlocked { date, .. }
            | Event::SlotUnblocked { date, .. }
            | Event::SlotsPurged { date, .. }
            | Event::ServicesReplaced { date, .. }
            | Event::StatusChanged { date, .. }
            | Event::AppointmentDeleted { date, .. } => *date,
            Event::AppointmentCreated { appointment } => appointment.date,
            Event::Rescheduled { old_date, .. } => *old_date,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

/// A slot plus its occupancy, derived at query time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotView {
    pub slot: TimeSlot,
    pub active: u32,
    pub remaining: u32,
    pub available: bool,
}

/// The same-day candidate sets the conflict checker evaluates.
#[derive(Debug, Clone, Default)]
pub struct CollisionSets {
    /// Active appointments for the vehicle on the date, any center.
    pub vehicle: Vec<Appointment>,
    /// Active appointments for the technician at the center on the date.
    pub technician: Vec<Appointment>,
    /// Active appointments at the center on the date.
    pub center: Vec<Appointment>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn window_basics() {
        let w = TimeWindow::new(t(9, 0), t(10, 30));
        assert_eq!(w.duration_minutes(), 90);
        assert!(w.contains(t(9, 0)));
        assert!(w.contains(t(10, 29)));
        assert!(!w.contains(t(10, 30))); // half-open
    }

    #[test]
    fn window_overlap() {
        let a = TimeWindow::new(t(9, 0), t(10, 0));
        let b = TimeWindow::new(t(9, 30), t(10, 30));
        let c = TimeWindow::new(t(10, 0), t(11, 0));
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
    }

    #[test]
    fn status_classification() {
        use AppointmentStatus::*;
        for s in [Completed, Cancelled, Rescheduled, NoShow] {
            assert!(s.is_terminal(), "{s} should be terminal");
        }
        for s in [Pending, Confirmed, CheckedIn, InProgress] {
            assert!(!s.is_terminal(), "{s} should not be terminal");
        }
        // Completed stays active: it still counts against its slot.
        for s in [Pending, Confirmed, CheckedIn, InProgress, Completed] {
            assert!(s.is_active(), "{s} should be active");
        }
        for s in [Cancelled, Rescheduled, NoShow] {
            assert!(!s.is_active(), "{s} should not be active");
        }
    }

    fn slot(date: NaiveDate, max: u32, blocked: bool) -> TimeSlot {
        TimeSlot {
            id: Ulid::new(),
            center_id: Ulid::new(),
            date,
            window: TimeWindow::new(t(9, 0), t(10, 0)),
            max_bookings: max,
            blocked,
            kind: SlotKind::Standard,
        }
    }

    #[test]
    fn slot_availability() {
        let date = d(2030, 6, 1);
        let now = d(2030, 5, 1).and_time(t(12, 0));
        let s = slot(date, 2, false);
        assert!(s.is_available(0, now));
        assert!(s.is_available(1, now));
        assert!(!s.is_available(2, now)); // full
        assert_eq!(s.remaining(1), 1);
        assert_eq!(s.remaining(5), 0); // saturating
    }

    #[test]
    fn blocked_slot_unavailable() {
        let date = d(2030, 6, 1);
        let now = d(2030, 5, 1).and_time(t(12, 0));
        let s = slot(date, 2, true);
        assert!(!s.is_available(0, now));
    }

    #[test]
    fn past_slot_unavailable() {
        let date = d(2030, 6, 1);
        let s = slot(date, 2, false);
        // Exactly at start: already past.
        assert!(!s.is_available(0, date.and_time(t(9, 0))));
        assert!(s.is_available(0, date.and_time(t(8, 59))));
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::AppointmentCreated {
            appointment: Appointment {
                id: Ulid::new(),
                code: "APT-TEST".into(),
                customer_id: Ulid::new(),
                vehicle_id: Ulid::new(),
                technician_id: None,
                center_id: Ulid::new(),
                slot_id: Ulid::new(),
                date: d(2030, 6, 1),
                window: TimeWindow::new(t(9, 0), t(10, 0)),
                status: AppointmentStatus::Pending,
                services: vec![ServiceLine {
                    service_id: Ulid::new(),
                    label: Some("battery check".into()),
                }],
                rescheduled_from: None,
                rescheduled_to: None,
                services_amended: false,
            },
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
