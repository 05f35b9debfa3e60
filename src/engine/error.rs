use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::AppointmentStatus;

/// Everything a booking operation can be rejected with. All variants are
/// recoverable by the caller; `TransientStore` is the only one worth
/// retrying as-is.
#[derive(Debug)]
pub enum BookingError {
    Validation(&'static str),
    NotFound(Ulid),
    /// The vehicle already has an overlapping active appointment that day.
    VehicleConflict { vehicle_id: Ulid, other: Ulid },
    /// The technician already has an overlapping active appointment at
    /// that center that day.
    TechnicianConflict { technician_id: Ulid, other: Ulid },
    /// The slot's active bookings already reach its maximum.
    CapacityExceeded { slot_id: Ulid, max_bookings: u32 },
    /// Blocked, already started, or not the requested center's slot.
    SlotUnavailable { slot_id: Ulid, reason: &'static str },
    /// Slot generation would collide with an existing slot.
    SlotOverlap {
        center_id: Ulid,
        date: NaiveDate,
        existing: Ulid,
    },
    InvalidTransition {
        id: Ulid,
        from: AppointmentStatus,
        to: AppointmentStatus,
    },
    ChainDepthExceeded { id: Ulid, depth: u32 },
    LimitExceeded(&'static str),
    /// Storage failure during commit; the caller may retry with backoff.
    TransientStore(String),
}

impl BookingError {
    /// Stable machine-readable code, independent of the display text.
    pub fn code(&self) -> &'static str {
        match self {
            BookingError::Validation(_) => "validation",
            BookingError::NotFound(_) => "not_found",
            BookingError::VehicleConflict { .. } => "conflict_vehicle",
            BookingError::TechnicianConflict { .. } => "conflict_technician",
            BookingError::CapacityExceeded { .. } => "capacity_exceeded",
            BookingError::SlotUnavailable { .. } => "slot_unavailable",
            BookingError::SlotOverlap { .. } => "slot_overlap",
            BookingError::InvalidTransition { .. } => "invalid_transition",
            BookingError::ChainDepthExceeded { .. } => "chain_depth_exceeded",
            BookingError::LimitExceeded(_) => "limit_exceeded",
            BookingError::TransientStore(_) => "transient_store",
        }
    }
}

impl std::fmt::Display for BookingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BookingError::Validation(msg) => write!(f, "invalid request: {msg}"),
            BookingError::NotFound(id) => write!(f, "not found: {id}"),
            BookingError::VehicleConflict { vehicle_id, other } => write!(
                f,
                "vehicle {vehicle_id} already has an overlapping appointment: {other}"
            ),
            BookingError::TechnicianConflict {
                technician_id,
                other,
            } => write!(
                f,
                "technician {technician_id} already has an overlapping appointment: {other}"
            ),
            BookingError::CapacityExceeded {
                slot_id,
                max_bookings,
            } => write!(f, "slot {slot_id} is full: all {max_bookings} places taken"),
            BookingError::SlotUnavailable { slot_id, reason } => {
                write!(f, "slot {slot_id} not available: {reason}")
            }
            BookingError::SlotOverlap {
                center_id,
                date,
                existing,
            } => write!(
                f,
                "generation overlaps existing slot {existing} at center {center_id} on {date}"
            ),
            BookingError::InvalidTransition { id, from, to } => {
                write!(f, "invalid transition for {id}: {from} -> {to}")
            }
            BookingError::ChainDepthExceeded { id, depth } => {
                write!(f, "appointment {id} already rescheduled {depth} times")
            }
            BookingError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            BookingError::TransientStore(e) => write!(f, "storage error: {e}"),
        }
    }
}

impl std::error::Error for BookingError {}
