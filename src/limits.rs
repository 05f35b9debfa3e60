//! Hard bounds guarding against runaway requests. Exceeding any of these
//! yields `BookingError::LimitExceeded`.

/// Longest date range a single slot-generation request may cover.
pub const MAX_GENERATION_DAYS: i64 = 92;

/// Most slots one generation request may create across its whole range.
pub const MAX_SLOTS_PER_GENERATION: usize = 2_000;

/// Slot duration bounds, in minutes.
pub const MIN_SLOT_MINUTES: u32 = 5;
pub const MAX_SLOT_MINUTES: u32 = 8 * 60;

/// Most service line items a single appointment may carry.
pub const MAX_SERVICES_PER_APPOINTMENT: usize = 25;

/// Longest service line label.
pub const MAX_SERVICE_LABEL_LEN: usize = 120;

/// Paged listing bounds.
pub const MAX_PAGE_SIZE: usize = 200;
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Widest date range a slot range query may cover.
pub const MAX_QUERY_WINDOW_DAYS: i64 = 120;

/// Upper bound on reschedule-chain traversal; a chain longer than this is
/// corrupt, since the configured reschedule depth is far smaller.
pub const MAX_CHAIN_WALK: usize = 64;
