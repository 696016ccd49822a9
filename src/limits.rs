use crate::model::Ms;

/// Earliest accepted instant: 2000-01-01T00:00:00Z.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// Latest accepted instant: 2100-01-01T00:00:00Z.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// A single appointment may not run longer than a day.
pub const MAX_SPAN_DURATION_MS: Ms = 24 * 3_600_000;

/// Rejection texts for the two limits above. Both are operational limits, not
/// claims that the input is chronologically wrong.
pub const OUTSIDE_WINDOW: &str =
    "outside the supported window 2000-01-01T00:00:00Z..2100-01-01T00:00:00Z (deployment limit)";
pub const SPAN_TOO_LONG: &str = "appointment exceeds the 24h maximum length (deployment limit)";

pub const MAX_NAME_LEN: usize = 200;
pub const MAX_NOTE_LEN: usize = 2_000;

pub const DEFAULT_LIST_LIMIT: usize = 50;
pub const MAX_LIST_LIMIT: usize = 200;

pub const MAX_LOAN_QTY: u32 = 100_000;
pub const MAX_TOTAL_QTY: u32 = 1_000_000;
