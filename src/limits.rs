use crate::model::Ms;

/// Longest accepted resource, user or owner identifier.
pub const MAX_ID_LEN: usize = 128;

/// Longest accepted bearer credential, including the scheme.
pub const MAX_AUTH_TOKEN_LEN: usize = 8192;

/// 1970-01-01T00:00:00Z.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;

/// 9999-12-31T23:59:59.999Z.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;

/// A single booking may not span more than a year.
pub const MAX_SPAN_DURATION_MS: Ms = 366 * 24 * 3_600_000;

pub const MAX_BOOKINGS_PER_RESOURCE: usize = 100_000;
