use chrono::{DateTime, NaiveDate, NaiveTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, UTC — the only time type stored.
pub type Ms = i64;

pub const HOUR_MS: Ms = 3_600_000;
pub const DAY_MS: Ms = 24 * HOUR_MS;

/// Closed interval `[start, end]`. Touching endpoints overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start <= end, "Span start must not be after end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t <= self.end
    }

    /// Intersection test against the half-open window `[from, to)`, used for
    /// calendar-day lookups: `start < to AND end > from`.
    pub fn intersects_window(&self, from: Ms, to: Ms) -> bool {
        self.start < to && self.end > from
    }
}

/// Lifecycle status. Only `Pending` is ever assigned by creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingStatus {
    Pending,
    Active,
    Cancelled,
}

impl BookingStatus {
    /// Pending and active bookings hold the resource.
    pub fn is_blocking(&self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Active)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "PENDING",
            BookingStatus::Active => "ACTIVE",
            BookingStatus::Cancelled => "CANCELLED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Unpaid,
    Paid,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Unpaid => "UNPAID",
            PaymentStatus::Paid => "PAID",
        }
    }
}

/// Which bookings count when testing a resource for overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverlapPolicy {
    /// Every pending or active booking blocks.
    #[default]
    Blocking,
    /// A pending or active booking blocks only once it is paid.
    PaidOnly,
}

impl OverlapPolicy {
    pub fn blocks(&self, booking: &Booking) -> bool {
        if !booking.status.is_blocking() {
            return false;
        }
        match self {
            OverlapPolicy::Blocking => true,
            OverlapPolicy::PaidOnly => booking.payment_status == PaymentStatus::Paid,
        }
    }
}

impl std::str::FromStr for OverlapPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "blocking" => Ok(OverlapPolicy::Blocking),
            "paid_only" | "paid-only" => Ok(OverlapPolicy::PaidOnly),
            other => Err(format!("unknown overlap policy: {other}")),
        }
    }
}

/// A persisted reservation of one resource by one requester.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub resource_id: String,
    pub user_id: String,
    pub owner_id: String,
    pub span: Span,
    pub status: BookingStatus,
    pub payment_status: PaymentStatus,
    pub created_at: Ms,
    pub updated_at: Ms,
}

/// Everything a caller supplies; id and timestamps are assigned on insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBooking {
    pub resource_id: String,
    pub user_id: String,
    pub owner_id: String,
    pub span: Span,
    pub status: BookingStatus,
    pub payment_status: PaymentStatus,
}

impl NewBooking {
    pub fn pending(resource_id: String, user_id: String, owner_id: String, span: Span) -> Self {
        Self {
            resource_id,
            user_id,
            owner_id,
            span,
            status: BookingStatus::Pending,
            payment_status: PaymentStatus::Unpaid,
        }
    }

    pub fn into_booking(self, id: Ulid, now: Ms) -> Booking {
        Booking {
            id,
            resource_id: self.resource_id,
            user_id: self.user_id,
            owner_id: self.owner_id,
            span: self.span,
            status: self.status,
            payment_status: self.payment_status,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: String,
    /// All bookings on this resource, sorted by `span.start`.
    pub bookings: Vec<Booking>,
}

impl ResourceState {
    pub fn new(id: String) -> Self {
        Self {
            id,
            bookings: Vec::new(),
        }
    }

    /// Insert booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.span.start <= booking.span.start);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    /// Bookings whose closed span overlaps the closed query span.
    /// Binary search skips everything starting after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.span.start <= query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end >= query.start)
    }

    /// Bookings intersecting the half-open window `[from, to)`.
    pub fn within_window(&self, from: Ms, to: Ms) -> impl Iterator<Item = &Booking> {
        let right_bound = self.bookings.partition_point(|b| b.span.start < to);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > from)
    }
}

/// WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BookingCreated { booking: Booking },
    BookingRemoved { id: Ulid, resource_id: String },
}

// ── Time conversions ─────────────────────────────────────────────

pub fn now_ms() -> Ms {
    Utc::now().timestamp_millis()
}

/// Parse an RFC3339 instant into UTC milliseconds. A timestamp without a
/// seconds field (`2025-02-22T10:00Z`) is accepted as well.
pub fn parse_instant(s: &str) -> Result<Ms, String> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc).timestamp_millis());
    }
    let normalized = match s.strip_suffix('Z').or_else(|| s.strip_suffix('z')) {
        Some(rest) => format!("{rest}+00:00"),
        None => s.to_string(),
    };
    DateTime::parse_from_str(&normalized, "%Y-%m-%dT%H:%M%:z")
        .map(|dt| dt.with_timezone(&Utc).timestamp_millis())
        .map_err(|_| format!("invalid timestamp (RFC3339 expected): {s}"))
}

/// Parse a `YYYY-MM-DD` calendar date.
pub fn parse_date(s: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|_| format!("invalid date (YYYY-MM-DD expected): {s}"))
}

/// UTC midnight at the start of `date`.
pub fn day_start_ms(date: NaiveDate) -> Ms {
    date.and_time(NaiveTime::MIN).and_utc().timestamp_millis()
}

pub fn format_instant(ms: Ms) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::AutoSi, true))
        .unwrap_or_else(|| ms.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn booking(start: Ms, end: Ms) -> Booking {
        NewBooking::pending("R1".into(), "u1".into(), "o1".into(), Span::new(start, end))
            .into_booking(Ulid::new(), 0)
    }

    #[test]
    fn span_closed_containment() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(200)); // closed at end
        assert!(!s.contains_instant(201));
    }

    #[test]
    fn span_touching_endpoints_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(200, 300);
        let c = Span::new(201, 300);
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn window_intersection_is_half_open() {
        let day = (1000, 2000);
        assert!(!Span::new(500, 1000).intersects_window(day.0, day.1));
        assert!(Span::new(500, 1001).intersects_window(day.0, day.1));
        assert!(!Span::new(2000, 2500).intersects_window(day.0, day.1));
        assert!(Span::new(1999, 2500).intersects_window(day.0, day.1));
    }

    #[test]
    fn bookings_kept_sorted_by_start() {
        let mut rs = ResourceState::new("R1".into());
        rs.insert_booking(booking(300, 400));
        rs.insert_booking(booking(100, 200));
        rs.insert_booking(booking(200, 300));
        let starts: Vec<Ms> = rs.bookings.iter().map(|b| b.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn overlapping_includes_touching() {
        let mut rs = ResourceState::new("R1".into());
        rs.insert_booking(booking(100, 200));
        rs.insert_booking(booking(450, 600));
        rs.insert_booking(booking(1000, 1100));

        let hits: Vec<_> = rs.overlapping(&Span::new(200, 450)).collect();
        assert_eq!(hits.len(), 2);

        let hits: Vec<_> = rs.overlapping(&Span::new(601, 999)).collect();
        assert!(hits.is_empty());
    }

    #[test]
    fn overlapping_large_booking_spanning_query() {
        let mut rs = ResourceState::new("R1".into());
        rs.insert_booking(booking(0, 10_000));
        let hits: Vec<_> = rs.overlapping(&Span::new(500, 600)).collect();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn within_window_excludes_boundary_touch() {
        let mut rs = ResourceState::new("R1".into());
        rs.insert_booking(booking(0, 1000));
        rs.insert_booking(booking(1500, 1600));
        rs.insert_booking(booking(2000, 3000));
        let hits: Vec<_> = rs.within_window(1000, 2000).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(1500, 1600));
    }

    #[test]
    fn remove_missing_booking_is_none() {
        let mut rs = ResourceState::new("R1".into());
        rs.insert_booking(booking(100, 200));
        assert!(rs.remove_booking(Ulid::new()).is_none());
        assert_eq!(rs.bookings.len(), 1);
    }

    #[test]
    fn overlap_policy_respects_status_and_payment() {
        let mut b = booking(0, 100);
        assert!(OverlapPolicy::Blocking.blocks(&b));
        assert!(!OverlapPolicy::PaidOnly.blocks(&b));

        b.payment_status = PaymentStatus::Paid;
        assert!(OverlapPolicy::PaidOnly.blocks(&b));

        b.status = BookingStatus::Cancelled;
        assert!(!OverlapPolicy::Blocking.blocks(&b));
        assert!(!OverlapPolicy::PaidOnly.blocks(&b));
    }

    #[test]
    fn overlap_policy_from_str() {
        assert_eq!("blocking".parse::<OverlapPolicy>(), Ok(OverlapPolicy::Blocking));
        assert_eq!("PAID_ONLY".parse::<OverlapPolicy>(), Ok(OverlapPolicy::PaidOnly));
        assert!("sometimes".parse::<OverlapPolicy>().is_err());
    }

    #[test]
    fn parse_instant_variants() {
        let full = parse_instant("2025-02-22T10:00:00Z").unwrap();
        let short = parse_instant("2025-02-22T10:00Z").unwrap();
        let offset = parse_instant("2025-02-22T13:00:00+03:00").unwrap();
        assert_eq!(full, short);
        assert_eq!(full, offset);
        assert_eq!(full, 1_740_218_400_000);
        assert!(parse_instant("22/02/2025").is_err());
    }

    #[test]
    fn parse_date_and_day_start() {
        let date = parse_date("2025-02-22").unwrap();
        assert_eq!(day_start_ms(date), parse_instant("2025-02-22T00:00:00Z").unwrap());
        assert!(parse_date("2025-2-31").is_err());
    }

    #[test]
    fn format_instant_is_utc_rfc3339() {
        let ms = parse_instant("2025-02-22T13:00:00+03:00").unwrap();
        assert_eq!(format_instant(ms), "2025-02-22T10:00:00Z");
    }

    #[test]
    fn status_serializes_screaming() {
        let json = serde_json::to_string(&BookingStatus::Pending).unwrap();
        assert_eq!(json, "\"PENDING\"");
        assert_eq!(BookingStatus::Cancelled.as_str(), "CANCELLED");
        assert!(!BookingStatus::Cancelled.is_blocking());
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::BookingCreated { booking: booking(1000, 2000) };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
