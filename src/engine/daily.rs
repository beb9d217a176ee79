use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::Serialize;

use crate::model::{Booking, DAY_MS, HOUR_MS, Ms};

/// First bookable hour of the day (UTC).
pub const OPEN_HOUR: Ms = 9;
/// Last bookable hour of the day (UTC), inclusive.
pub const CLOSE_HOUR: Ms = 21;

/// Hour-slot occupancy for one UTC calendar day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailyAvailability {
    pub date: NaiveDate,
    /// `"09:00"` through `"21:00"`; `true` means free.
    pub hours: BTreeMap<String, bool>,
}

pub fn slot_label(hour: Ms) -> String {
    format!("{hour:02}:00")
}

/// Mark the operating-hour slots occupied by `bookings` on the day starting
/// at `day_start`.
///
/// A booking occupies slot `h` when `start_hour <= h < end_hour`, where both
/// hours are the wall-clock hour of the endpoint. A booking that began on an
/// earlier day counts from hour 0; one that ends on a later day runs to 24.
/// Bookings ending exactly on the hour leave that hour free.
pub fn hour_slots<'a>(
    day_start: Ms,
    bookings: impl IntoIterator<Item = &'a Booking>,
) -> BTreeMap<String, bool> {
    let mut hours: BTreeMap<String, bool> =
        (OPEN_HOUR..=CLOSE_HOUR).map(|h| (slot_label(h), true)).collect();
    let day_end = day_start + DAY_MS;

    for b in bookings {
        if !b.span.intersects_window(day_start, day_end) {
            continue;
        }
        let start_hour = if b.span.start < day_start {
            0
        } else {
            (b.span.start - day_start) / HOUR_MS
        };
        let end_hour = if b.span.end >= day_end {
            24
        } else {
            (b.span.end - day_start) / HOUR_MS
        };
        for h in start_hour.max(OPEN_HOUR)..end_hour.min(CLOSE_HOUR + 1) {
            if let Some(free) = hours.get_mut(&slot_label(h)) {
                *free = false;
            }
        }
    }
    hours
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NewBooking, Span};
    use ulid::Ulid;

    const H: Ms = HOUR_MS;
    const M: Ms = 60_000;
    const DAY: Ms = 20_000 * DAY_MS;

    fn booking(start: Ms, end: Ms) -> Booking {
        NewBooking::pending("R1".into(), "u1".into(), "o1".into(), Span::new(start, end))
            .into_booking(Ulid::new(), 0)
    }

    fn occupied(hours: &BTreeMap<String, bool>) -> Vec<&str> {
        hours
            .iter()
            .filter(|(_, free)| !**free)
            .map(|(k, _)| k.as_str())
            .collect()
    }

    #[test]
    fn empty_day_is_all_free() {
        let hours = hour_slots(DAY, []);
        assert_eq!(hours.len(), 13);
        assert!(hours.values().all(|free| *free));
        assert_eq!(hours.keys().next().map(String::as_str), Some("09:00"));
        assert_eq!(hours.keys().last().map(String::as_str), Some("21:00"));
    }

    #[test]
    fn half_hour_start_occupies_its_hour() {
        let b = booking(DAY + 10 * H + 30 * M, DAY + 12 * H);
        let hours = hour_slots(DAY, [&b]);
        assert_eq!(occupied(&hours), vec!["10:00", "11:00"]);
        assert!(hours["12:00"]);
    }

    #[test]
    fn end_hour_is_taken_literally() {
        // Ends 12:30: the 12:00 slot stays free.
        let b = booking(DAY + 10 * H, DAY + 12 * H + 30 * M);
        assert_eq!(occupied(&hour_slots(DAY, [&b])), vec!["10:00", "11:00"]);
    }

    #[test]
    fn hours_outside_window_are_absent() {
        let b = booking(DAY + 2 * H, DAY + 23 * H);
        let hours = hour_slots(DAY, [&b]);
        assert!(!hours.contains_key("08:00"));
        assert!(!hours.contains_key("22:00"));
        assert_eq!(occupied(&hours).len(), 13);
    }

    #[test]
    fn booking_from_previous_day_counts_from_midnight() {
        let b = booking(DAY - 3 * H, DAY + 10 * H);
        assert_eq!(occupied(&hour_slots(DAY, [&b])), vec!["09:00"]);
    }

    #[test]
    fn booking_into_next_day_runs_to_close() {
        let b = booking(DAY + 20 * H, DAY + DAY_MS + 5 * H);
        assert_eq!(occupied(&hour_slots(DAY, [&b])), vec!["20:00", "21:00"]);
    }

    #[test]
    fn bookings_on_other_days_are_ignored() {
        let before = booking(DAY - 5 * H, DAY);
        let after = booking(DAY + DAY_MS, DAY + DAY_MS + 5 * H);
        let hours = hour_slots(DAY, [&before, &after]);
        assert!(hours.values().all(|free| *free));
    }
}
