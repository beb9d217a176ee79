use std::cmp::Reverse;
use std::collections::{BTreeMap, HashSet};

use ulid::Ulid;

use crate::model::*;

use super::mutations::find_conflict;
use super::{IntervalStore, StoreError};

impl IntervalStore {
    /// Whether any blocking booking on `resource_id` overlaps the closed `span`.
    /// Other resources are never consulted.
    pub async fn has_overlap(&self, resource_id: &str, span: Span) -> Result<bool, StoreError> {
        let Some(rs) = self.get_resource(resource_id) else {
            return Ok(false);
        };
        let guard = rs.read().await;
        Ok(find_conflict(&guard, &span, self.policy).is_some())
    }

    /// True iff no blocking booking's closed span contains `instant`.
    pub async fn is_available_at(&self, resource_id: &str, instant: Ms) -> Result<bool, StoreError> {
        self.has_overlap(resource_id, Span::new(instant, instant))
            .await
            .map(|overlap| !overlap)
    }

    pub async fn get_by_id(&self, id: Ulid) -> Result<Booking, StoreError> {
        let resource_id = self
            .booking_to_resource
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(StoreError::NotFound(id))?;
        let rs = self.get_resource(&resource_id).ok_or(StoreError::NotFound(id))?;
        let guard = rs.read().await;
        guard
            .bookings
            .iter()
            .find(|b| b.id == id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    /// Bookings made by `user_id`, most recent start first.
    pub async fn list_by_user(&self, user_id: &str) -> Result<Vec<Booking>, StoreError> {
        let ids = self
            .user_bookings
            .get(user_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();

        // One pass per resource rather than one lookup per booking.
        let mut by_resource: BTreeMap<String, HashSet<Ulid>> = BTreeMap::new();
        for id in ids {
            // Missing ids were removed after we copied the index.
            if let Some(resource_id) = self.booking_to_resource.get(&id).map(|e| e.value().clone()) {
                by_resource.entry(resource_id).or_default().insert(id);
            }
        }

        let mut out = Vec::new();
        for (resource_id, wanted) in by_resource {
            let Some(rs) = self.get_resource(&resource_id) else {
                continue;
            };
            let guard = rs.read().await;
            out.extend(guard.bookings.iter().filter(|b| wanted.contains(&b.id)).cloned());
        }
        out.sort_by_key(|b| Reverse((b.span.start, b.id)));
        Ok(out)
    }

    /// Every booking on a resource, ascending by start.
    pub async fn list_by_resource(&self, resource_id: &str) -> Result<Vec<Booking>, StoreError> {
        let Some(rs) = self.get_resource(resource_id) else {
            return Ok(vec![]);
        };
        let guard = rs.read().await;
        Ok(guard.bookings.clone())
    }

    /// Bookings intersecting `[day_start, day_start + 24h)`, ascending by start.
    pub async fn list_by_resource_and_day(
        &self,
        resource_id: &str,
        day_start: Ms,
    ) -> Result<Vec<Booking>, StoreError> {
        let Some(rs) = self.get_resource(resource_id) else {
            return Ok(vec![]);
        };
        let guard = rs.read().await;
        Ok(guard
            .within_window(day_start, day_start + DAY_MS)
            .cloned()
            .collect())
    }

    /// All bookings, newest creation first.
    pub async fn list_all(&self) -> Result<Vec<Booking>, StoreError> {
        let resources: Vec<_> = self.resources.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for rs in resources {
            let guard = rs.read().await;
            out.extend(guard.bookings.iter().cloned());
        }
        out.sort_by_key(|b| Reverse((b.created_at, b.id)));
        Ok(out)
    }

    pub fn booking_count(&self) -> usize {
        self.booking_to_resource.len()
    }
}
