use tokio::sync::oneshot;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{IntervalStore, StoreError, WalCommand};

/// First booking on `rs` that blocks `span` under `policy`, if any.
pub(crate) fn find_conflict(rs: &ResourceState, span: &Span, policy: OverlapPolicy) -> Option<Ulid> {
    rs.overlapping(span)
        .find(|b| policy.blocks(b))
        .map(|b| b.id)
}

impl IntervalStore {
    /// Insert a booking unless a blocking booking on the same resource overlaps it.
    ///
    /// The overlap test and the WAL append run under the resource's write lock,
    /// so two racing inserts for overlapping spans cannot both commit.
    /// Assigns the id and both timestamps.
    pub async fn insert(&self, new: NewBooking) -> Result<Booking, StoreError> {
        let rs = self.resource_entry(&new.resource_id);
        let mut guard = rs.write().await;
        if guard.bookings.len() >= MAX_BOOKINGS_PER_RESOURCE {
            return Err(StoreError::LimitExceeded("too many bookings on resource"));
        }

        if new.status.is_blocking()
            && let Some(existing) = find_conflict(&guard, &new.span, self.policy)
        {
            return Err(StoreError::Conflict(existing));
        }

        let booking = new.into_booking(Ulid::new(), now_ms());
        let event = Event::BookingCreated {
            booking: booking.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(booking)
    }

    /// Hard-delete a booking by id.
    pub async fn remove(&self, id: Ulid) -> Result<Booking, StoreError> {
        let resource_id = self
            .booking_to_resource
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(StoreError::NotFound(id))?;
        let rs = self.get_resource(&resource_id).ok_or(StoreError::NotFound(id))?;
        let mut guard = rs.write().await;
        // Re-read under the lock: a concurrent remove may have won.
        let booking = guard
            .bookings
            .iter()
            .find(|b| b.id == id)
            .cloned()
            .ok_or(StoreError::NotFound(id))?;

        let event = Event::BookingRemoved { id, resource_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(booking)
    }

    /// Rewrite the WAL as one `BookingCreated` per live booking.
    pub async fn compact_wal(&self) -> Result<(), StoreError> {
        let resources: Vec<_> = self.resources.iter().map(|e| e.value().clone()).collect();
        let mut events = Vec::new();
        // Holding every read lock until the snapshot is handed to the writer
        // keeps inserts from landing between snapshot and swap.
        let mut guards = Vec::with_capacity(resources.len());
        for rs in &resources {
            guards.push(rs.read().await);
        }
        for guard in &guards {
            events.extend(guard.bookings.iter().map(|b| Event::BookingCreated { booking: b.clone() }));
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::WalError("WAL writer shut down".into()))?;
        let result = rx
            .await
            .map_err(|_| StoreError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::WalError(e.to_string()));
        drop(guards);
        result
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
