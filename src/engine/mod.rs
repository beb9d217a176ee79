mod daily;
mod error;

pub use daily::{CLOSE_HOUR, DailyAvailability, OPEN_HOUR, hour_slots, slot_label};
pub use error::EngineError;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use ulid::Ulid;

use crate::auth::BearerToken;
use crate::existence::{EntityKind, Existence, ExistenceChecker};
use crate::limits::*;
use crate::model::*;
use crate::observability;
use crate::store::{IntervalStore, StoreError};

/// A booking request as it arrives at the boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateBooking {
    pub resource_id: String,
    pub user_id: String,
    pub owner_id: String,
    pub start: Ms,
    pub end: Ms,
}

/// Booking rules and availability answers on top of the interval store.
///
/// Holds no mutable state of its own: the store and the existence checker
/// are injected, so one engine can be shared by every connection.
pub struct AvailabilityEngine {
    store: Arc<IntervalStore>,
    checker: Arc<dyn ExistenceChecker>,
    check_timeout: Duration,
}

impl AvailabilityEngine {
    pub fn new(
        store: Arc<IntervalStore>,
        checker: Arc<dyn ExistenceChecker>,
        check_timeout: Duration,
    ) -> Self {
        Self {
            store,
            checker,
            check_timeout,
        }
    }

    pub fn store(&self) -> &Arc<IntervalStore> {
        &self.store
    }

    // ── Creation ─────────────────────────────────────────────

    /// Validate, confirm the requester, owner and resource exist, then insert
    /// a `PENDING` booking unless an overlapping blocking booking exists.
    ///
    /// Existence checks run concurrently and finish before the store takes the
    /// resource lock; the overlap test and the insert happen atomically under it.
    pub async fn create_booking(
        &self,
        req: CreateBooking,
        token: Option<&BearerToken>,
    ) -> Result<Booking, EngineError> {
        validate_id("resource_id", &req.resource_id)?;
        validate_id("user_id", &req.user_id)?;
        validate_id("owner_id", &req.owner_id)?;
        let span = validate_span(req.start, req.end)?;
        let token =
            token.ok_or_else(|| EngineError::Unauthorized("missing bearer credential".into()))?;

        let checks = async {
            let (user, owner, resource) = tokio::join!(
                self.check_exists(EntityKind::User, &req.user_id, Some(token)),
                self.check_exists(EntityKind::User, &req.owner_id, Some(token)),
                self.check_exists(EntityKind::Resource, &req.resource_id, Some(token)),
            );
            user.map_err(|e| context("user", e))?;
            owner.map_err(|e| context("owner", e))?;
            resource.map_err(|e| context("listing", e))
        };
        self.bounded(checks).await?;

        let new = NewBooking::pending(req.resource_id, req.user_id, req.owner_id, span);
        match self.store.insert(new).await {
            Ok(booking) => {
                metrics::counter!(observability::BOOKINGS_CREATED_TOTAL).increment(1);
                tracing::info!(
                    "booking {} created on {} [{}, {}]",
                    booking.id,
                    booking.resource_id,
                    format_instant(booking.span.start),
                    format_instant(booking.span.end)
                );
                Ok(booking)
            }
            Err(StoreError::Conflict(existing)) => {
                metrics::counter!(observability::BOOKING_CONFLICTS_TOTAL).increment(1);
                tracing::warn!("booking rejected: overlaps {existing}");
                Err(EngineError::Conflict(existing))
            }
            Err(e) => Err(e.into()),
        }
    }

    // ── Availability ─────────────────────────────────────────

    /// True iff no blocking booking on the resource overlaps `[start, end]`.
    pub async fn is_available_interval(
        &self,
        resource_id: &str,
        start: Ms,
        end: Ms,
        token: Option<&BearerToken>,
    ) -> Result<bool, EngineError> {
        validate_id("resource_id", resource_id)?;
        let span = validate_span(start, end)?;
        self.bounded(self.check_exists(EntityKind::Resource, resource_id, token))
            .await
            .map_err(|e| context("listing", e))?;
        Ok(!self.store.has_overlap(resource_id, span).await?)
    }

    /// True iff no blocking booking's closed span contains `at`.
    pub async fn is_available_at_moment(
        &self,
        resource_id: &str,
        at: Ms,
        token: Option<&BearerToken>,
    ) -> Result<bool, EngineError> {
        validate_id("resource_id", resource_id)?;
        validate_instant(at)?;
        self.bounded(self.check_exists(EntityKind::Resource, resource_id, token))
            .await
            .map_err(|e| context("listing", e))?;
        Ok(self.store.is_available_at(resource_id, at).await?)
    }

    /// Free/occupied hour slots 09:00..=21:00 on a UTC calendar day.
    pub async fn daily_availability(
        &self,
        resource_id: &str,
        date: NaiveDate,
    ) -> Result<DailyAvailability, EngineError> {
        validate_id("resource_id", resource_id)?;
        let day_start = day_start_ms(date);
        validate_instant(day_start)?;
        let bookings = self.store.list_by_resource_and_day(resource_id, day_start).await?;
        let policy = self.store.policy();
        let hours = hour_slots(day_start, bookings.iter().filter(|b| policy.blocks(b)));
        Ok(DailyAvailability { date, hours })
    }

    // ── Reads & removal ──────────────────────────────────────

    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        Ok(self.store.get_by_id(id).await?)
    }

    pub async fn list_by_user(&self, user_id: &str) -> Result<Vec<Booking>, EngineError> {
        validate_id("user_id", user_id)?;
        Ok(self.store.list_by_user(user_id).await?)
    }

    pub async fn list_by_resource(&self, resource_id: &str) -> Result<Vec<Booking>, EngineError> {
        validate_id("resource_id", resource_id)?;
        Ok(self.store.list_by_resource(resource_id).await?)
    }

    pub async fn list_by_resource_and_day(
        &self,
        resource_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<Booking>, EngineError> {
        validate_id("resource_id", resource_id)?;
        let day_start = day_start_ms(date);
        validate_instant(day_start)?;
        Ok(self.store.list_by_resource_and_day(resource_id, day_start).await?)
    }

    pub async fn list_all(&self) -> Result<Vec<Booking>, EngineError> {
        Ok(self.store.list_all().await?)
    }

    pub async fn remove_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let booking = self.store.remove(id).await?;
        tracing::info!("booking {id} removed from {}", booking.resource_id);
        Ok(booking)
    }

    // ── Existence checks ─────────────────────────────────────

    async fn check_exists(
        &self,
        kind: EntityKind,
        id: &str,
        token: Option<&BearerToken>,
    ) -> Result<(), EngineError> {
        let started = Instant::now();
        let outcome = self.checker.exists(kind, id, token).await;
        metrics::histogram!(observability::EXISTENCE_CHECK_DURATION_SECONDS, "kind" => kind.as_str())
            .record(started.elapsed().as_secs_f64());
        metrics::counter!(
            observability::EXISTENCE_CHECKS_TOTAL,
            "kind" => kind.as_str(),
            "outcome" => outcome.label()
        )
        .increment(1);

        match outcome {
            Existence::Found => Ok(()),
            Existence::NotFound => {
                tracing::debug!("{kind} {id} not found");
                Err(EngineError::NotFound(format!("{kind} {id}")))
            }
            Existence::Unauthorized => {
                tracing::warn!("{kind} service rejected credential for {id}");
                Err(EngineError::Unauthorized(format!("{kind} service rejected credential")))
            }
            Existence::Error(msg) => {
                tracing::warn!("{kind} existence check failed: {msg}");
                Err(EngineError::Upstream(msg))
            }
        }
    }

    /// Bound outbound checks by the configured budget. No lock is held here.
    async fn bounded<F>(&self, checks: F) -> Result<(), EngineError>
    where
        F: Future<Output = Result<(), EngineError>>,
    {
        match tokio::time::timeout(self.check_timeout, checks).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Upstream(format!(
                "existence checks timed out after {} ms",
                self.check_timeout.as_millis()
            ))),
        }
    }
}

/// Prefix which party failed validation, keeping the error kind.
fn context(what: &str, e: EngineError) -> EngineError {
    match e {
        EngineError::NotFound(msg) => EngineError::NotFound(format!("{what} validation failed: {msg}")),
        EngineError::Unauthorized(msg) => {
            EngineError::Unauthorized(format!("{what} validation failed: {msg}"))
        }
        EngineError::Upstream(msg) => EngineError::Upstream(format!("{what} validation failed: {msg}")),
        other => other,
    }
}

// ── Validation ───────────────────────────────────────────────────

pub(crate) fn validate_id(field: &str, id: &str) -> Result<(), EngineError> {
    if id.is_empty() {
        return Err(EngineError::InvalidInput(format!("{field} must not be empty")));
    }
    if id.len() > MAX_ID_LEN {
        return Err(EngineError::InvalidInput(format!(
            "{field} longer than {MAX_ID_LEN} bytes"
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(EngineError::InvalidInput(format!(
            "{field} may only contain letters, digits, '-', '_' and '.'"
        )));
    }
    Ok(())
}

pub(crate) fn validate_instant(t: Ms) -> Result<(), EngineError> {
    if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&t) {
        return Err(EngineError::InvalidInput(format!("timestamp {t} out of range")));
    }
    Ok(())
}

/// `end` must be strictly after `start`; both inside the supported range.
pub(crate) fn validate_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    if end <= start {
        return Err(EngineError::InvalidInterval { start, end });
    }
    validate_instant(start)?;
    validate_instant(end)?;
    if end - start > MAX_SPAN_DURATION_MS {
        return Err(EngineError::InvalidInput("booking longer than a year".into()));
    }
    Ok(Span::new(start, end))
}
