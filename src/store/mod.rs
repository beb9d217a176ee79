mod error;
mod mutations;
mod queries;

pub use error::StoreError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit:
/// wait for one append, drain whatever else is already queued, write the
/// whole batch with a single fsync, then answer every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    // Flush what we have before compaction or counters look at the log.
                    deferred = Some(other);
                    break;
                }
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();

    let mut result = Ok(());
    for (event, _) in &batch {
        if let Err(e) = wal.append_buffered(event) {
            result = Err(e);
            break;
        }
    }
    if result.is_ok() {
        result = wal.flush_sync();
    }
    // A failed batch must leave no bytes behind: callers are told it never happened.
    if result.is_err()
        && let Err(e) = wal.rollback()
    {
        tracing::error!("WAL rollback failed, refusing further appends: {e}");
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL batch of {} failed: {e}", batch.len());
    }

    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// Durable, indexed set of bookings.
///
/// Each resource owns a start-sorted booking vector behind its own `RwLock`;
/// that lock is the unit of serialization for conditional inserts, so resource
/// entries live for the life of the store even once empty. Two side indexes
/// map booking id → resource and user → booking ids.
pub struct IntervalStore {
    pub(super) resources: DashMap<String, SharedResourceState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) booking_to_resource: DashMap<Ulid, String>,
    pub(super) user_bookings: DashMap<String, Vec<Ulid>>,
    pub(super) policy: OverlapPolicy,
}

impl IntervalStore {
    /// Replay the log at `wal_path` and start the WAL writer task.
    /// Must be called from within a tokio runtime.
    pub fn open(wal_path: PathBuf, policy: OverlapPolicy) -> io::Result<Self> {
        let replay = Wal::replay(&wal_path)?;
        if replay.discarded_tail {
            tracing::warn!(
                "discarded damaged tail of {}, truncating to {} bytes",
                wal_path.display(),
                replay.valid_len
            );
            Wal::truncate(&wal_path, replay.valid_len)?;
        }
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Self {
            resources: DashMap::new(),
            wal_tx,
            booking_to_resource: DashMap::new(),
            user_bookings: DashMap::new(),
            policy,
        };

        // We are the only owner of every lock here, so try_write never contends.
        // Blocking lock calls are off-limits: open may run inside async code.
        for event in &replay.events {
            let resource_id = event_resource_id(event);
            let rs = store.resource_entry(resource_id);
            let Ok(mut guard) = rs.try_write() else {
                return Err(io::Error::other("replay: resource lock contended"));
            };
            store.apply(&mut guard, event);
        }
        tracing::info!(
            "interval store opened: {} bookings on {} resources",
            store.booking_to_resource.len(),
            store.resources.len()
        );

        Ok(store)
    }

    pub fn policy(&self) -> OverlapPolicy {
        self.policy
    }

    pub(super) fn get_resource(&self, id: &str) -> Option<SharedResourceState> {
        self.resources.get(id).map(|e| e.value().clone())
    }

    /// Resource state for `id`, created empty on first use. Resources are
    /// owned by an external catalog; the store only tracks their bookings.
    pub(super) fn resource_entry(&self, id: &str) -> SharedResourceState {
        if let Some(rs) = self.get_resource(id) {
            return rs;
        }
        self.resources
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(ResourceState::new(id.to_string()))))
            .value()
            .clone()
    }

    /// Apply an event to a resource (caller holds the resource's write lock).
    pub(super) fn apply(&self, rs: &mut ResourceState, event: &Event) {
        match event {
            Event::BookingCreated { booking } => {
                self.booking_to_resource
                    .insert(booking.id, booking.resource_id.clone());
                self.user_bookings
                    .entry(booking.user_id.clone())
                    .or_default()
                    .push(booking.id);
                rs.insert_booking(booking.clone());
            }
            Event::BookingRemoved { id, .. } => {
                self.booking_to_resource.remove(id);
                if let Some(removed) = rs.remove_booking(*id) {
                    if let Some(mut ids) = self.user_bookings.get_mut(&removed.user_id) {
                        ids.retain(|b| b != id);
                    }
                    self.user_bookings
                        .remove_if(&removed.user_id, |_, ids| ids.is_empty());
                }
            }
        }
    }

    /// Write event to the WAL via the group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::WalError(e.to_string()))
    }

    /// Log first, then apply. Nothing reaches memory unless the append is durable.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut ResourceState,
        event: &Event,
    ) -> Result<(), StoreError> {
        self.wal_append(event).await?;
        self.apply(rs, event);
        Ok(())
    }
}

fn event_resource_id(event: &Event) -> &str {
    match event {
        Event::BookingCreated { booking } => &booking.resource_id,
        Event::BookingRemoved { resource_id, .. } => resource_id,
    }
}
