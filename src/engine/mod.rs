mod conflict;
mod error;
mod mutations;
mod queries;
mod slots;
mod store;

pub use error::BookingError;
pub use queries::{AppointmentFilter, Page, PagedAppointments};
pub use slots::{day_windows, generation_dates, plan_generation};
pub use store::{transition_allowed, DayState};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability;
use crate::wal::Wal;

pub type SharedDayState = Arc<RwLock<DayState>>;

/// Policy decisions fixed at construction.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How many times one original booking may be rescheduled in total.
    pub max_reschedule_depth: u32,
    /// Whether a reschedule may move the booking to another center.
    pub allow_cross_center_reschedule: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_reschedule_depth: 3,
            allow_cross_center_reschedule: false,
        }
    }
}

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

/// Background task owning the WAL. Appends are batched: whatever is
/// already queued behind the first one gets buffered and committed with a
/// single fsync, then every waiter is answered.
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

fn commit_batch(wal: &mut Wal, batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut append_err: Option<io::Error> = None;
    for (event, _) in &batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so partially buffered bytes don't
    // leak into the next batch (these callers are told the batch failed).
    let flush_err = wal.flush_sync().err();
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    let result = match append_err.or(flush_err) {
        Some(e) => Err(e),
        None => Ok(()),
    };
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
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// The booking engine: day-sharded slots and appointments, every mutation
/// WAL-appended before it is applied in memory. All writes go through the
/// orchestration methods in `mutations`; everything else is read-only.
pub struct Engine {
    days: DashMap<NaiveDate, SharedDayState>,
    wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// appointment id → the day shard holding it
    appt_index: DashMap<Ulid, NaiveDate>,
    /// slot id → the day shard holding it
    slot_index: DashMap<Ulid, NaiveDate>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        config: EngineConfig,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            days: DashMap::new(),
            wal_tx,
            notify,
            appt_index: DashMap::new(),
            slot_index: DashMap::new(),
            config,
        };

        // Replay — we are the sole owner of the day Arcs here, so
        // try_write always succeeds instantly. Never block on a lock in
        // this constructor; it may run inside an async context.
        for event in &events {
            match event {
                Event::Rescheduled {
                    old_date,
                    replacement,
                    ..
                } if replacement.date != *old_date => {
                    for date in [*old_date, replacement.date] {
                        let day = engine.day_entry(date);
                        let mut guard = day.try_write().expect("replay: uncontended write");
                        store::apply_event(
                            &mut guard,
                            event,
                            &engine.appt_index,
                            &engine.slot_index,
                        );
                    }
                }
                other => {
                    let day = engine.day_entry(other.date());
                    let mut guard = day.try_write().expect("replay: uncontended write");
                    store::apply_event(&mut guard, other, &engine.appt_index, &engine.slot_index);
                }
            }
        }

        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Get or lazily create the shard for a day.
    pub(super) fn day_entry(&self, date: NaiveDate) -> SharedDayState {
        if let Some(entry) = self.days.get(&date) {
            return entry.value().clone();
        }
        let day = self
            .days
            .entry(date)
            .or_insert_with(|| Arc::new(RwLock::new(DayState::new(date))))
            .clone();
        metrics::gauge!(observability::DAYS_ACTIVE).set(self.days.len() as f64);
        day
    }

    /// The shard for a day, if one was ever loaded. Queries use this so a
    /// lookup never materializes empty shards.
    pub(super) fn day_get(&self, date: &NaiveDate) -> Option<SharedDayState> {
        self.days.get(date).map(|e| e.value().clone())
    }

    pub(super) fn day_of_appointment(&self, id: &Ulid) -> Result<NaiveDate, BookingError> {
        self.appt_index
            .get(id)
            .map(|e| *e.value())
            .ok_or(BookingError::NotFound(*id))
    }

    pub(super) fn day_of_slot(&self, id: &Ulid) -> Result<NaiveDate, BookingError> {
        self.slot_index
            .get(id)
            .map(|e| *e.value())
            .ok_or(BookingError::NotFound(*id))
    }

    /// Write an event through the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), BookingError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| BookingError::TransientStore("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| BookingError::TransientStore("WAL writer dropped response".into()))?
            .map_err(|e| BookingError::TransientStore(e.to_string()))
    }

    /// WAL-append + apply + notify in one call — the single-day commit
    /// path every simple mutation funnels through.
    pub(super) async fn persist_and_apply(
        &self,
        center_id: Ulid,
        day: &mut DayState,
        event: &Event,
    ) -> Result<(), BookingError> {
        self.wal_append(event).await?;
        store::apply_event(day, event, &self.appt_index, &self.slot_index);
        self.notify.send(center_id, event);
        Ok(())
    }

    /// Look up an appointment's day and take its write lock.
    pub(super) async fn resolve_appointment_write(
        &self,
        id: &Ulid,
    ) -> Result<
        (
            NaiveDate,
            tokio::sync::OwnedRwLockWriteGuard<DayState>,
        ),
        BookingError,
    > {
        let date = self.day_of_appointment(id)?;
        let day = self.day_get(&date).ok_or(BookingError::NotFound(*id))?;
        Ok((date, day.write_owned().await))
    }
}
