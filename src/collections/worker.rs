//! Per-collection scan worker.
//!
//! Each enabled collection gets a dedicated thread so a misbehaving scan
//! strategy can at worst stall its own collection. The thread blocks on a
//! control channel with a timeout equal to the time until the next scheduled
//! scan; `Stop` exits, `Update` moves the next scan forward.

use super::strategy::StrategyKind;
use crate::photo_store::{self, CollectionRecord};
use crate::schedule::Schedule;
use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{error, info};

#[derive(Debug, Clone, Copy)]
pub enum WorkerMessage {
    Stop,
    Update { delay: Duration },
}

pub struct WorkerHandle {
    sender: SyncSender<WorkerMessage>,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Ask the worker to scan at `now + delay`. Returns false when the
    /// control channel is full or gone.
    pub fn request_update(&self, delay: Duration) -> bool {
        match self.sender.try_send(WorkerMessage::Update { delay }) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Stop the worker and wait for it to exit.
    pub fn stop(mut self) {
        let _ = self.sender.send(WorkerMessage::Stop);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

pub fn spawn(record: CollectionRecord, kind: StrategyKind, db_path: PathBuf) -> WorkerHandle {
    let (sender, receiver) = std::sync::mpsc::sync_channel(8);
    let identifier = record.identifier.clone();
    let join = std::thread::Builder::new()
        .name(format!("collection-{}", identifier))
        .spawn(move || run_worker(record, kind, db_path, receiver))
        .expect("failed to spawn collection worker thread");

    WorkerHandle {
        sender,
        join: Some(join),
    }
}

fn run_worker(
    record: CollectionRecord,
    kind: StrategyKind,
    db_path: PathBuf,
    receiver: Receiver<WorkerMessage>,
) {
    info!("Started collection worker \"{}\"", record.identifier);

    let schedule = match Schedule::parse(&record.schedule) {
        Ok(schedule) => schedule,
        Err(e) => {
            error!(
                "Invalid schedule for \"{}\", scanning manually only: {}",
                record.identifier, e
            );
            Schedule::parse("").unwrap()
        }
    };

    let mut pending_update: Option<Instant> = None;
    loop {
        let cron_deadline = schedule.next_after(chrono::Utc::now()).map(|at| {
            let delta = (at - chrono::Utc::now()).to_std().unwrap_or(Duration::ZERO);
            Instant::now() + delta
        });
        let deadline = match (cron_deadline, pending_update) {
            (Some(cron), Some(pending)) => Some(cron.min(pending)),
            (deadline, None) | (None, deadline) => deadline,
        };

        let received = match deadline {
            // Manual-only schedule with nothing pending: block until a message.
            None => match receiver.recv() {
                Ok(message) => Some(message),
                Err(_) => break,
            },
            Some(deadline) => {
                let timeout = deadline.saturating_duration_since(Instant::now());
                match receiver.recv_timeout(timeout) {
                    Ok(message) => Some(message),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        };

        match received {
            Some(WorkerMessage::Stop) => break,
            Some(WorkerMessage::Update { delay }) => {
                let candidate = Instant::now() + delay;
                pending_update = Some(pending_update.map_or(candidate, |p| p.min(candidate)));
            }
            None => {
                pending_update = None;
                let control = run_update(&record, kind, &db_path, &receiver);
                if control.stop.get() {
                    break;
                }
                pending_update = control.pending.get();
            }
        }
    }

    info!("Stopped collection worker \"{}\"", record.identifier);
}

/// Messages consumed by the cancellation check during a scan.
struct ControlFlags {
    stop: Cell<bool>,
    pending: Cell<Option<Instant>>,
}

fn run_update(
    record: &CollectionRecord,
    kind: StrategyKind,
    db_path: &PathBuf,
    receiver: &Receiver<WorkerMessage>,
) -> ControlFlags {
    let control = ControlFlags {
        stop: Cell::new(false),
        pending: Cell::new(None),
    };

    let mut conn = match photo_store::open_connection(db_path) {
        Ok(conn) => conn,
        Err(e) => {
            error!(
                "Collection \"{}\" can't open the photo database: {:#}",
                record.identifier, e
            );
            return control;
        }
    };

    let cancel = || {
        if control.stop.get() || control.pending.get().is_some() {
            return true;
        }
        match receiver.try_recv() {
            Ok(WorkerMessage::Stop) => {
                control.stop.set(true);
                true
            }
            Ok(WorkerMessage::Update { delay }) => {
                control.pending.set(Some(Instant::now() + delay));
                true
            }
            Err(std::sync::mpsc::TryRecvError::Empty) => false,
            Err(std::sync::mpsc::TryRecvError::Disconnected) => {
                control.stop.set(true);
                true
            }
        }
    };

    info!("Updating \"{}\"", record.identifier);
    let result = catch_unwind(AssertUnwindSafe(|| kind.update(&mut conn, record, &cancel)));
    match result {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => {
            error!(
                "Error in collection \"{}\" update: {:#}",
                record.identifier, e
            );
        }
        Err(_) => {
            error!("Panic in collection \"{}\" update", record.identifier);
        }
    }

    control
}
