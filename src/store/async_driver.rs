//! Background compaction driver: a job queue feeding a single worker
//! thread, with per-level mutual exclusion so at most one compaction runs
//! against any given level at a time.
//!
//! The worker only ever takes the store's lock briefly, inside
//! [`Store::compact_level`]'s catalog-swap critical section — it reads
//! immutable input files for the bulk of its work, so foreground `put`/`get`
//! never blocks on a running compaction.
//!
//! # Per-level exclusion
//!
//! Each level has an [`AtomicBool`] "busy" flag. The worker tries a
//! non-blocking compare-exchange before starting a job; on contention the
//! job is requeued with a short delay and stays [`CompactionJobState::Pending`]
//! rather than blocking the worker thread on that level.
//!
//! # Shutdown
//!
//! [`AsyncCompactionDriver::shutdown`] enqueues a sentinel and waits for the
//! worker's shutdown acknowledgement up to a bound; on timeout it logs and
//! returns anyway rather than hanging forever. In-flight jobs are not
//! cancelled — shutdown waits for the current job's critical section to
//! finish before the worker drains the sentinel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use tracing::{info, warn};

use super::Store;

/// Delay before a contended job is retried against a busy level.
const REQUEUE_DELAY: Duration = Duration::from_millis(20);

/// Lifecycle state of one [`CompactionJob`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionJobState {
    /// Queued, not yet picked up (or requeued after losing a level's lock).
    Pending,
    /// The worker is actively compacting this job's level.
    Running,
    /// Finished successfully; inputs have been unlinked.
    Completed,
    /// Finished with an error; the catalog and input files are unchanged.
    Failed,
}

/// A snapshot of one scheduled compaction.
#[derive(Debug, Clone)]
pub struct CompactionJob {
    /// Opaque identifier returned by [`AsyncCompactionDriver::schedule_compaction`].
    pub id: u64,
    /// Source level being compacted.
    pub level: usize,
    /// Current lifecycle state.
    pub state: CompactionJobState,
    /// Set when `state == Failed`, the triggering error's display string.
    pub error: Option<String>,
}

enum WorkItem {
    Job { id: u64, level: usize },
    Shutdown,
}

struct JobsTable {
    jobs: HashMap<u64, CompactionJob>,
}

/// Async wrapper around [`Store::compact_level`]: a queue, a worker thread,
/// and per-level mutual exclusion.
pub struct AsyncCompactionDriver {
    jobs: Arc<(Mutex<JobsTable>, Condvar)>,
    next_job_id: AtomicU64,
    sender: Sender<WorkItem>,
    worker: Mutex<Option<JoinHandle<()>>>,
    shutdown_ack: Receiver<()>,
}

impl AsyncCompactionDriver {
    /// Spawn the background worker for `store`.
    pub fn spawn(store: Arc<Store>) -> Self {
        let (sender, receiver) = channel::unbounded::<WorkItem>();
        let (ack_tx, ack_rx) = channel::bounded::<()>(1);
        let jobs = Arc::new((
            Mutex::new(JobsTable {
                jobs: HashMap::new(),
            }),
            Condvar::new(),
        ));
        let level_busy: Arc<Vec<AtomicBool>> = Arc::new(
            (0..store.max_levels())
                .map(|_| AtomicBool::new(false))
                .collect(),
        );

        let worker_jobs = Arc::clone(&jobs);
        let worker_sender = sender.clone();
        let handle = thread::spawn(move || {
            worker_loop(store, worker_jobs, level_busy, receiver, worker_sender, ack_tx);
        });

        Self {
            jobs,
            next_job_id: AtomicU64::new(0),
            sender,
            worker: Mutex::new(Some(handle)),
            shutdown_ack: ack_rx,
        }
    }

    /// Enqueue a compaction of `level`. Returns immediately with a job id
    /// unless `wait` is `true`, in which case it blocks until the job
    /// reaches a terminal state.
    pub fn schedule_compaction(&self, level: usize, wait: bool) -> u64 {
        let id = self.next_job_id.fetch_add(1, Ordering::SeqCst);
        {
            let (lock, _) = &*self.jobs;
            let mut table = lock.lock().unwrap_or_else(|e| e.into_inner());
            table.jobs.insert(
                id,
                CompactionJob {
                    id,
                    level,
                    state: CompactionJobState::Pending,
                    error: None,
                },
            );
        }
        let _ = self.sender.send(WorkItem::Job { id, level });
        if wait {
            self.wait_for_compaction(id, None);
        }
        id
    }

    /// Block until `job_id` reaches a terminal state or `timeout` elapses.
    /// Returns `false` on timeout or on an unknown job id; `timeout = None`
    /// waits indefinitely.
    pub fn wait_for_compaction(&self, job_id: u64, timeout: Option<Duration>) -> bool {
        let (lock, cvar) = &*self.jobs;
        let mut table = lock.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            match table.jobs.get(&job_id) {
                None => return false,
                Some(job) if is_terminal(job.state) => return true,
                Some(_) => {}
            }
            match timeout {
                None => {
                    table = cvar.wait(table).unwrap_or_else(|e| e.into_inner());
                }
                Some(t) => {
                    let (guard, result) =
                        cvar.wait_timeout(table, t).unwrap_or_else(|e| e.into_inner());
                    table = guard;
                    if result.timed_out() {
                        return table
                            .jobs
                            .get(&job_id)
                            .is_some_and(|job| is_terminal(job.state));
                    }
                }
            }
        }
    }

    /// Current snapshot of `job_id`, or `None` if it was never scheduled on
    /// this driver.
    pub fn get_compaction_status(&self, job_id: u64) -> Option<CompactionJob> {
        let (lock, _) = &*self.jobs;
        let table = lock.lock().unwrap_or_else(|e| e.into_inner());
        table.jobs.get(&job_id).cloned()
    }

    /// Snapshot of every job still in [`CompactionJobState::Pending`].
    pub fn list_pending_compactions(&self) -> Vec<CompactionJob> {
        let (lock, _) = &*self.jobs;
        let table = lock.lock().unwrap_or_else(|e| e.into_inner());
        table
            .jobs
            .values()
            .filter(|j| j.state == CompactionJobState::Pending)
            .cloned()
            .collect()
    }

    /// Signal the worker to stop, enqueue the shutdown sentinel, and wait
    /// up to `timeout` for it to drain. On timeout, logs and returns
    /// without joining — in-flight jobs are never cancelled, only waited
    /// for up to this bound.
    pub fn shutdown(&self, timeout: Duration) {
        let _ = self.sender.send(WorkItem::Shutdown);
        match self.shutdown_ack.recv_timeout(timeout) {
            Ok(()) => {
                if let Some(handle) = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take()
                {
                    let _ = handle.join();
                }
                info!("compaction worker shut down");
            }
            Err(_) => {
                warn!(?timeout, "compaction worker did not shut down in time");
            }
        }
    }
}

fn is_terminal(state: CompactionJobState) -> bool {
    matches!(state, CompactionJobState::Completed | CompactionJobState::Failed)
}

fn set_state(jobs: &Arc<(Mutex<JobsTable>, Condvar)>, id: u64, state: CompactionJobState, error: Option<String>) {
    let (lock, cvar) = &**jobs;
    let mut table = lock.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(job) = table.jobs.get_mut(&id) {
        job.state = state;
        job.error = error;
    }
    drop(table);
    cvar.notify_all();
}

fn worker_loop(
    store: Arc<Store>,
    jobs: Arc<(Mutex<JobsTable>, Condvar)>,
    level_busy: Arc<Vec<AtomicBool>>,
    receiver: Receiver<WorkItem>,
    requeue_sender: Sender<WorkItem>,
    ack: Sender<()>,
) {
    for item in receiver.iter() {
        match item {
            WorkItem::Shutdown => break,
            WorkItem::Job { id, level } => {
                if level >= level_busy.len()
                    || level_busy[level]
                        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                        .is_err()
                {
                    thread::sleep(REQUEUE_DELAY);
                    let _ = requeue_sender.send(WorkItem::Job { id, level });
                    continue;
                }

                set_state(&jobs, id, CompactionJobState::Running, None);
                let result = store.compact_level(level);
                level_busy[level].store(false, Ordering::SeqCst);

                match result {
                    Ok(()) => set_state(&jobs, id, CompactionJobState::Completed, None),
                    Err(e) => {
                        warn!(level, error = %e, "compaction job failed");
                        set_state(&jobs, id, CompactionJobState::Failed, Some(e.to_string()));
                    }
                }
            }
        }
    }
    let _ = ack.send(());
}
