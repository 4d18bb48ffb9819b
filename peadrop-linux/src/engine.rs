//! Engine context: the shared slot pool, host sink and settings, the per-registry job
//! table, and the per-job driver that walks a job through its roles.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use peadrop_core::{
    Direction, Item, JobRole, JobSink, JobSnapshot, JobState, SlotAllocator, SlotError,
    DEFAULT_CHUNK_SIZE, DEFAULT_MAX_JOBS, DEFAULT_PORT,
};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::negotiation::{InboundPending, OutboundPending};
use crate::receiver::ActiveReceiver;
use crate::sender::ActiveSender;

/// Tunables handed to every job. Derived from the host configuration.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// TCP port peers listen on (the UDP responder shares it).
    pub port: u16,
    pub max_jobs: usize,
    pub chunk_size: usize,
    /// No data for this long during a transfer (or before the first header) is a network error.
    pub idle_timeout: Duration,
    /// Snapshot re-push period while a transfer is active.
    pub push_interval: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            max_jobs: DEFAULT_MAX_JOBS,
            chunk_size: DEFAULT_CHUNK_SIZE,
            idle_timeout: Duration::from_secs(30),
            push_interval: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Slot(#[from] SlotError),
    #[error("no job in slot {0}")]
    UnknownJob(usize),
    #[error("job {0} is still running")]
    NotTerminal(usize),
    #[error("job {slot} cannot do that while {role:?}/{state:?}")]
    InvalidState {
        slot: usize,
        role: JobRole,
        state: JobState,
    },
    #[error("filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),
    #[error("listener is not open")]
    NotListening,
}

/// Commands a registry sends into a running job.
#[derive(Debug)]
pub enum Control {
    Cancel,
    Reject,
    AcceptSend { recv_dir: PathBuf },
    AcceptRecv { items: Vec<Item> },
}

/// Shared by both registries: one slot pool, one host sink, one set of settings.
#[derive(Clone)]
pub struct Engine {
    slots: Arc<Mutex<SlotAllocator>>,
    sink: Arc<dyn JobSink>,
    settings: Arc<EngineSettings>,
}

impl Engine {
    pub fn new(settings: EngineSettings, sink: Arc<dyn JobSink>) -> Self {
        let observer = sink.clone();
        let slots = SlotAllocator::with_observer(settings.max_jobs, move |n| {
            observer.job_count_changed(n)
        });
        Self {
            slots: Arc::new(Mutex::new(slots)),
            sink,
            settings: Arc::new(settings),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub async fn acquire_slot(&self) -> Result<usize, EngineError> {
        Ok(self.slots.lock().await.acquire()?)
    }

    pub async fn release_slot(&self, slot: usize) -> Result<(), EngineError> {
        Ok(self.slots.lock().await.release(slot)?)
    }

    pub async fn jobs_in_use(&self) -> usize {
        self.slots.lock().await.held_count()
    }

    /// Register a fresh job in `table` and hand back the context its task will own.
    pub(crate) async fn register(
        &self,
        table: &JobTable,
        slot: usize,
        role: JobRole,
        direction: Direction,
        peer_id: &str,
        peer_ip: Option<IpAddr>,
    ) -> JobContext {
        let mut snapshot = JobSnapshot::new(slot, role, direction, peer_id);
        snapshot.peer_ip = peer_ip;
        let (tx, rx) = mpsc::unbounded_channel();
        table.jobs.lock().await.insert(
            slot,
            JobEntry {
                snapshot: snapshot.clone(),
                control: tx,
            },
        );
        let ctx = JobContext {
            snapshot,
            table: table.clone(),
            sink: self.sink.clone(),
            control: rx,
            control_closed: false,
            settings: self.settings.clone(),
        };
        ctx.push().await;
        ctx
    }

    /// Remove a terminal job whose socket is closed, then return its slot to the pool.
    pub(crate) async fn delete_job(&self, table: &JobTable, slot: usize) -> Result<(), EngineError> {
        {
            let mut jobs = table.jobs.lock().await;
            let entry = jobs.get(&slot).ok_or(EngineError::UnknownJob(slot))?;
            if !entry.snapshot.is_deletable() {
                return Err(EngineError::NotTerminal(slot));
            }
            jobs.remove(&slot);
        }
        self.release_slot(slot).await?;
        self.sink.job_removed(slot);
        debug!(slot, "job deleted");
        Ok(())
    }
}

struct JobEntry {
    snapshot: JobSnapshot,
    control: mpsc::UnboundedSender<Control>,
}

/// Jobs owned by one registry, keyed by slot. Only the latest snapshot and the
/// control channel live here; the socket belongs to the job's task.
#[derive(Clone, Default)]
pub struct JobTable {
    jobs: Arc<Mutex<HashMap<usize, JobEntry>>>,
}

impl JobTable {
    pub async fn snapshot(&self, slot: usize) -> Option<JobSnapshot> {
        self.jobs.lock().await.get(&slot).map(|e| e.snapshot.clone())
    }

    pub async fn snapshots(&self) -> Vec<JobSnapshot> {
        let jobs = self.jobs.lock().await;
        let mut out: Vec<JobSnapshot> = jobs.values().map(|e| e.snapshot.clone()).collect();
        out.sort_by_key(|s| s.slot);
        out
    }

    /// Ask a running job to cancel. Ending a job that already finished is a no-op.
    pub async fn end_job(&self, slot: usize) -> Result<(), EngineError> {
        let jobs = self.jobs.lock().await;
        let entry = jobs.get(&slot).ok_or(EngineError::UnknownJob(slot))?;
        if entry.snapshot.state.is_terminal() {
            return Ok(());
        }
        let _ = entry.control.send(Control::Cancel);
        Ok(())
    }

    /// Deliver an accept/reject decision to an inbound job still waiting in `Pending`.
    pub(crate) async fn decide(
        &self,
        slot: usize,
        expect: Option<Direction>,
        decision: Control,
    ) -> Result<(), EngineError> {
        let jobs = self.jobs.lock().await;
        let entry = jobs.get(&slot).ok_or(EngineError::UnknownJob(slot))?;
        let snap = &entry.snapshot;
        let direction_ok = expect.map_or(true, |d| d == snap.direction);
        if snap.role != JobRole::InboundPending || snap.state != JobState::Pending || !direction_ok
        {
            return Err(EngineError::InvalidState {
                slot,
                role: snap.role,
                state: snap.state,
            });
        }
        let _ = entry.control.send(decision);
        Ok(())
    }

    async fn update(&self, snapshot: &JobSnapshot) {
        if let Some(entry) = self.jobs.lock().await.get_mut(&snapshot.slot) {
            entry.snapshot = snapshot.clone();
        }
    }
}

/// Everything a job's task owns besides its socket: its snapshot, the way back to
/// the table and host, and its control channel. Moves from role to role.
pub struct JobContext {
    pub snapshot: JobSnapshot,
    table: JobTable,
    sink: Arc<dyn JobSink>,
    control: mpsc::UnboundedReceiver<Control>,
    control_closed: bool,
    pub settings: Arc<EngineSettings>,
}

impl JobContext {
    pub fn slot(&self) -> usize {
        self.snapshot.slot
    }

    /// Publish the current snapshot to the table and the host.
    pub async fn push(&self) {
        self.table.update(&self.snapshot).await;
        self.sink.job_state(&self.snapshot);
    }

    pub async fn set_state(&mut self, state: JobState) {
        self.snapshot.state = state;
        self.push().await;
    }

    /// Terminal transition; the caller has already released socket and file handle.
    pub async fn finish(&mut self, state: JobState) {
        debug_assert!(state.is_terminal());
        self.snapshot.state = state;
        self.snapshot.closed = true;
        self.snapshot.speed = 0;
        self.push().await;
    }

    /// Next command from the registry. A dropped registry reads as one `Cancel`,
    /// after which this never resolves.
    pub async fn next_control(&mut self) -> Control {
        if self.control_closed {
            return std::future::pending().await;
        }
        match self.control.recv().await {
            Some(c) => c,
            None => {
                self.control_closed = true;
                Control::Cancel
            }
        }
    }
}

/// The job's current state machine. Negotiation roles turn into transfer roles by
/// value: the old variant is consumed and its socket moves into the new one.
pub enum Role {
    OutboundPending(OutboundPending),
    InboundPending(InboundPending),
    Sender(ActiveSender),
    Receiver(ActiveReceiver),
}

/// Drive one job from its first role to a terminal state.
pub async fn run_job(mut role: Role) {
    loop {
        role = match role {
            Role::OutboundPending(p) => match p.negotiate().await {
                Some(next) => next,
                None => return,
            },
            Role::InboundPending(p) => match p.negotiate().await {
                Some(next) => next,
                None => return,
            },
            Role::Sender(s) => return s.run().await,
            Role::Receiver(r) => return r.run().await,
        }
    }
}
