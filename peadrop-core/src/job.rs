//! Job states, the snapshot pushed to the host, and the host-side sink.

use std::net::IpAddr;

use serde::Serialize;

/// Which state machine currently holds the job's socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobRole {
    OutboundPending,
    InboundPending,
    Sender,
    Receiver,
}

/// What the initiator asked for (or what an inbound request asks of us).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    /// Items flow from the initiator to the listener.
    Send,
    /// Items flow from the listener to the initiator.
    Receive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    /// Negotiation: waiting for a decision.
    Pending,
    /// Negotiation: the listener declined.
    Rejected,
    /// Negotiation: either side sent `end` before acceptance.
    Cancelled,
    Sending,
    Receiving,
    /// Every item was offered and `done` was exchanged.
    Complete,
    /// The peer sent `end` mid-transfer.
    PeerEnded,
    /// We cancelled mid-transfer.
    LocallyEnded,
    /// Malformed frame, unexpected close, write failure or idle timeout.
    NetworkError,
    /// Local filesystem failure that cannot be confined to one item.
    FilesystemError,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        !matches!(
            self,
            JobState::Pending | JobState::Sending | JobState::Receiving
        )
    }

    pub fn is_active(self) -> bool {
        matches!(self, JobState::Sending | JobState::Receiving)
    }
}

/// State pushed to the host on every mutation and periodically while transferring.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSnapshot {
    pub slot: usize,
    pub role: JobRole,
    pub direction: Direction,
    pub state: JobState,
    pub peer_id: String,
    pub peer_ip: Option<IpAddr>,
    /// Items completed or skipped.
    pub items_done: usize,
    pub items_total: usize,
    /// Relative path of the item currently streaming.
    pub current_item: Option<String>,
    pub item_progress: u8,
    pub total_progress: u8,
    /// Bytes per second since the previous periodic push.
    pub speed: u64,
    /// True once the job's socket is gone; only then can the job be deleted.
    pub closed: bool,
}

impl JobSnapshot {
    pub fn new(slot: usize, role: JobRole, direction: Direction, peer_id: &str) -> Self {
        Self {
            slot,
            role,
            direction,
            state: JobState::Pending,
            peer_id: peer_id.to_string(),
            peer_ip: None,
            items_done: 0,
            items_total: 0,
            current_item: None,
            item_progress: 0,
            total_progress: 0,
            speed: 0,
            closed: false,
        }
    }

    pub fn is_deletable(&self) -> bool {
        self.state.is_terminal() && self.closed
    }
}

/// Host-side receiver of engine notifications. Called from the event loop; must not block.
pub trait JobSink: Send + Sync {
    fn job_state(&self, snapshot: &JobSnapshot);
    fn job_count_changed(&self, count: usize);
    fn job_removed(&self, slot: usize);
}

/// Sink that drops every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl JobSink for NullSink {
    fn job_state(&self, _snapshot: &JobSnapshot) {}
    fn job_count_changed(&self, _count: usize) {}
    fn job_removed(&self, _slot: usize) {}
}
