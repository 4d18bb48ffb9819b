//! Channel-backed `JobSink`: turns engine pushes into events the host loop consumes.

use peadrop_core::{JobSink, JobSnapshot};
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub enum EngineEvent {
    State(JobSnapshot),
    Count(usize),
    Removed(usize),
}

pub struct ChannelSink {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl JobSink for ChannelSink {
    fn job_state(&self, snapshot: &JobSnapshot) {
        let _ = self.tx.send(EngineEvent::State(snapshot.clone()));
    }

    fn job_count_changed(&self, count: usize) {
        let _ = self.tx.send(EngineEvent::Count(count));
    }

    fn job_removed(&self, slot: usize) {
        let _ = self.tx.send(EngineEvent::Removed(slot));
    }
}
