//! Outbound registry: jobs this host starts against a peer's listener.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use peadrop_core::{Direction, JobRole, JobSnapshot};
use tracing::info;

use crate::engine::{run_job, Engine, EngineError, JobTable, Role};
use crate::items::flatten_items;
use crate::negotiation::{OutboundPending, Request};

pub struct Initiator {
    engine: Engine,
    jobs: JobTable,
}

impl Initiator {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            jobs: JobTable::default(),
        }
    }

    /// Offer `roots` (files or directories) to the peer at `peer_ip`. The slot is taken
    /// before anything touches the network; a full pool refuses the start outright.
    pub async fn start_send(
        &self,
        identity: &str,
        roots: &[PathBuf],
        peer_ip: IpAddr,
        peer_id: &str,
    ) -> Result<usize, EngineError> {
        let slot = self.engine.acquire_slot().await?;
        let items = match flatten_items(roots).await {
            Ok(items) => items,
            Err(e) => {
                self.engine.release_slot(slot).await?;
                return Err(e.into());
            }
        };
        info!(slot, peer = %peer_ip, items = items.len(), "starting send");
        self.spawn(slot, Direction::Send, identity, peer_ip, peer_id, Request::Send { items })
            .await;
        Ok(slot)
    }

    /// Ask the peer at `peer_ip` to send us what it shares, into `recv_dir`.
    pub async fn start_receive(
        &self,
        identity: &str,
        peer_ip: IpAddr,
        peer_id: &str,
        recv_dir: PathBuf,
    ) -> Result<usize, EngineError> {
        let slot = self.engine.acquire_slot().await?;
        info!(slot, peer = %peer_ip, dir = %recv_dir.display(), "starting receive");
        self.spawn(
            slot,
            Direction::Receive,
            identity,
            peer_ip,
            peer_id,
            Request::Receive { recv_dir },
        )
        .await;
        Ok(slot)
    }

    async fn spawn(
        &self,
        slot: usize,
        direction: Direction,
        identity: &str,
        peer_ip: IpAddr,
        peer_id: &str,
        request: Request,
    ) {
        let ctx = self
            .engine
            .register(
                &self.jobs,
                slot,
                JobRole::OutboundPending,
                direction,
                peer_id,
                Some(peer_ip),
            )
            .await;
        let addr = SocketAddr::new(peer_ip, self.engine.settings().port);
        let pending = OutboundPending::new(ctx, addr, identity, request);
        tokio::spawn(run_job(Role::OutboundPending(pending)));
    }

    pub async fn end_job(&self, slot: usize) -> Result<(), EngineError> {
        self.jobs.end_job(slot).await
    }

    pub async fn delete_job(&self, slot: usize) -> Result<(), EngineError> {
        self.engine.delete_job(&self.jobs, slot).await
    }

    pub async fn snapshot(&self, slot: usize) -> Option<JobSnapshot> {
        self.jobs.snapshot(slot).await
    }

    pub async fn snapshots(&self) -> Vec<JobSnapshot> {
        self.jobs.snapshots().await
    }
}
