//! Inbound registry: accepts peer connections on one local network, classifies each
//! by its first header and parks it as a pending request until the user decides.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use peadrop_core::{Direction, JobRole, JobSnapshot, Presence};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::conn::FramedConn;
use crate::discovery::{LocalNetwork, Responder};
use crate::engine::{run_job, Control, Engine, EngineError, JobTable, Role};
use crate::items::flatten_items;
use crate::negotiation::{classify, InboundPending};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Listening,
    /// Accepting failed; new connections are no longer taken.
    Error,
    Closed,
}

pub struct Listener {
    engine: Engine,
    jobs: JobTable,
    state: Arc<Mutex<ListenerState>>,
    local_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl Listener {
    /// Bind the TCP listener on `ip` and the discovery responder on the same port.
    pub async fn open(
        engine: Engine,
        ip: Ipv4Addr,
        netmask: Ipv4Addr,
        identity: &str,
    ) -> Result<Self, EngineError> {
        let tcp = TcpListener::bind((ip, engine.settings().port)).await?;
        let local_addr = tcp.local_addr()?;
        let network = LocalNetwork::new(ip, netmask);
        let responder = Responder::bind(
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, local_addr.port())),
            &Presence::local(identity),
            Some(network),
        )
        .await?;
        info!(addr = %local_addr, broadcast = %network.broadcast(), "listening");

        let jobs = JobTable::default();
        let state = Arc::new(Mutex::new(ListenerState::Listening));
        let accept = tokio::spawn(accept_loop(
            tcp,
            engine.clone(),
            jobs.clone(),
            state.clone(),
        ));
        let respond = tokio::spawn(async move {
            if let Err(e) = responder.run().await {
                warn!(error = %e, "discovery responder stopped");
            }
        });
        Ok(Self {
            engine,
            jobs,
            state,
            local_addr,
            tasks: vec![accept, respond],
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn state(&self) -> ListenerState {
        *self.state.lock().await
    }

    /// Accept a pending send request; files land under `recv_dir`.
    pub async fn accept_send_request(&self, slot: usize, recv_dir: PathBuf) -> Result<(), EngineError> {
        self.jobs
            .decide(slot, Some(Direction::Send), Control::AcceptSend { recv_dir })
            .await
    }

    /// Accept a pending receive request by offering `roots`.
    pub async fn accept_recv_request(&self, slot: usize, roots: &[PathBuf]) -> Result<(), EngineError> {
        let items = flatten_items(roots).await?;
        self.jobs
            .decide(slot, Some(Direction::Receive), Control::AcceptRecv { items })
            .await
    }

    pub async fn reject_request(&self, slot: usize) -> Result<(), EngineError> {
        self.jobs.decide(slot, None, Control::Reject).await
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

    /// Stop taking connections and answering probes. Jobs already running continue.
    pub async fn close(&mut self) {
        *self.state.lock().await = ListenerState::Closed;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        info!(addr = %self.local_addr, "listener closed");
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn accept_loop(
    tcp: TcpListener,
    engine: Engine,
    jobs: JobTable,
    state: Arc<Mutex<ListenerState>>,
) {
    loop {
        let (stream, peer) = match tcp.accept().await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "accept failed, listener is in error state");
                *state.lock().await = ListenerState::Error;
                return;
            }
        };
        if *state.lock().await != ListenerState::Listening {
            debug!(%peer, "not listening, dropping connection");
            continue;
        }
        let slot = match engine.acquire_slot().await {
            Ok(slot) => slot,
            Err(e) => {
                info!(%peer, error = %e, "refusing connection");
                continue;
            }
        };
        tokio::spawn(admit(stream, peer, slot, engine.clone(), jobs.clone()));
    }
}

/// Read and classify the first header, then park the connection as a pending job.
/// Anything else releases the slot and drops the connection.
async fn admit(stream: TcpStream, peer: SocketAddr, slot: usize, engine: Engine, jobs: JobTable) {
    let idle = engine.settings().idle_timeout;
    let mut conn = match FramedConn::new(stream) {
        Ok(c) => c,
        Err(e) => {
            warn!(%peer, error = %e, "cannot set up connection");
            let _ = engine.release_slot(slot).await;
            return;
        }
    };
    let request = match conn.recv(Some(idle)).await {
        Ok(frame) => classify(&frame),
        Err(e) => {
            debug!(%peer, error = %e, "no request header");
            None
        }
    };
    let Some((direction, peer_id, num_items)) = request else {
        warn!(%peer, "dropping connection without a valid request");
        let _ = engine.release_slot(slot).await;
        return;
    };
    info!(slot, %peer, peer_id = %peer_id, ?direction, num_items, "incoming request");
    let ctx = engine
        .register(
            &jobs,
            slot,
            JobRole::InboundPending,
            direction,
            &peer_id,
            Some(peer.ip()),
        )
        .await;
    run_job(Role::InboundPending(InboundPending::new(ctx, conn, num_items))).await;
}
