//! Pre-acceptance roles. Both hold the socket until the request is accepted
//! (and the role turns into a sender or receiver), rejected or cancelled.

use std::net::SocketAddr;
use std::path::PathBuf;

use peadrop_core::{Direction, Frame, Header, Item, JobRole, JobState, APP_NAME};
use tracing::{debug, info, warn};

use crate::conn::{ConnError, FramedConn};
use crate::engine::{Control, JobContext, Role};
use crate::receiver::ActiveReceiver;
use crate::sender::ActiveSender;

/// What the initiator asked for.
pub enum Request {
    Send { items: Vec<Item> },
    Receive { recv_dir: PathBuf },
}

/// Initiator side: connect, send the request, wait for `ok`/`no`/`end`.
pub struct OutboundPending {
    ctx: JobContext,
    addr: SocketAddr,
    identity: String,
    request: Request,
}

impl OutboundPending {
    pub fn new(ctx: JobContext, addr: SocketAddr, identity: &str, request: Request) -> Self {
        Self {
            ctx,
            addr,
            identity: identity.to_string(),
            request,
        }
    }

    /// Run the handshake. Returns the transfer role on acceptance, None once terminal.
    pub async fn negotiate(mut self) -> Option<Role> {
        let slot = self.ctx.slot();
        let connect = FramedConn::connect(self.addr);
        tokio::pin!(connect);
        let mut conn = loop {
            tokio::select! {
                res = &mut connect => match res {
                    Ok(conn) => break conn,
                    Err(e) => {
                        warn!(slot, peer = %self.addr, error = %e, "connect failed");
                        self.ctx.finish(JobState::NetworkError).await;
                        return None;
                    }
                },
                ctl = self.ctx.next_control() => match ctl {
                    Control::Cancel => {
                        // Nothing exchanged yet: no end frame to send.
                        info!(slot, "cancelled before connecting");
                        self.ctx.finish(JobState::Cancelled).await;
                        return None;
                    }
                    other => debug!(slot, ?other, "ignoring control while connecting"),
                },
            }
        };

        let header = match &self.request {
            Request::Send { items } => Header::send_request(&self.identity, items.len()),
            Request::Receive { .. } => Header::recv_request(&self.identity),
        };
        if let Err(e) = conn.send(&header).await {
            warn!(slot, error = %e, "request write failed");
            self.ctx.finish(JobState::NetworkError).await;
            return None;
        }
        debug!(slot, peer = %self.addr, class = header.class(), "request sent");

        loop {
            tokio::select! {
                frame = conn.recv(None) => return self.on_reply(conn, frame).await,
                ctl = self.ctx.next_control() => match ctl {
                    Control::Cancel => {
                        cancel(&mut self.ctx, &mut conn).await;
                        return None;
                    }
                    other => debug!(slot, ?other, "ignoring control on outbound request"),
                },
            }
        }
    }

    async fn on_reply(
        mut self,
        mut conn: FramedConn,
        frame: Result<Frame, ConnError>,
    ) -> Option<Role> {
        let slot = self.ctx.slot();
        match frame {
            Ok(Frame {
                header: Header::Ok { size: None, num_items },
                ..
            }) => {
                info!(slot, peer = %self.addr, "request accepted");
                Some(match self.request {
                    Request::Send { items } => {
                        Role::Sender(ActiveSender::new(self.ctx, conn, items))
                    }
                    Request::Receive { recv_dir } => Role::Receiver(ActiveReceiver::new(
                        self.ctx,
                        conn,
                        recv_dir,
                        num_items.unwrap_or(0),
                    )),
                })
            }
            Ok(Frame {
                header: Header::No, ..
            }) => {
                info!(slot, peer = %self.addr, "request rejected");
                conn.shutdown().await;
                self.ctx.finish(JobState::Rejected).await;
                None
            }
            Ok(Frame {
                header: Header::End,
                ..
            }) => {
                info!(slot, peer = %self.addr, "peer cancelled the request");
                conn.shutdown().await;
                self.ctx.finish(JobState::Cancelled).await;
                None
            }
            Ok(frame) => {
                warn!(slot, class = frame.header.class(), "unexpected reply");
                self.ctx.finish(JobState::NetworkError).await;
                None
            }
            Err(e) => {
                warn!(slot, error = %e, "no reply to request");
                self.ctx.finish(JobState::NetworkError).await;
                None
            }
        }
    }
}

/// Listener side: a classified request waiting for the local user's decision.
pub struct InboundPending {
    ctx: JobContext,
    conn: FramedConn,
    num_items: usize,
}

impl InboundPending {
    pub fn new(mut ctx: JobContext, conn: FramedConn, num_items: usize) -> Self {
        ctx.snapshot.role = JobRole::InboundPending;
        ctx.snapshot.items_total = num_items;
        Self {
            ctx,
            conn,
            num_items,
        }
    }

    pub async fn negotiate(mut self) -> Option<Role> {
        let slot = self.ctx.slot();
        let direction = self.ctx.snapshot.direction;
        loop {
            tokio::select! {
                ctl = self.ctx.next_control() => match ctl {
                    Control::AcceptSend { recv_dir } if direction == Direction::Send => {
                        if let Err(e) = self.conn.send(&Header::ack()).await {
                            warn!(slot, error = %e, "accept write failed");
                            self.ctx.finish(JobState::NetworkError).await;
                            return None;
                        }
                        info!(slot, dir = %recv_dir.display(), "send request accepted");
                        return Some(Role::Receiver(ActiveReceiver::new(
                            self.ctx,
                            self.conn,
                            recv_dir,
                            self.num_items,
                        )));
                    }
                    Control::AcceptRecv { items } if direction == Direction::Receive => {
                        let header = Header::accept_with_items(items.len());
                        if let Err(e) = self.conn.send(&header).await {
                            warn!(slot, error = %e, "accept write failed");
                            self.ctx.finish(JobState::NetworkError).await;
                            return None;
                        }
                        info!(slot, items = items.len(), "recv request accepted");
                        return Some(Role::Sender(ActiveSender::new(self.ctx, self.conn, items)));
                    }
                    Control::Reject => {
                        self.reject().await;
                        return None;
                    }
                    Control::Cancel => {
                        cancel(&mut self.ctx, &mut self.conn).await;
                        return None;
                    }
                    other => warn!(slot, ?other, "decision does not match request direction"),
                },
                frame = self.conn.recv(None) => {
                    match frame {
                        Ok(Frame { header: Header::End, .. }) => {
                            info!(slot, "peer withdrew the request");
                            self.conn.shutdown().await;
                            self.ctx.finish(JobState::Cancelled).await;
                        }
                        Ok(frame) => {
                            warn!(slot, class = frame.header.class(), "unexpected frame while pending");
                            self.ctx.finish(JobState::NetworkError).await;
                        }
                        Err(e) => {
                            warn!(slot, error = %e, "connection lost while pending");
                            self.ctx.finish(JobState::NetworkError).await;
                        }
                    }
                    return None;
                }
            }
        }
    }

    async fn reject(&mut self) {
        let slot = self.ctx.slot();
        match self.conn.send(&Header::No).await {
            Ok(()) => {
                info!(slot, "request rejected");
                self.conn.shutdown().await;
                self.ctx.finish(JobState::Rejected).await;
            }
            Err(e) => {
                warn!(slot, error = %e, "reject write failed");
                self.ctx.finish(JobState::NetworkError).await;
            }
        }
    }
}

/// Parse and validate the first header of an inbound connection.
/// Returns (direction, peer id, announced item count).
pub fn classify(frame: &Frame) -> Option<(Direction, String, usize)> {
    match &frame.header {
        Header::SendRequest {
            app, id, num_items, ..
        } if app == APP_NAME => Some((Direction::Send, id.clone(), *num_items)),
        Header::RecvRequest { app, id, .. } if app == APP_NAME => {
            Some((Direction::Receive, id.clone(), 0))
        }
        _ => None,
    }
}

/// Either side, before acceptance: write `end`, then wait for the peer to hang up.
/// The close that follows is expected and does not count as a network error.
async fn cancel(ctx: &mut JobContext, conn: &mut FramedConn) {
    let slot = ctx.slot();
    if let Err(e) = conn.send(&Header::End).await {
        warn!(slot, error = %e, "end write failed");
        ctx.finish(JobState::NetworkError).await;
        return;
    }
    info!(slot, "request cancelled");
    conn.shutdown().await;
    let grace = ctx.settings.idle_timeout;
    conn.drain_until_closed(grace).await;
    ctx.finish(JobState::Cancelled).await;
}
