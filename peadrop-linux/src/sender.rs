//! Active sender: streams the item list one frame at a time, each frame waiting for
//! the peer's reply before the next step.

use std::time::Instant;

use peadrop_core::{
    Frame, Header, Item, ItemKind, JobRole, JobState, Throughput, TransferCursor,
    MAX_PAYLOAD_LEN,
};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use crate::conn::FramedConn;
use crate::engine::{Control, JobContext};

enum Step {
    /// A frame is out; wait for the peer's reply.
    AwaitReply,
    Finished(JobState),
}

pub struct ActiveSender {
    ctx: JobContext,
    conn: FramedConn,
    items: Vec<Item>,
    cursor: TransferCursor,
    file: Option<File>,
    /// Index of the item the outstanding frame belongs to.
    awaiting: Option<usize>,
    cancel_requested: bool,
    throughput: Throughput,
    buf: Vec<u8>,
}

impl ActiveSender {
    pub fn new(mut ctx: JobContext, conn: FramedConn, items: Vec<Item>) -> Self {
        ctx.snapshot.role = JobRole::Sender;
        ctx.snapshot.items_total = items.len();
        ctx.snapshot.items_done = 0;
        let chunk_size = ctx.settings.chunk_size.clamp(1, MAX_PAYLOAD_LEN as usize);
        Self {
            ctx,
            conn,
            cursor: TransferCursor::new(items.len()),
            items,
            file: None,
            awaiting: None,
            cancel_requested: false,
            throughput: Throughput::new(Instant::now()),
            buf: vec![0u8; chunk_size],
        }
    }

    pub async fn run(mut self) {
        info!(slot = self.ctx.slot(), peer = %self.conn.peer_addr(), items = self.items.len(), "sending");
        self.ctx.set_state(JobState::Sending).await;
        let state = self.stream_items().await;
        self.close_file();
        if matches!(state, JobState::Complete | JobState::LocallyEnded) {
            self.conn.shutdown().await;
            self.conn.drain_until_closed(self.ctx.settings.idle_timeout).await;
        }
        self.refresh_progress();
        info!(slot = self.ctx.slot(), ?state, "send finished");
        self.ctx.finish(state).await;
    }

    async fn stream_items(&mut self) -> JobState {
        let period = self.ctx.settings.push_interval;
        let idle = self.ctx.settings.idle_timeout;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        if let Step::Finished(state) = self.step().await {
            return state;
        }
        // Moves only when a reply arrives; ticks and controls leave it alone.
        let mut deadline = tokio::time::Instant::now() + idle;
        loop {
            tokio::select! {
                frame = self.conn.recv(None) => {
                    let step = match frame {
                        Ok(Frame { header: Header::Ok { size: None, .. }, .. }) => self.step().await,
                        Ok(Frame { header: Header::Skip, .. }) => {
                            self.skip_awaited();
                            self.step().await
                        }
                        Ok(Frame { header: Header::End, .. }) => {
                            info!(slot = self.ctx.slot(), "peer ended the transfer");
                            return JobState::PeerEnded;
                        }
                        Ok(frame) => {
                            warn!(slot = self.ctx.slot(), class = frame.header.class(), "unexpected reply");
                            return JobState::NetworkError;
                        }
                        Err(e) => {
                            warn!(slot = self.ctx.slot(), error = %e, "connection failed");
                            return JobState::NetworkError;
                        }
                    };
                    if let Step::Finished(state) = step {
                        return state;
                    }
                    deadline = tokio::time::Instant::now() + idle;
                }
                ctl = self.ctx.next_control() => match ctl {
                    Control::Cancel => {
                        debug!(slot = self.ctx.slot(), "cancel requested");
                        self.cancel_requested = true;
                    }
                    other => debug!(slot = self.ctx.slot(), ?other, "ignoring control while sending"),
                },
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(slot = self.ctx.slot(), ?idle, "peer went silent");
                    return JobState::NetworkError;
                }
                _ = ticker.tick() => {
                    self.ctx.snapshot.speed = self.throughput.speed(Instant::now());
                    self.refresh_progress();
                    self.ctx.push().await;
                }
            }
        }
    }

    /// Emit the next frame. Items that cannot be stat'ed, opened or fully read are
    /// passed over without a frame and the next item is tried straight away.
    async fn step(&mut self) -> Step {
        loop {
            if self.cancel_requested {
                self.close_file();
                return match self.conn.send(&Header::End).await {
                    Ok(()) => Step::Finished(JobState::LocallyEnded),
                    Err(e) => {
                        warn!(slot = self.ctx.slot(), error = %e, "end write failed");
                        Step::Finished(JobState::NetworkError)
                    }
                };
            }
            if self.cursor.is_exhausted() {
                return match self.conn.send(&Header::Done).await {
                    Ok(()) => Step::Finished(JobState::Complete),
                    Err(e) => {
                        warn!(slot = self.ctx.slot(), error = %e, "done write failed");
                        Step::Finished(JobState::NetworkError)
                    }
                };
            }
            let index = self.cursor.index();
            let sent = if self.file.is_none() {
                self.announce(index).await
            } else {
                self.send_chunk(index).await
            };
            match sent {
                Ok(true) => {
                    self.awaiting = Some(index);
                    return Step::AwaitReply;
                }
                Ok(false) => continue,
                Err(state) => return Step::Finished(state),
            }
        }
    }

    /// Announce the current item. Ok(false) if it vanished and the cursor moved on.
    async fn announce(&mut self, index: usize) -> Result<bool, JobState> {
        let item = &self.items[index];
        let Some(path) = item.path.clone() else {
            self.cursor.advance();
            return Ok(false);
        };
        let meta = match tokio::fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) => {
                debug!(slot = self.ctx.slot(), path = %path.display(), error = %e, "item vanished, skipping");
                self.cursor.advance();
                return Ok(false);
            }
        };
        self.ctx.snapshot.current_item = Some(item.relative_path());

        if meta.is_dir() || item.kind == ItemKind::Directory {
            if !meta.is_dir() {
                debug!(slot = self.ctx.slot(), path = %path.display(), "directory became a file, skipping");
                self.cursor.advance();
                return Ok(false);
            }
            let header = Item {
                kind: ItemKind::Directory,
                ..item.clone()
            }
            .announcement(None);
            self.write(&header).await?;
            self.cursor.advance();
            return Ok(true);
        }

        let file = match File::open(&path).await {
            Ok(f) => f,
            Err(e) => {
                debug!(slot = self.ctx.slot(), path = %path.display(), error = %e, "cannot open, skipping");
                self.cursor.advance();
                return Ok(false);
            }
        };
        let size = meta.len();
        let header = item.announcement(Some(size));
        self.write(&header).await?;
        self.file = Some(file);
        self.cursor.begin_item(size);
        Ok(true)
    }

    /// Send the next chunk of the open file. Ok(false) if the file turned out
    /// complete or changed under us and was closed without a frame.
    async fn send_chunk(&mut self, index: usize) -> Result<bool, JobState> {
        if self.cursor.item_complete() {
            self.close_file();
            self.cursor.advance();
            return Ok(false);
        }
        let Some(file) = self.file.as_mut() else {
            return Ok(false);
        };
        let n = match file.read(&mut self.buf).await {
            Ok(n) => n,
            Err(e) => {
                warn!(slot = self.ctx.slot(), item = index, error = %e, "read failed, skipping item");
                self.close_file();
                self.cursor.advance();
                return Ok(false);
            }
        };
        if n == 0 || n as u64 > self.cursor.remaining() {
            warn!(
                slot = self.ctx.slot(),
                item = index,
                declared = self.cursor.declared(),
                sent = self.cursor.bytes_done(),
                "file changed while sending, skipping item"
            );
            self.close_file();
            self.cursor.advance();
            return Ok(false);
        }
        if let Err(e) = self.conn.send_chunk(&self.buf[..n]).await {
            warn!(slot = self.ctx.slot(), error = %e, "chunk write failed");
            return Err(JobState::NetworkError);
        }
        self.cursor.record(n as u64);
        self.throughput.record(n as u64);
        if self.cursor.item_complete() {
            self.close_file();
            self.cursor.advance();
        }
        Ok(true)
    }

    async fn write(&mut self, header: &Header) -> Result<(), JobState> {
        self.conn.send(header).await.map_err(|e| {
            warn!(slot = self.ctx.slot(), error = %e, "write failed");
            JobState::NetworkError
        })
    }

    /// The peer refused the item our last frame belonged to. If we are still on it,
    /// drop it; if the cursor already moved past it there is nothing left to undo.
    fn skip_awaited(&mut self) {
        if self.awaiting == Some(self.cursor.index()) && !self.cursor.is_exhausted() {
            debug!(slot = self.ctx.slot(), item = self.cursor.index(), "peer skipped item");
            self.close_file();
            self.cursor.advance();
        }
    }

    fn close_file(&mut self) {
        self.file = None;
    }

    fn refresh_progress(&mut self) {
        let snap = &mut self.ctx.snapshot;
        snap.items_done = self.cursor.index().min(self.cursor.total());
        snap.item_progress = self.cursor.item_progress();
        snap.total_progress = self.cursor.total_progress();
    }
}
