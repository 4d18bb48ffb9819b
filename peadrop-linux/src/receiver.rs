//! Active receiver: rebuilds the announced tree under the receive directory, replying
//! to every header so the sender can move on.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Instant;

use peadrop_core::item::{join_relative, target_path};
use peadrop_core::{Frame, Header, ItemKind, JobRole, JobState, Throughput, TransferCursor};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::conn::FramedConn;
use crate::engine::{Control, JobContext};

/// The reply owed to the sender for the header just handled, or the end of the job.
enum Reply {
    Ack,
    Skip,
    Finished(JobState),
}

/// A file being written. Only held while still short of its declared size.
struct Partial {
    file: File,
    path: PathBuf,
}

pub struct ActiveReceiver {
    ctx: JobContext,
    conn: FramedConn,
    root: PathBuf,
    cursor: TransferCursor,
    partial: Option<Partial>,
    throughput: Throughput,
}

impl ActiveReceiver {
    pub fn new(mut ctx: JobContext, conn: FramedConn, root: PathBuf, num_items: usize) -> Self {
        ctx.snapshot.role = JobRole::Receiver;
        ctx.snapshot.items_total = num_items;
        ctx.snapshot.items_done = 0;
        Self {
            ctx,
            conn,
            root,
            cursor: TransferCursor::new(num_items),
            partial: None,
            throughput: Throughput::new(Instant::now()),
        }
    }

    pub async fn run(mut self) {
        info!(slot = self.ctx.slot(), peer = %self.conn.peer_addr(), dir = %self.root.display(), "receiving");
        self.ctx.set_state(JobState::Receiving).await;
        let state = match tokio::fs::create_dir_all(&self.root).await {
            Ok(()) => self.receive_items().await,
            Err(e) => {
                warn!(slot = self.ctx.slot(), dir = %self.root.display(), error = %e, "cannot create receive directory");
                let _ = self.conn.send(&Header::End).await;
                JobState::FilesystemError
            }
        };
        self.discard_partial().await;
        match state {
            JobState::LocallyEnded => {
                self.conn.shutdown().await;
                self.conn.drain_until_closed(self.ctx.settings.idle_timeout).await;
            }
            JobState::Complete | JobState::PeerEnded | JobState::FilesystemError => {
                self.conn.shutdown().await;
            }
            _ => {}
        }
        self.refresh_progress();
        if state == JobState::Complete {
            // Items the sender passed over never reach us; done means all of them.
            let snap = &mut self.ctx.snapshot;
            snap.items_done = snap.items_total;
            snap.item_progress = 100;
            snap.total_progress = 100;
        }
        info!(slot = self.ctx.slot(), ?state, "receive finished");
        self.ctx.finish(state).await;
    }

    async fn receive_items(&mut self) -> JobState {
        let period = self.ctx.settings.push_interval;
        let idle = self.ctx.settings.idle_timeout;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        // Moves only when a frame arrives; ticks and controls leave it alone.
        let mut deadline = tokio::time::Instant::now() + idle;

        loop {
            tokio::select! {
                frame = self.conn.recv(None) => {
                    let frame = match frame {
                        Ok(f) => {
                            deadline = tokio::time::Instant::now() + idle;
                            f
                        }
                        Err(e) => {
                            warn!(slot = self.ctx.slot(), error = %e, "connection failed");
                            return JobState::NetworkError;
                        }
                    };
                    let reply = match self.on_frame(frame).await {
                        Reply::Ack => Header::ack(),
                        Reply::Skip => Header::Skip,
                        Reply::Finished(state) => return state,
                    };
                    if let Err(e) = self.conn.send(&reply).await {
                        warn!(slot = self.ctx.slot(), error = %e, "reply write failed");
                        return JobState::NetworkError;
                    }
                }
                ctl = self.ctx.next_control() => match ctl {
                    Control::Cancel => {
                        self.discard_partial().await;
                        return match self.conn.send(&Header::End).await {
                            Ok(()) => JobState::LocallyEnded,
                            Err(e) => {
                                warn!(slot = self.ctx.slot(), error = %e, "end write failed");
                                JobState::NetworkError
                            }
                        };
                    }
                    other => debug!(slot = self.ctx.slot(), ?other, "ignoring control while receiving"),
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

    async fn on_frame(&mut self, frame: Frame) -> Reply {
        let slot = self.ctx.slot();
        match frame.header {
            Header::New {
                name,
                relative_parent_path,
                kind,
                size,
            } => {
                if self.partial.is_some() {
                    self.discard_partial().await;
                    self.cursor.advance();
                }
                let Some(target) = target_path(&self.root, &relative_parent_path, &name) else {
                    warn!(slot, name = %name, parent = %relative_parent_path, "refusing unsafe item path");
                    self.cursor.advance();
                    return Reply::Skip;
                };
                self.ctx.snapshot.current_item = Some(join_relative(&relative_parent_path, &name));
                match kind {
                    ItemKind::Directory => self.make_dir(target).await,
                    ItemKind::File => self.create_file(target, size.unwrap_or(0)).await,
                }
            }
            Header::Ok {
                size: Some(_), ..
            } => self.append(&frame.payload).await,
            Header::Done => {
                info!(slot, items = self.cursor.index(), "sender done");
                Reply::Finished(JobState::Complete)
            }
            Header::End => {
                info!(slot, "peer ended the transfer");
                Reply::Finished(JobState::PeerEnded)
            }
            other => {
                warn!(slot, class = other.class(), "unexpected frame while receiving");
                Reply::Finished(JobState::NetworkError)
            }
        }
    }

    async fn make_dir(&mut self, target: PathBuf) -> Reply {
        match tokio::fs::create_dir(&target).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!(slot = self.ctx.slot(), dir = %target.display(), "directory already exists");
            }
            Err(e) => {
                warn!(slot = self.ctx.slot(), dir = %target.display(), error = %e, "cannot create directory");
                let _ = self.conn.send(&Header::End).await;
                return Reply::Finished(JobState::FilesystemError);
            }
        }
        self.cursor.advance();
        Reply::Ack
    }

    async fn create_file(&mut self, target: PathBuf, size: u64) -> Reply {
        let file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&target)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                debug!(slot = self.ctx.slot(), path = %target.display(), error = %e, "skipping file");
                self.cursor.advance();
                return Reply::Skip;
            }
        };
        self.cursor.begin_item(size);
        if size == 0 {
            drop(file);
            self.cursor.advance();
        } else {
            self.partial = Some(Partial { file, path: target });
        }
        Reply::Ack
    }

    async fn append(&mut self, payload: &[u8]) -> Reply {
        let slot = self.ctx.slot();
        let Some(partial) = self.partial.as_mut() else {
            debug!(slot, len = payload.len(), "chunk without an open file");
            return Reply::Skip;
        };
        if payload.len() as u64 > self.cursor.remaining() {
            warn!(slot, path = %partial.path.display(), "chunk overruns declared size");
            self.discard_partial().await;
            self.cursor.advance();
            return Reply::Skip;
        }
        let written = async {
            partial.file.write_all(payload).await?;
            partial.file.flush().await
        }
        .await;
        if let Err(e) = written {
            warn!(slot, path = %partial.path.display(), error = %e, "append failed, skipping item");
            self.discard_partial().await;
            self.cursor.advance();
            return Reply::Skip;
        }
        self.cursor.record(payload.len() as u64);
        self.throughput.record(payload.len() as u64);
        if self.cursor.item_complete() {
            self.partial = None;
            self.cursor.advance();
        }
        Reply::Ack
    }

    /// Close and remove a file that never reached its declared size.
    async fn discard_partial(&mut self) {
        if let Some(Partial { file, path }) = self.partial.take() {
            drop(file);
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(slot = self.ctx.slot(), path = %path.display(), error = %e, "cannot remove partial file");
            } else {
                debug!(slot = self.ctx.slot(), path = %path.display(), "removed partial file");
            }
        }
    }

    fn refresh_progress(&mut self) {
        let snap = &mut self.ctx.snapshot;
        snap.items_total = self.cursor.total();
        snap.items_done = self.cursor.index().min(self.cursor.total());
        snap.item_progress = self.cursor.item_progress();
        snap.total_progress = self.cursor.total_progress();
    }
}
