//! End-to-end runs over loopback: real listener and initiator registries, or one of
//! them against a hand-driven peer speaking frames directly.

use std::collections::BTreeMap;
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use peadrop_core::cursor::chunk_count;
use peadrop_core::{Direction, Header, ItemKind, JobRole, JobSnapshot, JobState, SlotError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::conn::{ConnError, FramedConn};
use crate::engine::{Engine, EngineError, EngineSettings};
use crate::initiator::Initiator;
use crate::listener::Listener;
use crate::sink::{ChannelSink, EngineEvent};

const WAIT: Duration = Duration::from_secs(10);
const CHUNK: usize = 1000;
const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn settings(port: u16, max_jobs: usize) -> EngineSettings {
    EngineSettings {
        port,
        max_jobs,
        chunk_size: CHUNK,
        idle_timeout: Duration::from_secs(5),
        push_interval: Duration::from_millis(50),
    }
}

/// One side's engine plus the events its sink saw.
struct Host {
    engine: Engine,
    events: UnboundedReceiver<EngineEvent>,
}

impl Host {
    fn new(settings: EngineSettings) -> Self {
        let (sink, events) = ChannelSink::new();
        Self {
            engine: Engine::new(settings, Arc::new(sink)),
            events,
        }
    }

    async fn wait_for(&mut self, pred: impl Fn(&JobSnapshot) -> bool) -> JobSnapshot {
        tokio::time::timeout(WAIT, async {
            loop {
                match self.events.recv().await {
                    Some(EngineEvent::State(s)) if pred(&s) => return s,
                    Some(_) => {}
                    None => panic!("sink dropped"),
                }
            }
        })
        .await
        .expect("timed out waiting for job state")
    }

    async fn wait_pending(&mut self) -> JobSnapshot {
        self.wait_for(|s| s.role == JobRole::InboundPending && s.state == JobState::Pending)
            .await
    }

    async fn wait_finished(&mut self, slot: usize) -> JobSnapshot {
        self.wait_for(|s| s.slot == slot && s.is_deletable()).await
    }
}

/// Short idle timeout spanning several snapshot ticks.
fn impatient(port: u16) -> EngineSettings {
    EngineSettings {
        idle_timeout: Duration::from_millis(300),
        push_interval: Duration::from_millis(50),
        ..settings(port, 4)
    }
}

async fn open_listener(max_jobs: usize) -> (Listener, Host) {
    open_listener_with(settings(0, max_jobs)).await
}

async fn open_listener_with(settings: EngineSettings) -> (Listener, Host) {
    let host = Host::new(settings);
    let listener = Listener::open(
        host.engine.clone(),
        Ipv4Addr::LOCALHOST,
        Ipv4Addr::new(255, 0, 0, 0),
        "listener",
    )
    .await
    .unwrap();
    (listener, host)
}

fn random_bytes(n: usize) -> Vec<u8> {
    (0..n).map(|_| rand::random::<u8>()).collect()
}

fn build_tree(root: &Path) {
    fs::create_dir_all(root.join("album/2023/summer")).unwrap();
    fs::create_dir_all(root.join("album/empty")).unwrap();
    fs::write(root.join("album/cover.jpg"), random_bytes(2500)).unwrap();
    fs::write(root.join("album/2023/a.txt"), b"a").unwrap();
    fs::write(root.join("album/2023/summer/beach.png"), random_bytes(3000)).unwrap();
    fs::write(root.join("notes.md"), b"").unwrap();
}

/// Relative path -> contents (None for directories).
fn tree(root: &Path) -> BTreeMap<String, Option<Vec<u8>>> {
    let mut out = BTreeMap::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir).unwrap() {
            let p = entry.unwrap().path();
            let rel = p.strip_prefix(root).unwrap().to_string_lossy().into_owned();
            if p.is_dir() {
                out.insert(rel, None);
                stack.push(p);
            } else {
                out.insert(rel, Some(fs::read(&p).unwrap()));
            }
        }
    }
    out
}

fn new_file(name: &str, parent: &str, size: u64) -> Header {
    Header::New {
        name: name.into(),
        relative_parent_path: parent.into(),
        kind: ItemKind::File,
        size: Some(size),
    }
}

fn new_dir(name: &str, parent: &str) -> Header {
    Header::New {
        name: name.into(),
        relative_parent_path: parent.into(),
        kind: ItemKind::Directory,
        size: None,
    }
}

async fn next_header(conn: &mut FramedConn) -> Header {
    conn.recv(Some(WAIT)).await.unwrap().header
}

/// Raw sender connected to `listener` whose request has been accepted into `dst`.
async fn accepted_raw_sender(
    listener: &Listener,
    host: &mut Host,
    dst: &Path,
    num_items: usize,
) -> (FramedConn, usize) {
    let mut raw = FramedConn::connect(listener.local_addr()).await.unwrap();
    raw.send(&Header::send_request("raw", num_items)).await.unwrap();
    let pending = host.wait_pending().await;
    assert_eq!(pending.peer_id, "raw");
    assert_eq!(pending.direction, Direction::Send);
    assert_eq!(pending.peer_ip, Some(LOCALHOST));
    listener
        .accept_send_request(pending.slot, dst.to_path_buf())
        .await
        .unwrap();
    assert_eq!(next_header(&mut raw).await, Header::ack());
    (raw, pending.slot)
}

#[tokio::test]
async fn send_tree_end_to_end() {
    let (listener, mut rx_host) = open_listener(4).await;
    let mut tx_host = Host::new(settings(listener.local_addr().port(), 4));
    let initiator = Initiator::new(tx_host.engine.clone());

    let src = tempfile::tempdir().unwrap();
    build_tree(src.path());
    let dst = tempfile::tempdir().unwrap();

    let out = initiator
        .start_send(
            "sender",
            &[src.path().join("album"), src.path().join("notes.md")],
            LOCALHOST,
            "listener",
        )
        .await
        .unwrap();
    let pending = rx_host.wait_pending().await;
    assert_eq!(pending.peer_id, "sender");
    listener
        .accept_send_request(pending.slot, dst.path().to_path_buf())
        .await
        .unwrap();

    let received = rx_host.wait_finished(pending.slot).await;
    assert_eq!(received.state, JobState::Complete);
    assert_eq!(received.role, JobRole::Receiver);
    assert_eq!(received.items_done, 8);
    assert_eq!(received.total_progress, 100);

    let sent = tx_host.wait_finished(out).await;
    assert_eq!(sent.state, JobState::Complete);
    assert_eq!(sent.role, JobRole::Sender);
    assert_eq!(sent.items_total, 8);

    assert_eq!(tree(src.path()), tree(dst.path()));

    initiator.delete_job(out).await.unwrap();
    listener.delete_job(pending.slot).await.unwrap();
    assert_eq!(tx_host.engine.jobs_in_use().await, 0);
    assert_eq!(rx_host.engine.jobs_in_use().await, 0);
    assert!(initiator.snapshot(out).await.is_none());
}

#[tokio::test]
async fn recv_request_end_to_end() {
    let (listener, mut rx_host) = open_listener(4).await;
    let mut tx_host = Host::new(settings(listener.local_addr().port(), 4));
    let initiator = Initiator::new(tx_host.engine.clone());

    let shared = tempfile::tempdir().unwrap();
    build_tree(shared.path());
    let dst = tempfile::tempdir().unwrap();

    let out = initiator
        .start_receive("fetcher", LOCALHOST, "listener", dst.path().to_path_buf())
        .await
        .unwrap();
    let pending = rx_host.wait_pending().await;
    assert_eq!(pending.direction, Direction::Receive);
    listener
        .accept_recv_request(
            pending.slot,
            &[shared.path().join("album"), shared.path().join("notes.md")],
        )
        .await
        .unwrap();

    let fetched = tx_host.wait_finished(out).await;
    assert_eq!(fetched.state, JobState::Complete);
    assert_eq!(fetched.role, JobRole::Receiver);
    assert_eq!(fetched.items_total, 8);
    let served = rx_host.wait_finished(pending.slot).await;
    assert_eq!(served.state, JobState::Complete);
    assert_eq!(served.role, JobRole::Sender);

    assert_eq!(tree(shared.path()), tree(dst.path()));
}

#[tokio::test]
async fn rejected_send_streams_nothing() {
    let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut host = Host::new(settings(server.local_addr().unwrap().port(), 4));
    let initiator = Initiator::new(host.engine.clone());
    let src = tempfile::tempdir().unwrap();
    build_tree(src.path());

    let slot = initiator
        .start_send("me", &[src.path().join("album")], LOCALHOST, "peer")
        .await
        .unwrap();
    let (stream, _) = server.accept().await.unwrap();
    let mut raw = FramedConn::new(stream).unwrap();
    match next_header(&mut raw).await {
        Header::SendRequest { id, num_items, .. } => {
            assert_eq!(id, "me");
            assert_eq!(num_items, 7);
        }
        other => panic!("unexpected {other:?}"),
    }
    raw.send(&Header::No).await.unwrap();
    assert!(matches!(raw.recv(Some(WAIT)).await, Err(ConnError::Closed)));

    let snap = host.wait_finished(slot).await;
    assert_eq!(snap.state, JobState::Rejected);
    assert_eq!(snap.role, JobRole::OutboundPending);
}

#[tokio::test]
async fn chunks_cover_the_file_exactly() {
    let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut host = Host::new(settings(server.local_addr().unwrap().port(), 4));
    let initiator = Initiator::new(host.engine.clone());
    let src = tempfile::tempdir().unwrap();
    let data = random_bytes(2 * CHUNK + 500);
    fs::write(src.path().join("data.bin"), &data).unwrap();

    let slot = initiator
        .start_send("me", &[src.path().join("data.bin")], LOCALHOST, "peer")
        .await
        .unwrap();
    let (stream, _) = server.accept().await.unwrap();
    let mut raw = FramedConn::new(stream).unwrap();
    assert!(matches!(
        next_header(&mut raw).await,
        Header::SendRequest { num_items: 1, .. }
    ));
    raw.send(&Header::ack()).await.unwrap();
    assert_eq!(
        next_header(&mut raw).await,
        new_file("data.bin", "", data.len() as u64)
    );
    raw.send(&Header::ack()).await.unwrap();

    let mut sizes = Vec::new();
    let mut received = Vec::new();
    loop {
        let frame = raw.recv(Some(WAIT)).await.unwrap();
        match frame.header {
            Header::Ok { size: Some(n), .. } => {
                assert_eq!(n as usize, frame.payload.len());
                sizes.push(n);
                received.extend_from_slice(&frame.payload);
                raw.send(&Header::ack()).await.unwrap();
            }
            Header::Done => break,
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(sizes.len() as u64, chunk_count(data.len() as u64, CHUNK));
    assert_eq!(sizes.iter().sum::<u64>(), data.len() as u64);
    assert_eq!(received, data);
    drop(raw);

    let snap = host.wait_finished(slot).await;
    assert_eq!(snap.state, JobState::Complete);
    assert_eq!(snap.item_progress, 100);
}

#[tokio::test]
async fn vanished_source_is_passed_over() {
    let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut host = Host::new(settings(server.local_addr().unwrap().port(), 4));
    let initiator = Initiator::new(host.engine.clone());
    let src = tempfile::tempdir().unwrap();
    fs::write(src.path().join("a.txt"), b"first").unwrap();
    fs::write(src.path().join("b.txt"), b"second").unwrap();

    let slot = initiator
        .start_send(
            "me",
            &[src.path().join("a.txt"), src.path().join("b.txt")],
            LOCALHOST,
            "peer",
        )
        .await
        .unwrap();
    let (stream, _) = server.accept().await.unwrap();
    let mut raw = FramedConn::new(stream).unwrap();
    assert!(matches!(
        next_header(&mut raw).await,
        Header::SendRequest { num_items: 2, .. }
    ));
    fs::remove_file(src.path().join("a.txt")).unwrap();
    raw.send(&Header::ack()).await.unwrap();

    assert_eq!(next_header(&mut raw).await, new_file("b.txt", "", 6));
    raw.send(&Header::ack()).await.unwrap();
    let chunk = raw.recv(Some(WAIT)).await.unwrap();
    assert_eq!(chunk.payload, b"second");
    raw.send(&Header::ack()).await.unwrap();
    assert_eq!(next_header(&mut raw).await, Header::Done);
    drop(raw);

    let snap = host.wait_finished(slot).await;
    assert_eq!(snap.state, JobState::Complete);
    assert_eq!(snap.items_done, 2);
}

#[tokio::test]
async fn skip_reply_moves_sender_to_next_item() {
    let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut host = Host::new(settings(server.local_addr().unwrap().port(), 4));
    let initiator = Initiator::new(host.engine.clone());
    let src = tempfile::tempdir().unwrap();
    fs::write(src.path().join("a.txt"), random_bytes(3 * CHUNK)).unwrap();
    fs::write(src.path().join("b.txt"), b"tail").unwrap();

    let slot = initiator
        .start_send(
            "me",
            &[src.path().join("a.txt"), src.path().join("b.txt")],
            LOCALHOST,
            "peer",
        )
        .await
        .unwrap();
    let (stream, _) = server.accept().await.unwrap();
    let mut raw = FramedConn::new(stream).unwrap();
    next_header(&mut raw).await;
    raw.send(&Header::ack()).await.unwrap();
    assert_eq!(
        next_header(&mut raw).await,
        new_file("a.txt", "", 3 * CHUNK as u64)
    );
    raw.send(&Header::ack()).await.unwrap();
    assert_eq!(raw.recv(Some(WAIT)).await.unwrap().payload.len(), CHUNK);
    // Refuse the rest of a.txt mid-stream.
    raw.send(&Header::Skip).await.unwrap();
    assert_eq!(next_header(&mut raw).await, new_file("b.txt", "", 4));
    raw.send(&Header::ack()).await.unwrap();
    assert_eq!(raw.recv(Some(WAIT)).await.unwrap().payload, b"tail");
    raw.send(&Header::ack()).await.unwrap();
    assert_eq!(next_header(&mut raw).await, Header::Done);
    drop(raw);

    assert_eq!(host.wait_finished(slot).await.state, JobState::Complete);
}

#[tokio::test]
async fn existing_directory_is_acknowledged() {
    let (listener, mut host) = open_listener(4).await;
    let dst = tempfile::tempdir().unwrap();
    fs::create_dir(dst.path().join("album")).unwrap();

    let (mut raw, slot) = accepted_raw_sender(&listener, &mut host, dst.path(), 2).await;
    raw.send(&new_dir("album", "")).await.unwrap();
    assert_eq!(next_header(&mut raw).await, Header::ack());
    raw.send(&new_file("x.txt", "album", 3)).await.unwrap();
    assert_eq!(next_header(&mut raw).await, Header::ack());
    raw.send_chunk(b"abc").await.unwrap();
    assert_eq!(next_header(&mut raw).await, Header::ack());
    raw.send(&Header::Done).await.unwrap();

    let snap = host.wait_finished(slot).await;
    assert_eq!(snap.state, JobState::Complete);
    assert_eq!(fs::read(dst.path().join("album/x.txt")).unwrap(), b"abc");
}

#[tokio::test]
async fn existing_file_is_skipped_and_kept() {
    let (listener, mut host) = open_listener(4).await;
    let dst = tempfile::tempdir().unwrap();
    fs::write(dst.path().join("a.txt"), b"old").unwrap();

    let (mut raw, slot) = accepted_raw_sender(&listener, &mut host, dst.path(), 2).await;
    raw.send(&new_file("a.txt", "", 5)).await.unwrap();
    assert_eq!(next_header(&mut raw).await, Header::Skip);
    raw.send(&new_file("../escape.txt", "", 5)).await.unwrap();
    assert_eq!(next_header(&mut raw).await, Header::Skip);
    raw.send(&Header::Done).await.unwrap();

    let snap = host.wait_finished(slot).await;
    assert_eq!(snap.state, JobState::Complete);
    assert_eq!(snap.items_done, 2);
    assert_eq!(fs::read(dst.path().join("a.txt")).unwrap(), b"old");
    assert!(!dst.path().parent().unwrap().join("escape.txt").exists());
}

#[tokio::test]
async fn local_cancel_mid_transfer() {
    let (listener, mut host) = open_listener(4).await;
    let dst = tempfile::tempdir().unwrap();
    let (mut raw, slot) = accepted_raw_sender(&listener, &mut host, dst.path(), 1).await;

    raw.send(&new_file("big.bin", "", 10 * CHUNK as u64)).await.unwrap();
    assert_eq!(next_header(&mut raw).await, Header::ack());
    raw.send_chunk(&[7u8; CHUNK]).await.unwrap();
    assert_eq!(next_header(&mut raw).await, Header::ack());
    assert!(dst.path().join("big.bin").exists());

    listener.end_job(slot).await.unwrap();
    assert_eq!(next_header(&mut raw).await, Header::End);
    assert!(matches!(raw.recv(Some(WAIT)).await, Err(ConnError::Closed)));
    assert!(!dst.path().join("big.bin").exists());

    // Still holding our end of the socket: the job is not deletable yet.
    assert!(matches!(
        listener.delete_job(slot).await,
        Err(EngineError::NotTerminal(_))
    ));
    drop(raw);

    let snap = host.wait_finished(slot).await;
    assert_eq!(snap.state, JobState::LocallyEnded);
    listener.delete_job(slot).await.unwrap();
    assert_eq!(host.engine.jobs_in_use().await, 0);
}

#[tokio::test]
async fn peer_end_removes_partial_file() {
    let (listener, mut host) = open_listener(4).await;
    let dst = tempfile::tempdir().unwrap();
    let (mut raw, slot) = accepted_raw_sender(&listener, &mut host, dst.path(), 1).await;

    raw.send(&new_file("big.bin", "", 5 * CHUNK as u64)).await.unwrap();
    assert_eq!(next_header(&mut raw).await, Header::ack());
    raw.send_chunk(&[1u8; CHUNK]).await.unwrap();
    assert_eq!(next_header(&mut raw).await, Header::ack());
    raw.send(&Header::End).await.unwrap();

    let snap = host.wait_finished(slot).await;
    assert_eq!(snap.state, JobState::PeerEnded);
    assert!(!dst.path().join("big.bin").exists());
}

#[tokio::test]
async fn peer_vanishing_mid_transfer_is_a_network_error() {
    let (listener, mut host) = open_listener(4).await;
    let dst = tempfile::tempdir().unwrap();
    let (mut raw, slot) = accepted_raw_sender(&listener, &mut host, dst.path(), 1).await;

    raw.send(&new_file("big.bin", "", 5 * CHUNK as u64)).await.unwrap();
    assert_eq!(next_header(&mut raw).await, Header::ack());
    raw.send_chunk(&[1u8; CHUNK]).await.unwrap();
    assert_eq!(next_header(&mut raw).await, Header::ack());
    drop(raw);

    let snap = host.wait_finished(slot).await;
    assert_eq!(snap.state, JobState::NetworkError);
    assert!(!dst.path().join("big.bin").exists());
}

#[tokio::test]
async fn peer_withdraws_pending_request() {
    let (listener, mut host) = open_listener(4).await;
    let mut raw = FramedConn::connect(listener.local_addr()).await.unwrap();
    raw.send(&Header::recv_request("raw")).await.unwrap();
    let pending = host.wait_pending().await;
    raw.send(&Header::End).await.unwrap();

    let snap = host.wait_finished(pending.slot).await;
    assert_eq!(snap.state, JobState::Cancelled);
    assert!(matches!(
        listener.accept_recv_request(pending.slot, &[]).await,
        Err(EngineError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn listener_rejects_on_request() {
    let (listener, mut host) = open_listener(4).await;
    let mut raw = FramedConn::connect(listener.local_addr()).await.unwrap();
    raw.send(&Header::send_request("raw", 3)).await.unwrap();
    let pending = host.wait_pending().await;
    listener.reject_request(pending.slot).await.unwrap();

    assert_eq!(next_header(&mut raw).await, Header::No);
    assert!(matches!(raw.recv(Some(WAIT)).await, Err(ConnError::Closed)));
    let snap = host.wait_finished(pending.slot).await;
    assert_eq!(snap.state, JobState::Rejected);
}

#[tokio::test]
async fn bad_first_header_releases_the_slot() {
    let (listener, host) = open_listener(4).await;
    let oversized = vec![b'x'; 20_000];
    for input in [&b"{nope\r\n"[..], &b"{\"class\":\"done\"}\r\n"[..], &oversized[..]] {
        let mut raw = TcpStream::connect(listener.local_addr()).await.unwrap();
        raw.write_all(input).await.unwrap();
        let mut buf = [0u8; 64];
        // The listener hangs up without a reply.
        let n = tokio::time::timeout(WAIT, raw.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }
    assert_eq!(host.engine.jobs_in_use().await, 0);
    assert!(listener.snapshots().await.is_empty());
}

#[tokio::test]
async fn full_pool_refuses_new_jobs() {
    // Listener side: the second connection is dropped outright.
    let (listener, mut host) = open_listener(1).await;
    let mut first = FramedConn::connect(listener.local_addr()).await.unwrap();
    first.send(&Header::send_request("one", 1)).await.unwrap();
    host.wait_pending().await;
    let mut second = FramedConn::connect(listener.local_addr()).await.unwrap();
    second.send(&Header::send_request("two", 1)).await.ok();
    assert!(second.recv(Some(WAIT)).await.is_err());

    // Initiator side: the refusal is synchronous.
    let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut out = Host::new(settings(server.local_addr().unwrap().port(), 1));
    let initiator = Initiator::new(out.engine.clone());
    let dst = tempfile::tempdir().unwrap();
    let slot = initiator
        .start_receive("me", LOCALHOST, "peer", dst.path().to_path_buf())
        .await
        .unwrap();
    assert!(matches!(
        initiator
            .start_receive("me", LOCALHOST, "peer", dst.path().to_path_buf())
            .await,
        Err(EngineError::Slot(SlotError::Exhausted(1)))
    ));

    let (stream, _) = server.accept().await.unwrap();
    let mut raw = FramedConn::new(stream).unwrap();
    assert!(matches!(
        next_header(&mut raw).await,
        Header::RecvRequest { .. }
    ));
    initiator.end_job(slot).await.unwrap();
    assert_eq!(next_header(&mut raw).await, Header::End);
    drop(raw);
    let snap = out.wait_finished(slot).await;
    assert_eq!(snap.state, JobState::Cancelled);

    initiator.delete_job(slot).await.unwrap();
    let again = initiator
        .start_receive("me", LOCALHOST, "peer", dst.path().to_path_buf())
        .await
        .unwrap();
    assert_eq!(again, slot);
}

#[tokio::test]
async fn closed_listener_stops_accepting() {
    let (mut listener, _host) = open_listener(4).await;
    let addr = listener.local_addr();
    listener.close().await;
    assert_eq!(listener.state().await, crate::listener::ListenerState::Closed);
    // The aborted accept task drops its socket on the next scheduler pass.
    let mut refused = false;
    for _ in 0..50 {
        if TcpStream::connect(addr).await.is_err() {
            refused = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(refused);
}

#[tokio::test]
async fn silent_sender_times_out() {
    let (listener, mut host) = open_listener_with(impatient(0)).await;
    let dst = tempfile::tempdir().unwrap();
    let (mut raw, slot) = accepted_raw_sender(&listener, &mut host, dst.path(), 1).await;

    raw.send(&new_file("big.bin", "", 5 * CHUNK as u64)).await.unwrap();
    assert_eq!(next_header(&mut raw).await, Header::ack());
    raw.send_chunk(&[3u8; CHUNK]).await.unwrap();
    assert_eq!(next_header(&mut raw).await, Header::ack());
    let quiet = std::time::Instant::now();

    // Socket stays open; only the silence ends the job.
    let snap = host.wait_finished(slot).await;
    assert_eq!(snap.state, JobState::NetworkError);
    assert!(quiet.elapsed() >= Duration::from_millis(200));
    assert!(!dst.path().join("big.bin").exists());
    drop(raw);
}

#[tokio::test]
async fn silent_receiver_times_out() {
    let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut host = Host::new(impatient(server.local_addr().unwrap().port()));
    let initiator = Initiator::new(host.engine.clone());
    let src = tempfile::tempdir().unwrap();
    fs::write(src.path().join("a.bin"), random_bytes(3 * CHUNK)).unwrap();

    let slot = initiator
        .start_send("me", &[src.path().join("a.bin")], LOCALHOST, "peer")
        .await
        .unwrap();
    let (stream, _) = server.accept().await.unwrap();
    let mut raw = FramedConn::new(stream).unwrap();
    next_header(&mut raw).await;
    raw.send(&Header::ack()).await.unwrap();
    assert_eq!(
        next_header(&mut raw).await,
        new_file("a.bin", "", 3 * CHUNK as u64)
    );
    let quiet = std::time::Instant::now();

    let snap = host.wait_finished(slot).await;
    assert_eq!(snap.state, JobState::NetworkError);
    assert_eq!(snap.role, JobRole::Sender);
    assert!(quiet.elapsed() >= Duration::from_millis(200));
    drop(raw);
}

#[tokio::test]
async fn chunk_overrunning_its_item_is_skipped() {
    let (listener, mut host) = open_listener(4).await;
    let dst = tempfile::tempdir().unwrap();
    let (mut raw, slot) = accepted_raw_sender(&listener, &mut host, dst.path(), 2).await;

    raw.send(&new_file("a.txt", "", 3)).await.unwrap();
    assert_eq!(next_header(&mut raw).await, Header::ack());
    raw.send_chunk(b"12345").await.unwrap();
    assert_eq!(next_header(&mut raw).await, Header::Skip);
    assert!(!dst.path().join("a.txt").exists());

    raw.send(&new_file("b.txt", "", 2)).await.unwrap();
    assert_eq!(next_header(&mut raw).await, Header::ack());
    raw.send_chunk(b"ok").await.unwrap();
    assert_eq!(next_header(&mut raw).await, Header::ack());
    raw.send(&Header::Done).await.unwrap();

    let snap = host.wait_finished(slot).await;
    assert_eq!(snap.state, JobState::Complete);
    assert_eq!(snap.items_done, 2);
    assert_eq!(fs::read(dst.path().join("b.txt")).unwrap(), b"ok");
}

#[tokio::test]
async fn oversized_chunk_header_fails_the_job() {
    let (listener, mut host) = open_listener(4).await;
    let dst = tempfile::tempdir().unwrap();
    let (mut raw, slot) = accepted_raw_sender(&listener, &mut host, dst.path(), 1).await;

    raw.send(&new_file("big.bin", "", 5 * CHUNK as u64)).await.unwrap();
    assert_eq!(next_header(&mut raw).await, Header::ack());
    raw.send(&Header::chunk(1 << 40)).await.unwrap();
    raw.send_chunk(&[0u8; CHUNK]).await.ok();

    let snap = host.wait_finished(slot).await;
    assert_eq!(snap.state, JobState::NetworkError);
    assert!(!dst.path().join("big.bin").exists());
}

#[tokio::test]
async fn complete_receive_counts_items_the_sender_passed_over() {
    let (listener, mut host) = open_listener(4).await;
    let dst = tempfile::tempdir().unwrap();
    let (mut raw, slot) = accepted_raw_sender(&listener, &mut host, dst.path(), 3).await;

    // Two of the three announced items never show up.
    raw.send(&new_dir("only", "")).await.unwrap();
    assert_eq!(next_header(&mut raw).await, Header::ack());
    raw.send(&Header::Done).await.unwrap();

    let snap = host.wait_finished(slot).await;
    assert_eq!(snap.state, JobState::Complete);
    assert_eq!(snap.items_total, 3);
    assert_eq!(snap.items_done, 3);
    assert_eq!(snap.total_progress, 100);
}

#[tokio::test]
async fn truncated_source_skips_item() {
    let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut host = Host::new(settings(server.local_addr().unwrap().port(), 4));
    let initiator = Initiator::new(host.engine.clone());
    let src = tempfile::tempdir().unwrap();
    fs::write(src.path().join("a.bin"), random_bytes(2 * CHUNK)).unwrap();
    fs::write(src.path().join("b.txt"), b"tail").unwrap();

    let slot = initiator
        .start_send(
            "me",
            &[src.path().join("a.bin"), src.path().join("b.txt")],
            LOCALHOST,
            "peer",
        )
        .await
        .unwrap();
    let (stream, _) = server.accept().await.unwrap();
    let mut raw = FramedConn::new(stream).unwrap();
    next_header(&mut raw).await;
    raw.send(&Header::ack()).await.unwrap();
    assert_eq!(
        next_header(&mut raw).await,
        new_file("a.bin", "", 2 * CHUNK as u64)
    );
    // Emptied after it was announced: nothing of it may follow.
    fs::OpenOptions::new()
        .write(true)
        .open(src.path().join("a.bin"))
        .unwrap()
        .set_len(0)
        .unwrap();
    raw.send(&Header::ack()).await.unwrap();

    assert_eq!(next_header(&mut raw).await, new_file("b.txt", "", 4));
    raw.send(&Header::ack()).await.unwrap();
    assert_eq!(raw.recv(Some(WAIT)).await.unwrap().payload, b"tail");
    raw.send(&Header::ack()).await.unwrap();
    assert_eq!(next_header(&mut raw).await, Header::Done);
    drop(raw);

    let snap = host.wait_finished(slot).await;
    assert_eq!(snap.state, JobState::Complete);
    assert_eq!(snap.items_done, 2);
}
