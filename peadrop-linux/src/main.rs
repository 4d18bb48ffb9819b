// peadrop on Linux: discovery, listener and transfers from the command line.

mod config;
mod conn;
mod discovery;
mod engine;
mod initiator;
mod items;
mod listener;
mod negotiation;
mod receiver;
mod sender;
mod sink;

#[cfg(test)]
mod scenarios;

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use peadrop_core::{Direction, JobRole, JobSnapshot, JobState, Presence};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;
use crate::engine::Engine;
use crate::initiator::Initiator;
use crate::listener::Listener;
use crate::sink::{ChannelSink, EngineEvent};

const VERSION: &str = env!("CARGO_PKG_VERSION");

const USAGE: &str = "usage: peadrop-linux <command>
  networks                         list local networks
  probe                            look for peers on every local network
  listen [--accept] [--share PATH...]
                                   accept incoming requests until interrupted
  send IP PATH...                  send files or directories to a peer
  recv IP                          ask a peer for what it shares
  --version";

enum Command {
    Networks,
    Probe,
    Listen { accept: bool, share: Vec<PathBuf> },
    Send { peer: IpAddr, paths: Vec<PathBuf> },
    Recv { peer: IpAddr },
}

fn parse_args(args: &[String]) -> anyhow::Result<Command> {
    let Some((cmd, rest)) = args.split_first() else {
        bail!("{USAGE}");
    };
    match cmd.as_str() {
        "networks" => Ok(Command::Networks),
        "probe" => Ok(Command::Probe),
        "listen" => {
            let mut accept = false;
            let mut share = Vec::new();
            let mut sharing = false;
            for arg in rest {
                match arg.as_str() {
                    "--accept" => accept = true,
                    "--share" => sharing = true,
                    p if sharing => share.push(PathBuf::from(p)),
                    other => bail!("unexpected argument {other:?}\n{USAGE}"),
                }
            }
            Ok(Command::Listen { accept, share })
        }
        "send" => {
            let Some((ip, paths)) = rest.split_first() else {
                bail!("send needs a peer address\n{USAGE}");
            };
            if paths.is_empty() {
                bail!("send needs at least one path\n{USAGE}");
            }
            Ok(Command::Send {
                peer: ip.parse().with_context(|| format!("bad address {ip:?}"))?,
                paths: paths.iter().map(PathBuf::from).collect(),
            })
        }
        "recv" => match rest {
            [ip] => Ok(Command::Recv {
                peer: ip.parse().with_context(|| format!("bad address {ip:?}"))?,
            }),
            _ => bail!("recv takes exactly one peer address\n{USAGE}"),
        },
        other => bail!("unknown command {other:?}\n{USAGE}"),
    }
}

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("peadrop-linux {}", VERSION);
        return Ok(());
    }
    init_logging();
    let command = parse_args(&args)?;
    let cfg = config::load();

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(run(command, cfg))
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn run(command: Command, cfg: Config) -> anyhow::Result<()> {
    let (sink, events) = ChannelSink::new();
    let engine = Engine::new(cfg.engine_settings(), Arc::new(sink));
    match command {
        Command::Networks => {
            for iface in discovery::list_local_networks()? {
                let net = iface.network;
                println!("{}\t{}/{}\tbroadcast {}", iface.name, net.ip, net.netmask, net.broadcast());
            }
            Ok(())
        }
        Command::Probe => probe_all(&cfg).await,
        Command::Listen { accept, share } => listen(engine, events, &cfg, accept, share).await,
        Command::Send { peer, paths } => {
            let initiator = Initiator::new(engine);
            let slot = initiator
                .start_send(&cfg.identity, &paths, peer, &peer.to_string())
                .await?;
            finish_one(&initiator, events, slot).await
        }
        Command::Recv { peer } => {
            let initiator = Initiator::new(engine);
            let slot = initiator
                .start_receive(&cfg.identity, peer, &peer.to_string(), cfg.receive_dir.clone())
                .await?;
            finish_one(&initiator, events, slot).await
        }
    }
}

async fn probe_all(cfg: &Config) -> anyhow::Result<()> {
    let networks = discovery::list_local_networks()?;
    if networks.is_empty() {
        bail!("no private IPv4 network found");
    }
    let me = Presence::local(&cfg.identity);
    for iface in networks {
        let seen = discovery::probe(&iface.network, cfg.port, &me, cfg.probe_window(), |peer| {
            println!("{}\t{}\t{}\tv{}", peer.ip, peer.id, peer.os, peer.version);
        })
        .await;
        match seen {
            Ok(n) => info!(interface = %iface.name, peers = n, "probe finished"),
            Err(e) => warn!(interface = %iface.name, error = %e, "probe failed"),
        }
    }
    Ok(())
}

/// Print progress for one outbound job until it is terminal, then delete it.
async fn finish_one(
    initiator: &Initiator,
    mut events: UnboundedReceiver<EngineEvent>,
    slot: usize,
) -> anyhow::Result<()> {
    while let Some(event) = events.recv().await {
        let EngineEvent::State(snap) = event else {
            continue;
        };
        if snap.slot != slot {
            continue;
        }
        print_snapshot(&snap);
        if snap.is_deletable() {
            initiator.delete_job(slot).await?;
            return match snap.state {
                JobState::Complete => Ok(()),
                state => bail!("transfer ended: {state:?}"),
            };
        }
    }
    bail!("engine stopped before the job finished")
}

async fn listen(
    engine: Engine,
    mut events: UnboundedReceiver<EngineEvent>,
    cfg: &Config,
    accept: bool,
    share: Vec<PathBuf>,
) -> anyhow::Result<()> {
    let iface = discovery::list_local_networks()?
        .into_iter()
        .next()
        .context("no private IPv4 network to listen on")?;
    let mut listener = Listener::open(engine, iface.network.ip, iface.network.netmask, &cfg.identity)
        .await
        .context("cannot open listener")?;
    println!("listening on {} ({}) as {}", listener.local_addr(), iface.name, cfg.identity);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        let snap = tokio::select! {
            res = &mut shutdown => {
                let running = listener
                    .snapshots()
                    .await
                    .iter()
                    .filter(|s| !s.state.is_terminal())
                    .count();
                if running > 0 {
                    warn!(jobs = running, "shutting down with jobs still running");
                }
                listener.close().await;
                return res;
            }
            event = events.recv() => match event {
                Some(EngineEvent::State(snap)) => snap,
                Some(_) => continue,
                None => return Ok(()),
            },
        };
        print_snapshot(&snap);
        if snap.role == JobRole::InboundPending && snap.state == JobState::Pending {
            let decided = match snap.direction {
                Direction::Send if accept => {
                    listener
                        .accept_send_request(snap.slot, cfg.receive_dir.clone())
                        .await
                }
                Direction::Receive if !share.is_empty() => {
                    listener.accept_recv_request(snap.slot, &share).await
                }
                _ => listener.reject_request(snap.slot).await,
            };
            if let Err(e) = decided {
                warn!(slot = snap.slot, error = %e, "cannot answer request");
            }
        } else if snap.is_deletable() {
            if let Err(e) = listener.delete_job(snap.slot).await {
                warn!(slot = snap.slot, error = %e, "cannot delete job");
            }
        }
    }
}

fn print_snapshot(s: &JobSnapshot) {
    let item = s.current_item.as_deref().unwrap_or("-");
    println!(
        "[{}] {:?} {:?} {} {}/{} items {}% ({}% of {}) {} B/s",
        s.slot,
        s.role,
        s.state,
        s.peer_id,
        s.items_done,
        s.items_total,
        s.total_progress,
        s.item_progress,
        item,
        s.speed
    );
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res?,
        _ = sigterm.recv() => {}
    }
    Ok(())
}
