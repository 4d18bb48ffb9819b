//! LAN discovery: one broadcast probe per window, unicast replies from every
//! listening peer on the subnet, and the responder that produces those replies.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use peadrop_core::Presence;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

const DATAGRAM_BUF: usize = 2048;

/// An IPv4 interface address a listener can bind and a probe can broadcast from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalNetwork {
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
}

impl LocalNetwork {
    pub fn new(ip: Ipv4Addr, netmask: Ipv4Addr) -> Self {
        Self { ip, netmask }
    }

    /// Directed broadcast address: host bits all set.
    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.ip) | !u32::from(self.netmask))
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let mask = u32::from(self.netmask);
        u32::from(ip) & mask == u32::from(self.ip) & mask
    }
}

/// Named interface plus its network, as listed to the user.
#[derive(Debug, Clone)]
pub struct Interface {
    pub name: String,
    pub network: LocalNetwork,
}

/// Private, non-loopback IPv4 networks of this host.
pub fn list_local_networks() -> std::io::Result<Vec<Interface>> {
    let mut out = Vec::new();
    for iface in if_addrs::get_if_addrs()? {
        if iface.is_loopback() {
            continue;
        }
        if let if_addrs::IfAddr::V4(v4) = &iface.addr {
            if v4.ip.is_private() {
                out.push(Interface {
                    name: iface.name.clone(),
                    network: LocalNetwork::new(v4.ip, v4.netmask),
                });
            }
        }
    }
    out.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(out)
}

/// A peer that answered a probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerReply {
    pub ip: IpAddr,
    pub version: u8,
    pub id: String,
    pub os: String,
}

/// Broadcast one probe on `network` and report each distinct responder once.
pub async fn probe<F>(
    network: &LocalNetwork,
    port: u16,
    me: &Presence,
    window: Duration,
    on_reply: F,
) -> std::io::Result<usize>
where
    F: FnMut(PeerReply),
{
    let target = SocketAddr::from((network.broadcast(), port));
    probe_addr(network.ip, target, me, window, on_reply).await
}

/// Send a probe from `bind_ip` to `target` and collect replies for `window`.
/// Replies coming from `bind_ip` itself are ignored. Returns the number of peers seen.
pub async fn probe_addr<F>(
    bind_ip: Ipv4Addr,
    target: SocketAddr,
    me: &Presence,
    window: Duration,
    mut on_reply: F,
) -> std::io::Result<usize>
where
    F: FnMut(PeerReply),
{
    let socket = UdpSocket::bind((bind_ip, 0)).await?;
    socket.set_broadcast(true)?;
    let datagram = me
        .to_datagram()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    socket.send_to(&datagram, target).await?;
    debug!(%target, "probe sent");

    let mut seen: HashSet<IpAddr> = HashSet::new();
    let mut buf = vec![0u8; DATAGRAM_BUF];
    let deadline = tokio::time::Instant::now() + window;
    loop {
        let (n, from) = match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
            Err(_) => break,
            Ok(Err(e)) => {
                warn!(error = %e, "probe receive failed");
                continue;
            }
            Ok(Ok(r)) => r,
        };
        if from.ip() == IpAddr::V4(bind_ip) {
            continue;
        }
        let Some(peer) = Presence::from_datagram(&buf[..n]) else {
            debug!(%from, "ignoring malformed probe reply");
            continue;
        };
        if peer.id == me.id || !seen.insert(from.ip()) {
            continue;
        }
        on_reply(PeerReply {
            ip: from.ip(),
            version: peer.version,
            id: peer.id,
            os: peer.os,
        });
    }
    Ok(seen.len())
}

/// Answers probes with this host's presence while a listener is open.
pub struct Responder {
    socket: UdpSocket,
    reply: Vec<u8>,
    id: String,
    scope: Option<LocalNetwork>,
}

impl Responder {
    /// Bind `addr`. With a `scope`, only probes from inside that network are answered.
    pub async fn bind(
        addr: SocketAddr,
        me: &Presence,
        scope: Option<LocalNetwork>,
    ) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let reply = me
            .to_datagram()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        Ok(Self {
            socket,
            reply,
            id: me.id.clone(),
            scope,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Serve until the socket fails. Dropping the future stops the responder.
    pub async fn run(self) -> std::io::Result<()> {
        let mut buf = vec![0u8; DATAGRAM_BUF];
        loop {
            let (n, from) = self.socket.recv_from(&mut buf).await?;
            let Some(probe) = Presence::from_datagram(&buf[..n]) else {
                debug!(%from, "dropping malformed datagram");
                continue;
            };
            if probe.id == self.id {
                continue;
            }
            if let (Some(scope), IpAddr::V4(src)) = (self.scope, from.ip()) {
                if !scope.contains(src) {
                    debug!(%from, "probe from outside the listening network");
                    continue;
                }
            }
            debug!(%from, peer = %probe.id, "answering probe");
            if let Err(e) = self.socket.send_to(&self.reply, from).await {
                warn!(%from, error = %e, "probe reply failed");
            }
        }
    }
}
