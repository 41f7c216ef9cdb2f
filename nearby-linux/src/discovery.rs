//! Discovery and link negotiation: the collaborator the group runtime drives, plus a LAN
//! implementation over UDP multicast beacons.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use nearby_core::{LinkStatus, PeerRecord, Role};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Reported by the discovery collaborator, from whatever task it runs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// Full snapshot of currently visible peers.
    PeersChanged(Vec<PeerRecord>),
    LinkStatus(LinkStatus),
    /// A `request_link` attempt failed outright.
    LinkFailed,
    /// A formed link went away.
    LinkDropped,
}

/// Platform discovery and link negotiation. Calls return immediately; outcomes arrive as
/// [`DiscoveryEvent`]s on the channel the implementation was built with.
pub trait Discovery: Send + 'static {
    /// Start advertising this device's `(identifier, port)` record.
    fn publish(&mut self, identifier: &str, port: u16);
    fn unpublish(&mut self);
    /// Ask the lower layer for a link to the peer at `link_address`.
    fn request_link(&mut self, link_address: &str);
    /// The role this device assumed, or `None` after teardown.
    fn role_changed(&mut self, _role: Option<Role>) {}
}

const PROTOCOL_VERSION: u8 = 1;
const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 61);
const BEACON_INTERVAL: Duration = Duration::from_secs(2);
/// Peer considered gone if no beacon for this long.
const PEER_TIMEOUT: Duration = Duration::from_secs(8);
/// A requested target that has not started its relay by then is given up on.
const LINK_TIMEOUT: Duration = Duration::from_secs(10);

/// Multicast advertisement. Encoding is bincode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Beacon {
    protocol_version: u8,
    identifier: String,
    port: u16,
    /// Sender currently runs the relay hub.
    is_relay: bool,
    /// Identifier the sender is requesting a link to.
    target: Option<String>,
}

struct PeerState {
    record: PeerRecord,
    ip: IpAddr,
    last_seen: Instant,
}

/// What this device advertises and remembers about others. Socket-free.
#[derive(Default)]
struct LanState {
    published: Option<(String, u16)>,
    is_relay: bool,
    target: Option<String>,
    /// When `target` was asked for a link, while it has not yet taken the relay role.
    link_pending: Option<Instant>,
    peers: HashMap<String, PeerState>,
}

impl LanState {
    fn beacon(&self) -> Option<Beacon> {
        let (identifier, port) = self.published.as_ref()?;
        Some(Beacon {
            protocol_version: PROTOCOL_VERSION,
            identifier: identifier.clone(),
            port: *port,
            is_relay: self.is_relay,
            target: self.target.clone(),
        })
    }

    fn snapshot(&self) -> Vec<PeerRecord> {
        self.peers.values().map(|p| p.record.clone()).collect()
    }

    /// Apply a received beacon. Returns the events it causes.
    fn on_beacon(&mut self, from: IpAddr, beacon: Beacon, now: Instant) -> Vec<DiscoveryEvent> {
        if beacon.protocol_version != PROTOCOL_VERSION {
            return vec![];
        }
        let Some((my_id, _)) = &self.published else {
            return vec![];
        };
        if beacon.identifier == *my_id {
            return vec![];
        }
        let targets_me = beacon.target.as_deref() == Some(my_id.as_str());
        let link_ready = self.link_pending.is_some()
            && beacon.is_relay
            && self.target.as_deref() == Some(beacon.identifier.as_str());
        let link_address = format!("{}/{}", from, beacon.identifier);
        let record = PeerRecord::published(link_address.clone(), beacon.identifier, beacon.port)
            .platform_owner(beacon.is_relay);
        let changed = self
            .peers
            .get(&link_address)
            .map_or(true, |p| p.record != record);
        self.peers.insert(
            link_address,
            PeerState {
                record,
                ip: from,
                last_seen: now,
            },
        );
        let mut events = Vec::new();
        if changed {
            events.push(DiscoveryEvent::PeersChanged(self.snapshot()));
        }
        if targets_me && !self.is_relay {
            // A peer picked us: the lower layer hands us the relay role.
            events.push(DiscoveryEvent::LinkStatus(LinkStatus::relay()));
        }
        if link_ready {
            self.link_pending = None;
            events.push(DiscoveryEvent::LinkStatus(LinkStatus::client(from.to_string(), beacon.port)));
        }
        events
    }

    /// Drop timed-out peers and report the current snapshot, preceded by `LinkFailed` if a
    /// pending link request went unanswered.
    fn expire(&mut self, now: Instant) -> Vec<DiscoveryEvent> {
        let mut events = Vec::new();
        if self
            .link_pending
            .is_some_and(|asked| now.duration_since(asked) >= LINK_TIMEOUT)
        {
            debug!(peer = ?self.target, "link request unanswered");
            self.link_pending = None;
            self.target = None;
            events.push(DiscoveryEvent::LinkFailed);
        }
        self.peers
            .retain(|_, p| now.duration_since(p.last_seen) < PEER_TIMEOUT);
        events.push(DiscoveryEvent::PeersChanged(self.snapshot()));
        events
    }

    /// Advertise `link_address` as our target. The link is formed once that peer runs the relay;
    /// until its beacon says so, no event is produced.
    fn request_link(&mut self, link_address: &str, now: Instant) -> Option<DiscoveryEvent> {
        let Some(peer) = self.peers.get(link_address) else {
            return Some(DiscoveryEvent::LinkFailed);
        };
        let (Some(identifier), Some(port)) = (&peer.record.identifier, peer.record.port) else {
            return Some(DiscoveryEvent::LinkFailed);
        };
        self.target = Some(identifier.clone());
        if peer.record.is_platform_owner {
            self.link_pending = None;
            Some(DiscoveryEvent::LinkStatus(LinkStatus::client(peer.ip.to_string(), port)))
        } else {
            self.link_pending = Some(now);
            None
        }
    }

    fn role_changed(&mut self, role: Option<Role>) {
        self.is_relay = role == Some(Role::Relay);
        self.link_pending = None;
        if role != Some(Role::Client) {
            self.target = None;
        }
    }
}

/// LAN discovery: periodic multicast beacons, peer list with timeout, link "negotiation" by
/// advertising the chosen target so it can take the relay role.
pub struct LanDiscovery {
    state: Arc<Mutex<LanState>>,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
}

impl LanDiscovery {
    /// Bind the multicast socket on `discovery_port` and start the beacon, receive and expiry tasks.
    pub async fn spawn(
        discovery_port: u16,
        events: mpsc::UnboundedSender<DiscoveryEvent>,
    ) -> std::io::Result<Self> {
        let socket = Arc::new(make_multicast_socket(discovery_port)?);
        let state = Arc::new(Mutex::new(LanState::default()));
        let dest = SocketAddr::new(IpAddr::V4(MULTICAST_GROUP), discovery_port);

        tokio::spawn(beacon_loop(socket.clone(), state.clone(), dest));
        tokio::spawn(recv_loop(socket, state.clone(), events.clone()));
        tokio::spawn(expiry_loop(state.clone(), events.clone()));
        info!(port = discovery_port, "LAN discovery running");
        Ok(Self { state, events })
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut LanState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    fn emit(&self, event: DiscoveryEvent) {
        let _ = self.events.send(event);
    }
}

impl Discovery for LanDiscovery {
    fn publish(&mut self, identifier: &str, port: u16) {
        self.with_state(|s| s.published = Some((identifier.to_string(), port)));
    }

    fn unpublish(&mut self) {
        self.with_state(|s| {
            s.published = None;
            s.role_changed(None);
            s.peers.clear();
        });
    }

    fn request_link(&mut self, link_address: &str) {
        let event = self.with_state(|s| s.request_link(link_address, Instant::now()));
        debug!(link_address, ?event, "link requested");
        if let Some(event) = event {
            self.emit(event);
        }
    }

    fn role_changed(&mut self, role: Option<Role>) {
        self.with_state(|s| s.role_changed(role));
    }
}

fn make_multicast_socket(discovery_port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, discovery_port))?;
    std_sock.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

async fn beacon_loop(socket: Arc<UdpSocket>, state: Arc<Mutex<LanState>>, dest: SocketAddr) {
    loop {
        let beacon = state.lock().unwrap_or_else(|e| e.into_inner()).beacon();
        if let Some(beacon) = beacon {
            match bincode::serialize(&beacon) {
                Ok(bytes) => {
                    if let Err(e) = socket.send_to(&bytes, dest).await {
                        debug!(error = %e, "beacon send failed");
                    }
                }
                Err(e) => warn!(error = %e, "beacon encode failed"),
            }
        }
        tokio::time::sleep(BEACON_INTERVAL).await;
    }
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    state: Arc<Mutex<LanState>>,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
) {
    let mut buf = vec![0u8; 2048];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "discovery socket failed");
                return;
            }
        };
        let Ok(beacon) = bincode::deserialize::<Beacon>(&buf[..n]) else {
            continue;
        };
        let out = state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .on_beacon(from.ip(), beacon, Instant::now());
        for event in out {
            if events.send(event).is_err() {
                return;
            }
        }
    }
}

async fn expiry_loop(state: Arc<Mutex<LanState>>, events: mpsc::UnboundedSender<DiscoveryEvent>) {
    loop {
        tokio::time::sleep(BEACON_INTERVAL).await;
        let out = {
            let mut s = state.lock().unwrap_or_else(|e| e.into_inner());
            if s.published.is_none() {
                continue;
            }
            s.expire(Instant::now())
        };
        for event in out {
            if events.send(event).is_err() {
                return;
            }
        }
    }
}
