//! Discovered peers as reported by the discovery collaborator, and relay target selection.

use std::collections::BTreeMap;

/// One discovered peer. `identifier` and `port` arrive with the peer's published record
/// and may be missing on early discovery callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    /// Link-layer address; opaque to the core.
    pub link_address: String,
    pub identifier: Option<String>,
    /// Relay listening port.
    pub port: Option<u16>,
    /// The lower layer has already made this peer the relay.
    pub is_platform_owner: bool,
}

impl PeerRecord {
    pub fn new(link_address: impl Into<String>) -> Self {
        Self {
            link_address: link_address.into(),
            identifier: None,
            port: None,
            is_platform_owner: false,
        }
    }

    pub fn published(
        link_address: impl Into<String>,
        identifier: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            link_address: link_address.into(),
            identifier: Some(identifier.into()),
            port: Some(port),
            is_platform_owner: false,
        }
    }

    pub fn platform_owner(mut self, owner: bool) -> Self {
        self.is_platform_owner = owner;
        self
    }

    /// Both identifier and port are known.
    pub fn is_eligible(&self) -> bool {
        self.identifier.is_some() && self.port.is_some()
    }
}

/// Peer table keyed by link address. Ordered so iteration (and therefore selection) is stable.
#[derive(Debug, Default, Clone)]
pub struct PeerTable {
    peers: BTreeMap<String, PeerRecord>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a full discovery snapshot: update known records, add new ones, drop the rest.
    /// Returns the link addresses that disappeared.
    pub fn replace_all(&mut self, records: Vec<PeerRecord>) -> Vec<String> {
        let mut next = BTreeMap::new();
        for record in records {
            next.insert(record.link_address.clone(), record);
        }
        let gone: Vec<String> = self
            .peers
            .keys()
            .filter(|addr| !next.contains_key(*addr))
            .cloned()
            .collect();
        self.peers = next;
        gone
    }

    pub fn upsert(&mut self, record: PeerRecord) {
        self.peers.insert(record.link_address.clone(), record);
    }

    pub fn remove(&mut self, link_address: &str) -> Option<PeerRecord> {
        self.peers.remove(link_address)
    }

    pub fn get(&self, link_address: &str) -> Option<&PeerRecord> {
        self.peers.get(link_address)
    }

    /// Forget cached identifier/port bindings; the next discovery update repopulates them.
    pub fn clear_bindings(&mut self) {
        for record in self.peers.values_mut() {
            record.identifier = None;
            record.port = None;
            record.is_platform_owner = false;
        }
    }

    pub fn eligible(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.values().filter(|p| p.is_eligible())
    }

    pub fn has_eligible(&self) -> bool {
        self.eligible().next().is_some()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// Pick the peer to request a link to. Deterministic: every device computes it on its own.
///
/// 1. An eligible platform-owner peer wins (lowest identifier if several).
/// 2. Otherwise the smallest eligible identifier that sorts strictly before `local_id`.
/// 3. Otherwise nothing; the device with the smallest identifier waits to be connected to.
pub fn select_target<'a>(table: &'a PeerTable, local_id: &str) -> Option<&'a PeerRecord> {
    let identifier = |p: &&PeerRecord| p.identifier.clone().unwrap_or_default();
    if let Some(owner) = table
        .eligible()
        .filter(|p| p.is_platform_owner)
        .min_by_key(identifier)
    {
        return Some(owner);
    }
    table
        .eligible()
        .filter(|p| p.identifier.as_deref().is_some_and(|id| id < local_id))
        .min_by_key(identifier)
}
