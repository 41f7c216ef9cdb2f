//! Host-driven group formation: GroupController receives discovery and link events from the host,
//! returns actions for the host to perform (publish, request a link, start relay or client).

use crate::peers::{self, PeerRecord, PeerTable};

/// Default number of consecutive failed relay connections before the host is told.
pub const DEFAULT_MAX_CONNECT_FAILURES: u32 = 5;

/// Which side of the link this device plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Relay,
    Client,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupState {
    Idle,
    Discovering,
    /// A link to `target` (link address) has been requested.
    FormingLink { target: String },
    Active(Role),
    Recovering,
}

/// Link status reported by the negotiation layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkStatus {
    pub formed: bool,
    /// This device holds the relay role.
    pub is_platform_owner: bool,
    pub relay_address: Option<String>,
    pub relay_port: Option<u16>,
}

impl LinkStatus {
    pub fn relay() -> Self {
        Self {
            formed: true,
            is_platform_owner: true,
            ..Self::default()
        }
    }

    pub fn client(relay_address: impl Into<String>, relay_port: u16) -> Self {
        Self {
            formed: true,
            is_platform_owner: false,
            relay_address: Some(relay_address.into()),
            relay_port: Some(relay_port),
        }
    }

    pub fn pending() -> Self {
        Self::default()
    }
}

/// Action for host to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupAction {
    /// Start advertising this device's `(identifier, port)` record.
    Publish { identifier: String, port: u16 },
    Unpublish,
    RequestLink { link_address: String },
    /// Become the relay: listen on `port` and run the hub.
    StartRelay { port: u16 },
    /// Connect to the relay at `address:port`.
    StartClient { address: String, port: u16 },
    /// Shut down the active hub or client.
    TearDown,
    /// Surface a link error to the application.
    NotifyError,
}

/// Group formation state machine. Host passes events; controller returns actions.
pub struct GroupController {
    local_id: String,
    port: u16,
    state: GroupState,
    peers: PeerTable,
    connect_failures: u32,
    max_connect_failures: u32,
}

impl GroupController {
    /// `local_id` is this device's identifier; `port` is where it listens when it becomes the relay.
    pub fn new(local_id: impl Into<String>, port: u16) -> Self {
        Self {
            local_id: local_id.into(),
            port,
            state: GroupState::Idle,
            peers: PeerTable::new(),
            connect_failures: 0,
            max_connect_failures: DEFAULT_MAX_CONNECT_FAILURES,
        }
    }

    /// Set consecutive relay connection failures tolerated before `NotifyError`.
    pub fn set_max_connect_failures(&mut self, n: u32) {
        self.max_connect_failures = n.max(1);
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn state(&self) -> &GroupState {
        &self.state
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, GroupState::Active(_))
    }

    /// Idle -> Discovering.
    pub fn start(&mut self) -> Vec<GroupAction> {
        if self.state != GroupState::Idle {
            return vec![];
        }
        self.state = GroupState::Discovering;
        self.connect_failures = 0;
        vec![GroupAction::Publish {
            identifier: self.local_id.clone(),
            port: self.port,
        }]
    }

    /// Any -> Idle.
    pub fn stop(&mut self) -> Vec<GroupAction> {
        let mut actions = Vec::new();
        if self.is_active() {
            actions.push(GroupAction::TearDown);
        }
        if self.state != GroupState::Idle {
            actions.push(GroupAction::Unpublish);
        }
        self.state = GroupState::Idle;
        self.peers = PeerTable::new();
        actions
    }

    /// Discovery snapshot. Peers that vanished are dropped from the table only; an active link
    /// is torn down by its own failure path, never by a stale discovery signal.
    pub fn on_peers_changed(&mut self, records: Vec<PeerRecord>) -> Vec<GroupAction> {
        if self.state == GroupState::Idle {
            return vec![];
        }
        self.peers.replace_all(records);
        let reselect = match &self.state {
            GroupState::Discovering => true,
            GroupState::FormingLink { target } => self.peers.get(target).is_none(),
            _ => false,
        };
        if reselect {
            self.try_select()
        } else {
            vec![]
        }
    }

    pub fn on_link_status(&mut self, status: LinkStatus) -> Vec<GroupAction> {
        let forming_target = match &self.state {
            GroupState::Discovering => None,
            GroupState::FormingLink { target } => Some(target.clone()),
            _ => return vec![],
        };
        if !status.formed {
            // Still negotiating: try again.
            return match forming_target {
                Some(_) => self.try_select(),
                None => vec![],
            };
        }
        if status.is_platform_owner {
            self.state = GroupState::Active(Role::Relay);
            self.connect_failures = 0;
            return vec![GroupAction::StartRelay { port: self.port }];
        }
        let target = forming_target.as_deref().and_then(|t| self.peers.get(t));
        let address = status
            .relay_address
            .or_else(|| target.map(|p| p.link_address.clone()));
        let port = status.relay_port.or_else(|| target.and_then(|p| p.port));
        match (address, port) {
            (Some(address), Some(port)) => {
                self.state = GroupState::Active(Role::Client);
                vec![GroupAction::StartClient { address, port }]
            }
            _ => {
                self.state = GroupState::Discovering;
                vec![]
            }
        }
    }

    /// Link request failed outright.
    pub fn on_link_failed(&mut self) -> Vec<GroupAction> {
        if matches!(self.state, GroupState::FormingLink { .. }) {
            self.state = GroupState::Discovering;
        }
        vec![]
    }

    /// The client could not reach the relay (connect timeout or refused).
    pub fn on_connect_failed(&mut self) -> Vec<GroupAction> {
        if self.state != GroupState::Active(Role::Client) {
            return vec![];
        }
        let mut actions = self.recover();
        self.connect_failures += 1;
        if self.connect_failures == self.max_connect_failures {
            actions.push(GroupAction::NotifyError);
        }
        actions
    }

    /// The client reached the relay and finished the handshake.
    pub fn on_connected(&mut self) {
        self.connect_failures = 0;
    }

    /// The active hub or client reported a fatal link error.
    pub fn on_error(&mut self) -> Vec<GroupAction> {
        if !self.is_active() {
            return vec![];
        }
        self.recover()
    }

    /// The negotiation layer reported the link itself is gone.
    pub fn on_link_dropped(&mut self) -> Vec<GroupAction> {
        match self.state {
            GroupState::Active(_) => self.recover(),
            GroupState::FormingLink { .. } => {
                self.state = GroupState::Discovering;
                vec![]
            }
            _ => vec![],
        }
    }

    /// The host finished a `TearDown`. Recovering -> Discovering.
    pub fn on_torn_down(&mut self) -> Vec<GroupAction> {
        if self.state != GroupState::Recovering {
            return vec![];
        }
        self.try_select()
    }

    /// Active -> Recovering; `on_torn_down` completes the move back to Discovering.
    fn recover(&mut self) -> Vec<GroupAction> {
        self.state = GroupState::Recovering;
        self.peers.clear_bindings();
        vec![GroupAction::TearDown]
    }

    fn try_select(&mut self) -> Vec<GroupAction> {
        match peers::select_target(&self.peers, &self.local_id) {
            Some(peer) => {
                let link_address = peer.link_address.clone();
                self.state = GroupState::FormingLink {
                    target: link_address.clone(),
                };
                vec![GroupAction::RequestLink { link_address }]
            }
            None => {
                self.state = GroupState::Discovering;
                vec![]
            }
        }
    }
}
