//! Group runtime: drives the GroupController with discovery events and link failures, and
//! performs its actions (publish, request links, run the relay hub or the link client).

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use nearby_core::{GroupAction, GroupController, GroupState, Message, Role};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::client::LinkClient;
use crate::config::Config;
use crate::discovery::{Discovery, DiscoveryEvent};
use crate::error::LinkError;
use crate::events::{Delivery, GroupEvent, PendingRequests};
use crate::hub::{HubConfig, RelayHub};

/// Fatal link error from a hub or client. `generation` identifies which component instance
/// failed so reports from one already torn down are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkFailure {
    pub generation: u64,
}

#[derive(Clone)]
enum ActiveLink {
    Relay(RelayHub),
    Client(LinkClient),
}

pub struct GroupRuntime;

impl GroupRuntime {
    /// Start the group layer. Returns the handle the application sends through and the channel
    /// it receives [`GroupEvent`]s on. Each call is an independent instance.
    pub fn start<D: Discovery>(
        config: Config,
        discovery: D,
        discovery_events: mpsc::UnboundedReceiver<DiscoveryEvent>,
    ) -> (GroupHandle, mpsc::UnboundedReceiver<GroupEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = mpsc::unbounded_channel();

        let mut controller = GroupController::new(config.identifier.clone(), config.relay_port);
        controller.set_max_connect_failures(config.max_connect_failures);
        let controller = Arc::new(Mutex::new(controller));
        let active = Arc::new(RwLock::new(None));
        let delivery = Delivery::new(events_tx, PendingRequests::new());

        let handle = GroupHandle {
            identifier: config.identifier.clone(),
            request_timeout: config.request_timeout(),
            controller: controller.clone(),
            active: active.clone(),
            stop_tx,
        };
        let runner = Runner {
            config,
            discovery,
            controller,
            active,
            delivery,
            failures_tx,
            generation: 0,
        };
        tokio::spawn(runner.run(discovery_events, failures_rx, stop_rx));
        (handle, events_rx)
    }
}

/// Application-side handle. Cheap to clone.
#[derive(Clone)]
pub struct GroupHandle {
    identifier: String,
    request_timeout: Duration,
    controller: Arc<Mutex<GroupController>>,
    active: Arc<RwLock<Option<ActiveLink>>>,
    stop_tx: mpsc::UnboundedSender<oneshot::Sender<()>>,
}

impl GroupHandle {
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub async fn state(&self) -> GroupState {
        self.controller.lock().await.state().clone()
    }

    /// Send to one peer or [`BROADCAST`](nearby_core::BROADCAST). Best-effort: an absent
    /// receiver is not an error.
    pub async fn send(&self, message: Message) -> Result<(), LinkError> {
        let active = self.active.read().await.clone();
        match active {
            Some(ActiveLink::Relay(hub)) => hub.send(message).await,
            Some(ActiveLink::Client(client)) => client.send(message).await,
            None => Err(LinkError::NotActive),
        }
    }

    /// Send a request and wait for the peer's reply.
    pub async fn send_request(&self, message: Message) -> Result<Message, LinkError> {
        let active = self.active.read().await.clone();
        match active {
            Some(ActiveLink::Relay(hub)) => hub.send_request(message, self.request_timeout).await,
            Some(ActiveLink::Client(client)) => {
                client.send_request(message, self.request_timeout).await
            }
            None => Err(LinkError::NotActive),
        }
    }

    /// Tear down any active link and stop discovery. Idempotent.
    pub async fn stop(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.stop_tx.send(ack_tx).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

struct Runner<D> {
    config: Config,
    discovery: D,
    controller: Arc<Mutex<GroupController>>,
    active: Arc<RwLock<Option<ActiveLink>>>,
    delivery: Delivery,
    failures_tx: mpsc::UnboundedSender<LinkFailure>,
    /// Bumped for every hub or client started.
    generation: u64,
}

impl<D: Discovery> Runner<D> {
    async fn run(
        mut self,
        mut discovery_events: mpsc::UnboundedReceiver<DiscoveryEvent>,
        mut failures: mpsc::UnboundedReceiver<LinkFailure>,
        mut stop: mpsc::UnboundedReceiver<oneshot::Sender<()>>,
    ) {
        info!(identifier = %self.config.identifier, "group runtime starting");
        let actions = self.controller.lock().await.start();
        self.execute(actions).await;
        loop {
            tokio::select! {
                Some(event) = discovery_events.recv() => {
                    let actions = {
                        let mut controller = self.controller.lock().await;
                        match event {
                            DiscoveryEvent::PeersChanged(peers) => controller.on_peers_changed(peers),
                            DiscoveryEvent::LinkStatus(status) => controller.on_link_status(status),
                            DiscoveryEvent::LinkFailed => controller.on_link_failed(),
                            DiscoveryEvent::LinkDropped => {
                                let actions = controller.on_link_dropped();
                                if actions.contains(&GroupAction::TearDown) {
                                    self.delivery.emit(GroupEvent::Error);
                                }
                                actions
                            }
                        }
                    };
                    self.execute(actions).await;
                }
                Some(failure) = failures.recv() => {
                    if failure.generation != self.generation {
                        debug!(generation = failure.generation, "ignoring failure from a stale link");
                        continue;
                    }
                    let actions = self.controller.lock().await.on_error();
                    if !actions.is_empty() {
                        self.delivery.emit(GroupEvent::Error);
                    }
                    self.execute(actions).await;
                }
                ack = stop.recv() => {
                    let actions = self.controller.lock().await.stop();
                    self.execute(actions).await;
                    if let Some(ack) = ack {
                        let _ = ack.send(());
                    }
                    break;
                }
            }
        }
        // Later stop() calls find the channel closed and return at once.
        stop.close();
        while let Ok(ack) = stop.try_recv() {
            let _ = ack.send(());
        }
        info!(identifier = %self.config.identifier, "group runtime stopped");
    }

    async fn execute(&mut self, actions: Vec<GroupAction>) {
        let mut queue: VecDeque<GroupAction> = actions.into();
        while let Some(action) = queue.pop_front() {
            debug!(?action, "group action");
            match action {
                GroupAction::Publish { identifier, port } => self.discovery.publish(&identifier, port),
                GroupAction::Unpublish => self.discovery.unpublish(),
                GroupAction::RequestLink { link_address } => {
                    self.discovery.request_link(&link_address)
                }
                GroupAction::StartRelay { port } => {
                    match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await {
                        Ok(listener) => {
                            self.generation += 1;
                            let hub = RelayHub::start(
                                listener,
                                HubConfig {
                                    identifier: self.config.identifier.clone(),
                                    handshake_timeout: self.config.handshake_timeout(),
                                    dispatch_workers: self.config.dispatch_workers,
                                },
                                self.delivery.clone(),
                                self.failures_tx.clone(),
                                self.generation,
                            );
                            *self.active.write().await = Some(ActiveLink::Relay(hub));
                            self.discovery.role_changed(Some(Role::Relay));
                        }
                        Err(e) => {
                            warn!(port, error = %e, "cannot listen for members");
                            self.delivery.emit(GroupEvent::Error);
                            queue.extend(self.controller.lock().await.on_error());
                        }
                    }
                }
                GroupAction::StartClient { address, port } => {
                    self.generation += 1;
                    let connected = LinkClient::connect(
                        &address,
                        port,
                        &self.config.identifier,
                        self.config.connect_timeout(),
                        self.delivery.clone(),
                        self.failures_tx.clone(),
                        self.generation,
                    )
                    .await;
                    match connected {
                        Ok(client) => {
                            self.controller.lock().await.on_connected();
                            *self.active.write().await = Some(ActiveLink::Client(client));
                            self.discovery.role_changed(Some(Role::Client));
                        }
                        Err(e) => {
                            debug!(%address, port, error = %e, "relay unreachable");
                            queue.extend(self.controller.lock().await.on_connect_failed());
                        }
                    }
                }
                GroupAction::TearDown => {
                    let active = self.active.write().await.take();
                    match active {
                        Some(ActiveLink::Relay(hub)) => hub.shutdown().await,
                        Some(ActiveLink::Client(client)) => client.disconnect().await,
                        None => {}
                    }
                    self.delivery.requests().clear().await;
                    self.discovery.role_changed(None);
                    queue.extend(self.controller.lock().await.on_torn_down());
                }
                GroupAction::NotifyError => self.delivery.emit(GroupEvent::Error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nearby_core::{LinkStatus, PeerRecord};

    /// Discovery stand-in that records what the runtime asked of it.
    #[derive(Clone, Default)]
    struct Recorder {
        calls: Arc<std::sync::Mutex<Vec<String>>>,
    }

    impl Recorder {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn push(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl Discovery for Recorder {
        fn publish(&mut self, identifier: &str, port: u16) {
            self.push(format!("publish {identifier} {port}"));
        }
        fn unpublish(&mut self) {
            self.push("unpublish".into());
        }
        fn request_link(&mut self, link_address: &str) {
            self.push(format!("request {link_address}"));
        }
        fn role_changed(&mut self, role: Option<Role>) {
            self.push(format!("role {role:?}"));
        }
    }

    struct Node {
        handle: GroupHandle,
        events: mpsc::UnboundedReceiver<GroupEvent>,
        discovery: mpsc::UnboundedSender<DiscoveryEvent>,
        recorder: Recorder,
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn node(identifier: &str, relay_port: u16) -> Node {
        let config = Config {
            identifier: identifier.into(),
            relay_port,
            connect_timeout_ms: 300,
            request_timeout_ms: 2000,
            max_connect_failures: 1,
            ..Config::default()
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let recorder = Recorder::default();
        let (handle, events) = GroupRuntime::start(config, recorder.clone(), rx);
        Node {
            handle,
            events,
            discovery: tx,
            recorder,
        }
    }

    async fn wait_state(handle: &GroupHandle, want: GroupState) {
        for _ in 0..200 {
            if handle.state().await == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("state never became {want:?}, is {:?}", handle.state().await);
    }

    async fn next(events: &mut mpsc::UnboundedReceiver<GroupEvent>) -> GroupEvent {
        tokio::time::timeout(Duration::from_secs(3), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn two_devices_form_group_and_recover() {
        let port = free_port();
        let mut a = node("a1", port);
        let mut b = node("b2", port);

        // a1 has the smallest identifier: it selects nobody and waits.
        a.discovery
            .send(DiscoveryEvent::PeersChanged(vec![PeerRecord::published("B", "b2", port)]))
            .unwrap();
        b.discovery
            .send(DiscoveryEvent::PeersChanged(vec![PeerRecord::published("A", "a1", port)]))
            .unwrap();
        wait_state(&b.handle, GroupState::FormingLink { target: "A".into() }).await;
        assert_eq!(a.handle.state().await, GroupState::Discovering);
        assert!(b.recorder.calls().contains(&"request A".to_string()));

        a.discovery.send(DiscoveryEvent::LinkStatus(LinkStatus::relay())).unwrap();
        wait_state(&a.handle, GroupState::Active(Role::Relay)).await;
        b.discovery
            .send(DiscoveryEvent::LinkStatus(LinkStatus::client("127.0.0.1", port)))
            .unwrap();
        wait_state(&b.handle, GroupState::Active(Role::Client)).await;

        assert!(matches!(next(&mut b.events).await, GroupEvent::InstanceFound(id) if id == "a1"));
        assert!(matches!(next(&mut a.events).await, GroupEvent::InstanceFound(id) if id == "b2"));

        b.handle
            .send(Message::data("a1").with_arg("text", "hello relay"))
            .await
            .unwrap();
        match next(&mut a.events).await {
            GroupEvent::MessageReceived(m) => {
                assert_eq!(m.sender_id, "b2");
                assert_eq!(m.arg("text"), Some("hello relay"));
            }
            other => panic!("unexpected {other:?}"),
        }

        let mut b_events = b.events;
        let responder = tokio::spawn(async move {
            if let GroupEvent::Request { message, reply } = next(&mut b_events).await {
                reply.respond(Message::data("").with_arg("len", message.args.len().to_string()));
            } else {
                panic!("expected request");
            }
            b_events
        });
        let reply = a
            .handle
            .send_request(Message::request("b2").with_arg("q", "x"))
            .await
            .unwrap();
        assert_eq!(reply.sender_id, "b2");
        assert_eq!(reply.arg("len"), Some("2")); // q + request-id
        let mut b_events = responder.await.unwrap();

        // Relay goes away: the client reports the error and rediscovers.
        a.handle.stop().await;
        a.handle.stop().await;
        assert_eq!(a.handle.state().await, GroupState::Idle);
        assert!(matches!(next(&mut b_events).await, GroupEvent::Error));
        wait_state(&b.handle, GroupState::Discovering).await;
        let calls = b.recorder.calls();
        assert_eq!(calls.last().map(String::as_str), Some("role None"));
        assert!(matches!(
            b.handle.send(Message::data("a1")).await,
            Err(LinkError::NotActive)
        ));
        assert!(a.recorder.calls().contains(&"unpublish".to_string()));
    }

    #[tokio::test]
    async fn unreachable_relay_reports_error() {
        let dead_port = free_port();
        let mut b = node("b2", free_port());
        b.discovery
            .send(DiscoveryEvent::PeersChanged(vec![PeerRecord::published("A", "a1", dead_port)]))
            .unwrap();
        b.discovery
            .send(DiscoveryEvent::LinkStatus(LinkStatus::client("127.0.0.1", dead_port)))
            .unwrap();
        assert!(matches!(next(&mut b.events).await, GroupEvent::Error));
        assert_eq!(b.handle.state().await, GroupState::Discovering);
        b.handle.stop().await;
    }

    #[tokio::test]
    async fn link_failure_while_forming_returns_to_discovering() {
        let port = free_port();
        let b = node("b2", port);
        b.discovery
            .send(DiscoveryEvent::PeersChanged(vec![PeerRecord::published("A", "a1", 1)]))
            .unwrap();
        wait_state(&b.handle, GroupState::FormingLink { target: "A".into() }).await;
        b.discovery.send(DiscoveryEvent::LinkFailed).unwrap();
        wait_state(&b.handle, GroupState::Discovering).await;
        assert_eq!(
            b.recorder.calls(),
            vec![format!("publish b2 {port}"), "request A".to_string()]
        );
        assert!(matches!(
            b.handle.send_request(Message::request("a1")).await,
            Err(LinkError::NotActive)
        ));
    }
}
