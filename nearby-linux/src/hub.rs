//! Relay hub: accepts member connections, serializes membership changes, and routes messages
//! between members.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nearby_core::{Message, MessageKind, BROADCAST};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, info, warn};

use crate::connection::{read_frame, ConnectionEvent, ConnectionId, PeerConnection};
use crate::error::LinkError;
use crate::events::{Delivery, GroupEvent};
use crate::runtime::LinkFailure;

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub identifier: String,
    pub handshake_timeout: Duration,
    pub dispatch_workers: usize,
}

/// Handle to a running relay hub. Cheap to clone.
#[derive(Clone)]
pub struct RelayHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    identifier: String,
    handshake_timeout: Duration,
    /// Membership gate: every insert/remove and its announcements happen under this lock.
    members: Mutex<HashMap<String, Arc<PeerConnection>>>,
    /// Serializes outbound routing so two broadcasts never interleave per peer.
    send_gate: Mutex<()>,
    delivery: Delivery,
    /// One queue per dispatch worker; a connection always maps to the same worker.
    workers: Vec<mpsc::UnboundedSender<ConnectionEvent>>,
    /// Answers from the local application, sent back by the reply task.
    replies: mpsc::UnboundedSender<Message>,
    next_conn: AtomicU64,
    shutdown: watch::Sender<bool>,
}

impl RelayHub {
    /// Start accepting members on `listener`. A fatal accept error is reported on `failures`
    /// tagged with `generation`.
    pub fn start(
        listener: TcpListener,
        config: HubConfig,
        delivery: Delivery,
        failures: mpsc::UnboundedSender<LinkFailure>,
        generation: u64,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let worker_count = config.dispatch_workers.max(1);
        let mut workers = Vec::with_capacity(worker_count);
        let mut queues = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let (tx, rx) = mpsc::unbounded_channel();
            workers.push(tx);
            queues.push(rx);
        }
        let (replies, replies_rx) = mpsc::unbounded_channel();
        let hub = Self {
            inner: Arc::new(HubInner {
                identifier: config.identifier,
                handshake_timeout: config.handshake_timeout,
                members: Mutex::new(HashMap::new()),
                send_gate: Mutex::new(()),
                delivery,
                workers,
                replies,
                next_conn: AtomicU64::new(1),
                shutdown,
            }),
        };
        for queue in queues {
            let worker = hub.clone();
            let stop = hub.inner.shutdown.subscribe();
            tokio::spawn(async move { worker.dispatch_worker(queue, stop).await });
        }
        let replier = hub.clone();
        let stop = hub.inner.shutdown.subscribe();
        tokio::spawn(async move { replier.reply_loop(replies_rx, stop).await });
        let acceptor = hub.clone();
        let stop = hub.inner.shutdown.subscribe();
        tokio::spawn(async move {
            acceptor
                .accept_loop(listener, stop, failures, generation)
                .await
        });
        info!(identifier = %hub.inner.identifier, "relay hub started");
        hub
    }

    pub fn identifier(&self) -> &str {
        &self.inner.identifier
    }

    /// Identifiers of the currently admitted members (not including the relay).
    pub async fn member_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.members.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Application-originated message. Routed like an inbound one, with this relay as sender.
    pub async fn send(&self, mut message: Message) -> Result<(), LinkError> {
        message.sender_id = self.inner.identifier.clone();
        self.route(message).await;
        Ok(())
    }

    pub async fn send_request(&self, mut message: Message, timeout: Duration) -> Result<Message, LinkError> {
        let requests = self.inner.delivery.requests().clone();
        let (id, rx) = requests.register(&mut message).await;
        self.send(message).await?;
        requests.wait(id, rx, timeout).await
    }

    /// Stop accepting, close every member. Idempotent.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.send_replace(true) {
            return;
        }
        let members: Vec<Arc<PeerConnection>> = {
            let mut members = self.inner.members.lock().await;
            members.drain().map(|(_, conn)| conn).collect()
        };
        for conn in members {
            conn.close().await;
        }
        info!(identifier = %self.inner.identifier, "relay hub stopped");
    }

    async fn accept_loop(
        self,
        listener: TcpListener,
        mut stop: watch::Receiver<bool>,
        failures: mpsc::UnboundedSender<LinkFailure>,
        generation: u64,
    ) {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!(%addr, "inbound connection");
                        let hub = self.clone();
                        tokio::spawn(async move { hub.admit(stream).await });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed, relay hub giving up");
                        let _ = failures.send(LinkFailure { generation });
                        break;
                    }
                },
                _ = stop.changed() => break,
            }
        }
    }

    /// Join handshake: the first frame must be `connect` carrying the peer's identifier.
    async fn admit(&self, mut stream: TcpStream) {
        let first = tokio::time::timeout(self.inner.handshake_timeout, read_frame(&mut stream)).await;
        let identifier = match first {
            Ok(Ok(Some(msg))) if msg.kind == MessageKind::Connect && is_member_id(&msg.sender_id) => {
                msg.sender_id
            }
            Ok(Ok(Some(msg))) => {
                warn!(kind = ?msg.kind, "first frame was not a valid connect, dropping");
                return;
            }
            Ok(Ok(None)) => return,
            Ok(Err(e)) => {
                debug!(error = %e, "handshake failed");
                return;
            }
            Err(_) => {
                debug!("handshake timed out");
                return;
            }
        };
        if identifier == self.inner.identifier {
            warn!(%identifier, "peer claims the relay's own identifier, dropping");
            return;
        }
        let conn_id = self.inner.next_conn.fetch_add(1, Ordering::Relaxed);
        let queue = self.worker_for(conn_id).clone();
        let conn = PeerConnection::spawn(stream, conn_id, identifier.clone(), queue);
        self.on_member_joined(identifier, conn).await;
    }

    fn worker_for(&self, conn: ConnectionId) -> &mpsc::UnboundedSender<ConnectionEvent> {
        let workers = &self.inner.workers;
        &workers[(conn as usize) % workers.len()]
    }

    async fn dispatch_worker(
        self,
        mut queue: mpsc::UnboundedReceiver<ConnectionEvent>,
        mut stop: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                event = queue.recv() => match event {
                    Some(ConnectionEvent::Message { message, .. }) => self.route(message).await,
                    Some(ConnectionEvent::Closed { conn, peer_id, .. }) => {
                        self.on_member_left(&peer_id, conn).await
                    }
                    None => break,
                },
                _ = stop.changed() => break,
            }
        }
    }

    /// Admit `conn` under `identifier`. Existing members hear about the newcomer; the newcomer
    /// hears about everyone present at admission, the relay included.
    pub(crate) async fn on_member_joined(&self, identifier: String, conn: Arc<PeerConnection>) {
        let relay_id = &self.inner.identifier;
        let evicted = {
            let mut members = self.inner.members.lock().await;
            if conn.is_closed() || *self.inner.shutdown.borrow() {
                drop(members);
                conn.close().await;
                return;
            }
            let existing: Vec<(String, Arc<PeerConnection>)> = members
                .iter()
                .filter(|(id, _)| **id != identifier)
                .map(|(id, c)| (id.clone(), c.clone()))
                .collect();
            let evicted = members.insert(identifier.clone(), conn.clone());
            if evicted.is_none() {
                for (member_id, member) in &existing {
                    let found = self.stamp(Message::instance_found(member_id.as_str(), identifier.as_str()));
                    if let Err(e) = member.send(&found).await {
                        debug!(member = %member_id, error = %e, "announce failed");
                    }
                }
                self.inner.delivery.emit(GroupEvent::InstanceFound(identifier.clone()));
            }
            let present = std::iter::once(relay_id.clone()).chain(existing.into_iter().map(|(id, _)| id));
            for member_id in present {
                let found = self.stamp(Message::instance_found(identifier.as_str(), member_id));
                if let Err(e) = conn.send(&found).await {
                    debug!(member = %identifier, error = %e, "snapshot to new member failed");
                    break;
                }
            }
            evicted
        };
        info!(member = %identifier, conn = conn.id(), replaced = evicted.is_some(), "member joined");
        if let Some(old) = evicted {
            old.close().await;
        }
    }

    /// Remove `identifier` if it is still served by connection `conn`, then tell the rest.
    pub(crate) async fn on_member_left(&self, identifier: &str, conn: ConnectionId) {
        let removed = {
            let mut members = self.inner.members.lock().await;
            let current = members.get(identifier).is_some_and(|c| c.id() == conn);
            if !current {
                return;
            }
            let removed = members.remove(identifier);
            for (member_id, member) in members.iter() {
                let lost = self.stamp(Message::instance_lost(member_id.as_str(), identifier));
                if let Err(e) = member.send(&lost).await {
                    debug!(member = %member_id, error = %e, "announce failed");
                }
            }
            self.inner.delivery.emit(GroupEvent::InstanceLost(identifier.to_string()));
            removed
        };
        info!(member = %identifier, conn, "member left");
        if let Some(old) = removed {
            old.close().await;
        }
    }

    fn stamp(&self, mut message: Message) -> Message {
        message.sender_id = self.inner.identifier.clone();
        message
    }

    /// Route one message: to the relay itself, to every member but the sender, or to one member.
    /// Unicast to an absent member is dropped silently.
    async fn route(&self, message: Message) {
        let _gate = self.inner.send_gate.lock().await;
        let relay_id = &self.inner.identifier;
        if message.receiver_id == *relay_id {
            self.deliver_local(message).await;
        } else if message.is_broadcast() {
            let targets: Vec<(String, Arc<PeerConnection>)> = {
                let members = self.inner.members.lock().await;
                members
                    .iter()
                    .filter(|(id, _)| **id != message.sender_id)
                    .map(|(id, c)| (id.clone(), c.clone()))
                    .collect()
            };
            for (member_id, member) in targets {
                if let Err(e) = member.send(&message).await {
                    debug!(member = %member_id, error = %e, "broadcast delivery failed");
                }
            }
            if message.sender_id != *relay_id {
                self.deliver_local(message).await;
            }
        } else {
            let target = self.inner.members.lock().await.get(&message.receiver_id).cloned();
            match target {
                Some(member) => {
                    if let Err(e) = member.send(&message).await {
                        debug!(member = %message.receiver_id, error = %e, "unicast delivery failed");
                    }
                }
                None => debug!(receiver = %message.receiver_id, "no such member, dropping message"),
            }
        }
    }

    async fn deliver_local(&self, message: Message) {
        if let Some(reply) = self.inner.delivery.deliver(message).await {
            let replies = self.inner.replies.clone();
            tokio::spawn(forward_reply(reply, replies));
        }
    }

    async fn reply_loop(self, mut replies: mpsc::UnboundedReceiver<Message>, mut stop: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                reply = replies.recv() => match reply {
                    Some(reply) => {
                        let _ = self.send(reply).await;
                    }
                    None => break,
                },
                _ = stop.changed() => break,
            }
        }
    }
}

/// Identifiers a member may join under: non-blank and not the broadcast address.
fn is_member_id(identifier: &str) -> bool {
    !identifier.trim().is_empty() && identifier != BROADCAST
}

async fn forward_reply(reply: oneshot::Receiver<Message>, replies: mpsc::UnboundedSender<Message>) {
    if let Ok(response) = reply.await {
        let _ = replies.send(response);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::PendingRequests;
    use nearby_core::{InstanceEvent, BROADCAST};
    use std::collections::BTreeSet;
    use std::net::SocketAddr;
    use tokio::io::AsyncWriteExt;

    struct TestHub {
        hub: RelayHub,
        addr: SocketAddr,
        events: mpsc::UnboundedReceiver<GroupEvent>,
    }

    async fn start_hub(identifier: &str) -> TestHub {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (events_tx, events) = mpsc::unbounded_channel();
        let (failures, _) = mpsc::unbounded_channel();
        let hub = RelayHub::start(
            listener,
            HubConfig {
                identifier: identifier.into(),
                handshake_timeout: Duration::from_millis(500),
                dispatch_workers: 2,
            },
            Delivery::new(events_tx, PendingRequests::new()),
            failures,
            1,
        );
        TestHub { hub, addr, events }
    }

    /// Raw member: a connection that completed the handshake, plus its inbound queue.
    struct Member {
        conn: Arc<PeerConnection>,
        rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    }

    impl Member {
        async fn next(&mut self) -> Message {
            let event = tokio::time::timeout(Duration::from_secs(2), self.rx.recv())
                .await
                .expect("timed out waiting for message")
                .expect("channel closed");
            match event {
                ConnectionEvent::Message { message, .. } => message,
                other => panic!("unexpected {other:?}"),
            }
        }

        async fn found(&mut self, n: usize) -> Vec<String> {
            let mut ids = Vec::new();
            for _ in 0..n {
                match self.next().await.instance_event() {
                    Some(InstanceEvent::Found(id)) => ids.push(id),
                    other => panic!("expected found, got {other:?}"),
                }
            }
            ids.sort();
            ids
        }

        async fn quiet(&mut self) -> bool {
            tokio::time::timeout(Duration::from_millis(150), self.rx.recv())
                .await
                .is_err()
        }

        async fn send(&self, mut message: Message, as_id: &str) {
            message.sender_id = as_id.into();
            self.conn.send(&message).await.unwrap();
        }
    }

    async fn join(hub: &TestHub, identifier: &str) -> Member {
        join_at(hub.addr, identifier).await
    }

    async fn join_at(addr: SocketAddr, identifier: &str) -> Member {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = PeerConnection::spawn(stream, 0, "relay", tx);
        conn.send(&Message::connect(identifier)).await.unwrap();
        Member { conn, rx }
    }

    async fn wait_members(hub: &RelayHub, n: usize) {
        for _ in 0..100 {
            if hub.member_ids().await.len() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("member count never reached {n}");
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<GroupEvent>) -> GroupEvent {
        tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn newcomer_gets_snapshot_others_get_one_found() {
        let mut t = start_hub("r0").await;
        let mut x = join(&t, "x").await;
        assert_eq!(x.found(1).await, vec!["r0"]);
        let mut y = join(&t, "y").await;
        assert_eq!(y.found(2).await, vec!["r0", "x"]);
        assert_eq!(x.found(1).await, vec!["y"]);

        let mut z = join(&t, "z").await;
        assert_eq!(z.found(3).await, vec!["r0", "x", "y"]);
        assert_eq!(x.found(1).await, vec!["z"]);
        assert_eq!(y.found(1).await, vec!["z"]);
        assert!(x.quiet().await && y.quiet().await && z.quiet().await);

        for expected in ["x", "y", "z"] {
            assert!(matches!(next_event(&mut t.events).await, GroupEvent::InstanceFound(id) if id == expected));
        }
    }

    #[tokio::test]
    async fn leave_announces_lost() {
        let mut t = start_hub("r0").await;
        let mut x = join(&t, "x").await;
        x.found(1).await;
        let y = join(&t, "y").await;
        x.found(1).await;
        wait_members(&t.hub, 2).await;

        y.conn.close().await;
        match x.next().await.instance_event() {
            Some(InstanceEvent::Lost(id)) => assert_eq!(id, "y"),
            other => panic!("expected lost, got {other:?}"),
        }
        wait_members(&t.hub, 1).await;
        next_event(&mut t.events).await;
        next_event(&mut t.events).await;
        assert!(matches!(next_event(&mut t.events).await, GroupEvent::InstanceLost(id) if id == "y"));
    }

    #[tokio::test]
    async fn broadcast_skips_sender() {
        let mut t = start_hub("r0").await;
        let mut x = join(&t, "x").await;
        x.found(1).await;
        let mut y = join(&t, "y").await;
        y.found(2).await;
        x.found(1).await;
        let mut z = join(&t, "z").await;
        z.found(3).await;
        x.found(1).await;
        y.found(1).await;

        x.send(Message::data(BROADCAST).with_arg("text", "hi"), "x").await;
        assert_eq!(y.next().await.arg("text"), Some("hi"));
        assert_eq!(z.next().await.arg("text"), Some("hi"));
        assert!(x.quiet().await);

        // Relay application receives it too.
        loop {
            if let GroupEvent::MessageReceived(m) = next_event(&mut t.events).await {
                assert_eq!(m.sender_id, "x");
                break;
            }
        }

        // Relay-originated broadcast reaches every member but not the relay itself.
        t.hub.send(Message::data(BROADCAST).with_arg("text", "all")).await.unwrap();
        for m in [&mut x, &mut y, &mut z] {
            let msg = m.next().await;
            assert_eq!(msg.sender_id, "r0");
            assert_eq!(msg.arg("text"), Some("all"));
        }
        assert!(tokio::time::timeout(Duration::from_millis(150), t.events.recv()).await.is_err());
    }

    #[tokio::test]
    async fn unicast_routes_and_absent_is_dropped() {
        let t = start_hub("r0").await;
        let mut x = join(&t, "x").await;
        x.found(1).await;
        let mut y = join(&t, "y").await;
        y.found(2).await;
        x.found(1).await;

        x.send(Message::data("y").with_arg("n", "1"), "x").await;
        let got = y.next().await;
        assert_eq!(got.sender_id, "x");
        assert_eq!(got.arg("n"), Some("1"));

        x.send(Message::data("ghost"), "x").await;
        t.hub.send(Message::data("ghost")).await.unwrap();
        assert!(x.quiet().await && y.quiet().await);
    }

    #[tokio::test]
    async fn rejoin_replaces_old_connection() {
        let t = start_hub("r0").await;
        let mut x = join(&t, "x").await;
        x.found(1).await;
        let mut x2 = join(&t, "x").await;
        x2.found(1).await;
        // Old link is closed after the replacement is installed.
        loop {
            match tokio::time::timeout(Duration::from_secs(2), x.rx.recv()).await.unwrap() {
                Some(ConnectionEvent::Closed { .. }) | None => break,
                Some(_) => {}
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(t.hub.member_ids().await, vec!["x"]);
        t.hub.send(Message::data("x").with_arg("to", "new")).await.unwrap();
        assert_eq!(x2.next().await.arg("to"), Some("new"));
    }

    #[tokio::test]
    async fn non_connect_first_frame_rejected() {
        let t = start_hub("r0").await;
        let mut stream = TcpStream::connect(t.addr).await.unwrap();
        let mut bogus = Message::data("r0");
        bogus.sender_id = "x".into();
        stream
            .write_all(&nearby_core::encode_frame(&bogus).unwrap())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(t.hub.member_ids().await.is_empty());
    }

    #[tokio::test]
    async fn request_to_relay_gets_reply() {
        let mut t = start_hub("r0").await;
        let mut x = join(&t, "x").await;
        x.found(1).await;
        next_event(&mut t.events).await;

        let responder = tokio::spawn(async move {
            if let GroupEvent::Request { message, reply } = next_event(&mut t.events).await {
                assert_eq!(message.arg("q"), Some("time"));
                reply.respond(Message::data("").with_arg("a", "noon"));
            } else {
                panic!("expected request");
            }
        });
        x.send(
            Message::request("r0")
                .with_arg("q", "time")
                .with_arg(nearby_core::protocol::ARG_REQUEST_ID, "req-1"),
            "x",
        )
        .await;
        let reply = x.next().await;
        responder.await.unwrap();
        assert!(reply.is_reply());
        assert_eq!(reply.request_id(), Some("req-1"));
        assert_eq!(reply.arg("a"), Some("noon"));
    }

    #[tokio::test]
    async fn shutdown_closes_members() {
        let t = start_hub("r0").await;
        let mut x = join(&t, "x").await;
        x.found(1).await;
        wait_members(&t.hub, 1).await;
        t.hub.shutdown().await;
        t.hub.shutdown().await;
        loop {
            match tokio::time::timeout(Duration::from_secs(2), x.rx.recv()).await.unwrap() {
                Some(ConnectionEvent::Closed { .. }) | None => break,
                Some(_) => {}
            }
        }
        assert!(t.hub.member_ids().await.is_empty());
    }

    async fn wait_closed(member: &mut Member) {
        loop {
            match tokio::time::timeout(Duration::from_secs(2), member.rx.recv()).await.unwrap() {
                Some(ConnectionEvent::Closed { .. }) | None => break,
                Some(_) => {}
            }
        }
    }

    #[tokio::test]
    async fn reserved_identifiers_rejected() {
        let t = start_hub("r0").await;
        for identifier in [BROADCAST, "", "  ", "r0"] {
            let mut m = join(&t, identifier).await;
            wait_closed(&mut m).await;
        }
        assert!(t.hub.member_ids().await.is_empty());
    }

    #[tokio::test]
    async fn admission_racing_shutdown_closes_link() {
        let t = start_hub("r0").await;
        t.hub.shutdown().await;
        let (remote_side, hub_side) = crate::connection::tests::tcp_pair().await;
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = PeerConnection::spawn(hub_side, 99, "x", tx);
        let (remote_tx, remote_rx) = mpsc::unbounded_channel();
        let mut remote = Member {
            conn: PeerConnection::spawn(remote_side, 1, "relay", remote_tx),
            rx: remote_rx,
        };

        t.hub.on_member_joined("x".into(), conn.clone()).await;
        assert!(conn.is_closed());
        assert!(t.hub.member_ids().await.is_empty());
        wait_closed(&mut remote).await;
    }

    /// Found/lost announcements a member received until it went quiet.
    async fn drain_instance_events(member: &mut Member) -> Vec<InstanceEvent> {
        let mut seen = Vec::new();
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(300), member.rx.recv()).await
        {
            if let ConnectionEvent::Message { message, .. } = event {
                seen.extend(message.instance_event());
            }
        }
        seen
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_joins_and_leaves_keep_views_consistent() {
        let t = start_hub("r0").await;
        let joins: Vec<_> = (0..10)
            .map(|i| {
                let addr = t.addr;
                tokio::spawn(async move {
                    let id = format!("m{i}");
                    let member = join_at(addr, &id).await;
                    (id, member)
                })
            })
            .collect();
        let mut members = HashMap::new();
        for j in joins {
            let (id, member) = j.await.unwrap();
            members.insert(id, member);
        }
        wait_members(&t.hub, 10).await;

        // Five leave while five newcomers join.
        let mut churn = Vec::new();
        for i in 0..5 {
            let leaving = members.remove(&format!("m{i}")).unwrap();
            churn.push(tokio::spawn(async move {
                leaving.conn.close().await;
                None
            }));
            let addr = t.addr;
            churn.push(tokio::spawn(async move {
                let id = format!("n{i}");
                let member = join_at(addr, &id).await;
                Some((id, member))
            }));
        }
        for c in churn {
            if let Some((id, member)) = c.await.unwrap() {
                members.insert(id, member);
            }
        }

        let expected: Vec<String> = members.keys().cloned().collect::<BTreeSet<_>>().into_iter().collect();
        for _ in 0..200 {
            if t.hub.member_ids().await == expected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(t.hub.member_ids().await, expected);

        for (id, member) in members.iter_mut() {
            let mut view = BTreeSet::new();
            for event in drain_instance_events(member).await {
                match event {
                    InstanceEvent::Found(peer) => {
                        assert!(view.insert(peer.clone()), "{id} told twice about {peer}")
                    }
                    InstanceEvent::Lost(peer) => {
                        assert!(view.remove(&peer), "{id} lost {peer} it never knew")
                    }
                }
            }
            let mut want: BTreeSet<String> = expected.iter().filter(|m| *m != id).cloned().collect();
            want.insert("r0".to_string());
            assert_eq!(view, want, "view of {id}");
        }
    }
}
