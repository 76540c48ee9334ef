//! The per-connection state machine.
//!
//! A session runs two lanes: the inbound lane (the task calling
//! [`Session::serve`]) reads and dispatches envelopes, and the outbound lane
//! drains the connection's mailbox onto the socket. They share nothing but
//! the mailbox and its close signal.

use std::sync::Arc;
use std::time::Duration;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::broadcaster::Broadcaster;
use crate::client::{Client, Closer, Mailbox};
use crate::config::SessionLimits;
use crate::envelope::{Envelope, Kind};
use crate::error::{SessionError, TransportError};
use crate::registry::Registry;
use crate::transport::{Inbound, Incoming, Outbound};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticated,
    /// Member of at least one room.
    Chatting,
    Closed,
}

pub struct Session {
    id: Uuid,
    registry: Arc<Registry>,
    broadcaster: Broadcaster,
    mailbox: Mailbox,
    client: Option<Arc<Client>>,
    state: SessionState,
}

impl Session {
    pub fn new(registry: Arc<Registry>, broadcaster: Broadcaster, mailbox: Mailbox) -> Self {
        Session {
            id: Uuid::new_v4(),
            registry,
            broadcaster,
            mailbox,
            client: None,
            state: SessionState::Unauthenticated,
        }
    }

    /// Drive one connection until it closes, then unregister its client.
    pub async fn serve<I, O>(
        registry: Arc<Registry>,
        broadcaster: Broadcaster,
        mut inbound: I,
        outbound: O,
        limits: SessionLimits,
    ) where
        I: Inbound + 'static,
        O: Outbound + 'static,
    {
        let (mailbox, queue) = Mailbox::new(limits.outbound_capacity);
        let writer = tokio::spawn(write_lane(queue, outbound, mailbox.closer(), limits));

        let mut session = Session::new(registry, broadcaster, mailbox);
        info!("Session {} opened", session.id);

        match session.read_lane(&mut inbound, limits.idle_timeout).await {
            Ok(()) => info!("Session {} closed", session.id),
            Err(SessionError::Protocol(reason)) => {
                warn!("Session {} closed on protocol violation: {}", session.id, reason);
            }
            Err(SessionError::Transport(e)) => {
                info!("Session {} closed on transport failure: {}", session.id, e);
            }
        }

        session.close().await;
        drop(session);

        // The writer flushes what is queued and exits once every mailbox
        // handle is gone.
        if let Err(e) = writer.await {
            error!("Outbound lane panicked: {}", e);
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn nickname(&self) -> Option<&str> {
        self.client.as_deref().map(Client::nickname)
    }

    async fn read_lane<I: Inbound>(
        &mut self,
        inbound: &mut I,
        idle_timeout: Duration,
    ) -> Result<(), SessionError> {
        loop {
            let next = tokio::select! {
                () = self.mailbox.closed() => return Ok(()),
                next = tokio::time::timeout(idle_timeout, inbound.receive()) => next,
            };

            // Any frame, heartbeats included, restarts the idle timer.
            let envelope = match next {
                Err(_) => return Err(TransportError::Timeout(idle_timeout).into()),
                Ok(Ok(Some(Incoming::Envelope(envelope)))) => envelope,
                Ok(Ok(Some(Incoming::Heartbeat))) => continue,
                Ok(Ok(None)) => return Ok(()),
                Ok(Err(e @ (TransportError::Malformed(_) | TransportError::Binary))) => {
                    return Err(SessionError::Protocol(e.to_string()));
                }
                Ok(Err(e)) => return Err(e.into()),
            };

            debug!("Session {} received {:?}", self.id, envelope.kind);
            if let Some(response) = self.handle(envelope).await? {
                if self.mailbox.reply(response).await.is_err() {
                    return Err(TransportError::Closed.into());
                }
            }
        }
    }

    /// Apply one envelope. Returns the response to send back, if the kind
    /// has one; an error means the connection must be closed.
    pub async fn handle(&mut self, envelope: Envelope) -> Result<Option<Envelope>, SessionError> {
        let kind = envelope.kind;
        match (self.state, kind) {
            (SessionState::Closed, _) => Err(SessionError::Protocol("session is closed".into())),
            (SessionState::Unauthenticated, Kind::Init) => Ok(Some(self.init(&envelope.author).await)),
            (SessionState::Unauthenticated, _) => {
                Err(SessionError::Protocol(format!("{kind:?} before init")))
            }
            (_, Kind::Init) => Err(SessionError::Protocol("init after registration".into())),
            (_, Kind::NegotiateName) => Ok(Some(self.negotiate_name(&envelope.content).await)),
            (_, Kind::NewRoom) => Ok(Some(self.new_room(&envelope.content).await?)),
            (_, Kind::AddToRoom) => Ok(Some(self.add_to_room(&envelope.content).await?)),
            (_, Kind::GetAvailableRooms) => {
                let rooms = self.registry.list_rooms().await;
                Ok(Some(Envelope::accepted(kind, rooms.join(" "))))
            }
            (SessionState::Authenticated, Kind::Normal) => Err(SessionError::Protocol(
                "chat before joining a room".into(),
            )),
            (SessionState::Chatting, Kind::Normal) => {
                self.chat(envelope).await?;
                Ok(None)
            }
        }
    }

    async fn init(&mut self, nickname: &str) -> Envelope {
        match self.registry.register(nickname, self.mailbox.clone()).await {
            Ok(client) => {
                info!("Session {} is {}", self.id, nickname);
                self.client = Some(client);
                self.state = SessionState::Authenticated;
                Envelope::accepted(Kind::Init, "")
            }
            Err(e) => {
                debug!("Session {} init as {:?} rejected: {}", self.id, nickname, e);
                Envelope::rejected(Kind::Init, e.to_string())
            }
        }
    }

    async fn negotiate_name(&self, name: &str) -> Envelope {
        match self.registry.is_room_name_free(name).await {
            Ok(()) => Envelope::accepted(Kind::NegotiateName, name),
            Err(e) => Envelope::rejected(Kind::NegotiateName, e.to_string()),
        }
    }

    async fn new_room(&mut self, name: &str) -> Result<Envelope, SessionError> {
        let nickname = self.registered()?.nickname().to_string();
        Ok(match self.registry.create_room(name, &nickname).await {
            Ok(room) => {
                self.state = SessionState::Chatting;
                Envelope::accepted(Kind::NewRoom, room.name())
            }
            Err(e) => Envelope::rejected(Kind::NewRoom, e.to_string()),
        })
    }

    async fn add_to_room(&mut self, name: &str) -> Result<Envelope, SessionError> {
        let nickname = self.registered()?.nickname().to_string();
        Ok(match self.registry.join_room(name, &nickname).await {
            Ok(room) => {
                self.state = SessionState::Chatting;
                Envelope::accepted(Kind::AddToRoom, room.name())
            }
            Err(e) => Envelope::rejected(Kind::AddToRoom, e.to_string()),
        })
    }

    async fn chat(&self, mut envelope: Envelope) -> Result<(), SessionError> {
        let client = self.registered()?;
        if !client.is_member_of(&envelope.targeted_room).await {
            debug!(
                "Dropping chat from {} to {}: not a member",
                client.nickname(),
                envelope.targeted_room
            );
            return Ok(());
        }

        envelope.author = client.nickname().to_string();
        envelope.ok = true;
        self.broadcaster.broadcast(envelope).await;
        Ok(())
    }

    fn registered(&self) -> Result<&Arc<Client>, SessionError> {
        self.client
            .as_ref()
            .ok_or_else(|| SessionError::Protocol("no registered client".into()))
    }

    /// Enter `Closed`, unregistering the client exactly once.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closed;
        if let Some(client) = self.client.take() {
            self.registry.unregister_client(&client).await;
        }
    }
}

/// Drain the mailbox onto the socket, pinging the peer between writes so a
/// listener that never speaks still proves it is alive.
async fn write_lane<O: Outbound>(
    mut queue: mpsc::Receiver<Envelope>,
    mut outbound: O,
    closer: Closer,
    limits: SessionLimits,
) {
    let write_timeout = limits.write_timeout;
    let period = limits.heartbeat_interval();
    let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let written = tokio::select! {
            next = queue.recv() => match next {
                Some(envelope) => tokio::time::timeout(write_timeout, outbound.send(&envelope)).await,
                None => break,
            },
            _ = heartbeat.tick() => tokio::time::timeout(write_timeout, outbound.ping()).await,
        };

        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("Write failed: {}", e);
                break;
            }
            Err(_) => {
                warn!("Write timed out after {:?}", write_timeout);
                break;
            }
        }
    }

    // Later deliveries now fail, which marks this connection dead.
    queue.close();
    closer.close();
    if let Ok(Err(e)) = tokio::time::timeout(write_timeout, outbound.close()).await {
        debug!("Close failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::{self, Peer};
    use tokio::task::JoinHandle;

    fn open(registry: &Arc<Registry>) -> (Peer, JoinHandle<()>) {
        open_with(registry, SessionLimits::default())
    }

    fn open_with(registry: &Arc<Registry>, limits: SessionLimits) -> (Peer, JoinHandle<()>) {
        let (inbound, outbound, peer) = memory::pair();
        let broadcaster = Broadcaster::new(Arc::clone(registry));
        let task = tokio::spawn(Session::serve(
            Arc::clone(registry),
            broadcaster,
            inbound,
            outbound,
            limits,
        ));
        (peer, task)
    }

    async fn signed_in(registry: &Arc<Registry>, nickname: &str) -> (Peer, JoinHandle<()>) {
        signed_in_with(registry, nickname, SessionLimits::default()).await
    }

    async fn signed_in_with(
        registry: &Arc<Registry>,
        nickname: &str,
        limits: SessionLimits,
    ) -> (Peer, JoinHandle<()>) {
        let (mut peer, task) = open_with(registry, limits);
        peer.send(&Envelope::request(Kind::Init, nickname, ""));
        assert!(peer.recv().await.ok);
        (peer, task)
    }

    fn short_idle() -> SessionLimits {
        SessionLimits {
            idle_timeout: Duration::from_millis(300),
            ..SessionLimits::default()
        }
    }

    #[tokio::test]
    async fn duplicate_nickname_is_rejected_and_session_stays_open() {
        let registry = Arc::new(Registry::new());
        let (_alice, _) = signed_in(&registry, "alice").await;

        let (mut other, _) = open(&registry);
        other.send(&Envelope::request(Kind::Init, "alice", ""));
        let reply = other.recv().await;
        assert_eq!(reply.kind, Kind::Init);
        assert!(!reply.ok);
        assert_eq!(reply.content, "nickname already taken");

        other.send(&Envelope::request(Kind::Init, "bob", ""));
        assert!(other.recv().await.ok);
    }

    #[tokio::test]
    async fn create_join_and_chat() {
        let registry = Arc::new(Registry::new());
        let (mut alice, _) = signed_in(&registry, "alice").await;
        let (mut bob, _) = signed_in(&registry, "bob").await;

        alice.send(&Envelope::request(Kind::NewRoom, "alice", "lobby"));
        let reply = alice.recv().await;
        assert_eq!((reply.kind, reply.ok, reply.content.as_str()), (Kind::NewRoom, true, "lobby"));

        bob.send(&Envelope::request(Kind::AddToRoom, "bob", "lobby"));
        let reply = bob.recv().await;
        assert_eq!((reply.kind, reply.ok, reply.content.as_str()), (Kind::AddToRoom, true, "lobby"));

        alice.send(&Envelope::chat("alice", "lobby", "hi"));
        for peer in [&mut alice, &mut bob] {
            let got = peer.recv().await;
            assert_eq!(got.kind, Kind::Normal);
            assert_eq!(got.author, "alice");
            assert_eq!(got.content, "hi");
            assert_eq!(got.targeted_room, "lobby");
            assert!(!got.timestamp.is_empty());
        }
    }

    #[tokio::test]
    async fn author_is_taken_from_the_session() {
        let registry = Arc::new(Registry::new());
        let (mut alice, _) = signed_in(&registry, "alice").await;
        alice.send(&Envelope::request(Kind::NewRoom, "", "lobby"));
        alice.recv().await;

        alice.send(&Envelope::chat("mallory", "lobby", "hi"));
        assert_eq!(alice.recv().await.author, "alice");
    }

    #[tokio::test]
    async fn joining_a_missing_room_fails() {
        let registry = Arc::new(Registry::new());
        let (mut carol, _) = signed_in(&registry, "carol").await;
        carol.send(&Envelope::request(Kind::AddToRoom, "carol", "nonexistent"));
        let reply = carol.recv().await;
        assert!(!reply.ok);
        assert_eq!(reply.content, "room not found");
    }

    #[tokio::test]
    async fn negotiate_is_advisory() {
        let registry = Arc::new(Registry::new());
        let (mut alice, _) = signed_in(&registry, "alice").await;
        let (mut bob, _) = signed_in(&registry, "bob").await;

        for peer in [&mut alice, &mut bob] {
            peer.send(&Envelope::request(Kind::NegotiateName, "", "lobby"));
            let reply = peer.recv().await;
            assert!(reply.ok);
            assert_eq!(reply.content, "lobby");
        }

        alice.send(&Envelope::request(Kind::NewRoom, "", "lobby"));
        assert!(alice.recv().await.ok);
        bob.send(&Envelope::request(Kind::NewRoom, "", "lobby"));
        let reply = bob.recv().await;
        assert!(!reply.ok);
        assert_eq!(reply.content, "room name already taken");

        bob.send(&Envelope::request(Kind::NegotiateName, "", "lobby"));
        assert!(!bob.recv().await.ok);
    }

    #[tokio::test]
    async fn lists_rooms_space_separated() {
        let registry = Arc::new(Registry::new());
        let (mut alice, _) = signed_in(&registry, "alice").await;
        alice.send(&Envelope::request(Kind::GetAvailableRooms, "", ""));
        let reply = alice.recv().await;
        assert!(reply.ok);
        assert!(reply.content.is_empty());

        for name in ["lobby", "games"] {
            alice.send(&Envelope::request(Kind::NewRoom, "", name));
            alice.recv().await;
        }
        alice.send(&Envelope::request(Kind::GetAvailableRooms, "", ""));
        assert_eq!(alice.recv().await.content, "games lobby");

        let client = registry.client("alice").await.unwrap();
        let mut joined = client.rooms().await;
        joined.sort();
        assert_eq!(joined, vec!["games", "lobby"]);
    }

    #[tokio::test]
    async fn anything_before_init_closes_the_connection() {
        let registry = Arc::new(Registry::new());
        let (mut peer, task) = open(&registry);
        peer.send(&Envelope::request(Kind::GetAvailableRooms, "", ""));
        assert_eq!(peer.recv_or_closed().await, None);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn malformed_envelope_closes_the_connection() {
        let registry = Arc::new(Registry::new());
        let (mut alice, task) = signed_in(&registry, "alice").await;
        alice.send_raw(r#"{"kind":"shout"}"#);
        assert_eq!(alice.recv_or_closed().await, None);
        task.await.unwrap();
        assert!(registry.client("alice").await.is_none());
    }

    #[tokio::test]
    async fn chat_before_joining_closes_the_connection() {
        let registry = Arc::new(Registry::new());
        let (mut alice, task) = signed_in(&registry, "alice").await;
        alice.send(&Envelope::chat("alice", "lobby", "hi"));
        assert_eq!(alice.recv_or_closed().await, None);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn second_init_closes_the_connection() {
        let registry = Arc::new(Registry::new());
        let (mut alice, task) = signed_in(&registry, "alice").await;
        alice.send(&Envelope::request(Kind::Init, "alice2", ""));
        assert_eq!(alice.recv_or_closed().await, None);
        task.await.unwrap();
        assert!(registry.client("alice2").await.is_none());
    }

    #[tokio::test]
    async fn chat_to_a_room_not_joined_is_dropped() {
        let registry = Arc::new(Registry::new());
        let (mut alice, _) = signed_in(&registry, "alice").await;
        let (mut bob, _) = signed_in(&registry, "bob").await;
        alice.send(&Envelope::request(Kind::NewRoom, "", "lobby"));
        alice.recv().await;
        bob.send(&Envelope::request(Kind::NewRoom, "", "games"));
        bob.recv().await;

        bob.send(&Envelope::chat("bob", "lobby", "psst"));
        bob.send(&Envelope::chat("bob", "nowhere", "psst"));
        alice.assert_silent().await;
        bob.assert_silent().await;
    }

    #[tokio::test]
    async fn disconnect_cleans_up_and_frees_the_nickname() {
        let registry = Arc::new(Registry::new());
        let (mut alice, task) = signed_in(&registry, "alice").await;
        alice.send(&Envelope::request(Kind::NewRoom, "", "lobby"));
        alice.recv().await;

        alice.hang_up();
        task.await.unwrap();

        assert!(registry.client("alice").await.is_none());
        let lobby = registry.room("lobby").await.unwrap();
        assert!(!lobby.has_member("alice").await);
        assert_eq!(registry.list_rooms().await, vec!["lobby"]);

        let (_again, _) = signed_in(&registry, "alice").await;
    }

    #[tokio::test]
    async fn broken_member_does_not_block_others() {
        let registry = Arc::new(Registry::new());
        let (mut alice, _) = signed_in(&registry, "alice").await;
        let (bob, bob_task) = signed_in(&registry, "bob").await;
        let (mut carol, _) = signed_in(&registry, "carol").await;
        alice.send(&Envelope::request(Kind::NewRoom, "", "lobby"));
        alice.recv().await;
        for nickname in ["bob", "carol"] {
            registry.join_room("lobby", nickname).await.unwrap();
        }

        bob.break_writes();
        alice.send(&Envelope::chat("alice", "lobby", "hi"));
        assert_eq!(alice.recv().await.content, "hi");
        assert_eq!(carol.recv().await.content, "hi");

        // Bob's failed write ends his session, which unregisters him.
        bob_task.await.unwrap();
        assert!(registry.client("bob").await.is_none());
        let lobby = registry.room("lobby").await.unwrap();
        assert!(!lobby.has_member("bob").await);
    }

    #[tokio::test]
    async fn close_all_ends_every_session() {
        let registry = Arc::new(Registry::new());
        let (mut alice, alice_task) = signed_in(&registry, "alice").await;
        let (mut bob, bob_task) = signed_in(&registry, "bob").await;

        registry.close_all().await;
        alice_task.await.unwrap();
        bob_task.await.unwrap();
        assert_eq!(alice.recv_or_closed().await, None);
        assert_eq!(bob.recv_or_closed().await, None);
        assert_eq!(registry.client_count().await, 0);
    }

    #[tokio::test]
    async fn silent_listener_outlives_the_idle_timeout() {
        let registry = Arc::new(Registry::new());
        let (mut alice, _) = signed_in_with(&registry, "alice", short_idle()).await;
        let (mut bob, bob_task) = signed_in_with(&registry, "bob", short_idle()).await;
        alice.send(&Envelope::request(Kind::NewRoom, "", "lobby"));
        alice.recv().await;
        bob.send(&Envelope::request(Kind::AddToRoom, "", "lobby"));
        bob.recv().await;

        for i in 0..10 {
            alice.send(&Envelope::chat("alice", "lobby", i.to_string()));
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        for i in 0..10 {
            assert_eq!(bob.recv().await.content, i.to_string());
        }
        assert!(registry.client("bob").await.is_some());
        assert!(!bob_task.is_finished());
    }

    #[tokio::test]
    async fn unresponsive_peer_is_dropped_after_the_idle_timeout() {
        let registry = Arc::new(Registry::new());
        let (bob, bob_task) = signed_in_with(&registry, "bob", short_idle()).await;
        bob.go_deaf();

        tokio::time::timeout(Duration::from_secs(2), bob_task)
            .await
            .expect("session outlived its idle timeout")
            .unwrap();
        assert!(registry.client("bob").await.is_none());
    }

    #[test]
    fn idle_timeout_reports_sub_second_durations() {
        let err = TransportError::Timeout(Duration::from_millis(300));
        assert_eq!(err.to_string(), "timed out after 300ms");
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let registry = Arc::new(Registry::new());
        let (mailbox, _queue) = Mailbox::new(4);
        let mut session = Session::new(
            Arc::clone(&registry),
            Broadcaster::new(Arc::clone(&registry)),
            mailbox,
        );
        session
            .handle(Envelope::request(Kind::Init, "alice", ""))
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::Authenticated);
        assert_eq!(session.nickname(), Some("alice"));

        session.close().await;
        session.close().await;
        assert_eq!(session.state(), SessionState::Closed);
        assert!(registry.client("alice").await.is_none());
        assert!(session.handle(Envelope::new(Kind::GetAvailableRooms)).await.is_err());
    }
}
