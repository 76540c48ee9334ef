use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use crate::envelope::Envelope;

/// Why an envelope could not be handed to a connection's outbound lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// The queue is full; this one envelope was dropped.
    Full,
    /// The outbound lane has exited, so the connection is dead.
    Closed,
}

/// Tears a connection down. Holding one does not keep the queue open.
#[derive(Clone, Debug, Default)]
pub struct Closer(Arc<Notify>);

impl Closer {
    pub fn close(&self) {
        self.0.notify_one();
    }

    pub async fn closed(&self) {
        self.0.notified().await;
    }
}

/// The enqueuing end of one connection: a bounded queue drained by the
/// connection's writer task, plus the signal that tears the connection down.
#[derive(Clone, Debug)]
pub struct Mailbox {
    queue: mpsc::Sender<Envelope>,
    closer: Closer,
}

impl Mailbox {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Envelope>) {
        let (queue, rx) = mpsc::channel(capacity.max(1));
        let mailbox = Mailbox {
            queue,
            closer: Closer::default(),
        };
        (mailbox, rx)
    }

    /// Enqueue without waiting, so one slow reader never stalls a broadcast.
    pub fn deliver(&self, envelope: Envelope) -> Result<(), DeliveryError> {
        match self.queue.try_send(envelope) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(DeliveryError::Full),
            Err(TrySendError::Closed(_)) => Err(DeliveryError::Closed),
        }
    }

    /// Enqueue a response, waiting for room in the queue.
    pub async fn reply(&self, envelope: Envelope) -> Result<(), DeliveryError> {
        self.queue
            .send(envelope)
            .await
            .map_err(|_| DeliveryError::Closed)
    }

    /// Ask the owning session to close. Safe to call any number of times.
    pub fn close(&self) {
        self.closer.close();
    }

    pub async fn closed(&self) {
        self.closer.closed().await;
    }

    pub fn closer(&self) -> Closer {
        self.closer.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }
}

/// One registered participant.
#[derive(Debug)]
pub struct Client {
    id: Uuid,
    nickname: String,
    mailbox: Mailbox,
    rooms: Mutex<HashSet<String>>,
}

impl Client {
    pub fn new(nickname: String, mailbox: Mailbox) -> Self {
        Client {
            id: Uuid::new_v4(),
            nickname,
            mailbox,
            rooms: Mutex::new(HashSet::new()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    pub fn deliver(&self, envelope: Envelope) -> Result<(), DeliveryError> {
        self.mailbox.deliver(envelope)
    }

    pub async fn rooms(&self) -> Vec<String> {
        let rooms = self.rooms.lock().await;
        rooms.iter().cloned().collect()
    }

    pub async fn is_member_of(&self, room: &str) -> bool {
        self.rooms.lock().await.contains(room)
    }

    pub(crate) async fn note_joined(&self, room: &str) {
        self.rooms.lock().await.insert(room.to_string());
    }

    pub(crate) async fn take_rooms(&self) -> Vec<String> {
        let mut rooms = self.rooms.lock().await;
        rooms.drain().collect()
    }
}
