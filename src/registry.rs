//! Process-wide state: who is connected and which rooms exist.
//!
//! Lock order is always clients map, then rooms map, then a room's member
//! set. No lock is held while writing to a connection.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use log::{debug, info};
use tokio::sync::RwLock;

use crate::client::{Client, Mailbox};
use crate::error::RegistryError;
use crate::room::Room;

type Clients = RwLock<HashMap<String, Arc<Client>>>;
type Rooms = RwLock<HashMap<String, Arc<Room>>>;

#[derive(Debug, Default)]
pub struct Registry {
    clients: Clients,
    rooms: Rooms,
}

/// Room names are listed space-separated, so they must be a single word.
pub fn validate_room_name(name: &str) -> Result<(), RegistryError> {
    if name.is_empty() || name.chars().any(char::is_whitespace) {
        return Err(RegistryError::InvalidRoomName);
    }
    Ok(())
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    pub async fn register(
        &self,
        nickname: &str,
        mailbox: Mailbox,
    ) -> Result<Arc<Client>, RegistryError> {
        if nickname.is_empty() {
            return Err(RegistryError::EmptyNickname);
        }

        let mut clients = self.clients.write().await;
        match clients.entry(nickname.to_string()) {
            Entry::Occupied(_) => Err(RegistryError::DuplicateNickname),
            Entry::Vacant(slot) => {
                let client = Arc::new(Client::new(nickname.to_string(), mailbox));
                slot.insert(Arc::clone(&client));
                info!("Client registered: {} ({})", nickname, client.id());
                Ok(client)
            }
        }
    }

    /// Remove whoever holds `nickname`. A second call is a no-op.
    pub async fn unregister(&self, nickname: &str) -> bool {
        let removed = {
            let mut clients = self.clients.write().await;
            clients.remove(nickname)
        };

        match removed {
            Some(client) => {
                self.detach(&client).await;
                info!("Client unregistered: {}", nickname);
                true
            }
            None => false,
        }
    }

    /// Remove `client` only if it still owns its nickname, so cleanup of a
    /// dead connection never evicts a newer client that reused the name.
    pub async fn unregister_client(&self, client: &Client) -> bool {
        let removed = {
            let mut clients = self.clients.write().await;
            let owns_name = clients
                .get(client.nickname())
                .is_some_and(|current| std::ptr::eq(Arc::as_ptr(current), client));
            if owns_name {
                clients.remove(client.nickname())
            } else {
                None
            }
        };

        self.detach(client).await;
        if removed.is_some() {
            info!("Client unregistered: {} ({})", client.nickname(), client.id());
        }
        removed.is_some()
    }

    async fn detach(&self, client: &Client) {
        let joined = client.take_rooms().await;
        if !joined.is_empty() {
            let rooms = self.rooms.read().await;
            for name in &joined {
                if let Some(room) = rooms.get(name) {
                    room.remove_member(client).await;
                }
            }
            debug!("{} left {} room(s)", client.nickname(), joined.len());
        }
        client.mailbox().close();
    }

    /// Create `name` with `creator` as its only member. The check and the
    /// insert happen under one write lock: the first caller wins.
    pub async fn create_room(
        &self,
        name: &str,
        creator: &str,
    ) -> Result<Arc<Room>, RegistryError> {
        validate_room_name(name)?;

        let clients = self.clients.read().await;
        let client = clients.get(creator).ok_or(RegistryError::NotRegistered)?;

        let room = {
            let mut rooms = self.rooms.write().await;
            match rooms.entry(name.to_string()) {
                Entry::Occupied(_) => return Err(RegistryError::NameTaken),
                Entry::Vacant(slot) => {
                    let room = Arc::new(Room::new(name.to_string()));
                    room.add_member(client).await;
                    slot.insert(Arc::clone(&room));
                    room
                }
            }
        };
        client.note_joined(name).await;

        info!("Room created: {} by {}", name, creator);
        Ok(room)
    }

    pub async fn join_room(&self, name: &str, nickname: &str) -> Result<Arc<Room>, RegistryError> {
        validate_room_name(name)?;

        let clients = self.clients.read().await;
        let client = clients.get(nickname).ok_or(RegistryError::NotRegistered)?;

        let room = {
            let rooms = self.rooms.read().await;
            rooms.get(name).cloned().ok_or(RegistryError::RoomNotFound)?
        };
        room.add_member(client).await;
        client.note_joined(name).await;

        info!("{} joined room {}", nickname, name);
        Ok(room)
    }

    /// Advisory only; `create_room` is what decides.
    pub async fn is_room_name_free(&self, name: &str) -> Result<(), RegistryError> {
        validate_room_name(name)?;
        if self.rooms.read().await.contains_key(name) {
            return Err(RegistryError::NameTaken);
        }
        Ok(())
    }

    pub async fn list_rooms(&self) -> Vec<String> {
        let mut names: Vec<String> = {
            let rooms = self.rooms.read().await;
            rooms.keys().cloned().collect()
        };
        names.sort();
        names
    }

    pub async fn client(&self, nickname: &str) -> Option<Arc<Client>> {
        self.clients.read().await.get(nickname).cloned()
    }

    pub async fn room(&self, name: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(name).cloned()
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Signal every live connection to close.
    pub async fn close_all(&self) {
        let clients = self.clients.read().await;
        for client in clients.values() {
            client.mailbox().close();
        }
        info!("Closing {} connection(s)", clients.len());
    }
}
