use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;

use crate::client::Client;

/// A named broadcast group. Members are held weakly; the registry owns
/// clients and removes them from every room on unregister.
#[derive(Debug)]
pub struct Room {
    name: String,
    members: RwLock<HashMap<String, Weak<Client>>>, // nickname -> client
}

impl Room {
    pub fn new(name: String) -> Self {
        Room {
            name,
            members: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn add_member(&self, client: &Arc<Client>) {
        let mut members = self.members.write().await;
        members.insert(client.nickname().to_string(), Arc::downgrade(client));
    }

    /// Remove `client` only if the entry under its nickname is that client.
    pub async fn remove_member(&self, client: &Client) -> bool {
        let mut members = self.members.write().await;
        let same = members
            .get(client.nickname())
            .is_some_and(|member| std::ptr::eq(member.as_ptr(), client));
        if same {
            members.remove(client.nickname());
        }
        same
    }

    /// Membership as of now. Later joins and leaves do not affect it.
    pub async fn snapshot(&self) -> Vec<(String, Weak<Client>)> {
        let members = self.members.read().await;
        members
            .iter()
            .map(|(nickname, client)| (nickname.clone(), client.clone()))
            .collect()
    }

    pub async fn has_member(&self, nickname: &str) -> bool {
        self.members.read().await.contains_key(nickname)
    }

    pub async fn member_names(&self) -> Vec<String> {
        let members = self.members.read().await;
        let mut names: Vec<String> = members.keys().cloned().collect();
        names.sort();
        names
    }
}
