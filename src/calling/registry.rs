use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use crate::calling::envelope::ServerEvent;

/// Process-wide mapping from user identity to a live signaling
/// connection. One entry per registered user; an entry exists for the
/// lifetime of the connection and is removed on disconnect.
pub struct SessionRegistry {
    entries: Arc<RwLock<HashMap<String, mpsc::UnboundedSender<ServerEvent>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Bind a connection to a user identity. A re-register replaces the
    /// previous connection, which then stops receiving events.
    pub async fn register(&self, username: &str, sender: mpsc::UnboundedSender<ServerEvent>) {
        let mut entries = self.entries.write().await;
        if entries.insert(username.to_string(), sender).is_some() {
            warn!(user = username, "replaced existing registry entry");
        } else {
            debug!(user = username, "registered user");
        }
    }

    pub async fn unregister(&self, username: &str) {
        let mut entries = self.entries.write().await;
        if entries.remove(username).is_some() {
            debug!(user = username, "unregistered user");
        }
    }

    pub async fn is_present(&self, username: &str) -> bool {
        self.entries.read().await.contains_key(username)
    }

    /// Deliver an event to a user's connection. Returns false when the
    /// user is absent or the connection is dead; a dead entry is pruned
    /// so presence reflects reality.
    pub async fn deliver(&self, username: &str, event: ServerEvent) -> bool {
        let sender = {
            let entries = self.entries.read().await;
            match entries.get(username) {
                Some(sender) => sender.clone(),
                None => return false,
            }
        };
        if sender.send(event).is_err() {
            warn!(user = username, "pruning dead registry entry");
            self.entries.write().await.remove(username);
            return false;
        }
        true
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
