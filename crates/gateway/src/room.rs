use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use streamsync_protocol::SyncMessage;

use crate::connection::Connection;

/// Per-node index from user id to that user's live sessions.
///
/// Mutation happens under the write lock; readers take the shared lock and
/// never perform I/O while holding it. `Connection::send` is a
/// non-blocking channel push.
#[derive(Default)]
pub struct Room {
    users: RwLock<HashMap<String, HashMap<String, Arc<Connection>>>>,
}

impl Room {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn join(&self, conn: Arc<Connection>) {
        let mut users = self.users.write().await;
        users
            .entry(conn.user_id.clone())
            .or_default()
            .insert(conn.conn_id.clone(), conn);
    }

    /// Remove one session; the user's entry disappears with its last one.
    pub async fn leave(&self, user_id: &str, conn_id: &str) {
        let mut users = self.users.write().await;
        if let Some(conns) = users.get_mut(user_id) {
            conns.remove(conn_id);
            if conns.is_empty() {
                users.remove(user_id);
            }
        }
    }

    /// Push a frame at every active session of a user. Returns how many
    /// sessions accepted it into their outbound buffer, not how many
    /// frames reached the wire.
    pub async fn broadcast(&self, user_id: &str, frame: &str) -> usize {
        let users = self.users.read().await;
        let Some(conns) = users.get(user_id) else {
            return 0;
        };
        conns
            .values()
            .filter(|c| c.is_active())
            .filter(|c| c.send(frame.to_string()))
            .count()
    }

    pub async fn broadcast_message(&self, user_id: &str, msg: &SyncMessage) -> usize {
        match msg.encode() {
            Ok(frame) => self.broadcast(user_id, &frame).await,
            Err(_) => 0,
        }
    }

    /// Deliver the same frame to every locally online user.
    pub async fn broadcast_all(&self, frame: &str) -> usize {
        let users = self.users.read().await;
        users
            .values()
            .flat_map(|conns| conns.values())
            .filter(|c| c.is_active())
            .filter(|c| c.send(frame.to_string()))
            .count()
    }

    pub async fn connections_for(&self, user_id: &str) -> Vec<Arc<Connection>> {
        let users = self.users.read().await;
        users
            .get(user_id)
            .map(|conns| conns.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn connection_count(&self, user_id: &str) -> usize {
        let users = self.users.read().await;
        users.get(user_id).map_or(0, |conns| {
            conns.values().filter(|c| c.is_active()).count()
        })
    }

    pub async fn is_online(&self, user_id: &str) -> bool {
        self.connection_count(user_id).await > 0
    }

    pub async fn online_users(&self) -> Vec<String> {
        let users = self.users.read().await;
        users
            .iter()
            .filter(|(_, conns)| conns.values().any(|c| c.is_active()))
            .map(|(user, _)| user.clone())
            .collect()
    }

    /// Every live session on this node, across users.
    pub async fn all_connections(&self) -> Vec<Arc<Connection>> {
        let users = self.users.read().await;
        users
            .values()
            .flat_map(|conns| conns.values().cloned())
            .collect()
    }

    pub async fn total_connections(&self) -> usize {
        let users = self.users.read().await;
        users.values().map(|conns| conns.len()).sum()
    }
}
