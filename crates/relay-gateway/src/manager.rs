// Registry of live connections keyed by session ID.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::connection::Connection;

/// Owns the handles of every live connection.
///
/// Collaborators hold `Weak` references or session IDs and re-acquire through
/// this map, so removal here makes a close final.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    conns: Mutex<HashMap<String, Arc<Connection>>>,
}

impl ConnectionManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, conn: &Arc<Connection>) {
        let mut conns = self.conns.lock().expect("connection map poisoned");
        conns.insert(conn.session_id().to_string(), Arc::clone(conn));
    }

    pub fn remove(&self, conn: &Arc<Connection>) {
        let mut conns = self.conns.lock().expect("connection map poisoned");
        conns.remove(conn.session_id());
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Connection>> {
        let conns = self.conns.lock().expect("connection map poisoned");
        conns.get(session_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.conns.lock().expect("connection map poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clone the live handles under the lock; act on them after releasing it.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        let conns = self.conns.lock().expect("connection map poisoned");
        conns.values().cloned().collect()
    }

    /// Send one encoded frame to every live connection.
    pub fn broadcast(&self, message: bytes::Bytes) {
        for conn in self.snapshot() {
            conn.send(message.clone());
        }
    }

    pub fn close_all(&self) {
        for conn in self.snapshot() {
            conn.close();
        }
    }
}
