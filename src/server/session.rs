//! Session collaborator interface.
//!
//! A session is the identity bound 1:1 to a connection. The protocol core
//! only reads [`Session::user`]; login handlers call [`Session::set_user`].
//! [`MemorySessionStore`] keeps sessions in process so a reconnecting client
//! that echoes its old session id gets its authentication back. A session
//! no connection holds is evicted once its grace period runs out.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use crate::constants::DEFAULT_SESSION_GRACE;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Authenticated principal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// Stable user identifier.
    pub id: String,
    /// Any other profile fields.
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl User {
    /// User with no extra attributes.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attributes: Map::new(),
        }
    }
}

/// Identity and authorization state for one connection.
pub trait Session: Send + Sync + std::fmt::Debug {
    /// Session identifier.
    fn id(&self) -> &str;

    /// The authenticated user, if any.
    fn user(&self) -> Option<User>;

    /// Replace the authenticated user (`None` logs out).
    fn set_user(&self, user: Option<User>);
}

/// Source of sessions.
pub trait SessionStore: Send + Sync + std::fmt::Debug {
    /// Mint a fresh session id.
    fn generate_id(&self) -> String;

    /// Look up a session by id, creating it if unknown.
    fn get_instance(&self, id: &str) -> Arc<dyn Session>;

    /// No live connection holds `id` any more. The store may forget it.
    fn release(&self, id: &str);
}

/// In-memory [`Session`].
#[derive(Debug)]
pub struct MemorySession {
    id: String,
    user: RwLock<Option<User>>,
}

impl MemorySession {
    /// Anonymous session.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            user: RwLock::new(None),
        }
    }
}

impl Session for MemorySession {
    fn id(&self) -> &str {
        &self.id
    }

    fn user(&self) -> Option<User> {
        self.user
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_user(&self, user: Option<User>) {
        *self.user.write().unwrap_or_else(PoisonError::into_inner) = user;
    }
}

#[derive(Debug)]
struct StoredSession {
    session: Arc<MemorySession>,
    /// Set while no connection holds the session.
    released_at: Option<Instant>,
}

/// In-memory [`SessionStore`] with uuid ids.
#[derive(Debug)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<String, StoredSession>>,
    grace: Duration,
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::with_grace(DEFAULT_SESSION_GRACE)
    }
}

impl MemorySessionStore {
    /// Empty store with the default grace period.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty store keeping released sessions for `grace`.
    pub fn with_grace(grace: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            grace,
        }
    }

    /// Number of sessions currently retained.
    pub fn len(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no session is retained.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evict released sessions whose grace period has run out.
    pub fn prune(&self) {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        self.prune_locked(&mut sessions);
    }

    fn prune_locked(&self, sessions: &mut HashMap<String, StoredSession>) {
        let before = sessions.len();
        sessions.retain(|_, stored| {
            stored
                .released_at
                .is_none_or(|at| at.elapsed() < self.grace)
        });
        let evicted = before - sessions.len();
        if evicted > 0 {
            log::debug!("[Session] Evicted {evicted} idle session(s)");
        }
    }
}

impl SessionStore for MemorySessionStore {
    fn generate_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }

    fn get_instance(&self, id: &str) -> Arc<dyn Session> {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        self.prune_locked(&mut sessions);
        let stored = sessions.entry(id.to_string()).or_insert_with(|| StoredSession {
            session: Arc::new(MemorySession::new(id)),
            released_at: None,
        });
        stored.released_at = None;
        Arc::clone(&stored.session) as Arc<dyn Session>
    }

    fn release(&self, id: &str) {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(stored) = sessions.get_mut(id) {
            stored.released_at = Some(Instant::now());
        }
        self.prune_locked(&mut sessions);
    }
}
