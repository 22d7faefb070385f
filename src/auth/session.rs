//! Bounded, expiring session cache.
//!
//! Sessions are keyed by bearer token. There is no refresh: an expired
//! session is dropped on the next lookup and the client re-logins. When the
//! cache is full, the session closest to expiry is evicted.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::SessionCacheConfig;

/// Upper bound on cached sessions.
const MAX_SESSIONS: usize = 10_000;

#[derive(Debug, Clone)]
struct Session {
    client_id: String,
    expires_at: Instant,
}

pub struct SessionCache {
    expiration: Duration,
    capacity: usize,
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionCache {
    pub fn new(cfg: &SessionCacheConfig) -> Self {
        Self::with_capacity(
            Duration::from_secs(cfg.expiration_minutes * 60),
            MAX_SESSIONS,
        )
    }

    pub fn with_capacity(expiration: Duration, capacity: usize) -> Self {
        Self {
            expiration,
            capacity,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Insert a session for the given token.
    pub fn put(&self, token: String, client_id: String) {
        let now = Instant::now();
        let mut sessions = self.sessions.lock().expect("session cache lock");

        sessions.retain(|_, s| s.expires_at > now);

        if sessions.len() >= self.capacity {
            // Evict the session closest to expiry.
            if let Some(tk) = sessions
                .iter()
                .min_by_key(|(_, s)| s.expires_at)
                .map(|(tk, _)| tk.clone())
            {
                sessions.remove(&tk);
            }
        }

        sessions.insert(
            token,
            Session {
                client_id,
                expires_at: now + self.expiration,
            },
        );
    }

    /// Look up the client id for a token. Expired sessions are dropped.
    pub fn get(&self, token: &str) -> Option<String> {
        let mut sessions = self.sessions.lock().expect("session cache lock");
        match sessions.get(token) {
            Some(s) if s.expires_at > Instant::now() => Some(s.client_id.clone()),
            Some(_) => {
                sessions.remove(token);
                None
            }
            None => None,
        }
    }

    /// Drop every session belonging to the given client.
    pub fn remove_client(&self, client_id: &str) {
        let mut sessions = self.sessions.lock().expect("session cache lock");
        sessions.retain(|_, s| s.client_id != client_id);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}
