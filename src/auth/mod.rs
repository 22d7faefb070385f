//! Client registration, key verification, and bearer-token issuance.
//!
//! Auth keys are never stored in the clear: a random salt and a SHA-256
//! digest of salt+key are persisted per client. Login mints an opaque random
//! token and caches it; every authenticated request resolves the token
//! through the session cache.

mod session;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::AuthError;
use crate::random;
use crate::store::Store;

pub use session::SessionCache;

/// Minimum accepted length for auth keys (and the length of issued tokens).
pub const MIN_KEY_LEN: usize = 32;

const CLIENT_KEY_PREFIX: &str = "client_";
const SALT_LEN: usize = 16;

#[derive(Debug, Serialize, Deserialize)]
struct ClientRecord {
    id: String,
    auth_key_hash: String,
}

pub struct AuthService {
    store: Store,
    session_cache: Arc<SessionCache>,
}

impl AuthService {
    pub fn new(store: Store, session_cache: Arc<SessionCache>) -> Self {
        Self {
            store,
            session_cache,
        }
    }

    /// Register a new client. The id must be unused and the key at least
    /// [`MIN_KEY_LEN`] characters.
    pub fn register(&self, client_id: &str, auth_key: &str) -> Result<(), AuthError> {
        if client_id.is_empty() {
            return Err(AuthError::EmptyClientId);
        }
        if auth_key.len() < MIN_KEY_LEN {
            return Err(AuthError::KeyTooShort);
        }

        let key = client_key(client_id);
        if self.store.get(&key).is_ok() {
            return Err(AuthError::AlreadyRegistered);
        }

        let record = ClientRecord {
            id: client_id.to_string(),
            auth_key_hash: hash_key(auth_key),
        };
        let js = serde_json::to_string(&record)
            .map_err(|e| AuthError::Store(crate::error::StoreError::failed("failed to marshal", e)))?;
        self.store.set(&key, &js)?;

        Ok(())
    }

    /// Remove a registered client and drop its active sessions.
    pub fn unregister(&self, client_id: &str) -> Result<(), AuthError> {
        if client_id.is_empty() {
            return Err(AuthError::EmptyClientId);
        }
        self.store.delete(&client_key(client_id))?;
        self.session_cache.remove_client(client_id);
        Ok(())
    }

    /// Verify the key and mint a bearer token for the client.
    pub fn login(&self, client_id: &str, auth_key: &str) -> Result<String, AuthError> {
        if client_id.is_empty() {
            return Err(AuthError::EmptyClientId);
        }

        let js = self
            .store
            .get(&client_key(client_id))
            .map_err(|_| AuthError::AuthenticationFailed)?;
        let record: ClientRecord =
            serde_json::from_str(&js).map_err(|_| AuthError::AuthenticationFailed)?;

        if !verify_key(auth_key, &record.auth_key_hash) {
            return Err(AuthError::AuthenticationFailed);
        }

        let token = random::new_secure_string(MIN_KEY_LEN);
        self.session_cache
            .put(token.clone(), client_id.to_string());

        Ok(token)
    }

    /// Resolve a bearer token to a client id.
    pub fn authenticate_token(&self, token: &str) -> Result<String, AuthError> {
        if token.is_empty() {
            return Err(AuthError::Unauthorized);
        }
        self.session_cache
            .get(token)
            .ok_or(AuthError::Unauthorized)
    }
}

fn client_key(client_id: &str) -> String {
    format!("{CLIENT_KEY_PREFIX}{client_id}")
}

fn hash_key(key: &str) -> String {
    let salt = random::new_secure_string(SALT_LEN);
    let digest = Sha256::digest(format!("{salt}{key}").as_bytes());
    format!("{salt}${}", hex::encode(digest))
}

fn verify_key(key: &str, stored: &str) -> bool {
    let Some((salt, hash)) = stored.split_once('$') else {
        return false;
    };
    let digest = Sha256::digest(format!("{salt}{key}").as_bytes());
    hex::encode(digest) == hash
}
