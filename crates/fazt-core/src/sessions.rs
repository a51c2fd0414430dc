//! Browser sessions.
//!
//! A session token is minted at login, handed to the browser as an HttpOnly
//! cookie, and stored here as `SHA-256(token)` — the plaintext is returned
//! once and never persisted. Lookup hashes the presented token; expired
//! sessions are invalid and swept by a background worker.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use fazt_storage::StorageBackend;

use crate::error::SessionError;
use crate::ids;
use crate::queue::WriteQueue;

const SESSION_PREFIX: &str = "session/";

/// A stored session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    /// SHA-256 of the token (hex). This is the storage key suffix.
    pub token_hash: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Manages session creation, validation, and expiry.
pub struct SessionStore {
    storage: Arc<dyn StorageBackend>,
    queue: Arc<WriteQueue>,
}

impl SessionStore {
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>, queue: Arc<WriteQueue>) -> Self {
        Self { storage, queue }
    }

    /// Create a session for a user. Returns the plaintext token (shown
    /// once, never stored).
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Queue`] or [`SessionError::Storage`].
    pub async fn create(&self, user_id: &str, ttl: Duration) -> Result<String, SessionError> {
        let plaintext = ids::new_id();
        let token_hash = ids::hash_credential(&plaintext);
        let now = Utc::now();

        let record = SessionRecord {
            token_hash: token_hash.clone(),
            user_id: user_id.to_owned(),
            created_at: now,
            expires_at: now + ttl,
            last_seen: now,
        };
        let bytes = serde_json::to_vec(&record).map_err(|e| SessionError::Corrupt {
            reason: e.to_string(),
        })?;
        let storage = Arc::clone(&self.storage);
        let key = format!("{SESSION_PREFIX}{token_hash}");
        self.queue
            .submit(move || async move { storage.put(&key, &bytes).await })
            .await??;

        info!(user_id = %user_id, "session created");
        Ok(plaintext)
    }

    /// Validate a presented token and refresh its `last_seen` stamp.
    ///
    /// # Errors
    ///
    /// - [`SessionError::NotFound`] for unknown tokens.
    /// - [`SessionError::Expired`] past the expiry timestamp.
    pub async fn lookup(&self, plaintext: &str) -> Result<SessionRecord, SessionError> {
        let token_hash = ids::hash_credential(plaintext);
        let key = format!("{SESSION_PREFIX}{token_hash}");

        let bytes = self
            .storage
            .get(&key)
            .await?
            .ok_or(SessionError::NotFound)?;
        let mut record: SessionRecord =
            serde_json::from_slice(&bytes).map_err(|e| SessionError::Corrupt {
                reason: e.to_string(),
            })?;

        let now = Utc::now();
        if now > record.expires_at {
            return Err(SessionError::Expired {
                expired_at: record.expires_at.to_rfc3339(),
            });
        }

        // Refresh last_seen out of band; the request does not wait for it.
        record.last_seen = now;
        if let Ok(updated) = serde_json::to_vec(&record) {
            let queue = Arc::clone(&self.queue);
            let storage = Arc::clone(&self.storage);
            tokio::spawn(async move {
                let _ = queue
                    .submit(move || async move { storage.put(&key, &updated).await })
                    .await;
            });
        }

        Ok(record)
    }

    /// Delete the session for a presented token (logout). Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Queue`] or [`SessionError::Storage`].
    pub async fn delete(&self, plaintext: &str) -> Result<(), SessionError> {
        let token_hash = ids::hash_credential(plaintext);
        let storage = Arc::clone(&self.storage);
        let key = format!("{SESSION_PREFIX}{token_hash}");
        self.queue
            .submit(move || async move { storage.delete(&key).await })
            .await??;
        Ok(())
    }

    /// Remove every expired session. Returns the number removed. Called on
    /// a background cadence.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Queue`] or [`SessionError::Storage`].
    pub async fn sweep_expired(&self) -> Result<usize, SessionError> {
        let now = Utc::now();
        let pairs = self.storage.scan(SESSION_PREFIX).await?;
        let mut doomed = Vec::new();
        for (key, bytes) in pairs {
            let record: SessionRecord =
                serde_json::from_slice(&bytes).map_err(|e| SessionError::Corrupt {
                    reason: e.to_string(),
                })?;
            if now > record.expires_at {
                doomed.push(key);
            }
        }
        if doomed.is_empty() {
            return Ok(0);
        }

        let removed = doomed.len();
        let storage = Arc::clone(&self.storage);
        self.queue
            .submit(move || async move {
                let batch = doomed.into_iter().map(|k| (k, None)).collect();
                storage.put_batch(batch).await
            })
            .await??;
        debug!(removed, "expired sessions swept");
        Ok(removed)
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fazt_storage::MemoryBackend;

    fn store() -> SessionStore {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let queue = WriteQueue::start(64);
        SessionStore::new(storage, queue)
    }

    #[tokio::test]
    async fn create_and_lookup() {
        let sessions = store();
        let token = sessions.create("user1", Duration::hours(1)).await.unwrap();
        let record = sessions.lookup(&token).await.unwrap();
        assert_eq!(record.user_id, "user1");
    }

    #[tokio::test]
    async fn unknown_token_is_not_found() {
        let sessions = store();
        let err = sessions.lookup("bogus").await.unwrap_err();
        assert!(matches!(err, SessionError::NotFound));
    }

    #[tokio::test]
    async fn expired_session_is_rejected() {
        let sessions = store();
        let token = sessions
            .create("user1", Duration::milliseconds(-1))
            .await
            .unwrap();
        let err = sessions.lookup(&token).await.unwrap_err();
        assert!(matches!(err, SessionError::Expired { .. }));
    }

    #[tokio::test]
    async fn delete_invalidates_token() {
        let sessions = store();
        let token = sessions.create("user1", Duration::hours(1)).await.unwrap();
        sessions.delete(&token).await.unwrap();
        assert!(matches!(
            sessions.lookup(&token).await.unwrap_err(),
            SessionError::NotFound
        ));
    }

    #[tokio::test]
    async fn sweep_removes_only_expired() {
        let sessions = store();
        let live = sessions.create("user1", Duration::hours(1)).await.unwrap();
        let _dead = sessions
            .create("user2", Duration::milliseconds(-1))
            .await
            .unwrap();

        let removed = sessions.sweep_expired().await.unwrap();
        assert_eq!(removed, 1);
        assert!(sessions.lookup(&live).await.is_ok());
    }
}
