//! User records and roles.
//!
//! Users are created on first authentication. Exactly one owner exists: the
//! first user ever created claims the role, and role edits can neither
//! demote the owner nor mint a second one.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use fazt_storage::StorageBackend;

use crate::error::UserError;
use crate::ids;
use crate::queue::WriteQueue;

const USER_PREFIX: &str = "user/";
const EMAIL_PREFIX: &str = "useremail/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Admin,
    User,
}

impl Role {
    /// Admin-level access (owner included).
    #[must_use]
    pub fn is_admin(self) -> bool {
        matches!(self, Self::Owner | Self::Admin)
    }
}

/// A stored user record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    pub email: String,
    pub name: String,
    pub avatar: Option<String>,
    /// Which identity provider vouched for the email.
    pub provider: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Manages user creation and role edits.
pub struct UserStore {
    storage: Arc<dyn StorageBackend>,
    queue: Arc<WriteQueue>,
}

impl UserStore {
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>, queue: Arc<WriteQueue>) -> Self {
        Self { storage, queue }
    }

    /// Fetch the user for an email, creating the record on first sight.
    /// The very first user becomes the owner.
    ///
    /// # Errors
    ///
    /// Returns [`UserError::Queue`] or [`UserError::Storage`].
    pub async fn ensure(
        &self,
        email: &str,
        name: &str,
        provider: &str,
    ) -> Result<UserRecord, UserError> {
        let email = email.trim().to_ascii_lowercase();
        if let Some(existing) = self.get_by_email(&email).await? {
            return Ok(existing);
        }

        let role = if self.list().await?.is_empty() {
            Role::Owner
        } else {
            Role::User
        };

        let now = Utc::now();
        let record = UserRecord {
            id: ids::new_id(),
            email: email.clone(),
            name: name.to_owned(),
            avatar: None,
            provider: provider.to_owned(),
            role,
            created_at: now,
            updated_at: now,
        };

        let bytes = serde_json::to_vec(&record).map_err(|e| UserError::Corrupt {
            id: record.id.clone(),
            reason: e.to_string(),
        })?;
        let storage = Arc::clone(&self.storage);
        let user_key = format!("{USER_PREFIX}{}", record.id);
        let email_key = format!("{EMAIL_PREFIX}{email}");
        let id_bytes = record.id.clone().into_bytes();
        self.queue
            .submit(move || async move {
                storage
                    .put_batch(vec![
                        (user_key, Some(bytes)),
                        (email_key, Some(id_bytes)),
                    ])
                    .await
            })
            .await??;

        info!(user_id = %record.id, role = ?record.role, "user created");
        Ok(record)
    }

    /// Fetch a user by id.
    ///
    /// # Errors
    ///
    /// Returns [`UserError::NotFound`] for unknown ids.
    pub async fn get(&self, id: &str) -> Result<UserRecord, UserError> {
        let key = format!("{USER_PREFIX}{id}");
        let bytes = self
            .storage
            .get(&key)
            .await?
            .ok_or_else(|| UserError::NotFound { id: id.to_owned() })?;
        serde_json::from_slice(&bytes).map_err(|e| UserError::Corrupt {
            id: id.to_owned(),
            reason: e.to_string(),
        })
    }

    /// Fetch a user by email, if one exists.
    ///
    /// # Errors
    ///
    /// Returns [`UserError::Storage`] or [`UserError::Corrupt`].
    pub async fn get_by_email(&self, email: &str) -> Result<Option<UserRecord>, UserError> {
        let email = email.trim().to_ascii_lowercase();
        let key = format!("{EMAIL_PREFIX}{email}");
        let Some(id_bytes) = self.storage.get(&key).await? else {
            return Ok(None);
        };
        let id = String::from_utf8(id_bytes).map_err(|e| UserError::Corrupt {
            id: email.clone(),
            reason: e.to_string(),
        })?;
        Ok(Some(self.get(&id).await?))
    }

    /// List all users, in id order.
    ///
    /// # Errors
    ///
    /// Returns [`UserError::Storage`] or [`UserError::Corrupt`].
    pub async fn list(&self) -> Result<Vec<UserRecord>, UserError> {
        let pairs = self.storage.scan(USER_PREFIX).await?;
        let mut users = Vec::with_capacity(pairs.len());
        for (key, bytes) in pairs {
            let record = serde_json::from_slice(&bytes).map_err(|e| UserError::Corrupt {
                id: key.clone(),
                reason: e.to_string(),
            })?;
            users.push(record);
        }
        Ok(users)
    }

    /// Change a user's role.
    ///
    /// The owner invariant holds: the owner keeps the owner role no matter
    /// what is requested, and nobody else can be made owner.
    ///
    /// # Errors
    ///
    /// - [`UserError::OwnerImmutable`] when demoting the owner.
    /// - [`UserError::OwnerExists`] when promoting a second owner.
    pub async fn set_role(&self, id: &str, role: Role) -> Result<UserRecord, UserError> {
        let mut record = self.get(id).await?;

        if record.role == Role::Owner && role != Role::Owner {
            return Err(UserError::OwnerImmutable);
        }
        if role == Role::Owner && record.role != Role::Owner {
            return Err(UserError::OwnerExists);
        }
        if record.role == role {
            return Ok(record);
        }

        record.role = role;
        record.updated_at = Utc::now();

        let bytes = serde_json::to_vec(&record).map_err(|e| UserError::Corrupt {
            id: id.to_owned(),
            reason: e.to_string(),
        })?;
        let storage = Arc::clone(&self.storage);
        let key = format!("{USER_PREFIX}{id}");
        self.queue
            .submit(move || async move { storage.put(&key, &bytes).await })
            .await??;

        info!(user_id = %record.id, role = ?record.role, "role changed");
        Ok(record)
    }
}

impl std::fmt::Debug for UserStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fazt_storage::MemoryBackend;

    fn store() -> UserStore {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let queue = WriteQueue::start(64);
        UserStore::new(storage, queue)
    }

    #[tokio::test]
    async fn first_user_becomes_owner() {
        let users = store();
        let first = users.ensure("a@example.com", "A", "github").await.unwrap();
        assert_eq!(first.role, Role::Owner);

        let second = users.ensure("b@example.com", "B", "github").await.unwrap();
        assert_eq!(second.role, Role::User);
    }

    #[tokio::test]
    async fn ensure_is_idempotent_per_email() {
        let users = store();
        let a1 = users.ensure("a@example.com", "A", "github").await.unwrap();
        let a2 = users.ensure("A@Example.COM", "A again", "github").await.unwrap();
        assert_eq!(a1.id, a2.id);
        assert_eq!(users.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn owner_cannot_be_demoted() {
        let users = store();
        let owner = users.ensure("a@example.com", "A", "github").await.unwrap();
        let err = users.set_role(&owner.id, Role::User).await.unwrap_err();
        assert!(matches!(err, UserError::OwnerImmutable));

        // Setting owner to owner is a no-op, not an error.
        let still = users.set_role(&owner.id, Role::Owner).await.unwrap();
        assert_eq!(still.role, Role::Owner);
    }

    #[tokio::test]
    async fn second_owner_cannot_be_minted() {
        let users = store();
        users.ensure("a@example.com", "A", "github").await.unwrap();
        let b = users.ensure("b@example.com", "B", "github").await.unwrap();

        let err = users.set_role(&b.id, Role::Owner).await.unwrap_err();
        assert!(matches!(err, UserError::OwnerExists));
    }

    #[tokio::test]
    async fn promote_and_demote_admin() {
        let users = store();
        users.ensure("a@example.com", "A", "github").await.unwrap();
        let b = users.ensure("b@example.com", "B", "github").await.unwrap();

        let promoted = users.set_role(&b.id, Role::Admin).await.unwrap();
        assert!(promoted.role.is_admin());

        let demoted = users.set_role(&b.id, Role::User).await.unwrap();
        assert_eq!(demoted.role, Role::User);
    }
}
