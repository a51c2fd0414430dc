//! Storage scoping.
//!
//! Every storage capability is addressed through a [`Scope`]: either the app
//! itself, or one user within the app. User scopes get their own keyspace —
//! the scoping is structural, not a filter, so one user's data can never
//! leak into another's reads.

/// Which keyspace an operation addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    App { app_id: String },
    User { app_id: String, user_id: String },
}

impl Scope {
    /// Scope for an app's own storage.
    #[must_use]
    pub fn app(app_id: &str) -> Self {
        Self::App {
            app_id: app_id.to_owned(),
        }
    }

    /// Scope for one user's storage within an app.
    #[must_use]
    pub fn user(app_id: &str, user_id: &str) -> Self {
        Self::User {
            app_id: app_id.to_owned(),
            user_id: user_id.to_owned(),
        }
    }

    /// KV cell prefix.
    #[must_use]
    pub fn kv_prefix(&self) -> String {
        match self {
            Self::App { app_id } => format!("kv/{app_id}/"),
            Self::User { app_id, user_id } => format!("kvu/{app_id}/{user_id}/"),
        }
    }

    /// Document prefix for a collection.
    #[must_use]
    pub fn doc_prefix(&self, collection: &str) -> String {
        match self {
            Self::App { app_id } => format!("doc/{app_id}/{collection}/"),
            Self::User { app_id, user_id } => format!("docu/{app_id}/{user_id}/{collection}/"),
        }
    }

    /// Session-id index prefix for a collection.
    #[must_use]
    pub fn doc_index_prefix(&self, collection: &str) -> String {
        match self {
            Self::App { app_id } => format!("docidx/session/{app_id}/{collection}/"),
            Self::User { app_id, user_id } => {
                format!("docidxu/session/{app_id}/{user_id}/{collection}/")
            }
        }
    }

    /// Blob metadata prefix.
    #[must_use]
    pub fn blob_meta_prefix(&self) -> String {
        match self {
            Self::App { app_id } => format!("blob/{app_id}/meta/"),
            Self::User { app_id, user_id } => format!("blobu/{app_id}/{user_id}/meta/"),
        }
    }

    /// Blob content prefix.
    #[must_use]
    pub fn blob_data_prefix(&self) -> String {
        match self {
            Self::App { app_id } => format!("blob/{app_id}/data/"),
            Self::User { app_id, user_id } => format!("blobu/{app_id}/{user_id}/data/"),
        }
    }
}
