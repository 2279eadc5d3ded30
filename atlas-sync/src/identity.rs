//! Identity collaborator.
//!
//! The sync core never verifies credentials. It asks an [`IdentityProvider`]
//! whether a user id is active and trusts the answer. [`UserDirectory`] is the
//! in-process provider used by the server binary and the tests.

use std::collections::HashMap;
use std::sync::RwLock;

/// Header carrying the caller's user id on the HTTP transport.
pub const USER_HEADER: &str = "x-user-id";

/// Answers identity questions on behalf of the sync core.
pub trait IdentityProvider: Send + Sync {
    /// Whether `user_id` names an existing, active user.
    fn is_active_user(&self, user_id: &str) -> bool;

    /// Resolve the user behind a request, if any.
    ///
    /// The default reads [`USER_HEADER`] from the request headers.
    fn current_user(&self, headers: &axum::http::HeaderMap) -> Option<String> {
        headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    }
}

#[derive(Debug, Clone)]
struct UserRecord {
    name: String,
    active: bool,
}

/// In-memory user table.
#[derive(Debug, Default)]
pub struct UserDirectory {
    users: RwLock<HashMap<String, UserRecord>>,
}

impl UserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a directory from `(id, name)` pairs, all active.
    pub fn with_users<I, S>(users: I) -> Self
    where
        I: IntoIterator<Item = (S, S)>,
        S: Into<String>,
    {
        let dir = Self::new();
        for (id, name) in users {
            dir.register(id, name);
        }
        dir
    }

    /// Add or reactivate a user.
    pub fn register(&self, id: impl Into<String>, name: impl Into<String>) {
        let mut users = self.users.write().unwrap_or_else(|e| e.into_inner());
        users.insert(
            id.into(),
            UserRecord {
                name: name.into(),
                active: true,
            },
        );
    }

    /// Mark a user inactive. Returns false if the user is unknown.
    pub fn deactivate(&self, id: &str) -> bool {
        let mut users = self.users.write().unwrap_or_else(|e| e.into_inner());
        match users.get_mut(id) {
            Some(user) => {
                user.active = false;
                true
            }
            None => false,
        }
    }

    /// Display name of a known user.
    pub fn name_of(&self, id: &str) -> Option<String> {
        let users = self.users.read().unwrap_or_else(|e| e.into_inner());
        users.get(id).map(|u| u.name.clone())
    }

    pub fn len(&self) -> usize {
        self.users.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl IdentityProvider for UserDirectory {
    fn is_active_user(&self, user_id: &str) -> bool {
        let users = self.users.read().unwrap_or_else(|e| e.into_inner());
        users.get(user_id).is_some_and(|u| u.active)
    }
}
