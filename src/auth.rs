//! Client authentication.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

/// Authenticator consulted by handlers during protocol negotiation.
///
/// Returns the client id on success. The id becomes part of the request
/// fingerprint and the per-client stats key.
#[async_trait]
pub trait Auther: Send + Sync {
    async fn authenticate(&self, user: &str, pass: &str) -> Option<String>;
}

/// Static user/password table.
pub struct StaticAuther {
    users: RwLock<HashMap<String, String>>,
}

impl StaticAuther {
    pub fn new(users: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            users: RwLock::new(users.into_iter().collect()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.users.read().is_empty()
    }
}

#[async_trait]
impl Auther for StaticAuther {
    async fn authenticate(&self, user: &str, pass: &str) -> Option<String> {
        let users = self.users.read();
        match users.get(user) {
            Some(expected) if expected == pass => Some(user.to_string()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_auther() {
        let auther = StaticAuther::new([("alice".to_string(), "secret".to_string())]);
        assert_eq!(auther.authenticate("alice", "secret").await.as_deref(), Some("alice"));
        assert!(auther.authenticate("alice", "wrong").await.is_none());
        assert!(auther.authenticate("bob", "secret").await.is_none());
    }
}
