//! Authentication collaborator.
//!
//! The dispatch core trusts whatever user id this seam supplies; credential
//! issuance (signup/login/token refresh) lives with the identity service.

use std::collections::HashMap;

pub trait Authenticator: Send + Sync {
    /// Resolve a bearer token to a user id, or `None` if unknown.
    fn authenticate(&self, token: &str) -> Option<String>;
}

/// Config-backed token table. Good enough for service-to-service use; swap
/// the trait impl for anything token-shaped.
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, String>,
}

impl StaticTokenAuthenticator {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }
}

impl Authenticator for StaticTokenAuthenticator {
    fn authenticate(&self, token: &str) -> Option<String> {
        self.tokens.get(token).cloned()
    }
}
