//! Authentication Module
//!
//! Username/password checks for CONNECT. Passwords are stored either in
//! plaintext or as argon2 PHC hashes.

use std::collections::HashMap;

use argon2::{Argon2, PasswordHash, PasswordVerifier};
use tracing::warn;

use crate::config::AuthConfig;


/// Authentication provider
pub struct AuthProvider {
    /// Whether auth is enabled
    enabled: bool,
    /// Allow connections without a username
    allow_anonymous: bool,
    users: HashMap<String, Credential>,
}

enum Credential {
    Plaintext(String),
    /// argon2 PHC string
    Hash(String),
}

impl AuthProvider {
    /// Create a new auth provider from configuration
    pub fn new(config: &AuthConfig) -> Self {
        let mut users = HashMap::new();

        for user in &config.users {
            let credential = match (&user.password, &user.password_hash) {
                (_, Some(hash)) => Credential::Hash(hash.clone()),
                (Some(password), None) => Credential::Plaintext(password.clone()),
                (None, None) => {
                    warn!("User '{}' has no password, skipping", user.username);
                    continue;
                }
            };
            users.insert(user.username.clone(), credential);
        }

        Self {
            enabled: config.enabled,
            allow_anonymous: config.allow_anonymous,
            users,
        }
    }

    /// Check if auth is enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Check CONNECT credentials
    pub fn authenticate(&self, username: Option<&str>, password: Option<&[u8]>) -> bool {
        if !self.enabled {
            return true;
        }

        let Some(username) = username else {
            return self.allow_anonymous;
        };
        if username.is_empty() {
            return false;
        }

        let password = password.unwrap_or_default();
        if password.is_empty() {
            return false;
        }

        match self.users.get(username) {
            Some(Credential::Plaintext(stored)) => stored.as_bytes() == password,
            Some(Credential::Hash(hash)) => verify_hash(password, hash),
            None => false,
        }
    }
}

fn verify_hash(password: &[u8], hash: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default().verify_password(password, &parsed).is_ok(),
        Err(e) => {
            warn!("Stored password hash is not a valid PHC string: {}", e);
            false
        }
    }
}
