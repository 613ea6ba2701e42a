use std::collections::{HashMap, HashSet};
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

/// A verified caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub username: String,
    pub role: Role,
}

impl Identity {
    pub fn new(username: &str, role: Role) -> Self {
        Self {
            username: username.to_string(),
            role,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn require_admin(&self) -> Result<(), AuthError> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(AuthError::Forbidden("admins only".to_string()))
        }
    }
}

/// Turns a bearer token into an identity
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Role of a username against the admin allow-list
pub fn role_for(username: &str, admins: &HashSet<String>) -> Role {
    if admins.contains(username) {
        Role::Admin
    } else {
        Role::User
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header value
pub fn parse_bearer(header: &str) -> Result<&str, AuthError> {
    let token = header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .ok_or_else(|| AuthError::Unauthorized("expected a bearer token".to_string()))?;
    if token.is_empty() {
        return Err(AuthError::Unauthorized("no token provided".to_string()));
    }
    Ok(token)
}

/// Verifier backed by a fixed token table
#[derive(Debug, Clone, Default)]
pub struct StaticTokenVerifier {
    tokens: HashMap<String, String>,
    admins: HashSet<String>,
}

impl StaticTokenVerifier {
    pub fn new(tokens: HashMap<String, String>, admins: impl IntoIterator<Item = String>) -> Self {
        Self {
            tokens,
            admins: admins.into_iter().collect(),
        }
    }
}

#[async_trait]
impl IdentityVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let username = self
            .tokens
            .get(token)
            .ok_or_else(|| AuthError::Unauthorized("invalid token".to_string()))?;
        Ok(Identity::new(username, role_for(username, &self.admins)))
    }
}
