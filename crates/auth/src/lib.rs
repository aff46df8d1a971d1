//! The identity contract consumed by the servers. Verification itself
//! (JWT parsing, API-key lookup) lives outside this workspace; the servers
//! only need `Authenticate(credentials) -> principal | error` plus skipper
//! predicates for public routes.

use endpoint::Context;
use std::collections::{BTreeMap, HashSet};
use time::OffsetDateTime;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("missing credentials")]
    MissingCredentials,
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("credentials expired")]
    Expired,
    #[error("forbidden")]
    Forbidden,
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalKind {
    User,
    Service,
}

/// An authenticated identity. A principal whose expiry is set and in the past
/// is invalid for every operation.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Principal {
    pub id: String,
    pub kind: PrincipalKind,
    pub name: String,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub expires_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Principal {
    pub fn is_valid(&self) -> bool {
        match self.expires_at {
            Some(at) => at > OffsetDateTime::now_utc(),
            None => true,
        }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.iter().any(|p| p == permission)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    Bearer,
    ApiKey,
    Basic,
}

/// Carrier of an unverified identity claim.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub kind: CredentialKind,
    pub token: String,
    pub extras: BTreeMap<String, String>,
}

impl Credentials {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            kind: CredentialKind::Bearer,
            token: token.into(),
            extras: BTreeMap::new(),
        }
    }

    pub fn api_key(token: impl Into<String>) -> Self {
        Self {
            kind: CredentialKind::ApiKey,
            token: token.into(),
            extras: BTreeMap::new(),
        }
    }

    pub fn basic(token: impl Into<String>) -> Self {
        Self {
            kind: CredentialKind::Basic,
            token: token.into(),
            extras: BTreeMap::new(),
        }
    }
}

/// The external verifier's contract.
#[async_trait::async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(
        &self,
        cx: &Context,
        credentials: Credentials,
    ) -> Result<Principal, Error>;
}

/// Method skipper for the RPC surface: exact full-method names
/// (`/pkg.Service/Method`) or service wildcards (`/pkg.Service/*`).
#[derive(Debug, Clone, Default)]
pub struct MethodSkipper {
    exact: HashSet<String>,
    wildcards: Vec<String>,
}

impl MethodSkipper {
    pub fn new(patterns: impl IntoIterator<Item = String>) -> Self {
        let mut skipper = Self::default();
        for pattern in patterns {
            match pattern.strip_suffix("/*") {
                Some(prefix) => skipper.wildcards.push(format!("{prefix}/")),
                None => {
                    skipper.exact.insert(pattern);
                }
            }
        }
        skipper
    }

    pub fn matches(&self, method: &str) -> bool {
        self.exact.contains(method)
            || self.wildcards.iter().any(|prefix| method.starts_with(prefix))
    }
}

/// Path skipper for the HTTP surface: exact paths or prefix patterns
/// (`/public/*` and the looser `/public*` both match by prefix).
#[derive(Debug, Clone, Default)]
pub struct PathSkipper {
    exact: HashSet<String>,
    prefixes: Vec<String>,
}

impl PathSkipper {
    pub fn new(patterns: impl IntoIterator<Item = String>) -> Self {
        let mut skipper = Self::default();
        for pattern in patterns {
            match pattern.strip_suffix('*') {
                Some(prefix) => skipper.prefixes.push(prefix.to_string()),
                None => {
                    skipper.exact.insert(pattern);
                }
            }
        }
        skipper
    }

    pub fn matches(&self, path: &str) -> bool {
        self.exact.contains(path)
            || self.prefixes.iter().any(|prefix| path.starts_with(prefix))
    }
}
