//! Existence checks against the services that own users and listings.
//!
//! The engine never owns users or resources; it only asks whether an id is
//! known, forwarding the caller's bearer credential unchanged.

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::auth::BearerToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    User,
    Resource,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::User => "user",
            EntityKind::Resource => "resource",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one existence check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Existence {
    Found,
    NotFound,
    /// The owning service rejected the credential.
    Unauthorized,
    /// Transport failure or unexpected answer.
    Error(String),
}

impl Existence {
    pub fn label(&self) -> &'static str {
        match self {
            Existence::Found => "found",
            Existence::NotFound => "not_found",
            Existence::Unauthorized => "unauthorized",
            Existence::Error(_) => "error",
        }
    }
}

#[async_trait]
pub trait ExistenceChecker: Send + Sync {
    async fn exists(&self, kind: EntityKind, id: &str, token: Option<&BearerToken>) -> Existence;
}

// ── HTTP ─────────────────────────────────────────────────────────

/// Asks the user service (`GET {users}/api/users/{id}`) and the listing
/// service (`GET {listings}/api/listings/{id}`). 200 means found.
pub struct HttpExistenceChecker {
    client: reqwest::Client,
    user_service_url: String,
    listing_service_url: String,
}

impl HttpExistenceChecker {
    pub fn new(
        user_service_url: &str,
        listing_service_url: &str,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            user_service_url: user_service_url.trim_end_matches('/').to_string(),
            listing_service_url: listing_service_url.trim_end_matches('/').to_string(),
        })
    }

    fn url_for(&self, kind: EntityKind, id: &str) -> String {
        match kind {
            EntityKind::User => format!("{}/api/users/{id}", self.user_service_url),
            EntityKind::Resource => format!("{}/api/listings/{id}", self.listing_service_url),
        }
    }
}

fn classify_status(kind: EntityKind, status: StatusCode) -> Existence {
    match status {
        StatusCode::OK => Existence::Found,
        StatusCode::NOT_FOUND => Existence::NotFound,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Existence::Unauthorized,
        other => Existence::Error(format!("{kind} service returned status {}", other.as_u16())),
    }
}

#[async_trait]
impl ExistenceChecker for HttpExistenceChecker {
    async fn exists(&self, kind: EntityKind, id: &str, token: Option<&BearerToken>) -> Existence {
        let url = self.url_for(kind, id);
        let mut request = self.client.get(&url);
        if let Some(token) = token {
            request = request.header(reqwest::header::AUTHORIZATION, token.as_header());
        }
        match request.send().await {
            Ok(response) => {
                let outcome = classify_status(kind, response.status());
                tracing::debug!("existence check {url}: {}", response.status());
                outcome
            }
            Err(e) => Existence::Error(format!("{kind} service unreachable: {e}")),
        }
    }
}

// ── In-process directory ─────────────────────────────────────────

/// Fixed sets of known users and resources, optionally guarded by a single
/// accepted credential. Used for local runs and tests.
#[derive(Debug, Default, Clone)]
pub struct StaticExistenceChecker {
    users: HashSet<String>,
    resources: HashSet<String>,
    required_token: Option<String>,
}

impl StaticExistenceChecker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_users<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.users.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn with_resources<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.resources.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Only this exact `Authorization` value is accepted when a token is sent.
    pub fn requiring_token(mut self, header: impl Into<String>) -> Self {
        self.required_token = Some(header.into());
        self
    }
}

#[async_trait]
impl ExistenceChecker for StaticExistenceChecker {
    async fn exists(&self, kind: EntityKind, id: &str, token: Option<&BearerToken>) -> Existence {
        if let (Some(required), Some(token)) = (&self.required_token, token)
            && token.as_header() != required
        {
            return Existence::Unauthorized;
        }
        let known = match kind {
            EntityKind::User => &self.users,
            EntityKind::Resource => &self.resources,
        };
        if known.contains(id) {
            Existence::Found
        } else {
            Existence::NotFound
        }
    }
}
