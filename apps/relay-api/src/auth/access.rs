//! Room authorization: "may this user join this room?".
//!
//! The answer belongs to the service that owns the resource (documents, AI
//! streams, tool executions). This module only defines the seam and two
//! implementations.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::StatusCode;

use crate::error::ApiError;
use crate::gateway::rooms::RoomId;

#[async_trait]
pub trait AccessPolicy: Send + Sync {
    async fn has_access(&self, user_id: &str, room: &RoomId) -> Result<bool, ApiError>;
}

/// Asks the owning service over HTTP.
///
/// `GET {base}/api/v1/access/{kind}/{id}?user_id=...`. Any 2xx grants,
/// 403/404 deny, everything else is an infrastructure error.
pub struct RemoteAccessPolicy {
    base_url: String,
    http: reqwest::Client,
}

/// Upper bound on a single authorization round-trip.
const ACCESS_TIMEOUT: Duration = Duration::from_secs(5);

impl RemoteAccessPolicy {
    pub fn new(base_url: &str) -> Result<Self, reqwest::Error> {
        Self::with_timeout(base_url, ACCESS_TIMEOUT)
    }

    /// Every check gives up after `timeout` and counts as a failed lookup.
    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }
}

#[async_trait]
impl AccessPolicy for RemoteAccessPolicy {
    async fn has_access(&self, user_id: &str, room: &RoomId) -> Result<bool, ApiError> {
        let url = format!(
            "{}/api/v1/access/{}/{}",
            self.base_url,
            room.kind(),
            room.entity_id()
        );

        let resp = self
            .http
            .get(&url)
            .query(&[("user_id", user_id)])
            .send()
            .await
            .map_err(|e| {
                tracing::error!(?e, %url, "access check request failed");
                ApiError::internal("Access check failed")
            })?;

        match resp.status() {
            s if s.is_success() => Ok(true),
            StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => Ok(false),
            status => {
                tracing::error!(%status, %url, "unexpected access check status");
                Err(ApiError::internal("Access check failed"))
            }
        }
    }
}

/// In-process grant table for tests and single-binary development.
pub struct MemoryAccessPolicy {
    allow_all: bool,
    grants: RwLock<HashSet<(String, RoomId)>>,
}

impl MemoryAccessPolicy {
    /// Denies everything that has not been granted.
    pub fn new() -> Self {
        Self {
            allow_all: false,
            grants: RwLock::new(HashSet::new()),
        }
    }

    /// Grants every request. Development only.
    pub fn allow_all() -> Self {
        Self {
            allow_all: true,
            grants: RwLock::new(HashSet::new()),
        }
    }

    pub fn grant(&self, user_id: &str, room: RoomId) {
        self.grants.write().insert((user_id.to_string(), room));
    }

    pub fn revoke(&self, user_id: &str, room: &RoomId) {
        self.grants.write().remove(&(user_id.to_string(), room.clone()));
    }
}

impl Default for MemoryAccessPolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AccessPolicy for MemoryAccessPolicy {
    async fn has_access(&self, user_id: &str, room: &RoomId) -> Result<bool, ApiError> {
        if self.allow_all {
            return Ok(true);
        }
        Ok(self
            .grants
            .read()
            .contains(&(user_id.to_string(), room.clone())))
    }
}
