//! Fixed-window rate limiting of inbound events.
//!
//! Counters live in the shared store so the ceiling holds across processes
//! when the scope is per user. A window opens at the subject's first event
//! and closes exactly `window` later.

use std::sync::Arc;

use crate::auth::tokens::VerifiedUser;
use crate::config::{RateLimitConfig, RateLimitScope};
use crate::error::GatewayError;
use crate::store::SharedStore;

use super::session::Connection;

/// Decides whether a caller bypasses the limiter. Evaluated once per event.
pub type ExemptFn = Box<dyn Fn(&VerifiedUser) -> bool + Send + Sync>;

pub struct RateLimiter {
    store: Arc<dyn SharedStore>,
    config: RateLimitConfig,
    exempt: ExemptFn,
}

fn counter_key(subject: &str) -> String {
    format!("ratelimit:{subject}")
}

impl RateLimiter {
    /// Limiter with the default exemption: admins and allow-listed users.
    pub fn new(store: Arc<dyn SharedStore>, config: RateLimitConfig) -> Self {
        let allowlist = config.allowlist.clone();
        let exempt: ExemptFn =
            Box::new(move |user| user.is_admin() || allowlist.contains(&user.user_id));
        Self::with_exemption(store, config, exempt)
    }

    pub fn with_exemption(
        store: Arc<dyn SharedStore>,
        config: RateLimitConfig,
        exempt: ExemptFn,
    ) -> Self {
        Self {
            store,
            config,
            exempt,
        }
    }

    /// The counter subject for a connection under the configured scope.
    pub fn subject_for(&self, conn: &Connection) -> String {
        match self.config.scope {
            RateLimitScope::Connection => conn.id.clone(),
            RateLimitScope::User => format!("user:{}", conn.user.user_id),
        }
    }

    /// Charge `cost` events to the connection's window.
    pub async fn admit(&self, conn: &Connection, cost: u64) -> Result<(), GatewayError> {
        if (self.exempt)(&conn.user) {
            return Ok(());
        }
        let subject = self.subject_for(conn);
        self.admit_key(&subject, cost).await
    }

    /// Charge `cost` events to an arbitrary subject. Exemptions do not apply.
    pub async fn admit_key(&self, subject: &str, cost: u64) -> Result<(), GatewayError> {
        let count = match self
            .store
            .incr_with_expiry(&counter_key(subject), cost, self.config.window)
            .await
        {
            Ok(count) => count,
            Err(err) if self.config.fail_open => {
                tracing::warn!(?err, %subject, "rate limit store unavailable, admitting");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        if count > self.config.max_events {
            tracing::debug!(%subject, count, max = self.config.max_events, "rate limit exceeded");
            return Err(GatewayError::rate_limited());
        }
        Ok(())
    }

    /// Events counted in the subject's live window; 0 once it has expired.
    pub async fn current(&self, subject: &str) -> Result<u64, GatewayError> {
        let raw = self.store.get(&counter_key(subject)).await?;
        Ok(raw.and_then(|v| v.parse().ok()).unwrap_or(0))
    }
}
