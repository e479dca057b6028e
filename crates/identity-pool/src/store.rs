//! Identity store abstraction
//!
//! The store exclusively owns the proxy, user-agent and identity tables. Every
//! other component goes through this trait. Implementations must:
//!
//! - allow concurrent readers; selection must never wait for a write to be
//!   persisted,
//! - serve each read from a single consistent snapshot,
//! - apply each write, including the bulk ones, all-or-nothing,
//! - cascade proxy and user-agent deletion to dependent identities,
//! - stamp `updated_at` on every identity row they write.
//!
//! Uses `Pin<Box<dyn Future>>` return types so the store can be shared as
//! `Arc<dyn IdentityStore>`.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::error::Result;
use crate::model::{
    Identity, IdentityId, IdentityRecord, NewIdentity, NewProxy, Proxy, ProxyId, UserAgent,
    UserAgentId,
};
use crate::status::HealthStatus;

/// Boxed future returned by store methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait IdentityStore: Send + Sync {
    // --- proxies ---

    /// Insert a proxy. Rejects a URL whose fingerprint is already taken.
    fn create_proxy(&self, input: NewProxy) -> BoxFuture<'_, Result<Proxy>>;

    /// Replace a proxy's URL and expiry, recomputing the fingerprint.
    fn update_proxy(&self, id: ProxyId, input: NewProxy) -> BoxFuture<'_, Result<Proxy>>;

    fn get_proxy(&self, id: ProxyId) -> BoxFuture<'_, Result<Option<Proxy>>>;

    fn list_proxies(&self) -> BoxFuture<'_, Result<Vec<Proxy>>>;

    /// Delete a proxy and its identities. Returns whether the proxy existed.
    fn delete_proxy(&self, id: ProxyId) -> BoxFuture<'_, Result<bool>>;

    /// Delete every proxy with `expire_at <= now` and their identities, as one
    /// atomic operation. Returns the number of proxies removed.
    fn delete_expired_proxies(&self, now: DateTime<Utc>) -> BoxFuture<'_, Result<u64>>;

    // --- user agents ---

    fn create_user_agent(&self, agent: String) -> BoxFuture<'_, Result<UserAgent>>;

    fn list_user_agents(&self) -> BoxFuture<'_, Result<Vec<UserAgent>>>;

    /// Delete a user agent and its identities. Returns whether it existed.
    fn delete_user_agent(&self, id: UserAgentId) -> BoxFuture<'_, Result<bool>>;

    // --- identities ---

    fn create_identity(
        &self,
        input: NewIdentity,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Identity>>;

    fn get_identity(&self, id: IdentityId) -> BoxFuture<'_, Result<Option<Identity>>>;

    /// Identity joined with its proxy (URL opened) and user agent.
    fn identity_record(&self, id: IdentityId) -> BoxFuture<'_, Result<Option<IdentityRecord>>>;

    fn list_identities(&self) -> BoxFuture<'_, Result<Vec<Identity>>>;

    fn delete_identity(&self, id: IdentityId) -> BoxFuture<'_, Result<bool>>;

    /// Identities with status 200, joined with their proxy and user agent
    /// from the same snapshot. No ordering guarantee.
    fn list_selectable(&self) -> BoxFuture<'_, Result<Vec<IdentityRecord>>>;

    /// Identities with status 429 and `updated_at <= now - cooldown`.
    fn list_stale_rate_limited(
        &self,
        cooldown: Duration,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Vec<Identity>>>;

    /// Set one identity's status. `None` if the id does not exist, in which
    /// case nothing is written.
    fn update_status(
        &self,
        id: IdentityId,
        status: HealthStatus,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Option<Identity>>>;

    /// Set `new_status` on every listed identity whose status still equals
    /// `expected` and whose `updated_at <= stale_before`, as one atomic
    /// operation. Both conditions are checked at write time, so a row
    /// re-reported after it was listed keeps its new report. Returns the
    /// number of rows changed.
    fn bulk_reset_status(
        &self,
        ids: Vec<IdentityId>,
        expected: HealthStatus,
        stale_before: DateTime<Utc>,
        new_status: HealthStatus,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<u64>>;
}

/// `now - cooldown`, saturating at the earliest representable instant.
pub fn cooldown_cutoff(now: DateTime<Utc>, cooldown: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(cooldown)
        .ok()
        .and_then(|delta| now.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
