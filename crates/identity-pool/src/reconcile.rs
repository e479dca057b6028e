//! Cooldown reset for rate-limited identities
//!
//! Identities reported as 429 become selectable again once they have sat in
//! that state for the configured cooldown. Only 429 is eligible; every other
//! non-200 code stays until a caller or operator changes it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::Result;
use crate::scheduler::Job;
use crate::status::HealthStatus;
use crate::store::{BoxFuture, IdentityStore, cooldown_cutoff};

pub struct StatusReconciler {
    store: Arc<dyn IdentityStore>,
    clock: Arc<dyn Clock>,
    cooldown: Duration,
}

impl StatusReconciler {
    pub const JOB_NAME: &'static str = "reset_rate_limited";

    pub fn new(store: Arc<dyn IdentityStore>, clock: Arc<dyn Clock>, cooldown: Duration) -> Self {
        Self {
            store,
            clock,
            cooldown,
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Reset identities with status 429 and `updated_at <= now - cooldown`
    /// back to 200. Returns the number of rows changed.
    ///
    /// The reset re-checks both status and age at write time, so a report
    /// that lands after the query (including a repeated 429) is kept.
    pub async fn reset_stale_rate_limited(&self, now: DateTime<Utc>) -> Result<u64> {
        let stale = self
            .store
            .list_stale_rate_limited(self.cooldown, now)
            .await?;
        if stale.is_empty() {
            debug!("no stale rate-limited identities");
            return Ok(0);
        }

        let ids = stale.into_iter().map(|identity| identity.id).collect();
        let count = self
            .store
            .bulk_reset_status(
                ids,
                HealthStatus::RateLimited,
                cooldown_cutoff(now, self.cooldown),
                HealthStatus::Healthy,
                now,
            )
            .await?;

        metrics::counter!("identities_reset_total").increment(count);
        info!(count, "rate-limited identities reset to 200");
        Ok(count)
    }
}

impl Job for StatusReconciler {
    fn name(&self) -> &str {
        Self::JOB_NAME
    }

    fn run(&self) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move { self.reset_stale_rate_limited(self.clock.now()).await })
    }
}
