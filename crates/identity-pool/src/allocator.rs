//! Identity selection and caller status reports
//!
//! `select` reads the selectable set, already joined from one store snapshot,
//! and picks one row uniformly at random. It never writes. `report_status` is
//! the single caller-facing write path.

use std::sync::Arc;

use rand::RngExt;
use serde::Serialize;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::model::{IdentityId, IdentityRecord};
use crate::status::HealthStatus;
use crate::store::IdentityStore;

/// Message carried by `NotFound` when nothing is selectable.
pub const NO_SELECTABLE: &str = "No identities with status 200";

/// Overall pool state for the health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Pool health summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolHealth {
    pub status: PoolStatus,
    pub identities_total: usize,
    pub identities_selectable: usize,
    pub identities_rate_limited: usize,
    pub identities_other: usize,
}

pub struct Allocator {
    store: Arc<dyn IdentityStore>,
    clock: Arc<dyn Clock>,
}

impl Allocator {
    pub fn new(store: Arc<dyn IdentityStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Pick one selectable identity uniformly at random.
    ///
    /// Returns `NotFound` only when no identity has status 200 in the
    /// snapshot the store served.
    pub async fn select(&self) -> Result<IdentityRecord> {
        let mut candidates = self.store.list_selectable().await?;
        if candidates.is_empty() {
            metrics::counter!("identity_select_total", "outcome" => "empty").increment(1);
            debug!("no selectable identity");
            return Err(Error::NotFound(NO_SELECTABLE.into()));
        }

        let total = candidates.len();
        let pick = rand::rng().random_range(0..total);
        let record = candidates.swap_remove(pick);

        metrics::counter!("identity_select_total", "outcome" => "hit").increment(1);
        debug!(identity_id = %record.id, candidates = total, "identity selected");
        Ok(record)
    }

    /// Store a caller-reported status code verbatim.
    ///
    /// Any integer is accepted. Unknown ids return `NotFound` without writing.
    pub async fn report_status(&self, id: IdentityId, code: i32) -> Result<IdentityRecord> {
        let status = HealthStatus::from(code);
        let now = self.clock.now();

        self.store
            .update_status(id, status, now)
            .await?
            .ok_or_else(|| Error::NotFound(format!("identity {id}")))?;

        metrics::counter!("identity_status_reports_total", "status" => code.to_string())
            .increment(1);
        info!(identity_id = %id, status = code, "identity status reported");

        self.store
            .identity_record(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("identity {id}")))
    }

    /// Identity with its proxy and user agent, if it exists.
    pub async fn identity(&self, id: IdentityId) -> Result<Option<IdentityRecord>> {
        self.store.identity_record(id).await
    }

    /// Status counts across all identities.
    ///
    /// All selectable → healthy, some selectable → degraded, none (or an
    /// empty pool) → unhealthy.
    pub async fn health(&self) -> Result<PoolHealth> {
        let identities = self.store.list_identities().await?;

        let mut selectable = 0usize;
        let mut rate_limited = 0usize;
        let mut other = 0usize;
        for identity in &identities {
            match identity.status {
                HealthStatus::Healthy => selectable += 1,
                HealthStatus::RateLimited => rate_limited += 1,
                HealthStatus::Other(_) => other += 1,
            }
        }

        let status = if selectable == 0 {
            PoolStatus::Unhealthy
        } else if selectable == identities.len() {
            PoolStatus::Healthy
        } else {
            PoolStatus::Degraded
        };

        Ok(PoolHealth {
            status,
            identities_total: identities.len(),
            identities_selectable: selectable,
            identities_rate_limited: rate_limited,
            identities_other: other,
        })
    }

    pub fn store(&self) -> &Arc<dyn IdentityStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}
