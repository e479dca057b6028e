//! Proxy expiry

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::clock::Clock;
use crate::error::Result;
use crate::scheduler::Job;
use crate::store::{BoxFuture, IdentityStore};

/// Removes proxies past their `expire_at`, together with their identities.
pub struct ProxyLifecycle {
    store: Arc<dyn IdentityStore>,
    clock: Arc<dyn Clock>,
}

impl ProxyLifecycle {
    pub const JOB_NAME: &'static str = "expire_proxies";

    pub fn new(store: Arc<dyn IdentityStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Delete every proxy with `expire_at <= now`. Returns how many went.
    ///
    /// Idempotent: a second call with the same `now` deletes nothing.
    pub async fn expire_proxies(&self, now: DateTime<Utc>) -> Result<u64> {
        let count = self.store.delete_expired_proxies(now).await?;
        metrics::counter!("proxies_expired_total").increment(count);
        info!(count, "expired proxies deleted");
        Ok(count)
    }
}

impl Job for ProxyLifecycle {
    fn name(&self) -> &str {
        Self::JOB_NAME
    }

    fn run(&self) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move { self.expire_proxies(self.clock.now()).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use field_crypto::{FieldCipher, generate_key};

    use crate::allocator::Allocator;
    use crate::clock::ManualClock;
    use crate::error::Error;
    use crate::file_store::FileStore;
    use crate::model::{NewIdentity, NewProxy};
    use crate::status::HealthStatus;

    fn store() -> Arc<dyn IdentityStore> {
        let codec = Arc::new(FieldCipher::from_base64_key(&generate_key()).unwrap());
        Arc::new(FileStore::in_memory(codec))
    }

    #[tokio::test]
    async fn expired_proxy_and_its_identity_disappear() {
        let store = store();
        let now = Utc::now();
        let clock = Arc::new(ManualClock::new(now));
        let ua = store.create_user_agent("UA/1".into()).await.unwrap();
        let proxy = store
            .create_proxy(NewProxy {
                url: Some("http://stale.example:3128".into()),
                expire_at: Some(now - TimeDelta::days(1)),
            })
            .await
            .unwrap();
        let identity = store
            .create_identity(
                NewIdentity {
                    proxy_id: proxy.id,
                    user_agent_id: ua.id,
                    status: HealthStatus::Healthy,
                },
                now,
            )
            .await
            .unwrap();

        let lifecycle = ProxyLifecycle::new(store.clone(), clock.clone());
        assert_eq!(lifecycle.expire_proxies(now).await.unwrap(), 1);
        assert_eq!(lifecycle.expire_proxies(now).await.unwrap(), 0);

        let allocator = Allocator::new(store, clock);
        assert!(allocator.identity(identity.id).await.unwrap().is_none());
        assert!(matches!(
            allocator.report_status(identity.id, 200).await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(allocator.select().await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn proxy_expiring_exactly_now_is_removed() {
        let store = store();
        let now = Utc::now();
        let clock = Arc::new(ManualClock::new(now));
        store
            .create_proxy(NewProxy {
                url: None,
                expire_at: Some(now),
            })
            .await
            .unwrap();
        store
            .create_proxy(NewProxy {
                url: None,
                expire_at: Some(now + TimeDelta::milliseconds(1)),
            })
            .await
            .unwrap();

        let lifecycle = ProxyLifecycle::new(store.clone(), clock);
        assert_eq!(lifecycle.run().await.unwrap(), 1);
        assert_eq!(store.list_proxies().await.unwrap().len(), 1);
    }
}
