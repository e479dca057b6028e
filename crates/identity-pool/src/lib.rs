//! Pool of proxy × user-agent identities for a scraping client
//!
//! Hands out a healthy identity at random, records the status callers report
//! back, and heals itself in the background by expiring proxies and lifting
//! rate limits after a cooldown.
//!
//! Identity lifecycle:
//! 1. Operator creates a proxy and a user agent, then pairs them → status 200
//! 2. `Allocator::select` picks uniformly among identities with status 200
//! 3. Caller reports a status through `Allocator::report_status`; anything
//!    other than 200 takes the identity out of selection
//! 4. `StatusReconciler` resets 429 back to 200 once the cooldown has passed
//! 5. `ProxyLifecycle` deletes proxies past `expire_at`, and their identities
//!    with them
//!
//! The `Scheduler` drives steps 4 and 5 on independent timers with at most
//! one run per job in flight.

pub mod allocator;
pub mod clock;
pub mod error;
pub mod file_store;
pub mod lifecycle;
pub mod model;
pub mod reconcile;
pub mod scheduler;
pub mod status;
pub mod store;

pub use allocator::{Allocator, NO_SELECTABLE, PoolHealth, PoolStatus};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use file_store::FileStore;
pub use lifecycle::ProxyLifecycle;
pub use model::{
    Identity, IdentityId, IdentityRecord, NewIdentity, NewProxy, Proxy, ProxyId, UserAgent,
    UserAgentId,
};
pub use reconcile::StatusReconciler;
pub use scheduler::{Job, RunOutcome, Scheduler, ShutdownReport};
pub use status::HealthStatus;
pub use store::{BoxFuture, IdentityStore};
