//! File-backed identity store
//!
//! Holds the three tables as an immutable `Arc<Tables>` snapshot and mirrors
//! them to a JSON file on every write. Readers clone the current `Arc` and work
//! on it without holding any lock. Writers queue on a separate mutex, stage
//! their change on a copy of the tables, persist the copy, and only then swap
//! it in; the `RwLock` write guard is held for the pointer swap alone. A failed
//! persist therefore leaves readers on the previous state, and a slow disk
//! never stalls selection.
//!
//! Proxy URLs are sealed with the configured `FieldEncryptor` before they enter
//! the tables and opened again when rows leave the store, so the snapshot on
//! disk never contains a plaintext URL.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use field_crypto::{FieldEncryptor, fingerprint, is_encrypted};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::{
    Identity, IdentityId, IdentityRecord, NewIdentity, NewProxy, Proxy, ProxyId, UserAgent,
    UserAgentId,
};
use crate::status::HealthStatus;
use crate::store::{BoxFuture, IdentityStore, cooldown_cutoff};

/// Proxy as stored: `url` is sealed.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProxyRow {
    id: ProxyId,
    url: Option<String>,
    url_hash: Option<String>,
    expire_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
struct Tables {
    next_proxy_id: u64,
    next_user_agent_id: u64,
    next_identity_id: u64,
    proxies: BTreeMap<ProxyId, ProxyRow>,
    user_agents: BTreeMap<UserAgentId, UserAgent>,
    identities: BTreeMap<IdentityId, Identity>,
}

/// On-disk layout.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    next_proxy_id: u64,
    #[serde(default)]
    next_user_agent_id: u64,
    #[serde(default)]
    next_identity_id: u64,
    #[serde(default)]
    proxies: Vec<ProxyRow>,
    #[serde(default)]
    user_agents: Vec<UserAgent>,
    #[serde(default)]
    identities: Vec<Identity>,
}

impl Tables {
    fn from_snapshot(snapshot: Snapshot) -> Self {
        let proxies: BTreeMap<_, _> = snapshot.proxies.into_iter().map(|p| (p.id, p)).collect();
        let user_agents: BTreeMap<_, _> = snapshot
            .user_agents
            .into_iter()
            .map(|ua| (ua.id, ua))
            .collect();

        let mut identities = BTreeMap::new();
        for identity in snapshot.identities {
            if !proxies.contains_key(&identity.proxy_id)
                || !user_agents.contains_key(&identity.user_agent_id)
            {
                warn!(identity_id = %identity.id, "dropping identity with dangling reference");
                continue;
            }
            identities.insert(identity.id, identity);
        }

        let next = |persisted: u64, max: Option<u64>| persisted.max(max.map_or(1, |m| m + 1));
        Self {
            next_proxy_id: next(snapshot.next_proxy_id, proxies.keys().last().map(|id| id.0)),
            next_user_agent_id: next(
                snapshot.next_user_agent_id,
                user_agents.keys().last().map(|id| id.0),
            ),
            next_identity_id: next(
                snapshot.next_identity_id,
                identities.keys().last().map(|id: &IdentityId| id.0),
            ),
            proxies,
            user_agents,
            identities,
        }
    }

    fn to_snapshot(&self) -> Snapshot {
        Snapshot {
            next_proxy_id: self.next_proxy_id,
            next_user_agent_id: self.next_user_agent_id,
            next_identity_id: self.next_identity_id,
            proxies: self.proxies.values().cloned().collect(),
            user_agents: self.user_agents.values().cloned().collect(),
            identities: self.identities.values().cloned().collect(),
        }
    }

    fn hash_taken(&self, hash: &str, except: Option<ProxyId>) -> bool {
        self.proxies
            .values()
            .any(|p| Some(p.id) != except && p.url_hash.as_deref() == Some(hash))
    }

    /// Remove identities that reference the proxy. Returns how many.
    fn cascade_proxy(&mut self, id: ProxyId) -> usize {
        let before = self.identities.len();
        self.identities.retain(|_, identity| identity.proxy_id != id);
        before - self.identities.len()
    }

    fn cascade_user_agent(&mut self, id: UserAgentId) -> usize {
        let before = self.identities.len();
        self.identities.retain(|_, identity| identity.user_agent_id != id);
        before - self.identities.len()
    }

    fn alloc_proxy_id(&mut self) -> ProxyId {
        let id = ProxyId(self.next_proxy_id.max(1));
        self.next_proxy_id = id.0 + 1;
        id
    }

    fn alloc_user_agent_id(&mut self) -> UserAgentId {
        let id = UserAgentId(self.next_user_agent_id.max(1));
        self.next_user_agent_id = id.0 + 1;
        id
    }

    fn alloc_identity_id(&mut self) -> IdentityId {
        let id = IdentityId(self.next_identity_id.max(1));
        self.next_identity_id = id.0 + 1;
        id
    }
}

/// Result of a staged mutation; `dirty` decides whether it is persisted.
struct Outcome<T> {
    value: T,
    dirty: bool,
}

impl<T> Outcome<T> {
    fn changed(value: T) -> Self {
        Self { value, dirty: true }
    }

    fn unchanged(value: T) -> Self {
        Self {
            value,
            dirty: false,
        }
    }
}

/// Sealed URL plus the fingerprint of its plaintext.
struct SealedUrl {
    url: Option<String>,
    hash: Option<String>,
}

fn duplicate_url() -> Error {
    Error::validation("url", "proxy with this url already exists")
}

/// Identity store persisted as a JSON snapshot.
pub struct FileStore {
    path: Option<PathBuf>,
    tables: RwLock<Arc<Tables>>,
    /// Serializes writers; never taken by readers.
    writer: Mutex<()>,
    codec: Arc<dyn FieldEncryptor>,
}

impl FileStore {
    /// Open the store at `path`.
    ///
    /// A missing file is created empty. Plaintext URLs found in the file are
    /// sealed and written back; already sealed URLs are left untouched.
    pub async fn open(path: PathBuf, codec: Arc<dyn FieldEncryptor>) -> Result<Self> {
        let exists = tokio::fs::try_exists(&path)
            .await
            .map_err(|e| Error::Storage(format!("checking store file: {e}")))?;

        let tables = if exists {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Storage(format!("reading store file: {e}")))?;
            let snapshot: Snapshot = serde_json::from_str(&contents)
                .map_err(|e| Error::Storage(format!("parsing store file: {e}")))?;
            let tables = Tables::from_snapshot(snapshot);
            info!(
                path = %path.display(),
                proxies = tables.proxies.len(),
                user_agents = tables.user_agents.len(),
                identities = tables.identities.len(),
                "loaded identity store"
            );
            tables
        } else {
            info!(path = %path.display(), "store file not found, starting with empty store");
            let tables = Tables::default();
            write_atomic(&path, &tables.to_snapshot()).await?;
            tables
        };

        let store = Self {
            path: Some(path),
            tables: RwLock::new(Arc::new(tables)),
            writer: Mutex::new(()),
            codec,
        };
        store.seal_plaintext_urls().await?;
        Ok(store)
    }

    /// Store without a backing file.
    pub fn in_memory(codec: Arc<dyn FieldEncryptor>) -> Self {
        Self {
            path: None,
            tables: RwLock::new(Arc::new(Tables::default())),
            writer: Mutex::new(()),
            codec,
        }
    }

    /// Stage `op` on a copy of the tables, persist if it changed anything, then
    /// publish. Readers never observe a partially applied operation.
    async fn mutate<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&mut Tables) -> Result<Outcome<T>> + Send,
    {
        let _writer = self.writer.lock().await;
        let mut staged = Tables::clone(&*self.snapshot().await);
        let outcome = op(&mut staged)?;
        if outcome.dirty {
            if let Some(path) = &self.path {
                write_atomic(path, &staged.to_snapshot()).await?;
            }
            *self.tables.write().await = Arc::new(staged);
        }
        Ok(outcome.value)
    }

    /// Current published tables. The read guard is released on return.
    async fn snapshot(&self) -> Arc<Tables> {
        self.tables.read().await.clone()
    }

    /// Identity joined with its proxy and user agent from one snapshot.
    fn join(&self, tables: &Tables, identity: &Identity) -> Option<IdentityRecord> {
        let proxy = tables.proxies.get(&identity.proxy_id)?;
        let user_agent = tables.user_agents.get(&identity.user_agent_id)?;
        Some(IdentityRecord {
            id: identity.id,
            user_agent: user_agent.clone(),
            proxy: self.open_proxy(proxy),
            status: identity.status,
            updated_at: identity.updated_at,
        })
    }

    fn seal_url(&self, plaintext: Option<&str>) -> Result<SealedUrl> {
        match plaintext {
            Some(url) => Ok(SealedUrl {
                url: Some(self.codec.encrypt(url)?),
                hash: Some(fingerprint(url)),
            }),
            None => Ok(SealedUrl {
                url: None,
                hash: None,
            }),
        }
    }

    fn open_proxy(&self, row: &ProxyRow) -> Proxy {
        Proxy {
            id: row.id,
            url: row.url.as_deref().map(|sealed| self.codec.decrypt(sealed)),
            url_hash: row.url_hash.clone(),
            expire_at: row.expire_at,
        }
    }

    async fn seal_plaintext_urls(&self) -> Result<()> {
        let codec = &self.codec;
        let sealed = self
            .mutate(|tables| {
                let mut sealed = 0usize;
                for row in tables.proxies.values_mut() {
                    let Some(url) = row.url.as_deref() else {
                        continue;
                    };
                    if is_encrypted(url) {
                        continue;
                    }
                    if row.url_hash.is_none() {
                        row.url_hash = Some(fingerprint(url));
                    }
                    row.url = Some(codec.encrypt(url)?);
                    sealed += 1;
                }
                Ok(if sealed > 0 {
                    Outcome::changed(sealed)
                } else {
                    Outcome::unchanged(0)
                })
            })
            .await?;
        if sealed > 0 {
            info!(count = sealed, "sealed plaintext proxy urls");
        }
        Ok(())
    }
}

impl IdentityStore for FileStore {
    fn create_proxy(&self, input: NewProxy) -> BoxFuture<'_, Result<Proxy>> {
        Box::pin(async move {
            let sealed = self.seal_url(input.normalized_url())?;
            let row = self
                .mutate(move |tables| {
                    if let Some(hash) = &sealed.hash
                        && tables.hash_taken(hash, None)
                    {
                        return Err(duplicate_url());
                    }
                    let id = tables.alloc_proxy_id();
                    let row = ProxyRow {
                        id,
                        url: sealed.url,
                        url_hash: sealed.hash,
                        expire_at: input.expire_at,
                    };
                    tables.proxies.insert(id, row.clone());
                    Ok(Outcome::changed(row))
                })
                .await?;
            info!(proxy_id = %row.id, has_url = row.url.is_some(), "proxy created");
            Ok(self.open_proxy(&row))
        })
    }

    fn update_proxy(&self, id: ProxyId, input: NewProxy) -> BoxFuture<'_, Result<Proxy>> {
        Box::pin(async move {
            let sealed = self.seal_url(input.normalized_url())?;
            let row = self
                .mutate(move |tables| {
                    if !tables.proxies.contains_key(&id) {
                        return Err(Error::NotFound(format!("proxy {id}")));
                    }
                    if let Some(hash) = &sealed.hash
                        && tables.hash_taken(hash, Some(id))
                    {
                        return Err(duplicate_url());
                    }
                    let row = ProxyRow {
                        id,
                        url: sealed.url,
                        url_hash: sealed.hash,
                        expire_at: input.expire_at,
                    };
                    tables.proxies.insert(id, row.clone());
                    Ok(Outcome::changed(row))
                })
                .await?;
            info!(proxy_id = %id, "proxy updated");
            Ok(self.open_proxy(&row))
        })
    }

    fn get_proxy(&self, id: ProxyId) -> BoxFuture<'_, Result<Option<Proxy>>> {
        Box::pin(async move {
            let tables = self.snapshot().await;
            Ok(tables.proxies.get(&id).map(|row| self.open_proxy(row)))
        })
    }

    fn list_proxies(&self) -> BoxFuture<'_, Result<Vec<Proxy>>> {
        Box::pin(async move {
            let tables = self.snapshot().await;
            Ok(tables
                .proxies
                .values()
                .map(|row| self.open_proxy(row))
                .collect())
        })
    }

    fn delete_proxy(&self, id: ProxyId) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async move {
            let removed = self
                .mutate(move |tables| {
                    if tables.proxies.remove(&id).is_none() {
                        return Ok(Outcome::unchanged(None));
                    }
                    Ok(Outcome::changed(Some(tables.cascade_proxy(id))))
                })
                .await?;
            match removed {
                Some(identities) => {
                    info!(proxy_id = %id, identities, "proxy deleted");
                    Ok(true)
                }
                None => Ok(false),
            }
        })
    }

    fn delete_expired_proxies(&self, now: DateTime<Utc>) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move {
            let (proxies, identities) = self
                .mutate(move |tables| {
                    let expired: Vec<ProxyId> = tables
                        .proxies
                        .values()
                        .filter(|row| row.expire_at.is_some_and(|at| at <= now))
                        .map(|row| row.id)
                        .collect();
                    if expired.is_empty() {
                        return Ok(Outcome::unchanged((0, 0)));
                    }
                    let mut identities = 0usize;
                    for id in &expired {
                        tables.proxies.remove(id);
                        identities += tables.cascade_proxy(*id);
                    }
                    Ok(Outcome::changed((expired.len() as u64, identities)))
                })
                .await?;
            debug!(proxies, identities, "deleted expired proxies");
            Ok(proxies)
        })
    }

    fn create_user_agent(&self, agent: String) -> BoxFuture<'_, Result<UserAgent>> {
        Box::pin(async move {
            let agent = agent.trim().to_string();
            if agent.is_empty() {
                return Err(Error::validation("agent", "this field may not be blank"));
            }
            let user_agent = self
                .mutate(move |tables| {
                    if tables.user_agents.values().any(|ua| ua.agent == agent) {
                        return Err(Error::validation(
                            "agent",
                            "user agent with this agent already exists",
                        ));
                    }
                    let id = tables.alloc_user_agent_id();
                    let user_agent = UserAgent { id, agent };
                    tables.user_agents.insert(id, user_agent.clone());
                    Ok(Outcome::changed(user_agent))
                })
                .await?;
            info!(user_agent_id = %user_agent.id, "user agent created");
            Ok(user_agent)
        })
    }

    fn list_user_agents(&self) -> BoxFuture<'_, Result<Vec<UserAgent>>> {
        Box::pin(async move {
            let tables = self.snapshot().await;
            Ok(tables.user_agents.values().cloned().collect())
        })
    }

    fn delete_user_agent(&self, id: UserAgentId) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async move {
            let removed = self
                .mutate(move |tables| {
                    if tables.user_agents.remove(&id).is_none() {
                        return Ok(Outcome::unchanged(None));
                    }
                    Ok(Outcome::changed(Some(tables.cascade_user_agent(id))))
                })
                .await?;
            match removed {
                Some(identities) => {
                    info!(user_agent_id = %id, identities, "user agent deleted");
                    Ok(true)
                }
                None => Ok(false),
            }
        })
    }

    fn create_identity(
        &self,
        input: NewIdentity,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Identity>> {
        Box::pin(async move {
            let identity = self
                .mutate(move |tables| {
                    if !tables.proxies.contains_key(&input.proxy_id) {
                        return Err(Error::validation(
                            "proxy",
                            format!("proxy {} does not exist", input.proxy_id),
                        ));
                    }
                    if !tables.user_agents.contains_key(&input.user_agent_id) {
                        return Err(Error::validation(
                            "user_agent",
                            format!("user agent {} does not exist", input.user_agent_id),
                        ));
                    }
                    if tables.identities.values().any(|i| {
                        i.proxy_id == input.proxy_id && i.user_agent_id == input.user_agent_id
                    }) {
                        return Err(Error::validation(
                            "non_field_errors",
                            "the fields user_agent, proxy must make a unique set",
                        ));
                    }
                    let id = tables.alloc_identity_id();
                    let identity = Identity {
                        id,
                        proxy_id: input.proxy_id,
                        user_agent_id: input.user_agent_id,
                        status: input.status,
                        updated_at: now,
                    };
                    tables.identities.insert(id, identity.clone());
                    Ok(Outcome::changed(identity))
                })
                .await?;
            info!(
                identity_id = %identity.id,
                proxy_id = %identity.proxy_id,
                user_agent_id = %identity.user_agent_id,
                "identity created"
            );
            Ok(identity)
        })
    }

    fn get_identity(&self, id: IdentityId) -> BoxFuture<'_, Result<Option<Identity>>> {
        Box::pin(async move {
            let tables = self.snapshot().await;
            Ok(tables.identities.get(&id).cloned())
        })
    }

    fn identity_record(&self, id: IdentityId) -> BoxFuture<'_, Result<Option<IdentityRecord>>> {
        Box::pin(async move {
            let tables = self.snapshot().await;
            Ok(tables
                .identities
                .get(&id)
                .and_then(|identity| self.join(&tables, identity)))
        })
    }

    fn list_identities(&self) -> BoxFuture<'_, Result<Vec<Identity>>> {
        Box::pin(async move {
            let tables = self.snapshot().await;
            Ok(tables.identities.values().cloned().collect())
        })
    }

    fn delete_identity(&self, id: IdentityId) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async move {
            let removed = self
                .mutate(move |tables| {
                    Ok(match tables.identities.remove(&id) {
                        Some(_) => Outcome::changed(true),
                        None => Outcome::unchanged(false),
                    })
                })
                .await?;
            if removed {
                info!(identity_id = %id, "identity deleted");
            }
            Ok(removed)
        })
    }

    fn list_selectable(&self) -> BoxFuture<'_, Result<Vec<IdentityRecord>>> {
        Box::pin(async move {
            let tables = self.snapshot().await;
            Ok(tables
                .identities
                .values()
                .filter(|identity| identity.status.is_selectable())
                .filter_map(|identity| self.join(&tables, identity))
                .collect())
        })
    }

    fn list_stale_rate_limited(
        &self,
        cooldown: Duration,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Vec<Identity>>> {
        Box::pin(async move {
            let cutoff = cooldown_cutoff(now, cooldown);
            let tables = self.snapshot().await;
            Ok(tables
                .identities
                .values()
                .filter(|identity| {
                    identity.status == HealthStatus::RateLimited && identity.updated_at <= cutoff
                })
                .cloned()
                .collect())
        })
    }

    fn update_status(
        &self,
        id: IdentityId,
        status: HealthStatus,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Option<Identity>>> {
        Box::pin(async move {
            self.mutate(move |tables| {
                let Some(identity) = tables.identities.get_mut(&id) else {
                    return Ok(Outcome::unchanged(None));
                };
                identity.status = status;
                identity.updated_at = now;
                Ok(Outcome::changed(Some(identity.clone())))
            })
            .await
        })
    }

    fn bulk_reset_status(
        &self,
        ids: Vec<IdentityId>,
        expected: HealthStatus,
        stale_before: DateTime<Utc>,
        new_status: HealthStatus,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move {
            self.mutate(move |tables| {
                let mut changed = 0u64;
                for id in &ids {
                    if let Some(identity) = tables.identities.get_mut(id)
                        && identity.status == expected
                        && identity.updated_at <= stale_before
                    {
                        identity.status = new_status;
                        identity.updated_at = now;
                        changed += 1;
                    }
                }
                Ok(if changed > 0 {
                    Outcome::changed(changed)
                } else {
                    Outcome::unchanged(0)
                })
            })
            .await
        })
    }
}

/// Write the snapshot to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over the
/// target. Sets permissions to 0600 since the file holds sealed proxy URLs.
async fn write_atomic(path: &Path, snapshot: &Snapshot) -> Result<()> {
    let json = serde_json::to_string_pretty(snapshot)
        .map_err(|e| Error::Storage(format!("serializing store: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Storage("store path has no parent directory".into()))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "store".into());
    let tmp_path = dir.join(format!(".{file_name}.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Storage(format!("writing temp store file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Storage(format!("setting store file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Storage(format!("renaming temp store file: {e}")))?;

    debug!(path = %path.display(), "persisted identity store");
    Ok(())
}
