//! Pool bookkeeping, connection creation, eviction and the sweeper task.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::{timeout, Instant};
use tracing::instrument;

use xatm_core::{Result, XaError};

use super::factory::{ConnectionFactory, ConnectionRequest, Credentials, PhysicalConnection};
use super::handle::PooledHandle;
use super::{ConnectionId, LeaseState, PoolStats};
use crate::config::PoolConfig;
use crate::resource::XaResource;
use crate::runtime::{Runtime, TokioRuntime};
use crate::transaction::{Transaction, WeakTransaction};

/// Connections are shared only between requests for the same data source
/// and user.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct PoolKey {
    data_source: String,
    user: Option<String>,
}

impl PoolKey {
    fn new(data_source: &str, credentials: Option<&Credentials>) -> Self {
        Self {
            data_source: data_source.to_string(),
            user: credentials.map(|c| c.user().to_string()),
        }
    }
}

/// Validity token and last activity, shared between a pooled connection and
/// the handles issued for it.
#[derive(Debug)]
pub(crate) struct Validity {
    token: AtomicU64,
    last_used: Mutex<Instant>,
}

impl Validity {
    fn new() -> Self {
        Self {
            token: AtomicU64::new(0),
            last_used: Mutex::new(Instant::now()),
        }
    }

    pub(crate) fn token(&self) -> u64 {
        self.token.load(Ordering::Acquire)
    }

    fn bump(&self) {
        self.token.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    fn last_used(&self) -> Instant {
        *self.last_used.lock()
    }
}

struct PoolEntry {
    key: PoolKey,
    physical: Arc<dyn PhysicalConnection>,
    resource: Arc<dyn XaResource>,
    validity: Arc<Validity>,
    lease: LeaseState,
    /// Transactions whose branches on this connection may still be
    /// completed. Held weakly so an abandoned transaction can be reaped.
    enlisted: Vec<WeakTransaction>,
}

fn is_unfinished(tx: &WeakTransaction) -> bool {
    tx.upgrade().is_some_and(|tx| !tx.status().is_terminal())
}

impl PoolEntry {
    fn has_unfinished_transaction(&self) -> bool {
        self.enlisted.iter().any(is_unfinished)
    }

    fn track(&mut self, tx: &Transaction) {
        self.enlisted.retain(is_unfinished);
        let known = self
            .enlisted
            .iter()
            .filter_map(WeakTransaction::upgrade)
            .any(|t| t.xid() == tx.xid());
        if !known {
            self.enlisted.push(tx.downgrade());
        }
    }
}

#[derive(Default)]
struct PoolState {
    entries: HashMap<ConnectionId, PoolEntry>,
    idle: HashMap<PoolKey, VecDeque<ConnectionId>>,
    pending: HashMap<PoolKey, usize>,
}

impl PoolState {
    fn open_for(&self, key: &PoolKey) -> usize {
        let open = self.entries.values().filter(|e| &e.key == key).count();
        open + self.pending.get(key).copied().unwrap_or(0)
    }

    /// Removes the entry and invalidates every handle issued for it.
    fn evict(&mut self, id: ConnectionId) -> Option<PoolEntry> {
        let entry = self.entries.remove(&id)?;
        entry.validity.bump();
        if let Some(queue) = self.idle.get_mut(&entry.key) {
            queue.retain(|i| *i != id);
            if queue.is_empty() {
                self.idle.remove(&entry.key);
            }
        }
        Some(entry)
    }
}

pub(crate) struct PoolShared {
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    pub(crate) runtime: Arc<dyn Runtime>,
    state: Mutex<PoolState>,
    created: AtomicU64,
    destroyed: AtomicU64,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl fmt::Debug for PoolShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolShared")
            .field("config", &self.config)
            .field("factory", &self.factory)
            .field("created", &self.created.load(Ordering::Relaxed))
            .field("destroyed", &self.destroyed.load(Ordering::Relaxed))
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl PoolShared {
    fn checkout_idle(self: &Arc<Self>, key: &PoolKey) -> Option<PooledHandle> {
        let mut state = self.state.lock();
        let id = state.idle.get_mut(key)?.pop_back()?;
        if state.idle.get(key).is_some_and(|q| q.is_empty()) {
            state.idle.remove(key);
        }
        let entry = state.entries.get_mut(&id)?;
        entry.lease = LeaseState::Leased;
        entry.validity.touch();
        tracing::trace!(connection = %id, "reusing idle connection");
        Some(PooledHandle::new(
            Arc::clone(self),
            id,
            Arc::clone(&entry.physical),
            Arc::clone(&entry.resource),
            Arc::clone(&entry.validity),
        ))
    }

    fn reserve(&self, key: &PoolKey) -> Result<()> {
        let mut state = self.state.lock();
        let max = self.config.max_connections();
        if max > 0 && state.open_for(key) >= max {
            return Err(XaError::Connection(format!(
                "connection limit of {} reached for data source '{}'",
                max, key.data_source
            )));
        }
        *state.pending.entry(key.clone()).or_insert(0) += 1;
        Ok(())
    }

    fn unreserve(&self, key: &PoolKey) {
        let mut state = self.state.lock();
        let remaining = state.pending.get_mut(key).map(|n| {
            *n = n.saturating_sub(1);
            *n
        });
        if remaining == Some(0) {
            state.pending.remove(key);
        }
    }

    /// Registers a freshly created connection as leased. Returns `None` if
    /// the pool was shut down while the connection was being opened.
    fn admit(
        self: &Arc<Self>,
        key: PoolKey,
        physical: Arc<dyn PhysicalConnection>,
    ) -> Option<PooledHandle> {
        let mut state = self.state.lock();
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        let id = ConnectionId::new();
        let validity = Arc::new(Validity::new());
        let resource = physical.xa_resource();
        state.entries.insert(
            id,
            PoolEntry {
                key,
                physical: Arc::clone(&physical),
                resource: Arc::clone(&resource),
                validity: Arc::clone(&validity),
                lease: LeaseState::Leased,
                enlisted: Vec::new(),
            },
        );
        self.created.fetch_add(1, Ordering::Relaxed);
        Some(PooledHandle::new(Arc::clone(self), id, physical, resource, validity))
    }

    /// Returns a leased connection to the idle set, unless the handle's
    /// stamp is outdated.
    pub(crate) fn release(&self, id: ConnectionId, stamp: u64, tx: Option<Transaction>) {
        let mut state = self.state.lock();
        let Some(entry) = state.entries.get_mut(&id) else {
            return;
        };
        if entry.validity.token() != stamp {
            return;
        }
        entry.lease = LeaseState::Idle;
        entry.validity.touch();
        if let Some(tx) = &tx {
            entry.track(tx);
        }
        let key = entry.key.clone();
        state.idle.entry(key).or_default().push_back(id);
    }

    pub(crate) fn track_enlistment(&self, id: ConnectionId, stamp: u64, tx: Transaction) {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get_mut(&id) {
            if entry.validity.token() == stamp {
                entry.track(&tx);
            }
        }
    }

    /// Evicts a connection if `stamp` is still current.
    pub(crate) fn evict(&self, id: ConnectionId, stamp: u64) -> Option<Arc<dyn PhysicalConnection>> {
        let mut state = self.state.lock();
        if state.entries.get(&id)?.validity.token() != stamp {
            return None;
        }
        let entry = state.evict(id)?;
        self.destroyed.fetch_add(1, Ordering::Relaxed);
        Some(entry.physical)
    }

    pub(crate) async fn close_physical(
        &self,
        id: ConnectionId,
        physical: Arc<dyn PhysicalConnection>,
        reason: &str,
    ) {
        match physical.close().await {
            Ok(()) => tracing::info!(connection = %id, reason, "closed physical connection"),
            Err(e) => tracing::warn!(
                connection = %id,
                reason,
                error = %e,
                "failed to close physical connection"
            ),
        }
    }

    fn select_prunable(&self) -> Vec<(ConnectionId, Arc<dyn PhysicalConnection>)> {
        let factor = self.config.prune_factor();
        if factor <= 0.0 {
            return Vec::new();
        }
        let idle_timeout = self.config.idle_timeout();
        let now = Instant::now();

        let mut state = self.state.lock();
        let mut eligible: Vec<(Instant, ConnectionId)> = state
            .entries
            .iter()
            .filter(|(_, e)| !e.has_unfinished_transaction())
            .map(|(id, e)| (e.validity.last_used(), *id))
            .filter(|(last_used, _)| now.saturating_duration_since(*last_used) >= idle_timeout)
            .collect();
        if eligible.is_empty() {
            return Vec::new();
        }
        eligible.sort();

        let count = ((factor * eligible.len() as f64).ceil() as usize).min(eligible.len());
        let victims: Vec<_> = eligible
            .into_iter()
            .take(count)
            .filter_map(|(_, id)| state.evict(id).map(|e| (id, e.physical)))
            .collect();
        self.destroyed
            .fetch_add(victims.len() as u64, Ordering::Relaxed);
        victims
    }

    fn evict_all(&self) -> Vec<(ConnectionId, Arc<dyn PhysicalConnection>)> {
        let mut state = self.state.lock();
        let ids: Vec<_> = state.entries.keys().copied().collect();
        let victims: Vec<_> = ids
            .into_iter()
            .filter_map(|id| state.evict(id).map(|e| (id, e.physical)))
            .collect();
        self.destroyed
            .fetch_add(victims.len() as u64, Ordering::Relaxed);
        victims
    }

    fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        let idle = state
            .entries
            .values()
            .filter(|e| e.lease == LeaseState::Idle)
            .count();
        PoolStats {
            created: self.created.load(Ordering::Relaxed),
            destroyed: self.destroyed.load(Ordering::Relaxed),
            idle,
            leased: state.entries.len() - idle,
        }
    }
}

/// A pool of physical connections.
///
/// Cloning yields another handle to the same pool.
#[derive(Debug, Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

impl ConnectionPool {
    /// Creates a pool that runs its sweeper on Tokio.
    ///
    /// Must be called from within a Tokio runtime when pruning is enabled.
    pub fn new(config: PoolConfig, factory: Arc<dyn ConnectionFactory>) -> Self {
        Self::with_runtime(config, factory, Arc::new(TokioRuntime))
    }

    /// Creates a pool that spawns its sweeper through `runtime`.
    pub fn with_runtime(
        config: PoolConfig,
        factory: Arc<dyn ConnectionFactory>,
        runtime: Arc<dyn Runtime>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let shared = Arc::new(PoolShared {
            config,
            factory,
            runtime,
            state: Mutex::new(PoolState::default()),
            created: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            shutdown,
        });
        if shared.config.pruning_enabled() {
            spawn_sweeper(&shared);
        }
        Self { shared }
    }

    /// Returns the pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Returns a handle to an idle connection for `data_source`, or opens a
    /// new one through the factory.
    ///
    /// # Errors
    ///
    /// [`XaError::Connection`] if the pool is shut down, the per data source
    /// limit is reached, or the factory does not answer within the login
    /// timeout. Factory errors are returned as is.
    #[instrument(
        name = "pool.get",
        skip(self, credentials),
        fields(data_source = %data_source)
    )]
    pub async fn get(
        &self,
        data_source: &str,
        credentials: Option<Credentials>,
    ) -> Result<PooledHandle> {
        if self.is_shutdown() {
            return Err(XaError::Connection("connection pool is shut down".to_string()));
        }
        let key = PoolKey::new(data_source, credentials.as_ref());
        if let Some(handle) = self.shared.checkout_idle(&key) {
            return Ok(handle);
        }

        self.shared.reserve(&key)?;
        let request = ConnectionRequest::new(
            data_source,
            credentials,
            self.shared.config.default_isolation(),
        );
        let login_timeout = self.shared.config.login_timeout();
        let created = timeout(login_timeout, self.shared.factory.create(&request)).await;
        self.shared.unreserve(&key);

        let physical = match created {
            Ok(Ok(physical)) => physical,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "failed to open physical connection");
                return Err(e);
            }
            Err(_) => {
                tracing::warn!(timeout = ?login_timeout, "opening physical connection timed out");
                return Err(XaError::Connection(format!(
                    "opening a connection to '{}' timed out after {:?}",
                    data_source, login_timeout
                )));
            }
        };

        match self.shared.admit(key, Arc::clone(&physical)) {
            Some(handle) => {
                tracing::info!(connection = %handle.id(), "opened physical connection");
                Ok(handle)
            }
            None => {
                self.shared
                    .close_physical(ConnectionId::new(), physical, "pool shut down")
                    .await;
                Err(XaError::Connection("connection pool is shut down".to_string()))
            }
        }
    }

    /// Runs one prune sweep immediately. Returns the number of evicted
    /// connections.
    #[instrument(name = "pool.prune", skip(self))]
    pub async fn prune_now(&self) -> usize {
        let victims = self.shared.select_prunable();
        let count = victims.len();
        for (id, physical) in victims {
            self.shared.close_physical(id, physical, "pruned").await;
        }
        if count > 0 {
            tracing::info!(evicted = count, "pruned idle connections");
        }
        count
    }

    /// Evicts the connection behind `handle`, making the handle and every
    /// other handle to that connection stale.
    ///
    /// Does nothing if the handle is already stale.
    pub async fn invalidate(&self, handle: &PooledHandle) {
        if let Some(physical) = self.shared.evict(handle.id(), handle.stamp()) {
            self.shared
                .close_physical(handle.id(), physical, "invalidated")
                .await;
        }
    }

    /// Returns the lease state of a connection; evicted or unknown
    /// connections are [`LeaseState::Stale`].
    pub fn lease_state(&self, id: ConnectionId) -> LeaseState {
        self.shared
            .state
            .lock()
            .entries
            .get(&id)
            .map(|e| e.lease)
            .unwrap_or(LeaseState::Stale)
    }

    /// Returns a snapshot of the pool counters.
    pub fn stats(&self) -> PoolStats {
        self.shared.stats()
    }

    /// Returns true once [`shutdown`](Self::shutdown) was called.
    pub fn is_shutdown(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Stops the sweeper and closes every physical connection. Outstanding
    /// handles become stale.
    pub async fn shutdown(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shared.shutdown.send(true);
        for (id, physical) in self.shared.evict_all() {
            self.shared.close_physical(id, physical, "pool shut down").await;
        }
        tracing::info!("connection pool shut down");
    }
}

fn spawn_sweeper(shared: &Arc<PoolShared>) {
    let weak = Arc::downgrade(shared);
    let interval = shared.config.prune_interval();
    let runtime = Arc::clone(&shared.runtime);
    let mut shutdown_rx = shared.shutdown.subscribe();

    shared.runtime.spawn(Box::pin(async move {
        loop {
            tokio::select! {
                _ = runtime.sleep(interval) => {
                    let Some(shared) = weak.upgrade() else {
                        break;
                    };
                    let pool = ConnectionPool { shared };
                    pool.prune_now().await;
                }
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        tracing::debug!("pool sweeper shutting down");
                        break;
                    }
                }
            }
        }
    }));
}
