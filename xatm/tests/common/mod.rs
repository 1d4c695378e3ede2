//! Common test utilities for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use xatm::{
    ConnectionFactory, ConnectionRequest, DomainConfig, PhysicalConnection, Status,
    Synchronization, Transaction, TransactionDomain, Vote, XaError, XaResource, Xid,
};
use xatm::Result;

/// Installs a test subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

pub fn domain() -> TransactionDomain {
    init_tracing();
    TransactionDomain::create(DomainConfig::default())
}

pub fn domain_with_timeout(timeout: Duration) -> TransactionDomain {
    init_tracing();
    let config = DomainConfig::builder()
        .transaction(|t| {
            t.default_timeout(timeout)
                .reaper_interval(Duration::from_millis(100))
        })
        .build()
        .expect("failed to build config");
    TransactionDomain::create(config)
}

// ============================================================================
// Shared event log
// ============================================================================

/// Ordered record of every callback made by mocks sharing the log.
#[derive(Debug, Default)]
pub struct EventLog(Mutex<Vec<String>>);

impl EventLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().push(event.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn position(&self, event: &str) -> Option<usize> {
        self.0.lock().iter().position(|e| e == event)
    }
}

// ============================================================================
// Mock resource
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Start(i32),
    End(i32),
    Prepare,
    Commit(bool),
    Rollback,
    Forget,
}

/// In-memory resource that records every call.
///
/// Resources created with the same `rm` report the same resource manager.
#[derive(Debug)]
pub struct MockResource {
    name: String,
    rm: String,
    log: Arc<EventLog>,
    calls: Mutex<Vec<(Xid, Call)>>,
    vote: Mutex<Vote>,
    prepare_error: Mutex<Option<i32>>,
    commit_error: Mutex<Option<i32>>,
    rollback_error: Mutex<Option<i32>>,
    in_doubt: Mutex<Vec<Xid>>,
    rejoin: AtomicBool,
    claims_every_rm: AtomicBool,
    prepare_delay: Mutex<Option<Duration>>,
}

impl MockResource {
    pub fn new(label: &str, rm: &str, log: &Arc<EventLog>) -> Arc<Self> {
        Arc::new(Self {
            name: format!("{}/{}", rm, label),
            rm: rm.to_string(),
            log: Arc::clone(log),
            calls: Mutex::new(Vec::new()),
            vote: Mutex::new(Vote::Commit),
            prepare_error: Mutex::new(None),
            commit_error: Mutex::new(None),
            rollback_error: Mutex::new(None),
            in_doubt: Mutex::new(Vec::new()),
            rejoin: AtomicBool::new(false),
            claims_every_rm: AtomicBool::new(false),
            prepare_delay: Mutex::new(None),
        })
    }

    /// Makes `prepare` advance the paused test clock by `delay` before it
    /// answers.
    pub fn stall_prepare(&self, delay: Duration) {
        *self.prepare_delay.lock() = Some(delay);
    }

    pub fn set_vote(&self, vote: Vote) {
        *self.vote.lock() = vote;
    }

    pub fn fail_prepare(&self, code: i32) {
        *self.prepare_error.lock() = Some(code);
    }

    pub fn fail_commit(&self, code: i32) {
        *self.commit_error.lock() = Some(code);
    }

    pub fn fail_rollback(&self, code: i32) {
        *self.rollback_error.lock() = Some(code);
    }

    pub fn set_in_doubt(&self, xids: Vec<Xid>) {
        *self.in_doubt.lock() = xids;
    }

    pub fn enable_rejoin(&self) {
        self.rejoin.store(true, Ordering::SeqCst);
    }

    /// Makes `is_same_rm` answer true for every other resource.
    pub fn claim_every_rm(&self) {
        self.claims_every_rm.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().iter().map(|(_, c)| c.clone()).collect()
    }

    pub fn count(&self, call: &Call) -> usize {
        self.calls.lock().iter().filter(|(_, c)| c == call).count()
    }

    /// Returns the branch identifier passed to the first `start`.
    pub fn branch(&self) -> Option<Xid> {
        self.calls
            .lock()
            .iter()
            .find(|(_, c)| matches!(c, Call::Start(_)))
            .map(|(xid, _)| xid.clone())
    }

    pub fn as_resource(self: &Arc<Self>) -> Arc<dyn XaResource> {
        Arc::clone(self) as Arc<dyn XaResource>
    }

    fn record(&self, xid: &Xid, call: Call) {
        let event = match &call {
            Call::Start(_) => "start",
            Call::End(_) => "end",
            Call::Prepare => "prepare",
            Call::Commit(_) => "commit",
            Call::Rollback => "rollback",
            Call::Forget => "forget",
        };
        self.log.push(format!("{}:{}", self.name, event));
        self.calls.lock().push((xid.clone(), call));
    }
}

#[async_trait]
impl XaResource for MockResource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self, xid: &Xid, flags: i32) -> Result<()> {
        self.record(xid, Call::Start(flags));
        Ok(())
    }

    async fn end(&self, xid: &Xid, flags: i32) -> Result<()> {
        self.record(xid, Call::End(flags));
        Ok(())
    }

    async fn prepare(&self, xid: &Xid) -> Result<Vote> {
        self.record(xid, Call::Prepare);
        let delay = *self.prepare_delay.lock();
        if let Some(delay) = delay {
            tokio::time::advance(delay).await;
        }
        match *self.prepare_error.lock() {
            Some(code) => Err(XaError::resource(code, "prepare failed")),
            None => Ok(*self.vote.lock()),
        }
    }

    async fn commit(&self, xid: &Xid, one_phase: bool) -> Result<()> {
        self.record(xid, Call::Commit(one_phase));
        match *self.commit_error.lock() {
            Some(code) => Err(XaError::resource(code, "commit failed")),
            None => Ok(()),
        }
    }

    async fn rollback(&self, xid: &Xid) -> Result<()> {
        self.record(xid, Call::Rollback);
        match *self.rollback_error.lock() {
            Some(code) => Err(XaError::resource(code, "rollback failed")),
            None => Ok(()),
        }
    }

    async fn forget(&self, xid: &Xid) -> Result<()> {
        self.record(xid, Call::Forget);
        Ok(())
    }

    async fn recover(&self, _flags: i32) -> Result<Vec<Xid>> {
        Ok(self.in_doubt.lock().clone())
    }

    fn is_same_rm(&self, other: &dyn XaResource) -> bool {
        self.claims_every_rm.load(Ordering::SeqCst)
            || other.name().starts_with(&format!("{}/", self.rm))
    }

    fn set_transaction_timeout(&self, _timeout: Duration) -> bool {
        true
    }

    fn supports_rejoin(&self) -> bool {
        self.rejoin.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Recording synchronization
// ============================================================================

#[derive(Debug)]
pub struct RecordingSync {
    label: String,
    log: Arc<EventLog>,
    fail_before: AtomicBool,
    fail_after: AtomicBool,
    before_status: Mutex<Option<Status>>,
    after_status: Mutex<Option<Status>>,
    watched: Mutex<Option<Transaction>>,
}

impl RecordingSync {
    pub fn new(label: &str, log: &Arc<EventLog>) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            log: Arc::clone(log),
            fail_before: AtomicBool::new(false),
            fail_after: AtomicBool::new(false),
            before_status: Mutex::new(None),
            after_status: Mutex::new(None),
            watched: Mutex::new(None),
        })
    }

    pub fn fail_before(&self) {
        self.fail_before.store(true, Ordering::SeqCst);
    }

    pub fn fail_after(&self) {
        self.fail_after.store(true, Ordering::SeqCst);
    }

    pub fn after_status(&self) -> Option<Status> {
        *self.after_status.lock()
    }

    /// Records the status of `tx` seen from `before_completion`. The
    /// reference is released in `after_completion`.
    pub fn watch(&self, tx: &Transaction) {
        *self.watched.lock() = Some(tx.clone());
    }

    pub fn before_status(&self) -> Option<Status> {
        *self.before_status.lock()
    }
}

#[async_trait]
impl Synchronization for RecordingSync {
    async fn before_completion(&self) -> Result<()> {
        self.log.push(format!("{}:before", self.label));
        let seen = self.watched.lock().as_ref().map(|tx| tx.status());
        *self.before_status.lock() = seen;
        if self.fail_before.load(Ordering::SeqCst) {
            return Err(XaError::Connection("flush failed".into()));
        }
        Ok(())
    }

    async fn after_completion(&self, status: Status) -> Result<()> {
        self.log.push(format!("{}:after", self.label));
        *self.after_status.lock() = Some(status);
        self.watched.lock().take();
        if self.fail_after.load(Ordering::SeqCst) {
            return Err(XaError::Connection("cache eviction failed".into()));
        }
        Ok(())
    }
}

// ============================================================================
// Counting connection factory
// ============================================================================

#[derive(Debug)]
pub struct MockConnection {
    resource: Arc<MockResource>,
    closed: AtomicBool,
}

impl MockConnection {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn resource(&self) -> &Arc<MockResource> {
        &self.resource
    }
}

#[async_trait]
impl PhysicalConnection for MockConnection {
    fn xa_resource(&self) -> Arc<dyn XaResource> {
        self.resource.as_resource()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory that counts the physical connections it opens.
#[derive(Debug)]
pub struct CountingFactory {
    log: Arc<EventLog>,
    created: AtomicUsize,
    connections: Mutex<Vec<Arc<MockConnection>>>,
    delay: Mutex<Option<Duration>>,
}

impl CountingFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            log: EventLog::new(),
            created: AtomicUsize::new(0),
            connections: Mutex::new(Vec::new()),
            delay: Mutex::new(None),
        })
    }

    /// Makes every `create` take `delay` before answering.
    pub fn slow(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn connections(&self) -> Vec<Arc<MockConnection>> {
        self.connections.lock().clone()
    }
}

#[async_trait]
impl ConnectionFactory for CountingFactory {
    async fn create(&self, request: &ConnectionRequest) -> Result<Arc<dyn PhysicalConnection>> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        let resource = MockResource::new(&format!("conn-{}", n), request.data_source(), &self.log);
        let connection = Arc::new(MockConnection {
            resource,
            closed: AtomicBool::new(false),
        });
        self.connections.lock().push(Arc::clone(&connection));
        Ok(connection)
    }
}
