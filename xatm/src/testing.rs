//! Recording resource used by the unit tests.
//!
//! Names have the form `<rm>/<label>`; resources with the same `<rm>` report
//! the same resource manager. Aliases widen that to other `<rm>` names.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use xatm_core::{Result, XaError, Xid};

use crate::resource::{Vote, XaResource};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Start(Xid, i32),
    End(Xid, i32),
    Prepare(Xid),
    Commit(Xid, bool),
    Rollback(Xid),
    Forget(Xid),
}

#[derive(Debug)]
pub(crate) struct TestResource {
    name: String,
    rm: &'static str,
    calls: Mutex<Vec<Call>>,
    vote: Mutex<Vote>,
    commit_error: Mutex<Option<i32>>,
    fail_start: AtomicBool,
    rejoin: AtomicBool,
    aliases: Mutex<Vec<&'static str>>,
}

impl TestResource {
    pub(crate) fn new(name: &'static str, rm: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name: format!("{}/{}", rm, name),
            rm,
            calls: Mutex::new(Vec::new()),
            vote: Mutex::new(Vote::Commit),
            commit_error: Mutex::new(None),
            fail_start: AtomicBool::new(false),
            rejoin: AtomicBool::new(false),
            aliases: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn voting(self: Arc<Self>, vote: Vote) -> Arc<Self> {
        *self.vote.lock() = vote;
        self
    }

    pub(crate) fn failing_commit(self: Arc<Self>, code: i32) -> Arc<Self> {
        *self.commit_error.lock() = Some(code);
        self
    }

    pub(crate) fn failing_start(self: Arc<Self>) -> Arc<Self> {
        self.fail_start.store(true, Ordering::SeqCst);
        self
    }

    pub(crate) fn with_rejoin(self: Arc<Self>) -> Arc<Self> {
        self.rejoin.store(true, Ordering::SeqCst);
        self
    }

    pub(crate) fn aliasing(self: Arc<Self>, rm: &'static str) -> Arc<Self> {
        self.aliases.lock().push(rm);
        self
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub(crate) fn count(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| predicate(c)).count()
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl XaResource for TestResource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self, xid: &Xid, flags: i32) -> Result<()> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(XaError::Connection("refused".into()));
        }
        self.record(Call::Start(xid.clone(), flags));
        Ok(())
    }

    async fn end(&self, xid: &Xid, flags: i32) -> Result<()> {
        self.record(Call::End(xid.clone(), flags));
        Ok(())
    }

    async fn prepare(&self, xid: &Xid) -> Result<Vote> {
        self.record(Call::Prepare(xid.clone()));
        Ok(*self.vote.lock())
    }

    async fn commit(&self, xid: &Xid, one_phase: bool) -> Result<()> {
        self.record(Call::Commit(xid.clone(), one_phase));
        match *self.commit_error.lock() {
            Some(code) => Err(XaError::resource(code, "commit failed")),
            None => Ok(()),
        }
    }

    async fn rollback(&self, xid: &Xid) -> Result<()> {
        self.record(Call::Rollback(xid.clone()));
        Ok(())
    }

    async fn forget(&self, xid: &Xid) -> Result<()> {
        self.record(Call::Forget(xid.clone()));
        Ok(())
    }

    async fn recover(&self, _flags: i32) -> Result<Vec<Xid>> {
        Ok(Vec::new())
    }

    fn is_same_rm(&self, other: &dyn XaResource) -> bool {
        match other.name().split('/').next() {
            Some(rm) => rm == self.rm || self.aliases.lock().contains(&rm),
            None => false,
        }
    }

    fn supports_rejoin(&self) -> bool {
        self.rejoin.load(Ordering::SeqCst)
    }
}
