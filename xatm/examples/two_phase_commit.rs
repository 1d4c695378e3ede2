//! Example: a transfer between two ledgers coordinated with two-phase commit
//!
//! Each ledger is an in-memory resource manager that stages writes per branch
//! and only applies them on commit. The second transfer overdraws an account,
//! so its ledger votes to roll back and neither side changes.
//!
//! Run with: `cargo run --example two_phase_commit`

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use xatm::{DomainConfig, TransactionDomain, Vote, XaError, XaResource, Xid};

#[derive(Debug)]
struct Ledger {
    name: String,
    balances: Mutex<HashMap<String, i64>>,
    staged: Mutex<HashMap<Xid, Vec<(String, i64)>>>,
    current: Mutex<Option<Xid>>,
}

impl Ledger {
    fn new(name: &str, accounts: &[(&str, i64)]) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            balances: Mutex::new(
                accounts
                    .iter()
                    .map(|(account, balance)| (account.to_string(), *balance))
                    .collect(),
            ),
            staged: Mutex::new(HashMap::new()),
            current: Mutex::new(None),
        })
    }

    /// Stages a change on the branch the ledger is currently associated with.
    fn apply(&self, account: &str, delta: i64) -> xatm::Result<()> {
        let current = self.current.lock().clone();
        let xid = current.ok_or_else(|| {
            XaError::IllegalStateTransition(format!("{} is not enlisted", self.name))
        })?;
        self.staged
            .lock()
            .entry(xid)
            .or_default()
            .push((account.to_string(), delta));
        Ok(())
    }

    fn balance(&self, account: &str) -> i64 {
        self.balances.lock().get(account).copied().unwrap_or(0)
    }
}

#[async_trait]
impl XaResource for Ledger {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self, xid: &Xid, _flags: i32) -> xatm::Result<()> {
        *self.current.lock() = Some(xid.clone());
        Ok(())
    }

    async fn end(&self, _xid: &Xid, _flags: i32) -> xatm::Result<()> {
        *self.current.lock() = None;
        Ok(())
    }

    async fn prepare(&self, xid: &Xid) -> xatm::Result<Vote> {
        let staged = self.staged.lock();
        let Some(changes) = staged.get(xid) else {
            return Ok(Vote::ReadOnly);
        };
        let balances = self.balances.lock();
        let overdrawn = changes.iter().any(|(account, delta)| {
            balances.get(account).copied().unwrap_or(0) + delta < 0
        });
        Ok(if overdrawn { Vote::Rollback } else { Vote::Commit })
    }

    async fn commit(&self, xid: &Xid, _one_phase: bool) -> xatm::Result<()> {
        let changes = self.staged.lock().remove(xid).unwrap_or_default();
        let mut balances = self.balances.lock();
        for (account, delta) in changes {
            *balances.entry(account).or_insert(0) += delta;
        }
        Ok(())
    }

    async fn rollback(&self, xid: &Xid) -> xatm::Result<()> {
        self.staged.lock().remove(xid);
        Ok(())
    }

    async fn recover(&self, _flags: i32) -> xatm::Result<Vec<Xid>> {
        Ok(self.staged.lock().keys().cloned().collect())
    }

    fn is_same_rm(&self, other: &dyn XaResource) -> bool {
        other.name() == self.name
    }
}

async fn transfer(
    domain: &TransactionDomain,
    from: &Arc<Ledger>,
    to: &Arc<Ledger>,
    amount: i64,
) -> xatm::Result<()> {
    let tx = domain.begin().await?;
    tx.enlist_resource(from.clone()).await?;
    tx.enlist_resource(to.clone()).await?;

    from.apply("alice", -amount)?;
    to.apply("bob", amount)?;

    tx.commit().await
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "xatm=info".into()),
        )
        .init();

    let config = DomainConfig::builder()
        .name("ledgers")
        .transaction_timeout(Duration::from_secs(30))
        .build()?;
    let domain = TransactionDomain::create(config);

    let checking = Ledger::new("checking", &[("alice", 1000)]);
    let savings = Ledger::new("savings", &[("bob", 500)]);

    println!("--- Transfer $200 from Alice to Bob ---");
    transfer(&domain, &checking, &savings, 200).await?;
    println!("  Alice: ${}", checking.balance("alice"));
    println!("  Bob:   ${}", savings.balance("bob"));

    println!("\n--- Transfer $5000 from Alice to Bob (overdraws) ---");
    match transfer(&domain, &checking, &savings, 5000).await {
        Ok(()) => println!("  unexpectedly committed"),
        Err(e) if e.is_rollback() => println!("  rolled back: {}", e),
        Err(e) => return Err(e.into()),
    }
    println!("  Alice: ${}", checking.balance("alice"));
    println!("  Bob:   ${}", savings.balance("bob"));

    domain.shutdown().await;
    Ok(())
}
