//! Per-transaction bookkeeping of enlisted resources.
//!
//! Resources that report the same resource manager share one branch and are
//! grouped behind the first member enlisted (the group leader). Completion
//! works on groups: one prepare/commit/rollback per branch.

use std::sync::Arc;
use std::time::Duration;

use xatm_core::{Result, XaError, Xid};

use crate::resource::{
    same_resource_manager, Vote, XaResource, TMFAIL, TMJOIN, TMNOFLAGS, TMRESUME, TMSUCCESS,
    TMSUSPEND,
};

/// How a resource's association with its branch ends when it is delisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelistOutcome {
    /// The work done on the branch is complete.
    Success,
    /// The work failed; the transaction is marked rollback-only.
    Fail,
    /// The association is suspended and may be resumed by enlisting again.
    Suspend,
}

impl DelistOutcome {
    /// Returns the XA flag passed to `end`.
    pub fn flag(&self) -> i32 {
        match self {
            Self::Success => TMSUCCESS,
            Self::Fail => TMFAIL,
            Self::Suspend => TMSUSPEND,
        }
    }
}

/// Association state of one enlisted resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnlistmentState {
    /// Between `start` and `end`.
    Active,
    /// Ended with [`TMSUSPEND`].
    Suspended,
    /// Ended with [`TMSUCCESS`].
    EndedSuccess,
    /// Ended with [`TMFAIL`] or after a failed `end`.
    EndedFail,
}

impl EnlistmentState {
    fn is_associated(&self) -> bool {
        matches!(self, Self::Active | Self::Suspended)
    }
}

#[derive(Debug)]
struct EnlistedResource {
    resource: Arc<dyn XaResource>,
    group: usize,
    state: EnlistmentState,
}

/// One branch of the transaction and the resource that completes it.
#[derive(Debug)]
pub(crate) struct ResourceGroup {
    pub(crate) leader: Arc<dyn XaResource>,
    pub(crate) branch: Xid,
    pub(crate) vote: Option<Vote>,
    pub(crate) members: usize,
}

impl ResourceGroup {
    /// Returns true if the branch still needs a rollback call: it was not
    /// completed read-only and the resource did not already roll it back
    /// when it voted.
    pub(crate) fn needs_rollback(&self) -> bool {
        !matches!(self.vote, Some(Vote::ReadOnly) | Some(Vote::Rollback))
    }
}

/// The enlisted resources of one transaction, grouped by resource manager.
#[derive(Debug, Default)]
pub(crate) struct EnlistmentRegistry {
    resources: Vec<EnlistedResource>,
    groups: Vec<ResourceGroup>,
}

/// Compares resource instances by address.
fn same_instance(a: &Arc<dyn XaResource>, b: &Arc<dyn XaResource>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

fn enlistment_failure(resource: &dyn XaResource, branch: &Xid, err: XaError) -> XaError {
    XaError::ResourceEnlistmentFailure(format!(
        "{} failed to start branch {}: {}",
        resource.name(),
        branch,
        err
    ))
}

impl EnlistmentRegistry {
    /// Associates `resource` with the transaction identified by `global`.
    ///
    /// A resource already in the registry is resumed (if suspended) or
    /// rejoined (if it ended successfully and supports rejoining). A new
    /// resource joins the branch of the first enlisted resource it shares a
    /// resource manager with, otherwise it starts a fresh branch.
    pub(crate) async fn enlist(
        &mut self,
        global: &Xid,
        resource: Arc<dyn XaResource>,
        remaining: Duration,
    ) -> Result<()> {
        if let Some(index) = self.position(&resource) {
            return self.reassociate(index).await;
        }

        let joined = self
            .resources
            .iter()
            .find(|e| same_resource_manager(e.resource.as_ref(), resource.as_ref()))
            .map(|e| e.group);

        match joined {
            Some(group) => {
                let branch = self.groups[group].branch.clone();
                resource
                    .start(&branch, TMJOIN)
                    .await
                    .map_err(|e| enlistment_failure(resource.as_ref(), &branch, e))?;
                self.groups[group].members += 1;
                tracing::debug!(
                    resource = resource.name(),
                    leader = self.groups[group].leader.name(),
                    branch = %branch,
                    "joined existing branch"
                );
                self.resources.push(EnlistedResource {
                    resource,
                    group,
                    state: EnlistmentState::Active,
                });
            }
            None => {
                let branch = global.new_branch();
                if !remaining.is_zero() && !resource.set_transaction_timeout(remaining) {
                    tracing::debug!(
                        resource = resource.name(),
                        "resource did not accept transaction timeout"
                    );
                }
                resource
                    .start(&branch, TMNOFLAGS)
                    .await
                    .map_err(|e| enlistment_failure(resource.as_ref(), &branch, e))?;
                tracing::debug!(resource = resource.name(), branch = %branch, "started branch");
                let group = self.groups.len();
                self.groups.push(ResourceGroup {
                    leader: Arc::clone(&resource),
                    branch,
                    vote: None,
                    members: 1,
                });
                self.resources.push(EnlistedResource {
                    resource,
                    group,
                    state: EnlistmentState::Active,
                });
            }
        }
        Ok(())
    }

    async fn reassociate(&mut self, index: usize) -> Result<()> {
        let resource = Arc::clone(&self.resources[index].resource);
        let branch = self.groups[self.resources[index].group].branch.clone();
        let flags = match self.resources[index].state {
            EnlistmentState::Suspended => TMRESUME,
            EnlistmentState::EndedSuccess if resource.supports_rejoin() => TMJOIN,
            state => {
                return Err(XaError::ResourceEnlistmentFailure(format!(
                    "Cannot enlist {} again in state {:?}",
                    resource.name(),
                    state
                )));
            }
        };
        resource
            .start(&branch, flags)
            .await
            .map_err(|e| enlistment_failure(resource.as_ref(), &branch, e))?;
        self.resources[index].state = EnlistmentState::Active;
        Ok(())
    }

    /// Ends the association of `resource` with its branch.
    ///
    /// A failed `end` leaves the resource in [`EnlistmentState::EndedFail`]
    /// and is returned to the caller.
    pub(crate) async fn delist(
        &mut self,
        resource: &Arc<dyn XaResource>,
        outcome: DelistOutcome,
    ) -> Result<()> {
        let index = self.position(resource).ok_or_else(|| {
            XaError::ResourceEnlistmentFailure(format!(
                "{} is not enlisted in this transaction",
                resource.name()
            ))
        })?;

        let entry = &self.resources[index];
        let allowed = match outcome {
            DelistOutcome::Suspend => entry.state == EnlistmentState::Active,
            DelistOutcome::Success | DelistOutcome::Fail => entry.state.is_associated(),
        };
        if !allowed {
            return Err(XaError::IllegalStateTransition(format!(
                "Cannot delist {} with {:?} in state {:?}",
                resource.name(),
                outcome,
                entry.state
            )));
        }

        let branch = self.groups[entry.group].branch.clone();
        let result = resource.end(&branch, outcome.flag()).await;
        self.resources[index].state = match (&result, outcome) {
            (Err(_), _) | (Ok(()), DelistOutcome::Fail) => EnlistmentState::EndedFail,
            (Ok(()), DelistOutcome::Success) => EnlistmentState::EndedSuccess,
            (Ok(()), DelistOutcome::Suspend) => EnlistmentState::Suspended,
        };
        result
    }

    /// Ends every association that is still active or suspended.
    ///
    /// Returns the failures; every resource is attempted.
    pub(crate) async fn end_all(&mut self, flags: i32) -> Vec<(String, XaError)> {
        let mut failures = Vec::new();
        for index in 0..self.resources.len() {
            if !self.resources[index].state.is_associated() {
                continue;
            }
            let resource = Arc::clone(&self.resources[index].resource);
            let branch = &self.groups[self.resources[index].group].branch;
            match resource.end(branch, flags).await {
                Ok(()) if flags == TMSUCCESS => {
                    self.resources[index].state = EnlistmentState::EndedSuccess;
                }
                Ok(()) => self.resources[index].state = EnlistmentState::EndedFail,
                Err(e) => {
                    self.resources[index].state = EnlistmentState::EndedFail;
                    failures.push((resource.name().to_string(), e));
                }
            }
        }
        failures
    }

    fn position(&self, resource: &Arc<dyn XaResource>) -> Option<usize> {
        self.resources
            .iter()
            .position(|e| same_instance(&e.resource, resource))
    }

    /// Returns the association state of `resource`, if it was enlisted.
    pub(crate) fn state_of(&self, resource: &Arc<dyn XaResource>) -> Option<EnlistmentState> {
        self.position(resource).map(|i| self.resources[i].state)
    }

    pub(crate) fn resource_count(&self) -> usize {
        self.resources.len()
    }

    pub(crate) fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Returns the number of resources sharing each branch, in enlistment
    /// order of the groups.
    #[cfg(test)]
    pub(crate) fn group_sizes(&self) -> Vec<usize> {
        self.groups.iter().map(|g| g.members).collect()
    }

    pub(crate) fn groups(&self) -> &[ResourceGroup] {
        &self.groups
    }

    pub(crate) fn groups_mut(&mut self) -> &mut [ResourceGroup] {
        &mut self.groups
    }
}
