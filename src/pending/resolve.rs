//! Resolution rules for pending operations.
//!
//! A resolution only applies to an operation whose stored state is still the
//! one the caller holds (Dispatched, for anything a command resolves). The
//! store performs that check as a compare-and-set, so resolving the same
//! operation twice is a no-op the second time.

use anyhow::Result;
use std::sync::Arc;

use super::{AccountId, BlockReason, DeferUntil, Operation, PendingOperation, State, Why};
use crate::notification::{NotificationSink, OutcomeSummary};
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The server confirmed the mutation.
    Success,
    /// Permanently rejected; the user sees an error.
    HardFail(Why),
    /// Parked until the user (or an admin) acts; not retried automatically.
    UserBlocked(BlockReason, Why),
    /// Retry later. Consumes one of the operation's defers; with none left the
    /// operation fails instead.
    Deferred { why: Why, until: DeferUntil },
    /// Straight back to Eligible without consuming a defer.
    DeferredForce,
    /// Dropped without ever reaching the server.
    Deleted(Why),
}

/// Applies resolutions to the store and reports user-visible outcomes.
#[derive(Clone)]
pub struct Resolver {
    store: Arc<Store>,
    sink: Arc<dyn NotificationSink>,
}

impl Resolver {
    pub fn new(store: Arc<Store>, sink: Arc<dyn NotificationSink>) -> Self {
        Self { store, sink }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Resolve a Dispatched operation. Returns false if it was already resolved.
    pub async fn resolve(&self, pending: &mut PendingOperation, resolution: Resolution) -> Result<bool> {
        self.resolve_from(pending, State::Dispatched, resolution).await
    }

    /// Resolve an operation expected to be in `expected`.
    pub async fn resolve_from(
        &self,
        pending: &mut PendingOperation,
        expected: State,
        resolution: Resolution,
    ) -> Result<bool> {
        if pending.state != expected {
            tracing::debug!(
                "Pending {} is {} not {}, ignoring {:?}",
                pending.id,
                pending.state,
                expected,
                resolution
            );
            return Ok(false);
        }

        let next = Self::apply(pending, resolution);
        if !self.store.transition_pending(&next, expected).await? {
            tracing::debug!("Pending {} already resolved, ignoring {:?}", pending.id, resolution);
            return Ok(false);
        }

        tracing::info!(
            "Pending {} ({}) {} -> {}{}",
            next.id,
            next.operation,
            expected,
            next.state,
            next.why.map(|w| format!(" ({})", w)).unwrap_or_default()
        );
        *pending = next;
        self.after_resolution(pending).await?;
        Ok(true)
    }

    /// Compute the record after `resolution`, without touching the store.
    fn apply(pending: &PendingOperation, resolution: Resolution) -> PendingOperation {
        let mut next = pending.clone();
        next.defer_until = None;
        next.block_reason = None;
        next.why = None;

        match resolution {
            Resolution::Success => next.state = State::Deleted,
            Resolution::HardFail(why) => {
                next.state = State::Failed;
                next.why = Some(why);
            }
            Resolution::UserBlocked(reason, why) => {
                next.state = State::UserBlocked;
                next.block_reason = Some(reason);
                next.why = Some(why);
            }
            Resolution::Deferred { why, until } => {
                if next.defers_remaining == 0 {
                    next.state = State::Failed;
                } else {
                    next.defers_remaining -= 1;
                    next.state = State::Deferred;
                    next.defer_until = Some(until);
                }
                next.why = Some(why);
            }
            Resolution::DeferredForce => next.state = State::Eligible,
            Resolution::Deleted(why) => {
                next.state = State::Deleted;
                next.why = Some(why);
            }
        }
        next
    }

    async fn after_resolution(&self, pending: &PendingOperation) -> Result<()> {
        let account = pending.account_id;
        let token = pending.token.clone();

        match pending.state {
            State::Deleted if pending.succeeded() => {
                self.unblock_successors(pending.id).await?;
                self.sink.notify(
                    account,
                    OutcomeSummary::Succeeded {
                        operation: pending.operation,
                        token,
                    },
                );
            }
            State::Failed | State::Deleted => {
                self.cascade_failure(pending.id).await?;
                let why = pending.why.unwrap_or(Why::Unknown);
                if why != Why::PredecessorFailed && why != Why::CancelledByUser {
                    self.sink.notify(
                        account,
                        OutcomeSummary::Failed {
                            operation: pending.operation,
                            token,
                            why,
                        },
                    );
                }
            }
            State::UserBlocked => {
                if let (Some(reason), Some(why)) = (pending.block_reason, pending.why) {
                    self.sink.notify(
                        account,
                        OutcomeSummary::Blocked {
                            operation: pending.operation,
                            token,
                            reason,
                            why,
                        },
                    );
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn unblock_successors(&self, predecessor: super::PendingId) -> Result<()> {
        for mut successor in self.store.successors(predecessor).await? {
            if successor.state == State::PredecessorBlocked {
                successor.state = State::Eligible;
                if self
                    .store
                    .transition_pending(&successor, State::PredecessorBlocked)
                    .await?
                {
                    tracing::debug!("Pending {} unblocked by {}", successor.id, predecessor);
                }
            }
        }
        Ok(())
    }

    /// Delete every transitive successor of a failed operation.
    async fn cascade_failure(&self, predecessor: super::PendingId) -> Result<()> {
        let mut work = vec![predecessor];
        while let Some(pred) = work.pop() {
            for successor in self.store.successors(pred).await? {
                if successor.is_terminal() || successor.state == State::Dispatched {
                    continue;
                }
                let expected = successor.state;
                let mut deleted = successor;
                deleted.state = State::Deleted;
                deleted.why = Some(Why::PredecessorFailed);
                deleted.block_reason = None;
                deleted.defer_until = None;
                if self.store.transition_pending(&deleted, expected).await? {
                    tracing::info!("Pending {} deleted: predecessor {} failed", deleted.id, pred);
                    work.push(deleted.id);
                }
            }
        }
        Ok(())
    }

    /// Claim up to `limit` Eligible operations of the given kinds, marking them
    /// Dispatched. Operations whose predecessor has not succeeded are skipped
    /// (and blocked, or deleted if the predecessor failed). Operations sharing
    /// a serialized resource are claimed at most one at a time per account.
    pub async fn claim(
        &self,
        account_id: AccountId,
        operations: &[Operation],
        limit: usize,
    ) -> Result<Vec<PendingOperation>> {
        self.settle_blocked(account_id, operations).await?;

        let mut claimed: Vec<PendingOperation> = Vec::new();
        let candidates = self
            .store
            .eligible(account_id, operations, limit.saturating_mul(4).max(limit))
            .await?;

        for mut candidate in candidates {
            if claimed.len() >= limit {
                break;
            }

            if let Some(pred_id) = candidate.predecessor_id {
                match self.store.get_pending(pred_id).await? {
                    None => {}
                    Some(pred) if pred.succeeded() => {}
                    Some(pred) if pred.failed() => {
                        self.resolve_from(
                            &mut candidate,
                            State::Eligible,
                            Resolution::Deleted(Why::PredecessorFailed),
                        )
                        .await?;
                        continue;
                    }
                    Some(pred) => {
                        tracing::debug!(
                            "Pending {} waits for predecessor {} ({})",
                            candidate.id,
                            pred.id,
                            pred.state
                        );
                        let mut blocked = candidate.clone();
                        blocked.state = State::PredecessorBlocked;
                        self.store
                            .transition_pending(&blocked, State::Eligible)
                            .await?;
                        continue;
                    }
                }
            }

            let sharing = candidate.operation.sharing_resource();
            if !sharing.is_empty() {
                let in_flight = claimed
                    .iter()
                    .any(|p| sharing.contains(&p.operation));
                if in_flight || self.store.count_dispatched(account_id, &sharing).await? > 0 {
                    continue;
                }
            }

            let mut dispatched = candidate.clone();
            dispatched.state = State::Dispatched;
            if self
                .store
                .transition_pending(&dispatched, State::Eligible)
                .await?
            {
                claimed.push(dispatched);
            }
        }

        Ok(claimed)
    }

    /// Settle PredecessorBlocked operations whose predecessor has already
    /// finished: release them if it succeeded, delete them if it failed.
    async fn settle_blocked(&self, account_id: AccountId, operations: &[Operation]) -> Result<()> {
        for mut blocked in self.store.predecessor_blocked(account_id, operations).await? {
            let predecessor = match blocked.predecessor_id {
                Some(id) => self.store.get_pending(id).await?,
                None => None,
            };
            match predecessor {
                Some(pred) if pred.failed() => {
                    self.resolve_from(
                        &mut blocked,
                        State::PredecessorBlocked,
                        Resolution::Deleted(Why::PredecessorFailed),
                    )
                    .await?;
                }
                Some(pred) if !pred.succeeded() => {}
                _ => {
                    let mut released = blocked.clone();
                    released.state = State::Eligible;
                    if self
                        .store
                        .transition_pending(&released, State::PredecessorBlocked)
                        .await?
                    {
                        tracing::debug!("Pending {} released, its predecessor already finished", released.id);
                    }
                }
            }
        }
        Ok(())
    }

    /// Withdraw a queued operation at the user's request. Only operations not
    /// currently Dispatched can be withdrawn.
    pub async fn withdraw(&self, account_id: AccountId, token: &str) -> Result<bool> {
        let Some(mut pending) = self.store.pending_by_token(account_id, token).await? else {
            return Ok(false);
        };

        match pending.state {
            State::Eligible | State::Deferred | State::PredecessorBlocked | State::UserBlocked => {
                let expected = pending.state;
                self.resolve_from(&mut pending, expected, Resolution::Deleted(Why::CancelledByUser))
                    .await
            }
            _ => Ok(false),
        }
    }

    /// Return a UserBlocked operation to Eligible after the user acted on it.
    pub async fn release_blocked(&self, pending: &mut PendingOperation) -> Result<bool> {
        if pending.state != State::UserBlocked {
            return Ok(false);
        }
        let mut released = pending.clone();
        released.state = State::Eligible;
        released.block_reason = None;
        released.why = None;
        if self
            .store
            .transition_pending(&released, State::UserBlocked)
            .await?
        {
            *pending = released;
            return Ok(true);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingSink, test_store};
    use proptest::prelude::*;

    async fn resolver() -> (Resolver, Arc<RecordingSink>) {
        let store = test_store().await;
        let sink = Arc::new(RecordingSink::default());
        (Resolver::new(store, sink.clone()), sink)
    }

    async fn dispatched(resolver: &Resolver, op: PendingOperation) -> PendingOperation {
        let mut op = op;
        resolver.store().insert_pending(&mut op).await.unwrap();
        let claimed = resolver.claim(op.account_id, &[op.operation], 1).await.unwrap();
        assert_eq!(claimed.len(), 1);
        claimed.into_iter().next().unwrap()
    }

    #[tokio::test]
    async fn test_success_notifies_once() {
        let (resolver, sink) = resolver().await;
        let mut op = dispatched(&resolver, PendingOperation::new(1, Operation::EmailSend)).await;

        assert!(resolver.resolve(&mut op, Resolution::Success).await.unwrap());
        assert!(!resolver.resolve(&mut op, Resolution::Success).await.unwrap());

        assert!(op.succeeded());
        assert_eq!(sink.summaries().len(), 1);
    }

    #[tokio::test]
    async fn test_stale_copy_cannot_resolve_twice() {
        let (resolver, sink) = resolver().await;
        let op = dispatched(&resolver, PendingOperation::new(1, Operation::EmailSend)).await;

        // Two handlers holding the same Dispatched snapshot race to resolve.
        let mut first = op.clone();
        let mut second = op;
        assert!(resolver.resolve(&mut first, Resolution::HardFail(Why::ServerError)).await.unwrap());
        assert!(!resolver.resolve(&mut second, Resolution::Success).await.unwrap());

        let stored = resolver.store().get_pending(first.id).await.unwrap().unwrap();
        assert_eq!(stored.state, State::Failed);
        assert_eq!(sink.summaries().len(), 1);
    }

    #[tokio::test]
    async fn test_defer_consumes_budget_then_fails() {
        let (resolver, sink) = resolver().await;
        let mut op = PendingOperation::new(1, Operation::EmailMove).with_defers(1);
        resolver.store().insert_pending(&mut op).await.unwrap();

        let defer = Resolution::Deferred {
            why: Why::ServerError,
            until: DeferUntil::Anytime,
        };

        let mut first = resolver.claim(1, &[Operation::EmailMove], 1).await.unwrap().remove(0);
        resolver.resolve(&mut first, defer).await.unwrap();
        assert_eq!(first.state, State::Deferred);
        assert_eq!(first.defers_remaining, 0);
        assert!(sink.summaries().is_empty());

        resolver
            .store()
            .release_deferred(1, crate::store::DeferRelease::Due)
            .await
            .unwrap();
        let mut second = resolver.claim(1, &[Operation::EmailMove], 1).await.unwrap().remove(0);
        resolver.resolve(&mut second, defer).await.unwrap();
        assert_eq!(second.state, State::Failed);
        assert_eq!(sink.summaries().len(), 1);
    }

    #[tokio::test]
    async fn test_successor_waits_for_predecessor() {
        let (resolver, _) = resolver().await;
        let mut create = PendingOperation::new(1, Operation::CalCreate);
        resolver.store().insert_pending(&mut create).await.unwrap();
        let mut invite = PendingOperation::new(1, Operation::EmailSend).after(create.id);
        resolver.store().insert_pending(&mut invite).await.unwrap();

        assert!(resolver.claim(1, &[Operation::EmailSend], 5).await.unwrap().is_empty());

        let mut create = resolver.claim(1, &[Operation::CalCreate], 1).await.unwrap().remove(0);
        // Still blocked while the predecessor is in flight.
        assert!(resolver.claim(1, &[Operation::EmailSend], 5).await.unwrap().is_empty());

        resolver.resolve(&mut create, Resolution::Success).await.unwrap();
        let claimed = resolver.claim(1, &[Operation::EmailSend], 5).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, invite.id);
    }

    #[tokio::test]
    async fn test_failed_predecessor_deletes_chain() {
        let (resolver, sink) = resolver().await;
        let mut a = PendingOperation::new(1, Operation::CalCreate);
        resolver.store().insert_pending(&mut a).await.unwrap();
        let mut b = PendingOperation::new(1, Operation::EmailSend).after(a.id);
        resolver.store().insert_pending(&mut b).await.unwrap();
        let mut c = PendingOperation::new(1, Operation::EmailSend).after(b.id);
        resolver.store().insert_pending(&mut c).await.unwrap();

        let mut a = resolver.claim(1, &[Operation::CalCreate], 1).await.unwrap().remove(0);
        resolver.resolve(&mut a, Resolution::HardFail(Why::ServerError)).await.unwrap();

        for id in [b.id, c.id] {
            let stored = resolver.store().get_pending(id).await.unwrap().unwrap();
            assert_eq!(stored.state, State::Deleted);
            assert_eq!(stored.why, Some(Why::PredecessorFailed));
        }
        // Only the failure the user caused is reported.
        assert_eq!(sink.summaries().len(), 1);
    }

    /// Puts `pending` back in PredecessorBlocked, as a successor inserted
    /// just before its predecessor resolved would be.
    async fn strand(resolver: &Resolver, pending: &PendingOperation) {
        let mut blocked = resolver.store().get_pending(pending.id).await.unwrap().unwrap();
        let expected = blocked.state;
        blocked.state = State::PredecessorBlocked;
        assert!(resolver.store().transition_pending(&blocked, expected).await.unwrap());
    }

    #[tokio::test]
    async fn test_successor_stranded_after_success_is_claimed() {
        let (resolver, _) = resolver().await;
        let mut create = dispatched(&resolver, PendingOperation::new(1, Operation::CalCreate)).await;
        resolver.resolve(&mut create, Resolution::Success).await.unwrap();
        let mut invite = PendingOperation::new(1, Operation::EmailSend).after(create.id);
        resolver.store().insert_pending(&mut invite).await.unwrap();
        strand(&resolver, &invite).await;

        let claimed = resolver.claim(1, &[Operation::EmailSend], 5).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, invite.id);
    }

    #[tokio::test]
    async fn test_successor_stranded_after_failure_is_deleted() {
        let (resolver, sink) = resolver().await;
        let mut create = dispatched(&resolver, PendingOperation::new(1, Operation::CalCreate)).await;
        resolver
            .resolve(&mut create, Resolution::HardFail(Why::ServerError))
            .await
            .unwrap();
        let mut invite = PendingOperation::new(1, Operation::EmailSend).after(create.id);
        resolver.store().insert_pending(&mut invite).await.unwrap();
        strand(&resolver, &invite).await;

        assert!(resolver.claim(1, &[Operation::EmailSend], 5).await.unwrap().is_empty());
        let stored = resolver.store().get_pending(invite.id).await.unwrap().unwrap();
        assert_eq!(stored.state, State::Deleted);
        assert_eq!(stored.why, Some(Why::PredecessorFailed));
        assert_eq!(sink.summaries().len(), 1);
    }

    #[tokio::test]
    async fn test_user_blocked_predecessor_keeps_successor_blocked() {
        let (resolver, _) = resolver().await;
        let mut a = PendingOperation::new(1, Operation::FolderCreate);
        resolver.store().insert_pending(&mut a).await.unwrap();
        let mut b = PendingOperation::new(1, Operation::EmailMove).after(a.id);
        resolver.store().insert_pending(&mut b).await.unwrap();

        let mut a = resolver.claim(1, &[Operation::FolderCreate], 1).await.unwrap().remove(0);
        resolver
            .resolve(
                &mut a,
                Resolution::UserBlocked(BlockReason::MustChangeName, Why::AlreadyExists),
            )
            .await
            .unwrap();

        let stored = resolver.store().get_pending(b.id).await.unwrap().unwrap();
        assert_eq!(stored.state, State::PredecessorBlocked);
        assert!(resolver.claim(1, &[Operation::EmailMove], 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_folder_hierarchy_is_claimed_one_at_a_time() {
        let (resolver, _) = resolver().await;
        for name in ["A", "B"] {
            let mut op = PendingOperation::new(1, Operation::FolderCreate).with_display_name(name);
            resolver.store().insert_pending(&mut op).await.unwrap();
        }

        let ops = [Operation::FolderCreate, Operation::FolderDelete];
        assert_eq!(resolver.claim(1, &ops, 5).await.unwrap().len(), 1);
        assert!(resolver.claim(1, &ops, 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_withdraw_only_queued_operations() {
        let (resolver, _) = resolver().await;
        let mut queued = PendingOperation::new(1, Operation::EmailSend);
        resolver.store().insert_pending(&mut queued).await.unwrap();

        assert!(resolver.withdraw(1, &queued.token).await.unwrap());
        assert!(!resolver.withdraw(1, &queued.token).await.unwrap());
        assert!(!resolver.withdraw(1, "unknown").await.unwrap());
    }

    #[tokio::test]
    async fn test_release_blocked() {
        let (resolver, _) = resolver().await;
        let mut op = dispatched(&resolver, PendingOperation::new(1, Operation::FolderCreate)).await;
        resolver
            .resolve(
                &mut op,
                Resolution::UserBlocked(BlockReason::MustChangeName, Why::AlreadyExists),
            )
            .await
            .unwrap();

        assert!(resolver.release_blocked(&mut op).await.unwrap());
        assert_eq!(op.state, State::Eligible);
        assert_eq!(resolver.claim(1, &[Operation::FolderCreate], 1).await.unwrap().len(), 1);
    }

    fn any_resolution() -> impl Strategy<Value = Resolution> {
        let why = prop::sample::select(Why::ALL.to_vec());
        let reason = prop::sample::select(BlockReason::ALL.to_vec());
        prop_oneof![
            Just(Resolution::Success),
            why.clone().prop_map(Resolution::HardFail),
            (reason, why.clone()).prop_map(|(r, w)| Resolution::UserBlocked(r, w)),
            why.clone().prop_map(|w| Resolution::Deferred {
                why: w,
                until: DeferUntil::Anytime
            }),
            Just(Resolution::DeferredForce),
            why.prop_map(Resolution::Deleted),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_double_response_resolves_once(
            first in any_resolution(),
            second in any_resolution(),
            defers in 0u32..3,
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            runtime.block_on(async {
                let (resolver, sink) = resolver().await;
                let op = dispatched(
                    &resolver,
                    PendingOperation::new(1, Operation::EmailSend).with_defers(defers),
                )
                .await;

                let mut handler_a = op.clone();
                let mut handler_b = op;
                assert!(resolver.resolve(&mut handler_a, first).await.unwrap());
                let after_first = resolver.store().get_pending(handler_a.id).await.unwrap().unwrap();
                let notified = sink.summaries().len();

                assert!(!resolver.resolve(&mut handler_b, second).await.unwrap());
                let after_second = resolver.store().get_pending(handler_a.id).await.unwrap().unwrap();

                assert_eq!(after_first, after_second);
                assert_eq!(sink.summaries().len(), notified);
                assert_ne!(after_second.state, State::Dispatched);
            });
        }
    }
}
