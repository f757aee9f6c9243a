//! The set of pending operations one command holds between claim and resolution.

use anyhow::Result;
use tokio::sync::Mutex;

use super::{AccountId, Operation, PendingId, PendingOperation, Resolution, Resolver, State, StatusKind};
use crate::protocol::{Event, EventKind};

#[derive(Default)]
struct QueueInner {
    single: Option<PendingOperation>,
    list: Vec<PendingOperation>,
    /// A response handler owns resolution; cancellation must stand back.
    seized: bool,
    cancelled: bool,
}

impl QueueInner {
    /// Merge `single` into `list`, dropping duplicate ids.
    fn consolidate(&mut self) {
        if let Some(single) = self.single.take() {
            self.list.insert(0, single);
        }
        let mut seen = std::collections::HashSet::new();
        self.list.retain(|p| seen.insert(p.id));
    }
}

/// Pending operations claimed by one command.
///
/// All resolution goes through the queue's lock so that `cancel` never sees an
/// operation halfway between "about to resolve" and "resolved".
pub struct PendingQueue {
    resolver: Resolver,
    inner: Mutex<QueueInner>,
}

impl PendingQueue {
    pub fn empty(resolver: Resolver) -> Self {
        Self {
            resolver,
            inner: Mutex::new(QueueInner::default()),
        }
    }

    pub fn with_single(resolver: Resolver, pending: PendingOperation) -> Self {
        Self {
            resolver,
            inner: Mutex::new(QueueInner {
                single: Some(pending),
                ..Default::default()
            }),
        }
    }

    pub fn with_list(resolver: Resolver, list: Vec<PendingOperation>) -> Self {
        Self {
            resolver,
            inner: Mutex::new(QueueInner {
                list,
                ..Default::default()
            }),
        }
    }

    /// Claim the oldest eligible operation of the given kinds, if any.
    pub async fn claim_single(
        resolver: Resolver,
        account_id: AccountId,
        operations: &[Operation],
    ) -> Result<Self> {
        let claimed = resolver.claim(account_id, operations, 1).await?;
        Ok(match claimed.into_iter().next() {
            Some(pending) => Self::with_single(resolver, pending),
            None => Self::empty(resolver),
        })
    }

    /// Claim up to `limit` eligible operations of the given kinds.
    pub async fn claim_list(
        resolver: Resolver,
        account_id: AccountId,
        operations: &[Operation],
        limit: usize,
    ) -> Result<Self> {
        let claimed = resolver.claim(account_id, operations, limit).await?;
        Ok(Self::with_list(resolver, claimed))
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    pub async fn is_empty(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.single.is_none() && inner.list.is_empty()
    }

    /// Copies of the held operations, oldest claim first.
    pub async fn snapshot(&self) -> Vec<PendingOperation> {
        let mut inner = self.inner.lock().await;
        inner.consolidate();
        inner.list.clone()
    }

    pub async fn holds(&self, id: PendingId) -> bool {
        let mut inner = self.inner.lock().await;
        inner.consolidate();
        inner.list.iter().any(|p| p.id == id)
    }

    /// Claim the exclusive right to process a response. Fails if the command
    /// was already cancelled.
    pub async fn seize_cleanup(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.cancelled {
            return false;
        }
        inner.seized = true;
        true
    }

    pub async fn is_cancelled(&self) -> bool {
        self.inner.lock().await.cancelled
    }

    /// Remember the status the server reported, persisted with the resolution.
    pub async fn record_status(&self, code: u32, kind: StatusKind) {
        let mut inner = self.inner.lock().await;
        inner.consolidate();
        for pending in inner.list.iter_mut() {
            pending.record_status(code, kind);
        }
    }

    pub async fn record_status_of(&self, id: PendingId, code: u32, kind: StatusKind) {
        let mut inner = self.inner.lock().await;
        inner.consolidate();
        if let Some(pending) = inner.list.iter_mut().find(|p| p.id == id) {
            pending.record_status(code, kind);
        }
    }

    /// Resolve every held operation the same way and release them.
    pub async fn resolve_each(&self, resolution: Resolution) -> Result<usize> {
        self.resolve_each_with(|_| resolution).await
    }

    /// Resolve every held operation with a per-operation decision and release them.
    pub async fn resolve_each_with<F>(&self, decide: F) -> Result<usize>
    where
        F: FnMut(&PendingOperation) -> Resolution,
    {
        let mut inner = self.inner.lock().await;
        self.resolve_held(&mut inner, decide).await
    }

    /// Resolve and release each held operation in turn. On error the
    /// operation that failed and every one after it stay held.
    async fn resolve_held<F>(&self, inner: &mut QueueInner, mut decide: F) -> Result<usize>
    where
        F: FnMut(&PendingOperation) -> Resolution,
    {
        inner.consolidate();
        let mut held = std::mem::take(&mut inner.list).into_iter();

        let mut resolved = 0;
        while let Some(mut pending) = held.next() {
            let resolution = decide(&pending);
            match self.resolver.resolve(&mut pending, resolution).await {
                Ok(true) => resolved += 1,
                Ok(false) => {}
                Err(e) => {
                    inner.list.push(pending);
                    inner.list.extend(held);
                    return Err(e);
                }
            }
        }
        Ok(resolved)
    }

    /// Resolve one held operation and release it. Returns false if the queue
    /// no longer holds it.
    pub async fn resolve_one(&self, id: PendingId, resolution: Resolution) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        inner.consolidate();
        let Some(index) = inner.list.iter().position(|p| p.id == id) else {
            return Ok(false);
        };
        let mut pending = inner.list.remove(index);
        match self.resolver.resolve(&mut pending, resolution).await {
            Ok(resolved) => Ok(resolved),
            Err(e) => {
                inner.list.insert(index, pending);
                Err(e)
            }
        }
    }

    /// Return every held operation to Eligible, unless a response handler has
    /// already seized cleanup. Safe to call at any time, including after the
    /// command finished.
    pub async fn cancel(&self) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        if inner.seized {
            tracing::debug!("Cancel ignored, response processing owns the queue");
            return Ok(0);
        }
        inner.cancelled = true;
        let returned = self
            .resolve_held(&mut inner, |_| Resolution::DeferredForce)
            .await?;
        if returned > 0 {
            tracing::info!("Cancelled command returned {} pending operation(s)", returned);
        }
        Ok(returned)
    }

    /// Resolve whatever the response handler left unresolved. A leftover is a
    /// handler bug, not a user-visible failure.
    pub async fn diaper(&self, event: &Event) -> Result<usize> {
        let leftovers: Vec<PendingId> = self
            .snapshot()
            .await
            .iter()
            .filter(|p| p.state == State::Dispatched)
            .map(|p| p.id)
            .collect();

        if leftovers.is_empty() {
            return Ok(0);
        }

        tracing::error!(
            "Handler for {} left pending operation(s) {:?} unresolved",
            event,
            leftovers
        );
        let resolution = if event.kind == EventKind::HardFail {
            Resolution::HardFail(super::Why::Unknown)
        } else {
            Resolution::DeferredForce
        };
        self.resolve_each(resolution).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pending::Why;
    use crate::testing::test_resolver;

    async fn insert(resolver: &Resolver, op: Operation) -> PendingOperation {
        let mut pending = PendingOperation::new(1, op);
        resolver.store().insert_pending(&mut pending).await.unwrap();
        pending
    }

    async fn states(resolver: &Resolver) -> Vec<State> {
        resolver
            .store()
            .list_pending(1)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.state)
            .collect()
    }

    #[tokio::test]
    async fn test_cancel_never_leaves_dispatched() {
        let (resolver, _) = test_resolver().await;
        for _ in 0..3 {
            insert(&resolver, Operation::EmailMove).await;
        }
        let queue = PendingQueue::claim_list(resolver.clone(), 1, &[Operation::EmailMove], 10)
            .await
            .unwrap();
        assert_eq!(states(&resolver).await, vec![State::Dispatched; 3]);

        assert_eq!(queue.cancel().await.unwrap(), 3);

        assert_eq!(states(&resolver).await, vec![State::Eligible; 3]);
        assert!(queue.is_empty().await);
        assert!(!queue.seize_cleanup().await);
    }

    #[tokio::test]
    async fn test_cancel_after_seize_does_not_resolve() {
        let (resolver, _) = test_resolver().await;
        insert(&resolver, Operation::EmailSend).await;
        let queue = PendingQueue::claim_single(resolver.clone(), 1, &[Operation::EmailSend])
            .await
            .unwrap();

        assert!(queue.seize_cleanup().await);
        assert_eq!(queue.cancel().await.unwrap(), 0);
        assert_eq!(states(&resolver).await, vec![State::Dispatched]);

        queue.resolve_each(Resolution::Success).await.unwrap();
        let stored = resolver.store().list_pending(1).await.unwrap();
        assert!(stored[0].succeeded());
    }

    #[tokio::test]
    async fn test_cancel_after_completion_is_noop() {
        let (resolver, _) = test_resolver().await;
        insert(&resolver, Operation::EmailSend).await;
        let queue = PendingQueue::claim_single(resolver.clone(), 1, &[Operation::EmailSend])
            .await
            .unwrap();
        queue.resolve_each(Resolution::HardFail(Why::ServerError)).await.unwrap();

        assert_eq!(queue.cancel().await.unwrap(), 0);
        assert_eq!(states(&resolver).await, vec![State::Failed]);
    }

    #[tokio::test]
    async fn test_consolidate_deduplicates() {
        let (resolver, _) = test_resolver().await;
        let pending = insert(&resolver, Operation::EmailSend).await;
        let queue = PendingQueue {
            resolver,
            inner: Mutex::new(QueueInner {
                single: Some(pending.clone()),
                list: vec![pending.clone()],
                ..Default::default()
            }),
        };

        assert_eq!(queue.snapshot().await.len(), 1);
        assert!(queue.holds(pending.id).await);
    }

    #[tokio::test]
    async fn test_resolve_one_releases_only_that_operation() {
        let (resolver, _) = test_resolver().await;
        insert(&resolver, Operation::EmailMove).await;
        insert(&resolver, Operation::EmailMove).await;
        let queue = PendingQueue::claim_list(resolver.clone(), 1, &[Operation::EmailMove], 10)
            .await
            .unwrap();
        let first = queue.snapshot().await[0].id;

        assert!(queue.resolve_one(first, Resolution::Success).await.unwrap());
        assert!(!queue.resolve_one(first, Resolution::Success).await.unwrap());
        assert_eq!(queue.snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn test_diaper_resolves_leftovers() {
        let (resolver, _) = test_resolver().await;
        insert(&resolver, Operation::EmailSend).await;
        insert(&resolver, Operation::EmailMove).await;

        let sends = PendingQueue::claim_single(resolver.clone(), 1, &[Operation::EmailSend])
            .await
            .unwrap();
        let moves = PendingQueue::claim_single(resolver.clone(), 1, &[Operation::EmailMove])
            .await
            .unwrap();

        assert_eq!(sends.diaper(&Event::hard_fail("X")).await.unwrap(), 1);
        assert_eq!(moves.diaper(&Event::success("X")).await.unwrap(), 1);

        let stored = resolver.store().list_pending(1).await.unwrap();
        assert_eq!(stored[0].state, State::Failed);
        assert_eq!(stored[0].why, Some(Why::Unknown));
        assert_eq!(stored[1].state, State::Eligible);
    }

    async fn refuse_updates_to(resolver: &Resolver, id: PendingId) {
        sqlx::query(&format!(
            "CREATE TRIGGER refuse_update BEFORE UPDATE OF state ON pending WHEN OLD.id = {} \
             BEGIN SELECT RAISE(ABORT, 'database is locked'); END",
            id
        ))
        .execute(resolver.store().pool())
        .await
        .unwrap();
    }

    async fn allow_updates(resolver: &Resolver) {
        sqlx::query("DROP TRIGGER refuse_update")
            .execute(resolver.store().pool())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_failed_resolution_keeps_the_rest_held() {
        let (resolver, _) = test_resolver().await;
        for _ in 0..3 {
            insert(&resolver, Operation::EmailMove).await;
        }
        let queue = PendingQueue::claim_list(resolver.clone(), 1, &[Operation::EmailMove], 10)
            .await
            .unwrap();
        let second = queue.snapshot().await[1].id;
        refuse_updates_to(&resolver, second).await;

        assert!(queue.resolve_each(Resolution::Success).await.is_err());
        let held: Vec<PendingId> = queue.snapshot().await.iter().map(|p| p.id).collect();
        assert_eq!(held.len(), 2);
        assert_eq!(held[0], second);

        allow_updates(&resolver).await;
        assert_eq!(queue.diaper(&Event::temp_fail("INTERNAL")).await.unwrap(), 2);
        assert_eq!(
            states(&resolver).await,
            vec![State::Deleted, State::Eligible, State::Eligible]
        );
    }

    #[tokio::test]
    async fn test_failed_cancel_can_be_retried() {
        let (resolver, _) = test_resolver().await;
        for _ in 0..3 {
            insert(&resolver, Operation::EmailMove).await;
        }
        let queue = PendingQueue::claim_list(resolver.clone(), 1, &[Operation::EmailMove], 10)
            .await
            .unwrap();
        let second = queue.snapshot().await[1].id;
        refuse_updates_to(&resolver, second).await;

        assert!(queue.cancel().await.is_err());
        assert_eq!(queue.snapshot().await.len(), 2);

        allow_updates(&resolver).await;
        assert_eq!(queue.cancel().await.unwrap(), 2);
        assert_eq!(states(&resolver).await, vec![State::Eligible; 3]);
    }

    #[tokio::test]
    async fn test_record_status_is_persisted_on_resolution() {
        let (resolver, _) = test_resolver().await;
        insert(&resolver, Operation::EmailSend).await;
        let queue = PendingQueue::claim_single(resolver.clone(), 1, &[Operation::EmailSend])
            .await
            .unwrap();

        queue.record_status(131, StatusKind::TopLevel).await;
        queue.resolve_each(Resolution::HardFail(Why::AccessDeniedOrBlocked)).await.unwrap();

        let stored = &resolver.store().list_pending(1).await.unwrap()[0];
        assert_eq!(stored.last_status, Some(131));
        assert_eq!(stored.last_status_kind, Some(StatusKind::TopLevel));
    }
}
