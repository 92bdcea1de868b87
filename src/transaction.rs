//! Committing account changes.
//!
//! A store turns the pending [`AccountChanges`] of an account into statements, runs them in an
//! exclusive transaction and, once committed, broadcasts the changes and applies them to the
//! in-memory account. A busy database is never an error by itself: [`Account::store`] retries
//! on every turn of the runtime until the database timeout elapses, while
//! [`Account::store_blocking`] sleeps with exponential backoff.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    account::Account,
    changes::AccountChanges,
    error::{CancelledSnafu, DeletedSnafu, ReadOnlySnafu, Result, StoreInProgressSnafu},
    manager::ManagerInner,
    store::Statement,
    AccountId,
};

/// First sleep of a blocking store on a busy database.
const BLOCKING_INITIAL_SLEEP: Duration = Duration::from_millis(200);

/// Marks an account as storing for as long as it lives.
#[derive(Debug)]
struct StoreGuard<'a>(&'a AtomicBool);

impl<'a> StoreGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self> {
        if flag.swap(true, Ordering::AcqRel) {
            return StoreInProgressSnafu.fail();
        }
        Ok(Self(flag))
    }
}

impl Drop for StoreGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Changes taken from an account, ready to be committed.
#[derive(Debug)]
struct PendingStore {
    manager: Arc<ManagerInner>,
    changes: AccountChanges,
    statements: Vec<Statement>,
}

impl Account {
    /// Commits the pending changes.
    ///
    /// While the database is locked by another writer, the attempt is repeated on every turn
    /// of the runtime until the manager's database timeout elapses.
    pub async fn store(&self) -> Result<()> {
        self.store_with_cancel(&CancellationToken::new()).await
    }

    /// Commits the pending changes, giving up with [`crate::Error::Cancelled`] if `cancel`
    /// fires before the database lock is taken.
    ///
    /// Once the transaction runs, cancellation has no effect.
    pub async fn store_with_cancel(&self, cancel: &CancellationToken) -> Result<()> {
        let _guard = StoreGuard::acquire(&self.inner().storing)?;
        let Some(pending) = self.prepare()? else {
            return Ok(());
        };
        if pending.statements.is_empty() {
            self.apply_changes(&pending.changes);
            return Ok(());
        }
        let manager = &pending.manager;
        let start = Instant::now();
        let created = loop {
            if cancel.is_cancelled() {
                debug!("store of account {} cancelled", self.id());
                return CancelledSnafu.fail();
            }
            if let Some(created) = try_commit(manager, &pending.statements)? {
                break created;
            }
            let timeout = manager.store.lock().db_timeout();
            if start.elapsed() >= timeout {
                return Err(manager.store.lock().lock_timeout(timeout));
            }
            tokio::task::yield_now().await;
        };
        self.finish(manager, &pending.changes, created);
        Ok(())
    }

    /// Commits the pending changes, blocking the calling thread.
    ///
    /// While the database is locked by another writer, sleeps with exponential backoff up to
    /// the manager's blocking timeout.
    pub fn store_blocking(&self) -> Result<()> {
        let _guard = StoreGuard::acquire(&self.inner().storing)?;
        let Some(pending) = self.prepare()? else {
            return Ok(());
        };
        if pending.statements.is_empty() {
            self.apply_changes(&pending.changes);
            return Ok(());
        }
        let manager = &pending.manager;
        let start = Instant::now();
        let mut sleep = BLOCKING_INITIAL_SLEEP;
        let created = loop {
            if let Some(created) = try_commit(manager, &pending.statements)? {
                break created;
            }
            let remaining = manager.blocking_timeout.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                return Err(manager.store.lock().lock_timeout(manager.blocking_timeout));
            }
            trace!("database busy, retrying in {:?}", sleep.min(remaining));
            std::thread::sleep(sleep.min(remaining));
            sleep *= 2;
        };
        self.finish(manager, &pending.changes, created);
        Ok(())
    }

    /// Takes the pending changes. Returns `None` if there is nothing to store.
    ///
    /// An account which was never stored stays pending creation until a store succeeds, even
    /// if a failed store dropped its changes.
    fn prepare(&self) -> Result<Option<PendingStore>> {
        let manager = self.manager_inner()?;
        let mut state = self.inner().state.lock();
        let unstored = state.id == 0 && !state.deleted;
        if state.changes.is_none() && !unstored {
            return Ok(None);
        }
        if state.deleted {
            return DeletedSnafu { id: state.id }.fail();
        }
        let mut changes = state.changes.take().unwrap_or_default();
        changes.created |= unstored && !changes.deleted;
        let statements = changes.statements(state.id, &state.provider);
        drop(state);
        if !statements.is_empty() && manager.store.lock().is_read_only() {
            return ReadOnlySnafu.fail();
        }
        Ok(Some(PendingStore {
            manager,
            changes,
            statements,
        }))
    }

    /// Publishes committed changes: assigns the new id, caches the account, broadcasts the
    /// changes and applies them locally.
    fn finish(&self, manager: &Arc<ManagerInner>, changes: &AccountChanges, created: Option<AccountId>) {
        let (id, provider) = {
            let mut state = self.inner().state.lock();
            if let Some(id) = created {
                state.id = id;
            }
            (state.id, state.provider.clone())
        };
        if created.is_some() {
            debug!("created account {id} for provider {provider}");
            manager.cache.lock().insert(id, self.clone());
        }
        manager.broadcast(id, &provider, changes);
        let updated = manager.must_emit_updated(changes);
        let enabled = manager.must_emit_enabled(changes);
        self.apply_changes(changes);
        manager.emit_manager_events(id, updated, enabled, changes.created, changes.deleted);
    }
}

/// Runs `statements` in an exclusive transaction. Returns `None` if the database is busy.
fn try_commit(
    manager: &ManagerInner,
    statements: &[Statement],
) -> Result<Option<Option<AccountId>>> {
    let store = manager.store.lock();
    if !store.try_begin_exclusive()? {
        return Ok(None);
    }
    store.execute_and_commit(statements).map(Some)
}
