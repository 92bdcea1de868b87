//! Per-manager table of live accounts.

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    time::Duration,
};

use tracing::trace;

use crate::{
    account::{Account, AccountInner},
    AccountId,
};

/// Weak references to the accounts of a manager, keyed by id.
///
/// At most one live [`Account`] exists per id. Entries die with the last strong handle.
#[derive(Debug, Default)]
pub(crate) struct AccountCache {
    accounts: HashMap<AccountId, Weak<AccountInner>>,
}

impl AccountCache {
    /// Returns the live account with this id.
    pub fn get(&self, id: AccountId) -> Option<Account> {
        self.accounts
            .get(&id)
            .and_then(Weak::upgrade)
            .map(Account::from_inner)
    }

    /// Inserts an account, unless a live one with the same id exists. Returns the cached
    /// account.
    pub fn insert(&mut self, id: AccountId, account: Account) -> Account {
        if let Some(existing) = self.get(id) {
            return existing;
        }
        self.accounts.retain(|_, weak| weak.strong_count() > 0);
        self.accounts.insert(id, Arc::downgrade(account.inner()));
        account
    }

    /// Removes the entry for `id` if its account is gone.
    pub fn remove_dead(&mut self, id: AccountId) {
        if self
            .accounts
            .get(&id)
            .is_some_and(|weak| weak.strong_count() == 0)
        {
            trace!("account {id} released");
            self.accounts.remove(&id);
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.accounts.len()
    }
}

/// Keeps `account` alive for `duration`.
pub(crate) fn hold(account: Account, duration: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(duration).await;
        trace!("releasing hold on account {}", account.id());
        drop(account);
    });
}
