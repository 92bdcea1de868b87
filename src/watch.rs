//! Callbacks on setting changes.

use std::{collections::HashMap, sync::Arc};

use crate::account::Account;

/// Callback invoked with the account and the key or prefix of the watch which matched.
pub type WatchCallback = Box<dyn Fn(&Account, &str) + Send + Sync + 'static>;

/// Which keys a watch matches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WatchFilter {
    /// Matches every key starting with the prefix.
    Prefix(String),
    /// Matches exactly this key.
    Exact(String),
}

impl WatchFilter {
    /// Verifies whether this filter matches a given key.
    pub fn matches(&self, key: &str) -> bool {
        match self {
            WatchFilter::Prefix(prefix) => key.starts_with(prefix.as_str()),
            WatchFilter::Exact(expected) => expected == key,
        }
    }

    /// The key or prefix of the filter.
    pub fn as_str(&self) -> &str {
        match self {
            WatchFilter::Prefix(s) | WatchFilter::Exact(s) => s,
        }
    }
}

/// Handle of an installed watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchId(u64);

#[derive(derive_more::Debug)]
pub(crate) struct Watch {
    id: WatchId,
    filter: WatchFilter,
    #[debug(skip)]
    callback: WatchCallback,
}

impl Watch {
    pub fn invoke(&self, account: &Account) {
        (self.callback)(account, self.filter.as_str());
    }
}

/// The watches of an account, partitioned by service name.
#[derive(Debug, Default)]
pub(crate) struct Watches {
    next_id: u64,
    by_service: HashMap<String, Vec<Arc<Watch>>>,
}

impl Watches {
    pub fn add(&mut self, service: &str, filter: WatchFilter, callback: WatchCallback) -> WatchId {
        self.next_id += 1;
        let id = WatchId(self.next_id);
        self.by_service
            .entry(service.to_string())
            .or_default()
            .push(Arc::new(Watch {
                id,
                filter,
                callback,
            }));
        id
    }

    /// Removes a watch. Returns false if it was not installed.
    pub fn remove(&mut self, id: WatchId) -> bool {
        for watches in self.by_service.values_mut() {
            if let Some(pos) = watches.iter().position(|w| w.id == id) {
                watches.remove(pos);
                return true;
            }
        }
        false
    }

    /// Appends the watches of `service` matching `key` to `out`, skipping those already in it.
    pub fn collect_matching(&self, service: &str, key: &str, out: &mut Vec<Arc<Watch>>) {
        let Some(watches) = self.by_service.get(service) else {
            return;
        };
        for watch in watches {
            if watch.filter.matches(key) && !out.iter().any(|w| w.id == watch.id) {
                out.push(watch.clone());
            }
        }
    }
}
