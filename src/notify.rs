//! Sending and receiving change notifications.
//!
//! Every committed change is broadcast with a timestamp that identifies it. On receipt, a
//! notification is dropped if its timestamp was processed recently (a manager listening on
//! several topics gets the same notification more than once) or if it is the echo of one of
//! our own commits. Once a foreign notification arrives, all our own notifications still in
//! flight are marked for processing, so their effects are applied again after the foreign
//! change and the cached state ends up in commit order.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::{SystemTime, UNIX_EPOCH},
};

use tracing::{debug, trace, warn};

use crate::{
    account::Account,
    bus::{topic_for_service_type, BusMessage, ChangeMessage, ServiceDelta},
    cache,
    changes::AccountChanges,
    manager::{ManagerEvent, ManagerInner},
    service::{Service, GLOBAL},
    AccountId,
};

/// Number of processed timestamps remembered for deduplication.
const PROCESSED_HISTORY: usize = 2;

/// Token identifying one committed change.
///
/// Timestamps handed out by one process are strictly increasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct Timestamp {
    pub sec: u32,
    pub nsec: u32,
}

impl Timestamp {
    pub fn now() -> Self {
        static LAST: AtomicU64 = AtomicU64::new(0);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        let mut prev = LAST.load(Ordering::Relaxed);
        loop {
            let next = now.max(prev + 1);
            match LAST.compare_exchange_weak(prev, next, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => return Self::from_nanos(next),
                Err(actual) => prev = actual,
            }
        }
    }

    fn from_nanos(nanos: u64) -> Self {
        Self {
            sec: (nanos / 1_000_000_000) as u32,
            nsec: (nanos % 1_000_000_000) as u32,
        }
    }
}

#[derive(Debug)]
struct EmittedChange {
    timestamp: Timestamp,
    must_process: bool,
}

/// Bookkeeping of sent and received notifications.
#[derive(Debug, Default)]
pub(crate) struct ChangeNotifier {
    emitted: Vec<EmittedChange>,
    processed: VecDeque<Timestamp>,
}

impl ChangeNotifier {
    /// Remembers a notification we sent, so its echo can be recognized.
    pub fn record_emitted(&mut self, timestamp: Timestamp) {
        self.emitted.push(EmittedChange {
            timestamp,
            must_process: false,
        });
    }

    /// Returns true if `timestamp` was processed recently, otherwise remembers it.
    pub fn check_processed(&mut self, timestamp: Timestamp) -> bool {
        if self.processed.contains(&timestamp) {
            return true;
        }
        while self.processed.len() >= PROCESSED_HISTORY {
            self.processed.pop_back();
        }
        self.processed.push_front(timestamp);
        false
    }

    /// Forgets one of our own notifications. Returns whether it must still be processed, or
    /// `None` if the notification is not ours.
    pub fn take_emitted(&mut self, timestamp: Timestamp) -> Option<bool> {
        let pos = self
            .emitted
            .iter()
            .position(|e| e.timestamp == timestamp)?;
        Some(self.emitted.remove(pos).must_process)
    }

    /// Marks all our notifications in flight for processing. Returns how many there are.
    pub fn mark_pending(&mut self) -> usize {
        for emitted in self.emitted.iter_mut() {
            emitted.must_process = true;
        }
        self.emitted.len()
    }
}

impl ManagerInner {
    /// Broadcasts a committed change on the global topic and on the topic of every service type
    /// it touches.
    pub(crate) fn broadcast(&self, id: AccountId, provider: &str, changes: &AccountChanges) {
        let timestamp = Timestamp::now();
        let msg = changes.to_message(timestamp, id, provider);
        let payload = match msg.encode() {
            Ok(payload) => payload,
            Err(err) => {
                warn!("failed to encode change of account {id}: {err}");
                return;
            }
        };
        if self.verbose {
            debug!(?msg, "broadcasting change");
        }
        self.notifier.lock().record_emitted(timestamp);
        for service_type in changes.service_types() {
            let topic = topic_for_service_type(&service_type);
            if let Err(err) = self.bus.emit(&topic, payload.clone()) {
                warn!("failed to send change of account {id} on {topic}: {err}");
                continue;
            }
            self.metrics.notifications_sent.inc();
        }
    }

    /// Applies a change notification received from the bus.
    pub(crate) fn handle_message(self: &Arc<Self>, msg: &BusMessage) {
        let change = match ChangeMessage::decode(&msg.payload) {
            Ok(change) => change,
            Err(err) => {
                warn!("dropping malformed change notification on {}: {err}", msg.topic);
                return;
            }
        };
        self.metrics.notifications_received.inc();
        if self.verbose {
            debug!(topic = %msg.topic, ?change, "received change");
        }
        let timestamp = Timestamp {
            sec: change.sec,
            nsec: change.nsec,
        };

        let ours = {
            let mut notifier = self.notifier.lock();
            if notifier.check_processed(timestamp) {
                trace!(?timestamp, "already processed");
                self.metrics.notifications_skipped.inc();
                return;
            }
            let ours = match notifier.take_emitted(timestamp) {
                Some(false) => {
                    trace!(?timestamp, "echo of own change");
                    self.metrics.notifications_skipped.inc();
                    return;
                }
                Some(true) => {
                    self.metrics.notifications_reprocessed.inc();
                    true
                }
                None => false,
            };
            let pending = notifier.mark_pending();
            if pending > 0 {
                trace!("marked {pending} own changes for processing");
            }
            ours
        };

        let changes = AccountChanges::from_message(&change, |delta| self.service_for_delta(delta));
        let id = change.account_id;
        let cached = self.cache.lock().get(id);
        let lifecycle = change.created || change.deleted;
        let must_instantiate = !(cached.is_none() && !lifecycle) && !(ours && lifecycle);
        let account = match cached {
            Some(account) => Some(account),
            None if must_instantiate => Some(self.materialize(&change)),
            None => None,
        };

        let updated = self.must_emit_updated(&changes);
        let enabled = self.must_emit_enabled(&changes);
        if let Some(account) = account {
            account.apply_changes(&changes);
        }
        self.emit_manager_events(id, updated, enabled, change.created, change.deleted);
    }

    /// Creates an account for a change made by another manager, and keeps it alive for a
    /// while, since the application is likely to inspect it.
    fn materialize(self: &Arc<Self>, change: &ChangeMessage) -> Account {
        let account = Account::from_notification(
            Arc::downgrade(self),
            change.account_id,
            &change.provider,
            change.created,
        );
        let account = self.cache.lock().insert(change.account_id, account);
        self.metrics.foreign_accounts.inc();
        cache::hold(account.clone(), self.foreign_account_hold);
        account
    }

    fn service_for_delta(&self, delta: &ServiceDelta) -> Option<Service> {
        if delta.service_name == GLOBAL {
            return None;
        }
        let mut services = self.services.lock();
        if let Some(service) = services.get(&delta.service_name) {
            return Some(service.clone());
        }
        let service = match self.templates.service(&delta.service_name) {
            Some(template) => Service::from_template(delta.service_id, &template),
            None => Service::bare(
                delta.service_id,
                &delta.service_name,
                Some(delta.service_type.clone()).filter(|t| !t.is_empty()),
            ),
        };
        services.insert(delta.service_name.clone(), service.clone());
        Some(service)
    }

    pub(crate) fn must_emit_updated(&self, changes: &AccountChanges) -> bool {
        match &self.service_type {
            Some(service_type) if !changes.created && !changes.deleted => {
                changes.has_service_type(service_type)
            }
            _ => false,
        }
    }

    pub(crate) fn must_emit_enabled(&self, changes: &AccountChanges) -> bool {
        self.service_type.is_some() && changes.has_enabled()
    }

    pub(crate) fn emit_manager_events(
        &self,
        id: AccountId,
        updated: bool,
        enabled: bool,
        created: bool,
        deleted: bool,
    ) {
        let events = [
            (updated, ManagerEvent::AccountUpdated(id)),
            (enabled, ManagerEvent::EnabledEvent(id)),
            (deleted, ManagerEvent::AccountDeleted(id)),
            (created, ManagerEvent::AccountCreated(id)),
        ];
        let mut subscribers = self.subscribers.lock();
        for (_, event) in events.into_iter().filter(|(emit, _)| *emit) {
            subscribers.retain(|s| s.send(event.clone()).is_ok());
        }
    }
}

/// Applies notifications from the bus until the manager is dropped.
pub(crate) async fn listen(manager: Weak<ManagerInner>, receiver: flume::Receiver<BusMessage>) {
    while let Ok(msg) = receiver.recv_async().await {
        let Some(manager) = manager.upgrade() else {
            break;
        };
        manager.handle_message(&msg);
    }
    debug!("change listener stopped");
}
