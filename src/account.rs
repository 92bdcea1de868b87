//! Accounts and their settings.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{atomic::AtomicBool, Arc, Weak},
};

use parking_lot::{Mutex, MutexGuard};
use snafu::OptionExt;
use tracing::trace;

use crate::{
    changes::{AccountChanges, ENABLED_KEY, NAME_KEY},
    error::{DisposedSnafu, Result},
    manager::{Manager, ManagerInner},
    resolver::{resolve, SettingSource, SettingsIter},
    service::{Service, GLOBAL},
    store::AccountRow,
    template::Defaults,
    value::Value,
    watch::{Watch, WatchCallback, WatchFilter, WatchId, Watches},
    AccountId,
};

/// Notification about a change of an account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountEvent {
    /// The account or one of its services was enabled or disabled.
    Enabled {
        /// The service, `None` for the account itself.
        service: Option<String>,
        /// The new state.
        enabled: bool,
    },
    /// The display name changed.
    DisplayNameChanged(Option<String>),
    /// The account was deleted.
    Deleted,
}

/// Loaded settings of one service of an account.
#[derive(Debug)]
struct ServiceSettings {
    service: Option<Service>,
    settings: BTreeMap<String, Value>,
}

#[derive(Debug)]
pub(crate) struct AccountState {
    pub id: AccountId,
    pub provider: String,
    display_name: Option<String>,
    enabled: bool,
    pub deleted: bool,
    /// Created by another manager; its settings are known from the notification.
    foreign: bool,
    selected: Option<Service>,
    services: HashMap<String, ServiceSettings>,
    pub changes: Option<AccountChanges>,
}

impl AccountState {
    fn new(id: AccountId, provider: &str) -> Self {
        Self {
            id,
            provider: provider.to_string(),
            display_name: None,
            enabled: false,
            deleted: false,
            foreign: false,
            selected: None,
            services: HashMap::new(),
            changes: None,
        }
    }

    fn changes_mut(&mut self) -> &mut AccountChanges {
        self.changes.get_or_insert_with(AccountChanges::default)
    }

    fn selected_name(&self) -> &str {
        self.selected.as_ref().map_or(GLOBAL, Service::name)
    }

    fn selected_settings(&self) -> Option<&BTreeMap<String, Value>> {
        self.services.get(self.selected_name()).map(|ss| &ss.settings)
    }
}

#[derive(derive_more::Debug)]
pub(crate) struct AccountInner {
    #[debug(skip)]
    manager: Weak<ManagerInner>,
    pub(crate) state: Mutex<AccountState>,
    watches: Mutex<Watches>,
    #[debug(skip)]
    subscribers: Mutex<Vec<flume::Sender<AccountEvent>>>,
    /// Set while a store operation is running.
    pub(crate) storing: AtomicBool,
}

impl Drop for AccountInner {
    fn drop(&mut self) {
        let id = self.state.get_mut().id;
        if id == 0 {
            return;
        }
        if let Some(manager) = self.manager.upgrade() {
            // the cache is locked if we are dropped from within it, it is pruned on insert then
            if let Some(mut cache) = manager.cache.try_lock() {
                cache.remove_dead(id);
            }
        }
    }
}

/// An account: one configured identity with its per-service settings.
///
/// Cheap to clone; all clones refer to the same account. A [`crate::Manager`] hands out at most
/// one live instance per account id.
///
/// Reads and writes apply to the currently selected service, see [`Account::select_service`].
/// Writes are collected until [`Account::store`] (or one of its variants) commits them.
#[derive(Debug, Clone)]
pub struct Account {
    inner: Arc<AccountInner>,
}

impl PartialEq for Account {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Account {}

impl Account {
    fn with_state(manager: Weak<ManagerInner>, state: AccountState) -> Self {
        Self {
            inner: Arc::new(AccountInner {
                manager,
                state: Mutex::new(state),
                watches: Mutex::new(Watches::default()),
                subscribers: Mutex::new(Vec::new()),
                storing: AtomicBool::new(false),
            }),
        }
    }

    /// A new account, not stored yet.
    pub(crate) fn new(manager: Weak<ManagerInner>, provider: &str) -> Self {
        let mut state = AccountState::new(0, provider);
        state.changes_mut().created = true;
        state.services.insert(
            GLOBAL.to_string(),
            ServiceSettings {
                service: None,
                settings: BTreeMap::new(),
            },
        );
        Self::with_state(manager, state)
    }

    /// An account loaded from storage. Its global settings are loaded on selection.
    pub(crate) fn from_row(manager: Weak<ManagerInner>, id: AccountId, row: AccountRow) -> Self {
        let mut state = AccountState::new(id, &row.provider);
        state.display_name = row.name;
        state.enabled = row.enabled;
        Self::with_state(manager, state)
    }

    /// An account created or deleted by another manager.
    pub(crate) fn from_notification(
        manager: Weak<ManagerInner>,
        id: AccountId,
        provider: &str,
        foreign: bool,
    ) -> Self {
        let mut state = AccountState::new(id, provider);
        state.foreign = foreign;
        Self::with_state(manager, state)
    }

    pub(crate) fn from_inner(inner: Arc<AccountInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<AccountInner> {
        &self.inner
    }

    fn state(&self) -> MutexGuard<'_, AccountState> {
        self.inner.state.lock()
    }

    pub(crate) fn manager_inner(&self) -> Result<Arc<ManagerInner>> {
        self.inner.manager.upgrade().context(DisposedSnafu)
    }

    /// Returns the manager of this account.
    pub fn manager(&self) -> Result<Manager> {
        self.manager_inner().map(Manager::from_inner)
    }

    /// The id of the account, `0` if it was never stored.
    pub fn id(&self) -> AccountId {
        self.state().id
    }

    /// The name of the provider of the account.
    pub fn provider_name(&self) -> String {
        self.state().provider.clone()
    }

    /// The display name of the account.
    pub fn display_name(&self) -> Option<String> {
        self.state().display_name.clone()
    }

    /// Changes the display name.
    pub fn set_display_name(&self, name: &str) {
        self.state()
            .changes_mut()
            .set(None, NAME_KEY, Some(Value::from(name)));
    }

    /// Whether the account has been deleted.
    pub fn is_deleted(&self) -> bool {
        self.state().deleted
    }

    /// Whether the selected service is enabled, or the account itself if no service is
    /// selected.
    pub fn enabled(&self) -> bool {
        let state = self.state();
        match state.selected {
            None => state.enabled,
            Some(_) => self
                .resolve_locked(&state, ENABLED_KEY)
                .0
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
        }
    }

    /// Enables or disables the selected service, or the account itself if no service is
    /// selected.
    pub fn set_enabled(&self, enabled: bool) {
        self.set(ENABLED_KEY, Some(Value::Bool(enabled)));
    }

    /// The currently selected service, `None` for the global settings.
    pub fn selected_service(&self) -> Option<Service> {
        self.state().selected.clone()
    }

    /// Selects the service subsequent reads and writes apply to, `None` for the global
    /// settings.
    ///
    /// The stored settings of the service are loaded the first time it is selected.
    pub fn select_service(&self, service: Option<&Service>) -> Result<()> {
        let mut state = self.state();
        state.selected = service.cloned();
        let name = state.selected_name().to_string();
        if state.services.contains_key(&name) {
            return Ok(());
        }
        let service_id = service.map_or(0, Service::id);
        // a service with id 0 was never registered, so nothing can be stored for it
        let load = state.id != 0 && !state.foreign && (service.is_none() || service_id != 0);
        let settings = if load {
            let manager = self.manager_inner()?;
            let rows = manager.store.lock().load_settings(state.id, service_id)?;
            trace!("loaded {} settings of {name} for account {}", rows.len(), state.id);
            rows.into_iter().collect()
        } else {
            BTreeMap::new()
        };
        state.services.insert(
            name,
            ServiceSettings {
                service: service.cloned(),
                settings,
            },
        );
        Ok(())
    }

    /// Records a change to a setting of the selected service. `None` removes the setting.
    pub fn set(&self, key: &str, value: Option<Value>) {
        let mut state = self.state();
        let selected = state.selected.clone();
        state.changes_mut().set(selected.as_ref(), key, value);
    }

    /// Records a new value of a setting of the selected service.
    pub fn set_value(&self, key: &str, value: impl Into<Value>) {
        self.set(key, Some(value.into()));
    }

    /// Records the removal of a setting of the selected service.
    pub fn remove_value(&self, key: &str) {
        self.set(key, None);
    }

    /// Records a token for `key` of the selected service. The token is stored without a
    /// signature.
    pub fn sign(&self, key: &str, token: &str) {
        let mut state = self.state();
        let selected = state.selected.clone();
        state.changes_mut().sign(selected.as_ref(), key, token);
    }

    /// Marks the account for deletion on the next store. Does nothing if it is already
    /// deleted.
    pub fn delete(&self) {
        let mut state = self.state();
        if !state.deleted {
            state.changes_mut().deleted = true;
        }
    }

    fn provider_defaults(&self, state: &AccountState) -> Option<Arc<Defaults>> {
        let manager = self.inner.manager.upgrade()?;
        manager.templates.provider_defaults(&state.provider)
    }

    fn resolve_locked(&self, state: &AccountState, key: &str) -> (Option<Value>, SettingSource) {
        let settings = state.selected_settings();
        match &state.selected {
            Some(service) => resolve(settings, Some(service.defaults()), key),
            None => {
                let defaults = self.provider_defaults(state);
                resolve(settings, defaults.as_deref(), key)
            }
        }
    }

    /// Reads a setting of the selected service, falling back to the defaults of the service,
    /// or of the provider if no service is selected.
    ///
    /// Only committed values are visible.
    pub fn get_value(&self, key: &str) -> (Option<Value>, SettingSource) {
        let state = self.state();
        self.resolve_locked(&state, key)
    }

    /// Iterates over the settings of the selected service, stored values first, then the
    /// defaults they do not override.
    ///
    /// With a prefix, only the keys starting with it are returned, stripped of the prefix.
    pub fn settings_iter(&self, prefix: Option<&str>) -> SettingsIter {
        let state = self.state();
        let settings = state.selected_settings();
        match &state.selected {
            Some(service) => SettingsIter::new(settings, Some(service.defaults()), prefix),
            None => {
                let defaults = self.provider_defaults(&state);
                SettingsIter::new(settings, defaults.as_deref(), prefix)
            }
        }
    }

    fn add_watch(&self, filter: WatchFilter, callback: WatchCallback) -> WatchId {
        let service = self.state().selected_name().to_string();
        self.inner.watches.lock().add(&service, filter, callback)
    }

    /// Calls `callback` whenever `key` of the selected service changes.
    pub fn watch_key(
        &self,
        key: &str,
        callback: impl Fn(&Account, &str) + Send + Sync + 'static,
    ) -> WatchId {
        self.add_watch(WatchFilter::Exact(key.to_string()), Box::new(callback))
    }

    /// Calls `callback` whenever a key of the selected service starting with `prefix`
    /// changes.
    pub fn watch_dir(
        &self,
        prefix: &str,
        callback: impl Fn(&Account, &str) + Send + Sync + 'static,
    ) -> WatchId {
        self.add_watch(WatchFilter::Prefix(prefix.to_string()), Box::new(callback))
    }

    /// Removes a watch. Returns false if it was not installed.
    pub fn remove_watch(&self, id: WatchId) -> bool {
        self.inner.watches.lock().remove(id)
    }

    /// Subscribes to events of this account.
    pub fn subscribe(&self) -> flume::Receiver<AccountEvent> {
        let (sender, receiver) = flume::unbounded();
        self.inner.subscribers.lock().push(sender);
        receiver
    }

    /// Lists the services of the account's provider, restricted to the manager's service type
    /// if it has one.
    pub fn list_services(&self) -> Result<Vec<Service>> {
        let manager = self.manager_inner()?;
        let service_type = manager.service_type.clone();
        self.services_matching(&manager, service_type.as_deref())
    }

    /// Lists the services of the account's provider of the given type.
    pub fn list_services_by_type(&self, service_type: &str) -> Result<Vec<Service>> {
        let manager = self.manager_inner()?;
        self.services_matching(&manager, Some(service_type))
    }

    fn services_matching(
        &self,
        manager: &ManagerInner,
        service_type: Option<&str>,
    ) -> Result<Vec<Service>> {
        let provider = self.provider_name();
        manager.services_matching(|template| {
            template.provider.as_deref() == Some(provider.as_str())
                && service_type.is_none_or(|t| template.service_type.as_deref() == Some(t))
        })
    }

    /// Whether the account's provider has a service of the given type.
    pub fn supports_service(&self, service_type: &str) -> bool {
        let Some(manager) = self.inner.manager.upgrade() else {
            return false;
        };
        let provider = self.provider_name();
        manager.templates.services().iter().any(|t| {
            t.provider.as_deref() == Some(provider.as_str())
                && t.service_type.as_deref() == Some(service_type)
        })
    }

    /// Lists the services enabled on this account, restricted to the manager's service type if
    /// it has one.
    pub fn list_enabled_services(&self) -> Result<Vec<Service>> {
        let manager = self.manager_inner()?;
        let service_type = manager.service_type.as_deref();
        let (id, from_memory) = {
            let state = self.state();
            let from_memory = state.foreign.then(|| {
                let mut services: Vec<Service> = state
                    .services
                    .values()
                    .filter(|ss| ss.settings.get(ENABLED_KEY) == Some(&Value::Bool(true)))
                    .filter_map(|ss| ss.service.clone())
                    .filter(|s| service_type.is_none_or(|t| s.service_type() == Some(t)))
                    .collect();
                services.sort_by(|a, b| a.name().cmp(b.name()));
                services
            });
            (state.id, from_memory)
        };
        if let Some(services) = from_memory {
            return Ok(services);
        }
        let names = manager
            .store
            .lock()
            .list_enabled_services(id, service_type)?;
        let mut services = Vec::with_capacity(names.len());
        for name in names {
            services.extend(manager.get_service(&name)?);
        }
        Ok(services)
    }

    /// Applies committed changes to the loaded settings, then notifies watches and
    /// subscribers about what actually changed.
    pub(crate) fn apply_changes(&self, changes: &AccountChanges) {
        let mut events = Vec::new();
        let mut fired: Vec<Arc<Watch>> = Vec::new();
        {
            let mut state = self.state();
            let watches = self.inner.watches.lock();
            let AccountState {
                display_name,
                enabled,
                deleted,
                foreign,
                services,
                ..
            } = &mut *state;

            for (name, sc) in &changes.services {
                let is_global = name == GLOBAL;
                let mut ss = if *foreign {
                    Some(
                        services
                            .entry(name.clone())
                            .or_insert_with(|| ServiceSettings {
                                service: sc.service.clone(),
                                settings: BTreeMap::new(),
                            }),
                    )
                } else {
                    // services never selected have nothing loaded to update
                    services.get_mut(name)
                };

                for (key, value) in &sc.settings {
                    let changed = match (ss.as_deref_mut(), value) {
                        (Some(ss), Some(value)) => {
                            let old = ss.settings.insert(key.clone(), value.clone());
                            old.as_ref() != Some(value)
                        }
                        (Some(ss), None) => ss.settings.remove(key).is_some(),
                        (None, _) => true,
                    };

                    if is_global && ss.is_some() {
                        if key == NAME_KEY {
                            let name = value.as_ref().and_then(Value::as_str).map(str::to_string);
                            if *display_name != name {
                                *display_name = name.clone();
                                events.push(AccountEvent::DisplayNameChanged(name));
                            }
                            continue;
                        }
                        if key == ENABLED_KEY {
                            let value = value.as_ref().and_then(Value::as_bool).unwrap_or(false);
                            if *enabled != value {
                                *enabled = value;
                                events.push(AccountEvent::Enabled {
                                    service: None,
                                    enabled: value,
                                });
                            }
                            continue;
                        }
                    }

                    if !changed {
                        continue;
                    }
                    if ss.is_some() {
                        watches.collect_matching(name, key, &mut fired);
                    }
                    if key == ENABLED_KEY {
                        events.push(AccountEvent::Enabled {
                            service: (!is_global).then(|| name.clone()),
                            enabled: value.as_ref().and_then(Value::as_bool).unwrap_or(false),
                        });
                    }
                }
            }

            if changes.deleted && !*deleted {
                *deleted = true;
                if *enabled {
                    *enabled = false;
                    events.push(AccountEvent::Enabled {
                        service: None,
                        enabled: false,
                    });
                }
                events.push(AccountEvent::Deleted);
            }
        }

        if !events.is_empty() {
            let mut subscribers = self.inner.subscribers.lock();
            for event in events {
                subscribers.retain(|s| s.send(event.clone()).is_ok());
            }
        }
        for watch in fired {
            watch.invoke(self);
        }
    }
}
