//! The entry point to the registry.

use std::{collections::HashMap, sync::Arc, time::Duration};

use parking_lot::Mutex;
use snafu::{OptionExt, ResultExt};
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, info};

use crate::{
    account::Account,
    bus::{global_topic, topic_for_service_type, Bus, SessionBus},
    cache::AccountCache,
    config::Config,
    error::{AccountNotFoundSnafu, ConfigSnafu, Error, Result},
    metrics::Metrics,
    notify::{self, ChangeNotifier},
    service::{Service, ServiceId},
    store::SettingsStore,
    template::{ServiceTemplate, Templates},
    AccountId,
};

/// Notification about accounts, sent to [`Manager::subscribe`]rs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerEvent {
    /// An account was created.
    AccountCreated(AccountId),
    /// An account was deleted.
    AccountDeleted(AccountId),
    /// Settings of the manager's service type changed on an account.
    ///
    /// Only sent by managers restricted to a service type.
    AccountUpdated(AccountId),
    /// An account or one of its services was enabled or disabled.
    ///
    /// Only sent by managers restricted to a service type.
    EnabledEvent(AccountId),
}

#[derive(derive_more::Debug)]
pub(crate) struct ManagerInner {
    pub service_type: Option<String>,
    pub store: Mutex<SettingsStore>,
    pub templates: Arc<dyn Templates>,
    pub bus: Arc<dyn Bus>,
    pub cache: Mutex<AccountCache>,
    pub services: Mutex<HashMap<String, Service>>,
    pub notifier: Mutex<ChangeNotifier>,
    #[debug(skip)]
    pub subscribers: Mutex<Vec<flume::Sender<ManagerEvent>>>,
    #[debug(skip)]
    pub metrics: Arc<Metrics>,
    pub blocking_timeout: Duration,
    pub foreign_account_hold: Duration,
    pub verbose: bool,
    #[debug(skip)]
    listener: Mutex<Option<AbortOnDropHandle<()>>>,
}

impl ManagerInner {
    /// Looks up a service, registering it in the database on first use.
    ///
    /// Services unknown to both the database and the templates do not exist.
    pub(crate) fn get_service(&self, name: &str) -> Result<Option<Service>> {
        if let Some(service) = self.services.lock().get(name) {
            return Ok(Some(service.clone()));
        }
        let template = self.templates.service(name);
        let row = self.store.lock().service_by_name(name)?;
        let service = match (row, template) {
            (Some(row), Some(template)) => Service::from_template(row.id, &template),
            (Some(row), None) => Service::from_row(name, row),
            (None, Some(template)) => {
                let id = self.register_service(&template)?;
                Service::from_template(id, &template)
            }
            (None, None) => return Ok(None),
        };
        let mut services = self.services.lock();
        Ok(Some(
            services.entry(name.to_string()).or_insert(service).clone(),
        ))
    }

    fn register_service(&self, template: &ServiceTemplate) -> Result<ServiceId> {
        match self.store.lock().insert_service(template) {
            Ok(id) => {
                debug!("registered service {} with id {id}", template.name);
                Ok(id)
            }
            // usable for reading defaults, settings cannot be stored for it
            Err(Error::ReadOnly { .. }) => Ok(0),
            Err(err) => Err(err),
        }
    }

    /// The services of all templates matching `filter`, sorted by name.
    pub(crate) fn services_matching(
        &self,
        filter: impl Fn(&ServiceTemplate) -> bool,
    ) -> Result<Vec<Service>> {
        let mut services = Vec::new();
        for template in self.templates.services() {
            if !filter(&template) {
                continue;
            }
            services.extend(self.get_service(&template.name)?);
        }
        Ok(services)
    }
}

/// Manages the accounts stored in one database.
///
/// Cheap to clone. The manager listens for changes made by other managers on the [`Bus`] and
/// keeps the accounts it hands out up to date. It must be created inside a tokio runtime.
#[derive(Debug, Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

impl Manager {
    /// Opens the database configured in `config` and starts listening for changes.
    pub fn spawn(config: Config, bus: Arc<dyn Bus>, templates: Arc<dyn Templates>) -> Result<Self> {
        let path = config.database_path().context(ConfigSnafu)?;
        let metrics = Arc::new(Metrics::default());
        let store = SettingsStore::persistent(&path, config.store_options(), metrics.clone())?;
        Ok(Self::with_store(config, store, metrics, bus, templates))
    }

    /// Connects to the session bus, then opens the database configured in `config`.
    ///
    /// Changes committed through the returned manager reach the managers of all processes of
    /// the user session.
    pub async fn connect(config: Config, templates: Arc<dyn Templates>) -> Result<Self> {
        let bus = SessionBus::connect().await?;
        Self::spawn(config, Arc::new(bus), templates)
    }

    /// Creates a manager on a database living in memory only.
    ///
    /// Other managers on the bus still see its change notifications.
    pub fn spawn_in_memory(
        config: Config,
        bus: Arc<dyn Bus>,
        templates: Arc<dyn Templates>,
    ) -> Result<Self> {
        let metrics = Arc::new(Metrics::default());
        let store = SettingsStore::in_memory(config.store_options(), metrics.clone())?;
        Ok(Self::with_store(config, store, metrics, bus, templates))
    }

    fn with_store(
        config: Config,
        store: SettingsStore,
        metrics: Arc<Metrics>,
        bus: Arc<dyn Bus>,
        templates: Arc<dyn Templates>,
    ) -> Self {
        let topics = config
            .service_type
            .as_deref()
            .map(|t| vec![topic_for_service_type(t), global_topic()]);
        let receiver = bus.subscribe(topics);
        let inner = Arc::new(ManagerInner {
            service_type: config.service_type,
            store: Mutex::new(store),
            templates,
            bus,
            cache: Mutex::new(AccountCache::default()),
            services: Mutex::new(HashMap::new()),
            notifier: Mutex::new(ChangeNotifier::default()),
            subscribers: Mutex::new(Vec::new()),
            metrics,
            blocking_timeout: config.blocking_timeout,
            foreign_account_hold: config.foreign_account_hold,
            verbose: config.log.verbose,
            listener: Mutex::new(None),
        });
        let handle = tokio::spawn(notify::listen(Arc::downgrade(&inner), receiver));
        *inner.listener.lock() = Some(AbortOnDropHandle::new(handle));
        info!(
            service_type = ?inner.service_type,
            "accounts manager started"
        );
        Self { inner }
    }

    pub(crate) fn from_inner(inner: Arc<ManagerInner>) -> Self {
        Self { inner }
    }

    /// The service type this manager is restricted to.
    pub fn service_type(&self) -> Option<&str> {
        self.inner.service_type.as_deref()
    }

    /// Creates a new account for `provider`. It is stored on the first
    /// [`Account::store`].
    pub fn create_account(&self, provider: &str) -> Account {
        Account::new(Arc::downgrade(&self.inner), provider)
    }

    /// Returns the account with id `id`, loading it from the database if it is not in memory.
    pub fn get_account(&self, id: AccountId) -> Result<Account> {
        if let Some(account) = self.inner.cache.lock().get(id) {
            return Ok(account);
        }
        let row = self
            .inner
            .store
            .lock()
            .load_account(id)?
            .context(AccountNotFoundSnafu { id })?;
        let account = Account::from_row(Arc::downgrade(&self.inner), id, row);
        account.select_service(None)?;
        let account = self.inner.cache.lock().insert(id, account);
        Ok(account)
    }

    /// Lists the ids of all accounts, or of the accounts supporting the manager's service
    /// type.
    pub fn list(&self) -> Result<Vec<AccountId>> {
        match &self.inner.service_type {
            Some(service_type) => self.list_by_service_type(service_type),
            None => self.inner.store.lock().list_accounts(),
        }
    }

    /// Lists the ids of the accounts whose provider has services of `service_type`.
    pub fn list_by_service_type(&self, service_type: &str) -> Result<Vec<AccountId>> {
        self.inner
            .store
            .lock()
            .list_accounts_by_service_type(service_type)
    }

    /// Lists the ids of the enabled accounts. A manager restricted to a service type only
    /// lists accounts with an enabled service of that type.
    pub fn list_enabled(&self) -> Result<Vec<AccountId>> {
        match &self.inner.service_type {
            Some(service_type) => self.list_enabled_by_service_type(service_type),
            None => self.inner.store.lock().list_enabled_accounts(),
        }
    }

    /// Lists the ids of the enabled accounts with an enabled service of `service_type`.
    pub fn list_enabled_by_service_type(&self, service_type: &str) -> Result<Vec<AccountId>> {
        self.inner
            .store
            .lock()
            .list_enabled_accounts_by_service_type(service_type)
    }

    /// Looks up a service by name.
    pub fn get_service(&self, name: &str) -> Result<Option<Service>> {
        self.inner.get_service(name)
    }

    /// Lists all known services, or those of the manager's service type.
    pub fn list_services(&self) -> Result<Vec<Service>> {
        let service_type = self.inner.service_type.clone();
        self.inner.services_matching(|template| {
            service_type
                .as_deref()
                .is_none_or(|t| template.service_type.as_deref() == Some(t))
        })
    }

    /// Lists the known services of `service_type`.
    pub fn list_services_by_type(&self, service_type: &str) -> Result<Vec<Service>> {
        self.inner
            .services_matching(|template| template.service_type.as_deref() == Some(service_type))
    }

    /// Subscribes to account events.
    pub fn subscribe(&self) -> flume::Receiver<ManagerEvent> {
        let (sender, receiver) = flume::unbounded();
        self.inner.subscribers.lock().push(sender);
        receiver
    }

    /// How long reads and stores retry on a busy database.
    pub fn db_timeout(&self) -> Duration {
        self.inner.store.lock().db_timeout()
    }

    /// Sets how long reads and stores retry on a busy database.
    pub fn set_db_timeout(&self, timeout: Duration) {
        self.inner.store.lock().set_db_timeout(timeout);
    }

    /// Whether the process is aborted when the database stays locked.
    pub fn abort_on_db_timeout(&self) -> bool {
        self.inner.store.lock().abort_on_db_timeout()
    }

    /// Sets whether the process is aborted when the database stays locked.
    pub fn set_abort_on_db_timeout(&self, abort: bool) {
        self.inner.store.lock().set_abort_on_db_timeout(abort);
    }

    /// Whether the database cannot be written.
    pub fn is_read_only(&self) -> bool {
        self.inner.store.lock().is_read_only()
    }

    /// Metrics of this manager.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }
}
