//! Default settings supplied by service and provider descriptors.
//!
//! Parsing descriptor files is not the job of this crate. The registry only consumes the
//! [`Templates`] trait, and [`StaticTemplates`] is an in-memory implementation which can be
//! filled from whatever source the embedding application uses.

use std::{
    collections::{BTreeMap, HashMap},
    fmt::Debug,
    sync::Arc,
};

use crate::value::Value;

/// Default setting values of a service or a provider.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Defaults(BTreeMap<String, Value>);

impl Defaults {
    /// Creates an empty set of defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a default value.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Returns the default value for `key`.
    pub fn lookup_default(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Iterates over all defaults whose key starts with `prefix`, in key order.
    pub fn iter_prefix<'a>(
        &'a self,
        prefix: &'a str,
    ) -> impl Iterator<Item = (&'a String, &'a Value)> + 'a {
        self.0.iter().filter(move |(k, _)| k.starts_with(prefix))
    }

    /// Returns true if there are no defaults.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Defaults {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Static description of a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceTemplate {
    /// Unique service name.
    pub name: String,
    /// Human readable name.
    pub display_name: String,
    /// Provider this service belongs to.
    pub provider: Option<String>,
    /// Type of the service, e.g. `e-mail`.
    pub service_type: Option<String>,
    /// Default settings of the service.
    pub defaults: Defaults,
}

impl ServiceTemplate {
    /// Creates a template with no defaults.
    pub fn new(
        name: impl Into<String>,
        provider: impl Into<String>,
        service_type: impl Into<String>,
    ) -> Self {
        let name = name.into();
        Self {
            display_name: name.clone(),
            name,
            provider: Some(provider.into()),
            service_type: Some(service_type.into()),
            defaults: Defaults::default(),
        }
    }

    /// Sets the human readable name.
    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }

    /// Sets the default settings.
    pub fn with_defaults(mut self, defaults: Defaults) -> Self {
        self.defaults = defaults;
        self
    }
}

/// Source of service descriptors and provider defaults.
pub trait Templates: Debug + Send + Sync + 'static {
    /// Looks up the descriptor of a service by name.
    fn service(&self, name: &str) -> Option<Arc<ServiceTemplate>>;

    /// Looks up the default settings of a provider.
    fn provider_defaults(&self, provider: &str) -> Option<Arc<Defaults>>;

    /// Lists all known service descriptors.
    fn services(&self) -> Vec<Arc<ServiceTemplate>>;
}

/// In-memory [`Templates`].
#[derive(Debug, Default, Clone)]
pub struct StaticTemplates {
    services: HashMap<String, Arc<ServiceTemplate>>,
    providers: HashMap<String, Arc<Defaults>>,
}

impl StaticTemplates {
    /// Creates an empty set of templates.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a service descriptor.
    pub fn with_service(mut self, template: ServiceTemplate) -> Self {
        self.services
            .insert(template.name.clone(), Arc::new(template));
        self
    }

    /// Adds the defaults of a provider.
    pub fn with_provider(mut self, provider: impl Into<String>, defaults: Defaults) -> Self {
        self.providers.insert(provider.into(), Arc::new(defaults));
        self
    }
}

impl Templates for StaticTemplates {
    fn service(&self, name: &str) -> Option<Arc<ServiceTemplate>> {
        self.services.get(name).cloned()
    }

    fn provider_defaults(&self, provider: &str) -> Option<Arc<Defaults>> {
        self.providers.get(provider).cloned()
    }

    fn services(&self) -> Vec<Arc<ServiceTemplate>> {
        let mut list: Vec<_> = self.services.values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }
}
