//! Services an account can be configured for.

use std::sync::Arc;

use crate::{
    store::ServiceRow,
    template::{Defaults, ServiceTemplate},
};

/// Name of the pseudo-service holding account-wide settings.
pub const GLOBAL: &str = "global";

/// Storage id of a service row. `0` denotes the global pseudo-service.
pub type ServiceId = u32;

/// A service known to the registry.
///
/// Cheap to clone. Two handles are equal when they name the same service.
#[derive(Debug, Clone)]
pub struct Service(Arc<ServiceInner>);

#[derive(Debug)]
struct ServiceInner {
    id: ServiceId,
    name: String,
    display_name: String,
    provider: Option<String>,
    service_type: Option<String>,
    defaults: Defaults,
}

impl Service {
    pub(crate) fn from_template(id: ServiceId, template: &ServiceTemplate) -> Self {
        Self(Arc::new(ServiceInner {
            id,
            name: template.name.clone(),
            display_name: template.display_name.clone(),
            provider: template.provider.clone(),
            service_type: template.service_type.clone(),
            defaults: template.defaults.clone(),
        }))
    }

    /// A service only known by name and type, e.g. from a change notification for a service
    /// without a local descriptor.
    pub(crate) fn bare(id: ServiceId, name: &str, service_type: Option<String>) -> Self {
        Self(Arc::new(ServiceInner {
            id,
            name: name.to_string(),
            display_name: name.to_string(),
            provider: None,
            service_type,
            defaults: Defaults::default(),
        }))
    }

    /// A registered service without a local descriptor.
    pub(crate) fn from_row(name: &str, row: ServiceRow) -> Self {
        Self(Arc::new(ServiceInner {
            id: row.id,
            name: name.to_string(),
            display_name: row.display,
            provider: row.provider,
            service_type: row.service_type,
            defaults: Defaults::default(),
        }))
    }

    /// Storage id of the service.
    pub fn id(&self) -> ServiceId {
        self.0.id
    }

    /// Unique name of the service.
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Human readable name.
    pub fn display_name(&self) -> &str {
        &self.0.display_name
    }

    /// Provider the service belongs to.
    pub fn provider(&self) -> Option<&str> {
        self.0.provider.as_deref()
    }

    /// Type of the service.
    pub fn service_type(&self) -> Option<&str> {
        self.0.service_type.as_deref()
    }

    /// Default settings of the service.
    pub fn defaults(&self) -> &Defaults {
        &self.0.defaults
    }
}

impl PartialEq for Service {
    fn eq(&self, other: &Self) -> bool {
        self.0.name == other.0.name
    }
}

impl Eq for Service {}
