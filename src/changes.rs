//! Pending changes of an account.

use std::collections::{BTreeMap, BTreeSet};

use crate::{
    bus::{ChangeMessage, ServiceDelta},
    notify::Timestamp,
    service::{Service, GLOBAL},
    store::{AccountRef, Statement},
    value::Value,
    AccountId,
};

/// Key of the global setting holding the display name.
pub(crate) const NAME_KEY: &str = "name";
/// Key of the setting holding the enabled flag of an account or service.
pub(crate) const ENABLED_KEY: &str = "enabled";

/// Placeholder for a signed setting. No signing is performed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Signature {
    pub signature: String,
    pub token: String,
}

/// Changes to the settings of one service.
#[derive(Debug, Clone, Default)]
pub(crate) struct ServiceChanges {
    /// `None` for the global settings.
    pub service: Option<Service>,
    pub service_type: Option<String>,
    /// `None` values are removals.
    pub settings: BTreeMap<String, Option<Value>>,
    pub signatures: BTreeMap<String, Signature>,
}

impl ServiceChanges {
    fn new(service: Option<&Service>) -> Self {
        Self {
            service: service.cloned(),
            service_type: match service {
                Some(service) => service.service_type().map(ToString::to_string),
                None => Some(GLOBAL.to_string()),
            },
            ..Default::default()
        }
    }

    fn service_id(&self) -> u32 {
        self.service.as_ref().map_or(0, Service::id)
    }
}

/// The changeset of an account: everything modified since the last commit.
#[derive(Debug, Clone, Default)]
pub(crate) struct AccountChanges {
    pub created: bool,
    pub deleted: bool,
    /// Keyed by service name, [`GLOBAL`] for the global settings.
    pub services: BTreeMap<String, ServiceChanges>,
}

impl AccountChanges {
    fn service_mut(&mut self, service: Option<&Service>) -> &mut ServiceChanges {
        let name = service.map_or(GLOBAL, Service::name);
        self.services
            .entry(name.to_string())
            .or_insert_with(|| ServiceChanges::new(service))
    }

    /// Records a setting change. `None` removes the setting.
    pub fn set(&mut self, service: Option<&Service>, key: &str, value: Option<Value>) {
        self.service_mut(service)
            .settings
            .insert(key.to_string(), value);
    }

    pub fn sign(&mut self, service: Option<&Service>, key: &str, token: &str) {
        self.service_mut(service).signatures.insert(
            key.to_string(),
            Signature {
                signature: String::new(),
                token: token.to_string(),
            },
        );
    }

    fn global(&self, key: &str) -> Option<&Option<Value>> {
        self.services.get(GLOBAL)?.settings.get(key)
    }

    /// Returns the new global enabled flag, if it changed.
    pub fn enabled(&self) -> Option<bool> {
        self.global(ENABLED_KEY)
            .map(|v| v.as_ref().and_then(Value::as_bool).unwrap_or(false))
    }

    /// Returns the new display name, if it changed.
    pub fn display_name(&self) -> Option<Option<String>> {
        self.global(NAME_KEY)
            .map(|v| v.as_ref().and_then(Value::as_str).map(ToString::to_string))
    }

    /// The service types touched by the changes, always including [`GLOBAL`].
    pub fn service_types(&self) -> BTreeSet<String> {
        let mut types: BTreeSet<String> = self
            .services
            .values()
            .filter_map(|sc| sc.service_type.clone())
            .collect();
        types.insert(GLOBAL.to_string());
        types
    }

    pub fn has_service_type(&self, service_type: &str) -> bool {
        self.services
            .values()
            .any(|sc| sc.service_type.as_deref() == Some(service_type))
    }

    /// Returns true if an enabled flag of the account or any service was set. Removing the
    /// flag does not count.
    pub fn has_enabled(&self) -> bool {
        self.services
            .values()
            .any(|sc| sc.settings.get(ENABLED_KEY).is_some_and(Option::is_some))
    }

    /// Generates the statements storing the changes of account `id`, `0` if the account is
    /// not stored yet.
    ///
    /// A deleted account only produces its delete statement.
    pub fn statements(&self, id: AccountId, provider: &str) -> Vec<Statement> {
        let mut statements = Vec::new();
        if self.deleted {
            if id != 0 {
                statements.push(Statement::DeleteAccount { id });
            }
            return statements;
        }

        let account = if id == 0 {
            statements.push(Statement::InsertAccount {
                name: self.display_name().flatten(),
                provider: provider.to_string(),
                enabled: self.enabled().unwrap_or(false),
            });
            AccountRef::Created
        } else {
            let name = self.display_name();
            let enabled = self.enabled();
            if name.is_some() || enabled.is_some() {
                statements.push(Statement::UpdateAccount { id, name, enabled });
            }
            AccountRef::Id(id)
        };

        for sc in self.services.values() {
            let service = sc.service_id();
            for (key, value) in &sc.settings {
                match value {
                    Some(value) => statements.push(Statement::SetSetting {
                        account,
                        service,
                        key: key.clone(),
                        value: value.clone(),
                    }),
                    // nothing stored yet, nothing to remove
                    None if id == 0 => {}
                    None => statements.push(Statement::DeleteSetting {
                        id,
                        service,
                        key: key.clone(),
                    }),
                }
            }
            for (key, sig) in &sc.signatures {
                statements.push(Statement::SetSignature {
                    account,
                    service,
                    key: key.clone(),
                    signature: sig.signature.clone(),
                    token: sig.token.clone(),
                });
            }
        }
        statements
    }

    /// Builds the notification describing the changes.
    pub fn to_message(&self, timestamp: Timestamp, id: AccountId, provider: &str) -> ChangeMessage {
        let services = self
            .services
            .iter()
            .map(|(name, sc)| ServiceDelta {
                service_name: name.clone(),
                service_type: sc.service_type.clone().unwrap_or_default(),
                service_id: sc.service_id(),
                changed: sc
                    .settings
                    .iter()
                    .filter_map(|(k, v)| Some((k.clone(), v.clone()?)))
                    .collect(),
                removed: sc
                    .settings
                    .iter()
                    .filter(|(_, v)| v.is_none())
                    .map(|(k, _)| k.clone())
                    .collect(),
            })
            .collect();
        ChangeMessage {
            sec: timestamp.sec,
            nsec: timestamp.nsec,
            account_id: id,
            created: self.created,
            deleted: self.deleted,
            provider: provider.to_string(),
            services,
        }
    }

    /// Rebuilds the changes from a notification. `resolve` maps each delta to its service,
    /// `None` for the global settings.
    pub fn from_message(
        msg: &ChangeMessage,
        mut resolve: impl FnMut(&ServiceDelta) -> Option<Service>,
    ) -> Self {
        let services = msg
            .services
            .iter()
            .map(|delta| {
                let settings = delta
                    .changed
                    .iter()
                    .map(|(k, v)| (k.clone(), Some(v.clone())))
                    .chain(delta.removed.iter().map(|k| (k.clone(), None)))
                    .collect();
                let sc = ServiceChanges {
                    service: resolve(delta),
                    service_type: Some(delta.service_type.clone()).filter(|t| !t.is_empty()),
                    settings,
                    signatures: BTreeMap::new(),
                };
                (delta.service_name.clone(), sc)
            })
            .collect();
        Self {
            created: msg.created,
            deleted: msg.deleted,
            services,
        }
    }
}
