//! Reading settings: account values first, then the template defaults.

use std::collections::BTreeMap;

use crate::{template::Defaults, value::Value};

/// Where a setting value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum SettingSource {
    /// The setting has no value.
    None,
    /// The value is stored on the account.
    Account,
    /// The value is a default of the service or provider.
    Profile,
}

/// Resolves `key` against the loaded account settings and then the defaults.
pub(crate) fn resolve(
    settings: Option<&BTreeMap<String, Value>>,
    defaults: Option<&Defaults>,
    key: &str,
) -> (Option<Value>, SettingSource) {
    if let Some(value) = settings.and_then(|s| s.get(key)) {
        return (Some(value.clone()), SettingSource::Account);
    }
    if let Some(value) = defaults.and_then(|d| d.lookup_default(key)) {
        return (Some(value.clone()), SettingSource::Profile);
    }
    (None, SettingSource::None)
}

/// Iterator over the settings of an account for one service.
///
/// Yields the values stored on the account first, then the defaults which are not overridden
/// by the account. When created with a prefix, only keys starting with it are returned, with
/// the prefix stripped.
#[derive(Debug)]
pub struct SettingsIter {
    items: std::vec::IntoIter<(String, Value, SettingSource)>,
}

impl SettingsIter {
    pub(crate) fn new(
        settings: Option<&BTreeMap<String, Value>>,
        defaults: Option<&Defaults>,
        prefix: Option<&str>,
    ) -> Self {
        let prefix = prefix.unwrap_or("");
        let strip = |key: &str| key[prefix.len()..].to_string();
        let mut items = Vec::new();
        if let Some(settings) = settings {
            items.extend(
                settings
                    .iter()
                    .filter(|(k, _)| k.starts_with(prefix))
                    .map(|(k, v)| (strip(k), v.clone(), SettingSource::Account)),
            );
        }
        if let Some(defaults) = defaults {
            items.extend(
                defaults
                    .iter_prefix(prefix)
                    .filter(|(k, _)| !settings.is_some_and(|s| s.contains_key(*k)))
                    .map(|(k, v)| (strip(k), v.clone(), SettingSource::Profile)),
            );
        }
        Self {
            items: items.into_iter(),
        }
    }

    /// Returns the next setting together with its source.
    pub fn next_with_source(&mut self) -> Option<(String, Value, SettingSource)> {
        self.items.next()
    }
}

impl Iterator for SettingsIter {
    type Item = (String, Value);

    fn next(&mut self) -> Option<Self::Item> {
        self.items.next().map(|(k, v, _)| (k, v))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.items.size_hint()
    }
}
