//! A per-user registry of accounts and their per-service settings
//!
//! Accounts live in a SQLite database shared by all processes of a user. Every process opens
//! it through a [`Manager`], which hands out [`Account`]s, commits their changes in exclusive
//! transactions and keeps them consistent with the changes of other managers by exchanging
//! notifications over a [`bus::Bus`].

#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod bus;
pub mod config;
pub mod metrics;
pub mod template;

mod account;
mod cache;
mod changes;
mod error;
mod manager;
mod notify;
mod resolver;
mod service;
mod store;
mod transaction;
mod value;
mod watch;

pub use account::{Account, AccountEvent};
pub use config::{Config, LogConfig};
pub use error::{Error, Result};
pub use manager::{Manager, ManagerEvent};
pub use resolver::{SettingSource, SettingsIter};
pub use service::{Service, ServiceId, GLOBAL};
pub use value::Value;
pub use watch::{WatchCallback, WatchFilter, WatchId};

/// Storage id of an account. `0` denotes an account which was never stored.
pub type AccountId = u32;
