//! Errors returned by the registry.

use std::time::Duration;

use nested_enum_utils::common_fields;
use snafu::{Backtrace, Snafu};

use crate::AccountId;

/// Errors returned by registry operations.
///
/// Failures of the underlying storage engine are translated into this taxonomy at the store
/// boundary, the engine's own error codes never reach callers.
#[common_fields({
    backtrace: Option<Backtrace>,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// Any unexpected storage failure.
    #[snafu(display("Database error: {message}"))]
    Database { message: String },
    /// The database stayed busy for longer than the configured timeout.
    #[snafu(display("Database locked (timeout {timeout:?} exceeded)"))]
    DatabaseLocked { timeout: Duration },
    /// The database is not writable.
    #[snafu(display("Database is read-only"))]
    ReadOnly {},
    /// The account has been deleted.
    #[snafu(display("Account {id} has been deleted"))]
    Deleted { id: AccountId },
    /// No account with this id exists.
    #[snafu(display("Account {id} not found"))]
    AccountNotFound { id: AccountId },
    /// Another store operation is running on the same account.
    #[snafu(display("Store operation already in progress"))]
    StoreInProgress {},
    /// The manager owning the object has been dropped.
    #[snafu(display("Manager has been disposed"))]
    Disposed {},
    /// The store operation was cancelled before the database lock was taken.
    #[snafu(display("Store operation cancelled"))]
    Cancelled {},
    /// The configuration could not be loaded.
    #[snafu(display("Invalid configuration"))]
    Config { source: crate::config::ConfigError },
    /// The connection to the message bus failed.
    #[snafu(display("Message bus error"))]
    Bus { source: zbus::Error },
    /// The message bus connection was closed.
    #[snafu(display("Message bus connection closed"))]
    BusClosed {},
    /// A change notification could not be encoded or decoded.
    #[snafu(display("Malformed change notification"))]
    Codec { source: postcard::Error },
}

/// Result type with [`Error`] as the default error.
pub type Result<T, E = Error> = std::result::Result<T, E>;
