//! Metrics for the registry

use iroh_metrics::{Counter, MetricsGroup};

/// Metrics tracked by a [`crate::Manager`]
#[derive(Debug, Default, MetricsGroup)]
#[metrics(name = "accounts")]
pub struct Metrics {
    /*
     * Storage
     */
    /// Transactions committed
    #[metrics(help = "Number of account changes committed to the database.")]
    pub commits: Counter,
    /// Transactions rolled back or never started
    #[metrics(help = "Number of account changes that failed to commit.")]
    pub commits_failed: Counter,
    /// Attempts that found the database busy
    #[metrics(help = "Number of times a statement or transaction was retried on a busy database.")]
    pub busy_retries: Counter,
    /// Busy retries that gave up
    #[metrics(help = "Number of times the database stayed locked past the timeout.")]
    pub lock_timeouts: Counter,
    /// Accounts read from the database
    #[metrics(help = "Number of accounts loaded from the database.")]
    pub accounts_loaded: Counter,

    /*
     * Change notifications
     */
    /// One per topic a change is sent on
    #[metrics(help = "Number of change notifications sent.")]
    pub notifications_sent: Counter,
    /// Notifications read from the bus
    #[metrics(help = "Number of change notifications received.")]
    pub notifications_received: Counter,
    /// Duplicates and echoes of our own writes
    #[metrics(help = "Number of received change notifications that were discarded.")]
    pub notifications_skipped: Counter,
    /// Echoes applied because a foreign change arrived first
    #[metrics(help = "Number of own change notifications applied again after a racing write.")]
    pub notifications_reprocessed: Counter,
    /// Accounts created or deleted by other managers
    #[metrics(help = "Number of accounts materialized from change notifications.")]
    pub foreign_accounts: Counter,
}
