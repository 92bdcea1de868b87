//! SQLite storage of accounts, services and settings.
//!
//! The [`SettingsStore`] owns one connection. Statements are executed synchronously. When the
//! database is busy, reads are retried until the configured timeout elapses, while write
//! transactions are started with [`SettingsStore::try_begin_exclusive`] and the retry policy
//! is left to the caller.

use std::{
    path::Path,
    sync::Arc,
    time::{Duration, Instant},
};

use rusqlite::{params, types::ValueRef, Connection, ErrorCode, OpenFlags, OptionalExtension};
use tracing::{debug, error, info, trace, warn};

use crate::{
    error::{DatabaseLockedSnafu, DatabaseSnafu, Error, ReadOnlySnafu, Result},
    metrics::Metrics,
    service::ServiceId,
    template::ServiceTemplate,
    value::Value,
    AccountId,
};

mod schema;

/// Initial sleep between schema creation attempts on a busy database.
const SCHEMA_BUSY_SLEEP: Duration = Duration::from_millis(5);
/// Give up creating the schema once the sleep between attempts reaches this.
const SCHEMA_BUSY_MAX: Duration = Duration::from_secs(5);

/// Options of a [`SettingsStore`].
#[derive(Debug, Clone)]
pub(crate) struct StoreOptions {
    pub db_timeout: Duration,
    pub abort_on_db_timeout: bool,
    pub verbose: bool,
}

/// Core fields of an account row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AccountRow {
    pub name: Option<String>,
    pub provider: String,
    pub enabled: bool,
}

/// A row of the services table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ServiceRow {
    pub id: ServiceId,
    pub display: String,
    pub provider: Option<String>,
    pub service_type: Option<String>,
}

/// The account a statement applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AccountRef {
    /// An account which already has an id.
    Id(AccountId),
    /// The account inserted earlier in the same transaction.
    Created,
}

/// A single write against the database, executed inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Statement {
    DeleteAccount {
        id: AccountId,
    },
    InsertAccount {
        name: Option<String>,
        provider: String,
        enabled: bool,
    },
    UpdateAccount {
        id: AccountId,
        name: Option<Option<String>>,
        enabled: Option<bool>,
    },
    SetSetting {
        account: AccountRef,
        service: ServiceId,
        key: String,
        value: Value,
    },
    DeleteSetting {
        id: AccountId,
        service: ServiceId,
        key: String,
    },
    SetSignature {
        account: AccountRef,
        service: ServiceId,
        key: String,
        signature: String,
        token: String,
    },
}

impl Statement {
    /// Executes the statement. Returns the id of the inserted account for
    /// [`Statement::InsertAccount`].
    fn execute(
        &self,
        conn: &Connection,
        created: Option<AccountId>,
    ) -> Result<Option<AccountId>> {
        let resolve = |account: &AccountRef| match account {
            AccountRef::Id(id) => Ok(*id),
            AccountRef::Created => created.ok_or_else(|| {
                DatabaseSnafu {
                    message: "account id referenced before the account was inserted",
                }
                .build()
            }),
        };
        match self {
            Statement::DeleteAccount { id } => {
                conn.execute("DELETE FROM Accounts WHERE id = ?1", [id])
                    .map_err(from_sqlite)?;
                conn.execute("DELETE FROM Settings WHERE account = ?1", [id])
                    .map_err(from_sqlite)?;
            }
            Statement::InsertAccount {
                name,
                provider,
                enabled,
            } => {
                conn.execute(
                    "INSERT INTO Accounts (name, provider, enabled) VALUES (?1, ?2, ?3)",
                    params![name, provider, enabled],
                )
                .map_err(from_sqlite)?;
                let id = conn.last_insert_rowid();
                let id = AccountId::try_from(id).map_err(|_| {
                    DatabaseSnafu {
                        message: format!("account id {id} out of range"),
                    }
                    .build()
                })?;
                return Ok(Some(id));
            }
            Statement::UpdateAccount { id, name, enabled } => {
                let res = match (name, enabled) {
                    (Some(name), Some(enabled)) => conn.execute(
                        "UPDATE Accounts SET name = ?1, enabled = ?2 WHERE id = ?3",
                        params![name, enabled, id],
                    ),
                    (Some(name), None) => conn.execute(
                        "UPDATE Accounts SET name = ?1 WHERE id = ?2",
                        params![name, id],
                    ),
                    (None, Some(enabled)) => conn.execute(
                        "UPDATE Accounts SET enabled = ?1 WHERE id = ?2",
                        params![enabled, id],
                    ),
                    (None, None) => Ok(0),
                };
                res.map_err(from_sqlite)?;
            }
            Statement::SetSetting {
                account,
                service,
                key,
                value,
            } => {
                conn.execute(
                    "INSERT OR REPLACE INTO Settings (account, service, key, type, value) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        resolve(account)?,
                        service,
                        key,
                        value.type_signature(),
                        value.to_db()
                    ],
                )
                .map_err(from_sqlite)?;
            }
            Statement::DeleteSetting { id, service, key } => {
                conn.execute(
                    "DELETE FROM Settings WHERE account = ?1 AND service = ?2 AND key = ?3",
                    params![id, service, key],
                )
                .map_err(from_sqlite)?;
            }
            Statement::SetSignature {
                account,
                service,
                key,
                signature,
                token,
            } => {
                conn.execute(
                    "INSERT OR REPLACE INTO Signatures (account, service, key, signature, token) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![resolve(account)?, service, key, signature, token],
                )
                .map_err(from_sqlite)?;
            }
        }
        Ok(None)
    }
}

/// The accounts database.
#[derive(derive_more::Debug)]
pub(crate) struct SettingsStore {
    #[debug(skip)]
    conn: Connection,
    read_only: bool,
    db_timeout: Duration,
    abort_on_db_timeout: bool,
    verbose: bool,
    #[debug(skip)]
    metrics: Arc<Metrics>,
}

impl SettingsStore {
    /// Opens (or creates) the database at `path`.
    ///
    /// An existing database which cannot be written is opened read-only.
    pub fn persistent(
        path: impl AsRef<Path>,
        options: StoreOptions,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let path = path.as_ref();
        info!("loading accounts database from {}", path.display());
        let mut read_only = std::fs::metadata(path)
            .map(|m| m.permissions().readonly())
            .unwrap_or(false);
        if !read_only {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|err| {
                    DatabaseSnafu {
                        message: format!(
                            "failed to create database directory at {}: {err}",
                            parent.display()
                        ),
                    }
                    .build()
                })?;
            }
        }
        let conn = if read_only {
            Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        } else {
            match Connection::open(path) {
                Err(err) if path.exists() => {
                    warn!("opening {} read-only: {err}", path.display());
                    read_only = true;
                    Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
                }
                res => res,
            }
        }
        .map_err(from_sqlite)?;
        Self::open(conn, read_only, options, metrics)
    }

    /// Creates a database which lives in memory only.
    pub fn in_memory(options: StoreOptions, metrics: Arc<Metrics>) -> Result<Self> {
        info!("using in-memory accounts database");
        let conn = Connection::open_in_memory().map_err(from_sqlite)?;
        Self::open(conn, false, options, metrics)
    }

    fn open(
        conn: Connection,
        read_only: bool,
        options: StoreOptions,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        // busy handling is ours, sqlite must report busy right away
        conn.busy_timeout(Duration::ZERO).map_err(from_sqlite)?;
        let this = Self {
            conn,
            read_only,
            db_timeout: options.db_timeout,
            abort_on_db_timeout: options.abort_on_db_timeout,
            verbose: options.verbose,
            metrics,
        };
        this.init_schema()?;
        Ok(this)
    }

    fn init_schema(&self) -> Result<()> {
        if self.read_only {
            let version = schema::version(&self.conn).map_err(from_sqlite)?;
            if version < schema::SCHEMA_VERSION {
                warn!("read-only database has schema version {version}");
                return ReadOnlySnafu.fail();
            }
            return Ok(());
        }
        let mut sleep = SCHEMA_BUSY_SLEEP;
        loop {
            match self.try_init_schema() {
                Ok(()) => return Ok(()),
                Err(err) if is_busy(&err) && sleep < SCHEMA_BUSY_MAX => {
                    debug!("database locked, retrying schema setup in {sleep:?}");
                    std::thread::sleep(sleep);
                    sleep *= 2;
                }
                Err(err) => {
                    error!("error initializing database: {err}");
                    return Err(from_sqlite(err));
                }
            }
        }
    }

    fn try_init_schema(&self) -> rusqlite::Result<()> {
        self.conn.pragma_update(None, "synchronous", 1)?;
        let mode: String = self
            .conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        trace!("journal mode {mode}");
        schema::run_migrations(&self.conn)
    }

    /// Returns true if the database cannot be written.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn db_timeout(&self) -> Duration {
        self.db_timeout
    }

    pub fn set_db_timeout(&mut self, timeout: Duration) {
        self.db_timeout = timeout;
    }

    pub fn abort_on_db_timeout(&self) -> bool {
        self.abort_on_db_timeout
    }

    pub fn set_abort_on_db_timeout(&mut self, abort: bool) {
        self.abort_on_db_timeout = abort;
    }

    /// Runs `f`, retrying as long as the database is busy and the timeout has not elapsed.
    fn with_retry<T>(
        &self,
        sql: &str,
        f: impl Fn(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        if self.verbose {
            debug!("executing query: {sql}");
        }
        let start = Instant::now();
        loop {
            match f(&self.conn) {
                Ok(res) => return Ok(res),
                Err(err) if is_busy(&err) => {
                    if start.elapsed() >= self.db_timeout {
                        return Err(self.lock_timeout(self.db_timeout));
                    }
                    self.metrics.busy_retries.inc();
                    std::thread::yield_now();
                }
                Err(err) => return Err(from_sqlite(err)),
            }
        }
    }

    /// Builds the error for a lock which was held for longer than `timeout`, or aborts the
    /// process if configured to.
    pub fn lock_timeout(&self, timeout: Duration) -> Error {
        self.metrics.lock_timeouts.inc();
        if self.abort_on_db_timeout {
            error!("database locked for more than {timeout:?}, aborting");
            std::process::abort();
        }
        DatabaseLockedSnafu { timeout }.build()
    }

    pub fn load_account(&self, id: AccountId) -> Result<Option<AccountRow>> {
        const SQL: &str = "SELECT name, provider, enabled FROM Accounts WHERE id = ?1";
        let row = self.with_retry(SQL, |conn| {
            conn.query_row(SQL, [id], |row| {
                Ok(AccountRow {
                    name: row.get(0)?,
                    provider: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    enabled: row.get::<_, Option<i64>>(2)?.unwrap_or(0) != 0,
                })
            })
            .optional()
        })?;
        if row.is_some() {
            self.metrics.accounts_loaded.inc();
        }
        Ok(row)
    }

    /// Loads all settings of an account for one service.
    pub fn load_settings(
        &self,
        account: AccountId,
        service: ServiceId,
    ) -> Result<Vec<(String, Value)>> {
        const SQL: &str =
            "SELECT key, type, value FROM Settings WHERE account = ?1 AND service = ?2";
        let rows = self.with_retry(SQL, |conn| {
            let mut stmt = conn.prepare_cached(SQL)?;
            let rows = stmt.query_map(params![account, service], |row| {
                let text = match row.get_ref(2)? {
                    ValueRef::Text(t) | ValueRef::Blob(t) => {
                        Some(String::from_utf8_lossy(t).into_owned())
                    }
                    _ => None,
                };
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, text))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;
        let settings = rows
            .into_iter()
            .filter_map(|(key, signature, text)| {
                let value = text.and_then(|text| Value::from_db(&signature, &text));
                if value.is_none() {
                    warn!(
                        "skipping setting {key} of account {account}: bad value of type {signature}"
                    );
                }
                value.map(|value| (key, value))
            })
            .collect();
        Ok(settings)
    }

    pub fn service_by_name(&self, name: &str) -> Result<Option<ServiceRow>> {
        const SQL: &str = "SELECT id, display, provider, type FROM Services WHERE name = ?1";
        self.with_retry(SQL, |conn| {
            conn.query_row(SQL, [name], |row| {
                Ok(ServiceRow {
                    id: row.get(0)?,
                    display: row.get(1)?,
                    provider: row.get(2)?,
                    service_type: row.get(3)?,
                })
            })
            .optional()
        })
    }

    /// Registers a service and returns its id.
    ///
    /// If a concurrent writer registered the same service first, its row is used.
    pub fn insert_service(&self, template: &ServiceTemplate) -> Result<ServiceId> {
        const INSERT: &str = "INSERT OR IGNORE INTO Services (name, display, provider, type) \
                              VALUES (?1, ?2, ?3, ?4)";
        const SELECT: &str = "SELECT id FROM Services WHERE name = ?1";
        if self.read_only {
            return ReadOnlySnafu.fail();
        }
        self.with_retry(INSERT, |conn| {
            conn.execute(
                INSERT,
                params![
                    template.name,
                    template.display_name,
                    template.provider,
                    template.service_type
                ],
            )
        })?;
        self.with_retry(SELECT, |conn| {
            conn.query_row(SELECT, [&template.name], |row| row.get(0))
        })
    }

    fn list_ids(&self, sql: &str, param: Option<&str>) -> Result<Vec<AccountId>> {
        self.with_retry(sql, |conn| {
            let mut stmt = conn.prepare_cached(sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(param), |row| row.get(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
    }

    pub fn list_accounts(&self) -> Result<Vec<AccountId>> {
        self.list_ids("SELECT id FROM Accounts ORDER BY id", None)
    }

    pub fn list_accounts_by_service_type(&self, service_type: &str) -> Result<Vec<AccountId>> {
        self.list_ids(
            "SELECT id FROM Accounts WHERE provider IN \
             (SELECT provider FROM Services WHERE type = ?1) ORDER BY id",
            Some(service_type),
        )
    }

    pub fn list_enabled_accounts(&self) -> Result<Vec<AccountId>> {
        self.list_ids("SELECT id FROM Accounts WHERE enabled = 1 ORDER BY id", None)
    }

    /// Lists the accounts which are enabled and have at least one enabled service of the
    /// given type.
    pub fn list_enabled_accounts_by_service_type(
        &self,
        service_type: &str,
    ) -> Result<Vec<AccountId>> {
        self.list_ids(
            "SELECT DISTINCT Settings.account FROM Settings \
             INNER JOIN Services ON Settings.service = Services.id \
             WHERE Settings.key = 'enabled' AND Settings.value = 'true' \
             AND Services.type = ?1 AND Settings.account IN \
             (SELECT id FROM Accounts WHERE enabled = 1) ORDER BY Settings.account",
            Some(service_type),
        )
    }

    /// Lists the names of the services enabled on an account.
    pub fn list_enabled_services(
        &self,
        account: AccountId,
        service_type: Option<&str>,
    ) -> Result<Vec<String>> {
        const SQL: &str = "SELECT DISTINCT Services.name FROM Services \
                           JOIN Settings ON Settings.service = Services.id \
                           WHERE Settings.key = 'enabled' AND Settings.value = 'true' \
                           AND Settings.account = ?1 \
                           AND (?2 IS NULL OR Services.type = ?2) \
                           ORDER BY Services.name";
        self.with_retry(SQL, |conn| {
            let mut stmt = conn.prepare_cached(SQL)?;
            let rows = stmt.query_map(params![account, service_type], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
    }

    /// Tries to start an exclusive transaction.
    ///
    /// Returns `Ok(false)` if another connection holds the lock.
    pub fn try_begin_exclusive(&self) -> Result<bool> {
        if self.read_only {
            return ReadOnlySnafu.fail();
        }
        match self.conn.execute_batch("BEGIN EXCLUSIVE") {
            Ok(()) => Ok(true),
            Err(err) if is_busy(&err) => {
                self.metrics.busy_retries.inc();
                Ok(false)
            }
            Err(err) => Err(from_sqlite(err)),
        }
    }

    /// Executes `statements` in the transaction started by [`Self::try_begin_exclusive`] and
    /// commits it. On failure the transaction is rolled back.
    ///
    /// Returns the id assigned to an inserted account, if any.
    pub fn execute_and_commit(&self, statements: &[Statement]) -> Result<Option<AccountId>> {
        let res = self.execute_statements(statements).and_then(|created| {
            self.conn.execute_batch("COMMIT").map_err(from_sqlite)?;
            Ok(created)
        });
        match res {
            Ok(created) => {
                self.metrics.commits.inc();
                Ok(created)
            }
            Err(err) => {
                warn!("transaction failed: {err}");
                self.rollback();
                self.metrics.commits_failed.inc();
                Err(err)
            }
        }
    }

    fn execute_statements(&self, statements: &[Statement]) -> Result<Option<AccountId>> {
        let mut created = None;
        for statement in statements {
            if self.verbose {
                debug!(?statement, "executing");
            }
            if let Some(id) = statement.execute(&self.conn, created)? {
                created = Some(id);
            }
        }
        Ok(created)
    }

    fn rollback(&self) {
        if self.conn.is_autocommit() {
            return;
        }
        if let Err(err) = self.conn.execute_batch("ROLLBACK") {
            warn!("rollback failed: {err}");
        }
    }
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

/// Translates an engine error into the registry's error taxonomy.
pub(crate) fn from_sqlite(err: rusqlite::Error) -> Error {
    match err.sqlite_error_code() {
        Some(ErrorCode::ReadOnly) => ReadOnlySnafu.build(),
        _ => DatabaseSnafu {
            message: err.to_string(),
        }
        .build(),
    }
}

#[cfg(test)]
mod tests {
    use testresult::TestResult;

    use super::*;

    fn options() -> StoreOptions {
        StoreOptions {
            db_timeout: Duration::from_millis(200),
            abort_on_db_timeout: false,
            verbose: true,
        }
    }

    fn store(path: &Path) -> Result<SettingsStore> {
        SettingsStore::persistent(path, options(), Default::default())
    }

    #[test]
    fn creates_schema() -> TestResult {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("accounts.db");
        let store = store(&path)?;
        assert_eq!(schema::version(&store.conn)?, schema::SCHEMA_VERSION);
        assert!(!store.is_read_only());
        // opening again must not fail on the existing schema
        drop(store);
        let store = self::store(&path)?;
        assert_eq!(store.list_accounts()?, Vec::<AccountId>::new());
        Ok(())
    }

    #[test]
    fn insert_load_and_delete() -> TestResult {
        let store = SettingsStore::in_memory(options(), Default::default())?;
        assert!(store.try_begin_exclusive()?);
        let created = store.execute_and_commit(&[
            Statement::InsertAccount {
                name: Some("me".into()),
                provider: "p".into(),
                enabled: true,
            },
            Statement::SetSetting {
                account: AccountRef::Created,
                service: 0,
                key: "enabled".into(),
                value: Value::Bool(true),
            },
            Statement::SetSetting {
                account: AccountRef::Created,
                service: 3,
                key: "port".into(),
                value: Value::U32(993),
            },
        ])?;
        let id = created.expect("id assigned");
        assert_eq!(
            store.load_account(id)?,
            Some(AccountRow {
                name: Some("me".into()),
                provider: "p".into(),
                enabled: true,
            })
        );
        assert_eq!(
            store.load_settings(id, 3)?,
            vec![("port".to_string(), Value::U32(993))]
        );
        assert_eq!(store.list_enabled_accounts()?, vec![id]);

        assert!(store.try_begin_exclusive()?);
        store.execute_and_commit(&[Statement::DeleteAccount { id }])?;
        assert_eq!(store.load_account(id)?, None);
        assert!(store.load_settings(id, 3)?.is_empty());
        Ok(())
    }

    #[test]
    fn failed_transaction_rolls_back() -> TestResult {
        let store = SettingsStore::in_memory(options(), Default::default())?;
        assert!(store.try_begin_exclusive()?);
        let id = store
            .execute_and_commit(&[Statement::InsertAccount {
                name: None,
                provider: "p".into(),
                enabled: false,
            }])?
            .expect("id assigned");

        assert!(store.try_begin_exclusive()?);
        let res = store.execute_and_commit(&[
            Statement::UpdateAccount {
                id,
                name: Some(Some("renamed".into())),
                enabled: None,
            },
            // no account was inserted in this transaction
            Statement::SetSignature {
                account: AccountRef::Created,
                service: 0,
                key: "k".into(),
                signature: "s".into(),
                token: "t".into(),
            },
        ]);
        assert!(matches!(res, Err(Error::Database { .. })));
        assert_eq!(store.load_account(id)?.expect("account exists").name, None);
        assert!(store.conn.is_autocommit());
        Ok(())
    }

    #[test]
    fn busy_database_is_reported() -> TestResult {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("accounts.db");
        let store = store(&path)?;
        let other = Connection::open(&path)?;
        other.execute_batch("BEGIN EXCLUSIVE")?;
        assert!(!store.try_begin_exclusive()?);
        other.execute_batch("COMMIT")?;
        assert!(store.try_begin_exclusive()?);
        store.execute_and_commit(&[])?;
        Ok(())
    }

    #[test]
    fn read_only_database() -> TestResult {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("accounts.db");
        drop(store(&path)?);
        // switch back from WAL so the file can be read without the shared memory index
        Connection::open(&path)?.query_row("PRAGMA journal_mode = DELETE", [], |_| Ok(()))?;
        let mut perms = std::fs::metadata(&path)?.permissions();
        perms.set_readonly(true);
        std::fs::set_permissions(&path, perms)?;

        let store = store(&path)?;
        assert!(store.is_read_only());
        assert!(matches!(store.try_begin_exclusive(), Err(Error::ReadOnly { .. })));
        assert!(store.list_accounts()?.is_empty());
        Ok(())
    }

    #[test]
    fn concurrent_service_registration() -> TestResult {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("accounts.db");
        let a = store(&path)?;
        let b = store(&path)?;
        let template = ServiceTemplate::new("imap", "p", "e-mail");
        let id_a = a.insert_service(&template)?;
        let id_b = b.insert_service(&template)?;
        assert_eq!(id_a, id_b);
        assert_eq!(
            b.service_by_name("imap")?.map(|row| row.service_type),
            Some(Some("e-mail".to_string()))
        );
        Ok(())
    }
}
