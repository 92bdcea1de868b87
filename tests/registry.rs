use std::{
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc, Arc,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use account_registry::{
    bus::{Bus, LocalBus},
    template::{Defaults, ServiceTemplate, StaticTemplates},
    AccountEvent, Config, Error, Manager, ManagerEvent, SettingSource, Value,
};
use rusqlite::Connection;
use testresult::TestResult;
use tokio_util::sync::CancellationToken;
use tracing_test::traced_test;

fn templates() -> Arc<StaticTemplates> {
    Arc::new(
        StaticTemplates::new()
            .with_provider("p", Defaults::new().with("auth/method", "password"))
            .with_service(
                ServiceTemplate::new("p-mail", "p", "e-mail")
                    .with_display_name("P Mail")
                    .with_defaults(
                        Defaults::new()
                            .with("server/host", "mail.example.com")
                            .with("server/port", 993u32),
                    ),
            )
            .with_service(ServiceTemplate::new("p-chat", "p", "IM")),
    )
}

fn config(dir: &Path) -> Config {
    Config::default().with_data_dir(dir)
}

fn manager(dir: &Path, bus: &Arc<LocalBus>) -> account_registry::Result<Manager> {
    Manager::spawn(config(dir), bus.clone(), templates())
}

/// Holds an exclusive transaction on the database for `duration`.
fn hold_lock(path: &Path, duration: Duration) -> (JoinHandle<()>, mpsc::Receiver<()>) {
    let path = path.to_path_buf();
    let (locked_tx, locked_rx) = mpsc::channel();
    let handle = std::thread::spawn(move || {
        let conn = Connection::open(&path).expect("open database");
        conn.execute_batch("BEGIN EXCLUSIVE").expect("lock database");
        locked_tx.send(()).expect("test alive");
        std::thread::sleep(duration);
        conn.execute_batch("COMMIT").expect("unlock database");
    });
    (handle, locked_rx)
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
#[traced_test]
async fn settings_survive_a_new_manager() -> TestResult {
    let dir = tempfile::tempdir()?;
    let bus = Arc::new(LocalBus::new());
    let id = {
        let manager = manager(dir.path(), &bus)?;
        let service = manager.get_service("p-mail")?.expect("known service");
        let account = manager.create_account("p");
        account.set_display_name("work");
        account.set_enabled(true);
        account.select_service(Some(&service))?;
        account.set_value("server/port", 995u32);
        account.set_value("aliases", vec!["a@example.com".to_string()]);
        account.sign("server/port", "token");
        account.store().await?;
        account.id()
    };

    let manager = manager(dir.path(), &bus)?;
    let account = manager.get_account(id)?;
    assert_eq!(account.provider_name(), "p");
    assert_eq!(account.display_name().as_deref(), Some("work"));
    assert!(account.enabled());
    assert_eq!(
        account.get_value("enabled"),
        (Some(Value::Bool(true)), SettingSource::Account)
    );

    let service = manager.get_service("p-mail")?.expect("known service");
    assert_eq!(service.display_name(), "P Mail");
    account.select_service(Some(&service))?;
    assert_eq!(
        account.get_value("server/port"),
        (Some(Value::U32(995)), SettingSource::Account)
    );
    assert_eq!(
        account.get_value("aliases"),
        (
            Some(Value::StringList(vec!["a@example.com".to_string()])),
            SettingSource::Account
        )
    );
    assert_eq!(
        account.get_value("server/host"),
        (Some(Value::from("mail.example.com")), SettingSource::Profile)
    );

    account.remove_value("server/port");
    account.store().await?;
    assert_eq!(
        account.get_value("server/port"),
        (Some(Value::U32(993)), SettingSource::Profile)
    );
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn listing() -> TestResult {
    let dir = tempfile::tempdir()?;
    let bus = Arc::new(LocalBus::new());
    let manager = manager(dir.path(), &bus)?;
    let mail = manager.get_service("p-mail")?.expect("known service");

    let enabled = manager.create_account("p");
    enabled.set_enabled(true);
    enabled.select_service(Some(&mail))?;
    enabled.set_enabled(true);
    enabled.store().await?;

    let disabled = manager.create_account("p");
    disabled.store().await?;

    let other = manager.create_account("q");
    other.set_enabled(true);
    other.store().await?;

    assert_eq!(
        manager.list()?,
        vec![enabled.id(), disabled.id(), other.id()]
    );
    assert_eq!(manager.list_enabled()?, vec![enabled.id(), other.id()]);
    assert_eq!(manager.list_by_service_type("e-mail")?, vec![enabled.id(), disabled.id()]);
    assert_eq!(manager.list_enabled_by_service_type("e-mail")?, vec![enabled.id()]);
    assert!(manager.list_enabled_by_service_type("IM")?.is_empty());

    let names = |services: Vec<account_registry::Service>| {
        services
            .iter()
            .map(|s| s.name().to_string())
            .collect::<Vec<_>>()
    };
    assert_eq!(names(manager.list_services()?), vec!["p-chat", "p-mail"]);
    assert_eq!(names(manager.list_services_by_type("IM")?), vec!["p-chat"]);
    assert_eq!(names(enabled.list_services()?), vec!["p-chat", "p-mail"]);
    assert!(other.list_services()?.is_empty());
    assert_eq!(names(enabled.list_enabled_services()?), vec!["p-mail"]);

    let typed = Manager::spawn(
        config(dir.path()).with_service_type("e-mail"),
        bus.clone(),
        templates(),
    )?;
    assert_eq!(typed.service_type(), Some("e-mail"));
    assert_eq!(typed.list()?, vec![enabled.id(), disabled.id()]);
    assert_eq!(typed.list_enabled()?, vec![enabled.id()]);
    assert_eq!(names(typed.list_services()?), vec!["p-mail"]);
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn account_events_and_watches() -> TestResult {
    let dir = tempfile::tempdir()?;
    let bus = Arc::new(LocalBus::new());
    let manager = manager(dir.path(), &bus)?;
    let mail = manager.get_service("p-mail")?.expect("known service");
    let account = manager.create_account("p");
    account.store().await?;
    let events = account.subscribe();

    let fired = Arc::new(AtomicUsize::new(0));
    account.select_service(Some(&mail))?;
    let watch = account.watch_dir("server/", {
        let fired = fired.clone();
        move |account, prefix| {
            assert_eq!(prefix, "server/");
            assert_ne!(account.id(), 0);
            fired.fetch_add(1, Ordering::SeqCst);
        }
    });
    account.set_value("server/host", "imap.example.com");
    account.set_value("server/port", 143u32);
    account.set_enabled(true);
    account.store().await?;
    // one change notification per watch and store
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    // unchanged values do not fire
    account.set_value("server/port", 143u32);
    account.store().await?;
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    assert!(account.remove_watch(watch));
    account.set_value("server/port", 144u32);
    account.store().await?;
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    account.select_service(None)?;
    account.set_display_name("renamed");
    account.set_enabled(true);
    account.store().await?;
    account.delete();
    account.store().await?;

    let events: Vec<_> = events.drain().collect();
    assert_eq!(
        events,
        vec![
            AccountEvent::Enabled {
                service: Some("p-mail".to_string()),
                enabled: true
            },
            AccountEvent::Enabled {
                service: None,
                enabled: true
            },
            AccountEvent::DisplayNameChanged(Some("renamed".to_string())),
            AccountEvent::Enabled {
                service: None,
                enabled: false
            },
            AccountEvent::Deleted,
        ]
    );
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn store_waits_for_busy_database() -> TestResult {
    let dir = tempfile::tempdir()?;
    let bus = Arc::new(LocalBus::new());
    let manager = manager(dir.path(), &bus)?;
    let account = manager.create_account("p");
    account.set_enabled(true);

    let (locker, locked) = hold_lock(&config(dir.path()).database_path()?, Duration::from_millis(500));
    locked.recv()?;
    let start = Instant::now();
    account.store().await?;
    assert!(start.elapsed() >= Duration::from_millis(300));
    assert_ne!(account.id(), 0);
    locker.join().expect("locker thread");
    assert!(manager.metrics().busy_retries.get() > 0);
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn blocking_store_backs_off() -> TestResult {
    let dir = tempfile::tempdir()?;
    let bus = Arc::new(LocalBus::new());
    let manager = manager(dir.path(), &bus)?;
    let account = manager.create_account("p");
    account.set_enabled(true);

    let (locker, locked) = hold_lock(&config(dir.path()).database_path()?, Duration::from_millis(500));
    locked.recv()?;
    let start = Instant::now();
    account.store_blocking()?;
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(300));
    assert!(elapsed < Config::default().blocking_timeout + Duration::from_secs(1));
    assert_ne!(account.id(), 0);
    locker.join().expect("locker thread");
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn store_gives_up_on_locked_database() -> TestResult {
    let dir = tempfile::tempdir()?;
    let bus = Arc::new(LocalBus::new());
    let manager = manager(dir.path(), &bus)?;
    manager.set_db_timeout(Duration::from_millis(100));
    assert_eq!(manager.db_timeout(), Duration::from_millis(100));
    assert!(!manager.abort_on_db_timeout());
    let account = manager.create_account("p");

    let (locker, locked) = hold_lock(&config(dir.path()).database_path()?, Duration::from_millis(600));
    locked.recv()?;
    let res = account.store().await;
    assert!(matches!(res, Err(Error::DatabaseLocked { .. })), "{res:?}");
    assert_eq!(account.id(), 0);
    locker.join().expect("locker thread");
    assert_eq!(manager.metrics().lock_timeouts.get(), 1);
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn concurrent_store_is_rejected() -> TestResult {
    let dir = tempfile::tempdir()?;
    let bus = Arc::new(LocalBus::new());
    let manager = manager(dir.path(), &bus)?;
    let account = manager.create_account("p");

    let (locker, locked) = hold_lock(&config(dir.path()).database_path()?, Duration::from_millis(300));
    locked.recv()?;
    let (first, second) = tokio::join!(account.store(), async {
        tokio::task::yield_now().await;
        account.set_enabled(true);
        account.store().await
    });
    first?;
    assert!(matches!(second, Err(Error::StoreInProgress { .. })));
    locker.join().expect("locker thread");

    // the change made during the first store is stored by the next one
    account.store().await?;
    assert!(account.enabled());
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn cancelled_store() -> TestResult {
    let dir = tempfile::tempdir()?;
    let bus = Arc::new(LocalBus::new());
    let manager = manager(dir.path(), &bus)?;
    let account = manager.create_account("p");
    let cancel = CancellationToken::new();

    let (locker, locked) = hold_lock(&config(dir.path()).database_path()?, Duration::from_millis(500));
    locked.recv()?;
    let (res, ()) = tokio::join!(account.store_with_cancel(&cancel), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });
    assert!(matches!(res, Err(Error::Cancelled { .. })));
    assert_eq!(account.id(), 0);
    locker.join().expect("locker thread");
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn read_only_database_fails_fast() -> TestResult {
    let dir = tempfile::tempdir()?;
    let bus = Arc::new(LocalBus::new());
    let id = {
        let manager = manager(dir.path(), &bus)?;
        let account = manager.create_account("p");
        account.store().await?;
        account.id()
    };
    let path = config(dir.path()).database_path()?;
    // switch back from WAL so the file can be read without the shared memory index
    Connection::open(&path)?.query_row("PRAGMA journal_mode = DELETE", [], |_| Ok(()))?;
    let mut perms = std::fs::metadata(&path)?.permissions();
    perms.set_readonly(true);
    std::fs::set_permissions(&path, perms)?;

    let manager = manager(dir.path(), &bus)?;
    assert!(manager.is_read_only());
    let account = manager.get_account(id)?;
    // unregistered services can still be read
    let service = manager.get_service("p-mail")?.expect("known service");
    assert_eq!(service.id(), 0);

    account.set_enabled(true);
    let start = Instant::now();
    let res = account.store().await;
    assert!(matches!(res, Err(Error::ReadOnly { .. })), "{res:?}");
    assert!(start.elapsed() < Duration::from_secs(1));
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn managers_share_service_rows() -> TestResult {
    let dir = tempfile::tempdir()?;
    let bus = Arc::new(LocalBus::new());
    let a = manager(dir.path(), &bus)?;
    let b = manager(dir.path(), &bus)?;

    let store = |manager: Manager| async move {
        let service = manager.get_service("p-mail")?.expect("known service");
        let account = manager.create_account("p");
        account.select_service(Some(&service))?;
        account.set_value("server/port", 995u32);
        account.store().await?;
        account_registry::Result::<_, Error>::Ok((account, service))
    };
    let (res_a, res_b) = tokio::join!(store(a.clone()), store(b.clone()));
    let (account_a, service_a) = res_a?;
    let (account_b, service_b) = res_b?;
    assert_eq!(service_a.id(), service_b.id());
    assert_ne!(account_a.id(), account_b.id());

    let c = manager(dir.path(), &bus)?;
    let service = c.get_service("p-mail")?.expect("known service");
    assert_eq!(service.id(), service_a.id());
    for id in [account_a.id(), account_b.id()] {
        let account = c.get_account(id)?;
        account.select_service(Some(&service))?;
        assert_eq!(
            account.get_value("server/port"),
            (Some(Value::U32(995)), SettingSource::Account)
        );
    }
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn changes_reach_other_managers() -> TestResult {
    let dir = tempfile::tempdir()?;
    let bus = Arc::new(LocalBus::new());
    let writer = manager(dir.path(), &bus)?;
    let reader = Manager::spawn(
        config(dir.path()).with_service_type("e-mail"),
        bus.clone(),
        templates(),
    )?;
    let reader_events = reader.subscribe();
    let writer_events = writer.subscribe();

    let mail = writer.get_service("p-mail")?.expect("known service");
    let account = writer.create_account("p");
    account.set_display_name("remote");
    account.select_service(Some(&mail))?;
    account.set_enabled(true);
    account.store().await?;
    let id = account.id();

    wait_until(|| reader_events.len() >= 2).await;
    let events: Vec<_> = reader_events.drain().collect();
    assert_eq!(
        events,
        vec![ManagerEvent::EnabledEvent(id), ManagerEvent::AccountCreated(id)]
    );
    assert_eq!(
        writer_events.drain().collect::<Vec<_>>(),
        vec![ManagerEvent::AccountCreated(id)]
    );

    // the reader keeps the new account around for a while, built from the notification
    let remote = reader.get_account(id)?;
    assert_eq!(remote.display_name().as_deref(), Some("remote"));
    let names: Vec<_> = remote
        .list_enabled_services()?
        .iter()
        .map(|s| s.name().to_string())
        .collect();
    assert_eq!(names, vec!["p-mail"]);
    assert_eq!(reader.metrics().foreign_accounts.get(), 1);

    // updates to a loaded account
    let remote_mail = reader.get_service("p-mail")?.expect("known service");
    remote.select_service(Some(&remote_mail))?;
    let fired = Arc::new(AtomicUsize::new(0));
    remote.watch_key("server/port", {
        let fired = fired.clone();
        move |_, _| {
            fired.fetch_add(1, Ordering::SeqCst);
        }
    });
    account.set_value("server/port", 995u32);
    account.store().await?;
    wait_until(|| fired.load(Ordering::SeqCst) == 1).await;
    assert_eq!(
        remote.get_value("server/port"),
        (Some(Value::U32(995)), SettingSource::Account)
    );
    wait_until(|| !reader_events.is_empty()).await;
    assert_eq!(reader_events.try_recv()?, ManagerEvent::AccountUpdated(id));

    account.delete();
    account.store().await?;
    wait_until(|| remote.is_deleted()).await;
    wait_until(|| !reader_events.is_empty()).await;
    assert_eq!(reader_events.try_recv()?, ManagerEvent::AccountDeleted(id));
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn duplicate_notifications_apply_once() -> TestResult {
    let dir = tempfile::tempdir()?;
    let writer_bus = Arc::new(LocalBus::new());
    let reader_bus = Arc::new(LocalBus::new());
    let writer = manager(dir.path(), &writer_bus)?;
    let reader = manager(dir.path(), &reader_bus)?;
    let sent = writer_bus.subscribe(None);

    let mail = writer.get_service("p-mail")?.expect("known service");
    let account = writer.create_account("p");
    account.store().await?;
    let id = account.id();
    sent.drain().for_each(drop);

    let remote = reader.get_account(id)?;
    let remote_mail = reader.get_service("p-mail")?.expect("known service");
    remote.select_service(Some(&remote_mail))?;
    let fired = Arc::new(AtomicUsize::new(0));
    remote.watch_key("server/port", {
        let fired = fired.clone();
        move |_, _| {
            fired.fetch_add(1, Ordering::SeqCst);
        }
    });

    account.select_service(Some(&mail))?;
    account.set_value("server/port", 995u32);
    account.store().await?;
    // one message on the global topic and one on the e-mail topic
    let messages: Vec<_> = sent.drain().collect();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].payload, messages[1].payload);
    for msg in messages.iter().chain(messages.iter().take(1)) {
        reader_bus.emit(&msg.topic, msg.payload.clone())?;
    }

    wait_until(|| reader.metrics().notifications_received.get() == 3).await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(reader.metrics().notifications_skipped.get(), 2);
    assert_eq!(
        remote.get_value("server/port"),
        (Some(Value::U32(995)), SettingSource::Account)
    );
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn failed_first_store_still_creates() -> TestResult {
    let dir = tempfile::tempdir()?;
    let bus = Arc::new(LocalBus::new());
    let writer = manager(dir.path(), &bus)?;
    let reader = manager(dir.path(), &bus)?;
    writer.set_db_timeout(Duration::from_millis(100));
    let writer_events = writer.subscribe();
    let reader_events = reader.subscribe();

    // a retry without further edits
    let account = writer.create_account("p");
    let (locker, locked) = hold_lock(&config(dir.path()).database_path()?, Duration::from_millis(400));
    locked.recv()?;
    let res = account.store().await;
    assert!(matches!(res, Err(Error::DatabaseLocked { .. })), "{res:?}");
    locker.join().expect("locker thread");
    account.store().await?;
    let id = account.id();
    assert_ne!(id, 0);
    assert_eq!(writer.list()?, vec![id]);
    assert_eq!(
        writer_events.drain().collect::<Vec<_>>(),
        vec![ManagerEvent::AccountCreated(id)]
    );
    wait_until(|| !reader_events.is_empty()).await;
    assert_eq!(reader_events.try_recv()?, ManagerEvent::AccountCreated(id));

    // a retry with further edits
    let other = writer.create_account("q");
    let cancel = CancellationToken::new();
    cancel.cancel();
    let res = other.store_with_cancel(&cancel).await;
    assert!(matches!(res, Err(Error::Cancelled { .. })), "{res:?}");
    other.set_enabled(true);
    other.store().await?;
    let other_id = other.id();
    assert_ne!(other_id, 0);
    assert_eq!(
        writer_events.drain().collect::<Vec<_>>(),
        vec![ManagerEvent::AccountCreated(other_id)]
    );
    wait_until(|| !reader_events.is_empty()).await;
    assert_eq!(reader_events.try_recv()?, ManagerEvent::AccountCreated(other_id));
    let remote = reader.get_account(other_id)?;
    assert_eq!(remote.provider_name(), "q");
    assert!(remote.enabled());
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn own_change_wins_over_earlier_foreign_change() -> TestResult {
    let dir = tempfile::tempdir()?;
    let bus = Arc::new(LocalBus::new());
    let a = manager(dir.path(), &bus)?;
    let b = manager(dir.path(), &bus)?;

    let local = a.create_account("p");
    local.store().await?;
    let id = local.id();
    wait_until(|| {
        a.metrics().notifications_received.get() == 1
            && b.metrics().notifications_received.get() == 1
    })
    .await;
    let remote = b.get_account(id)?;

    // b commits first, a commits before seeing b's notification
    remote.set_value("k", 2i32);
    remote.store().await?;
    local.set_value("k", 1i32);
    local.store().await?;

    wait_until(|| {
        a.metrics().notifications_received.get() == 3
            && b.metrics().notifications_received.get() == 3
    })
    .await;
    let expected = (Some(Value::I32(1)), SettingSource::Account);
    assert_eq!(local.get_value("k"), expected);
    assert_eq!(remote.get_value("k"), expected);
    assert_eq!(a.metrics().notifications_reprocessed.get(), 1);
    assert_eq!(b.metrics().notifications_reprocessed.get(), 0);

    let fresh = manager(dir.path(), &bus)?;
    assert_eq!(fresh.get_account(id)?.get_value("k"), expected);
    Ok(())
}

#[tokio::test]
#[traced_test]
#[ignore = "requires a D-Bus session bus"]
async fn changes_cross_the_session_bus() -> TestResult {
    let dir = tempfile::tempdir()?;
    let writer = Manager::connect(config(dir.path()), templates()).await?;
    let reader = Manager::connect(config(dir.path()), templates()).await?;
    let events = reader.subscribe();

    let account = writer.create_account("p");
    account.set_display_name("remote");
    account.store().await?;
    let id = account.id();

    wait_until(|| !events.is_empty()).await;
    assert_eq!(events.try_recv()?, ManagerEvent::AccountCreated(id));
    let remote = reader.get_account(id)?;
    assert_eq!(remote.display_name().as_deref(), Some("remote"));
    Ok(())
}
