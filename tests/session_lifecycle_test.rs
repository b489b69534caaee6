use contactbook::config::{Config, PoolConfig};
use contactbook::db::{resolve, ContactStore, StoreError};
use contactbook::domain::NewContact;
use contactbook::{ContactRepository, Engine};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

async fn setup_engine(pool: PoolConfig) -> (Engine, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let mut config = Config::local(temp_dir.path().join("test.db"));
    config.seed_sample_contacts = false;
    config.pool = pool;
    let engine = resolve(&config).await.expect("resolve failed");
    (engine, temp_dir)
}

async fn list_names(engine: &Engine) -> Vec<String> {
    engine
        .with_session(|s| Box::pin(async move { s.list_contacts().await }))
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.name)
        .collect()
}

#[tokio::test]
async fn test_error_after_write_rolls_back() {
    let (engine, _temp) = setup_engine(PoolConfig::default()).await;

    let result: Result<(), StoreError> = engine
        .with_session(|s| {
            Box::pin(async move {
                s.insert_contact(&NewContact::new("Half Written", "1 Partial Lane")?)
                    .await?;
                Err(StoreError::Database("simulated failure".to_string()))
            })
        })
        .await;

    assert!(matches!(result, Err(StoreError::Database(_))));
    assert!(list_names(&engine).await.is_empty());
    assert_eq!(engine.active_sessions(), 0);
}

#[tokio::test]
async fn test_panic_inside_session_rolls_back_and_releases() {
    let (engine, _temp) = setup_engine(PoolConfig::default()).await;

    let task_engine = engine.clone();
    let outcome = tokio::spawn(async move {
        task_engine
            .with_session(|s| {
                Box::pin(async move {
                    s.insert_contact(&NewContact::new("Doomed", "2 Panic Street")?)
                        .await?;
                    if s.count_contacts().await? > 0 {
                        panic!("caller code failed mid-session");
                    }
                    Ok(())
                })
            })
            .await
    })
    .await;

    assert!(outcome.unwrap_err().is_panic());
    assert_eq!(engine.active_sessions(), 0);
    assert!(list_names(&engine).await.is_empty());
}

#[tokio::test]
async fn test_dropped_session_rolls_back() {
    let (engine, _temp) = setup_engine(PoolConfig::default()).await;

    {
        let mut session = engine.begin().await.unwrap();
        session
            .insert_contact(&NewContact::new("Never Committed", "3 Drop Road").unwrap())
            .await
            .unwrap();
        assert_eq!(engine.active_sessions(), 1);
    }

    assert_eq!(engine.active_sessions(), 0);
    assert!(list_names(&engine).await.is_empty());
}

#[tokio::test]
async fn test_sequential_and_nested_sessions_release_connections() {
    let (engine, _temp) = setup_engine(PoolConfig {
        max_connections: 2,
        acquire_timeout: Duration::from_secs(5),
    })
    .await;

    // Far more sessions than pooled connections: a leak would exhaust the pool.
    for i in 0..20 {
        let outer = engine.begin().await.unwrap();
        let mut inner = engine.begin().await.unwrap();
        assert_eq!(engine.active_sessions(), 2);
        inner.ping().await.unwrap();
        inner.commit().await.unwrap();
        if i % 2 == 0 {
            outer.commit().await.unwrap();
        } else {
            outer.rollback().await.unwrap();
        }
        assert_eq!(engine.active_sessions(), 0);
    }
}

#[tokio::test]
async fn test_pool_exhaustion_times_out_as_connection_unavailable() {
    let (engine, _temp) = setup_engine(PoolConfig {
        max_connections: 1,
        acquire_timeout: Duration::from_millis(200),
    })
    .await;

    let held = engine.begin().await.unwrap();
    let err = engine.begin().await.err().expect("second session should time out");
    assert!(matches!(err, StoreError::ConnectionUnavailable(_)));
    assert_eq!(err.kind(), "connection_unavailable");

    held.rollback().await.unwrap();
    let session = engine.begin().await.expect("connection should be free again");
    session.commit().await.unwrap();
}

#[tokio::test]
async fn test_close_is_idempotent_and_blocks_new_sessions() {
    let (engine, _temp) = setup_engine(PoolConfig::default()).await;

    engine.close().await;
    engine.close().await;
    assert!(engine.is_closed());

    let err = engine.begin().await.err().expect("closed engine handed out a session");
    assert!(matches!(err, StoreError::Closed));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_creates_get_distinct_ids() {
    const N: usize = 24;
    let (engine, _temp) = setup_engine(PoolConfig::default()).await;
    let repo = Arc::new(ContactRepository::new(engine.clone()));

    let handles: Vec<_> = (0..N)
        .map(|i| {
            let repo = repo.clone();
            tokio::spawn(async move {
                repo.create_contact(&format!("Person {}", i), &format!("{} Parallel Street", i))
                    .await
            })
        })
        .collect();

    let mut ids = HashSet::new();
    for handle in handles {
        let id = handle.await.unwrap().expect("concurrent create failed");
        assert!(ids.insert(id), "duplicate id {}", id);
    }

    let contacts = repo.list_contacts().await.unwrap();
    assert_eq!(ids.len(), N);
    assert_eq!(contacts.len(), N);
    assert_eq!(engine.active_sessions(), 0);
}
