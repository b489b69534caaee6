//! Backend selection and engine construction.

use crate::config::{BackendConfig, Config, LocalConfig, PoolConfig, RemoteConfig};
use crate::db::migrations::{ensure_schema, seed_if_empty};
use crate::db::proxy::{CloudSqlProxy, ProxyError};
use crate::db::session::{Engine, EnginePool};
use crate::db::StoreError;
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions, MySqlSslMode};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePoolOptions};
use std::path::PathBuf;
use thiserror::Error;
use tracing::{info, warn};

/// Startup failures. All of them are fatal: the process must not serve.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Failed to prepare database directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Proxy(#[from] ProxyError),
    #[error("Failed to connect to {backend} database: {source}")]
    Connect {
        backend: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("Failed to create schema: {0}")]
    Schema(#[source] StoreError),
    #[error("Failed to seed sample contacts: {0}")]
    Seed(#[source] StoreError),
}

/// Build the process-wide engine from the startup configuration.
///
/// Also makes sure the `contacts` table exists and, when enabled, seeds it.
/// A remote backend that cannot be reached is an error; there is no silent
/// fallback to the local file.
pub async fn resolve(config: &Config) -> Result<Engine, ResolveError> {
    let engine = match &config.backend {
        BackendConfig::Local(local) => connect_local(local, &config.pool).await?,
        BackendConfig::Remote(remote) => connect_remote(remote, &config.pool).await?,
    };

    if let Err(e) = prepare(&engine, config.seed_sample_contacts).await {
        engine.close().await;
        return Err(e);
    }

    Ok(engine)
}

async fn prepare(engine: &Engine, seed: bool) -> Result<(), ResolveError> {
    ensure_schema(engine).await.map_err(ResolveError::Schema)?;
    if seed {
        seed_if_empty(engine).await.map_err(ResolveError::Seed)?;
    }
    Ok(())
}

async fn connect_local(local: &LocalConfig, pool: &PoolConfig) -> Result<Engine, ResolveError> {
    if !local.ignored_remote_vars.is_empty() {
        warn!(
            set = ?local.ignored_remote_vars,
            "Cloud SQL configuration is incomplete; falling back to the local SQLite database"
        );
    }

    let path = &local.database_path;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|source| ResolveError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);

    let sqlite = SqlitePoolOptions::new()
        .max_connections(pool.max_connections)
        .acquire_timeout(pool.acquire_timeout)
        .test_before_acquire(true)
        .after_connect(|conn, _meta| Box::pin(async move { configure_pragmas_conn(conn).await }))
        .connect_with(options)
        .await
        .map_err(|source| ResolveError::Connect {
            backend: "local SQLite",
            source,
        })?;

    info!(path = %path.display(), "Using local SQLite database");
    Ok(Engine::new(EnginePool::Sqlite(sqlite), None))
}

async fn connect_remote(remote: &RemoteConfig, pool: &PoolConfig) -> Result<Engine, ResolveError> {
    let proxy = CloudSqlProxy::start(remote).await?;

    let addr = proxy.addr();
    let options = MySqlConnectOptions::new()
        .host(&addr.ip().to_string())
        .port(addr.port())
        .username(&remote.db_user)
        .password(&remote.db_pass)
        .database(&remote.db_name)
        // The proxy already encrypts the hop to Cloud SQL.
        .ssl_mode(MySqlSslMode::Disabled);

    // `connect_with` opens one connection up front, so bad credentials fail here.
    let mysql = match MySqlPoolOptions::new()
        .max_connections(pool.max_connections)
        .acquire_timeout(pool.acquire_timeout)
        .test_before_acquire(true)
        .connect_with(options)
        .await
    {
        Ok(mysql) => mysql,
        Err(source) => {
            proxy.shutdown().await;
            return Err(ResolveError::Connect {
                backend: "Cloud SQL",
                source,
            });
        }
    };

    info!(
        instance = %remote.instance_connection_name,
        database = %remote.db_name,
        "Using Google Cloud SQL database"
    );
    Ok(Engine::new(EnginePool::MySql(mysql), Some(proxy)))
}

/// Configure SQLite pragmas on every new connection.
async fn configure_pragmas_conn(conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
    use sqlx::Row;

    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&mut *conn)
        .await?;

    // journal_mode returns the actual mode set; must use fetch to get result
    let row = sqlx::query("PRAGMA journal_mode = WAL")
        .fetch_one(&mut *conn)
        .await?;
    let journal_mode: String = row.get(0);
    tracing::debug!("SQLite journal_mode set to: {}", journal_mode);

    sqlx::query("PRAGMA busy_timeout = 5000")
        .execute(&mut *conn)
        .await?;
    sqlx::query("PRAGMA synchronous = NORMAL")
        .execute(&mut *conn)
        .await?;

    Ok(())
}
