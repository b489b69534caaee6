//! Scoped database sessions over the resolved engine.
//!
//! Every unit of work runs inside a `Session`, a transaction on a connection
//! leased from the engine's pool. A session ends in exactly one of three ways:
//! `commit`, `rollback`, or being dropped (which rolls back). In all three the
//! connection goes back to the pool before the caller regains control.

use crate::db::proxy::CloudSqlProxy;
use crate::db::StoreError;
use crate::domain::{Contact, NewContact};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures::future::BoxFuture;
use sqlx::mysql::{MySql, MySqlPool};
use sqlx::sqlite::{Sqlite, SqlitePool};
use sqlx::{Row, Transaction};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Attempts made to open a session when the failure looks transient.
const BEGIN_ATTEMPTS: u32 = 3;

const LIST_CONTACTS: &str = "SELECT id, name, address FROM contacts ORDER BY id ASC";
const INSERT_CONTACT: &str = "INSERT INTO contacts (name, address) VALUES (?, ?)";
const DELETE_CONTACT: &str = "DELETE FROM contacts WHERE id = ?";
const COUNT_CONTACTS: &str = "SELECT COUNT(*) AS total FROM contacts";

/// A single statement that inserts `rows` contacts only when the table is
/// empty. Valid in both SQLite and MySQL; `ord` keeps the ids in input order.
fn insert_if_empty_sql(rows: usize) -> String {
    let samples = (0..rows)
        .map(|ord| format!("SELECT ? AS name, ? AS address, {} AS ord", ord))
        .collect::<Vec<_>>()
        .join(" UNION ALL ");
    format!(
        "INSERT INTO contacts (name, address) \
         SELECT name, address FROM ({}) AS samples \
         WHERE NOT EXISTS (SELECT 1 FROM contacts) \
         ORDER BY ord",
        samples
    )
}

/// MySQL reports ids as unsigned; contacts expose them as `i64`.
fn mysql_insert_id(id: u64) -> Result<i64, StoreError> {
    i64::try_from(id)
        .map_err(|_| StoreError::Database(format!("assigned id {} does not fit in i64", id)))
}

/// Which storage backend an engine talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Embedded SQLite file.
    Local,
    /// Cloud SQL for MySQL through the auth proxy.
    Remote,
}

#[derive(Debug, Clone)]
pub(crate) enum EnginePool {
    Sqlite(SqlitePool),
    MySql(MySqlPool),
}

/// Process-wide connection factory.
///
/// Cheap to clone; all clones share one pool and one proxy.
#[derive(Debug, Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

#[derive(Debug)]
struct EngineInner {
    pool: EnginePool,
    proxy: Option<CloudSqlProxy>,
    closed: AtomicBool,
    active: Arc<AtomicUsize>,
}

impl Engine {
    pub(crate) fn new(pool: EnginePool, proxy: Option<CloudSqlProxy>) -> Self {
        Engine {
            inner: Arc::new(EngineInner {
                pool,
                proxy,
                closed: AtomicBool::new(false),
                active: Arc::new(AtomicUsize::new(0)),
            }),
        }
    }

    pub(crate) fn pool(&self) -> &EnginePool {
        &self.inner.pool
    }

    pub fn backend(&self) -> BackendKind {
        match self.inner.pool {
            EnginePool::Sqlite(_) => BackendKind::Local,
            EnginePool::MySql(_) => BackendKind::Remote,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Number of sessions currently holding a connection.
    pub fn active_sessions(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Open a session: lease a connection and begin a transaction.
    ///
    /// Transient connection failures are retried a bounded number of times.
    /// Pool timeouts are returned immediately since the pool already waited.
    pub async fn begin(&self) -> Result<Session, StoreError> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }

        let mut policy = ExponentialBackoff {
            current_interval: Duration::from_millis(50),
            initial_interval: Duration::from_millis(50),
            max_interval: Duration::from_millis(500),
            max_elapsed_time: None,
            ..Default::default()
        };

        let mut attempt = 1;
        let tx = loop {
            match self.begin_tx().await {
                Ok(tx) => break tx,
                Err(e) if attempt < BEGIN_ATTEMPTS && StoreError::is_transient(&e) => {
                    let delay = policy.next_backoff().unwrap_or(policy.max_interval);
                    warn!(
                        attempt,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Database connection attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        };

        self.inner.active.fetch_add(1, Ordering::SeqCst);
        Ok(Session {
            tx,
            _lease: Lease {
                active: Arc::clone(&self.inner.active),
            },
        })
    }

    async fn begin_tx(&self) -> Result<SessionTx, sqlx::Error> {
        Ok(match &self.inner.pool {
            EnginePool::Sqlite(pool) => SessionTx::Sqlite(pool.begin().await?),
            EnginePool::MySql(pool) => SessionTx::MySql(pool.begin().await?),
        })
    }

    /// Run `work` inside a session.
    ///
    /// Commits when `work` returns `Ok`, rolls back when it returns `Err`.
    /// If `work` panics, the session is dropped during unwinding, which also
    /// rolls back and releases the connection.
    pub async fn with_session<T, F>(&self, work: F) -> Result<T, StoreError>
    where
        T: Send,
        F: for<'s> FnOnce(&'s mut Session) -> BoxFuture<'s, Result<T, StoreError>> + Send,
    {
        let mut session = self.begin().await?;
        match work(&mut session).await {
            Ok(value) => {
                session.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = session.rollback().await {
                    warn!(
                        error = %e,
                        rollback_error = %rollback_err,
                        "Rollback failed after session error"
                    );
                }
                Err(e)
            }
        }
    }

    /// Close the pool and stop the proxy. Later calls do nothing.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            debug!("Database engine already closed");
            return;
        }

        match &self.inner.pool {
            EnginePool::Sqlite(pool) => pool.close().await,
            EnginePool::MySql(pool) => pool.close().await,
        }
        if let Some(proxy) = &self.inner.proxy {
            proxy.shutdown().await;
        }
        info!(backend = ?self.backend(), "Database engine closed");
    }
}

enum SessionTx {
    Sqlite(Transaction<'static, Sqlite>),
    MySql(Transaction<'static, MySql>),
}

/// Decrements the engine's active-session count when the session ends.
struct Lease {
    active: Arc<AtomicUsize>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One unit of work. Never shared between concurrent operations.
#[must_use = "if unused, the session is immediately rolled back"]
pub struct Session {
    // Field order matters: the transaction is released before the lease.
    tx: SessionTx,
    _lease: Lease,
}

macro_rules! on_tx {
    ($session:expr, $conn:ident => $body:expr) => {
        match &mut $session.tx {
            SessionTx::Sqlite(tx) => {
                let $conn = &mut **tx;
                $body
            }
            SessionTx::MySql(tx) => {
                let $conn = &mut **tx;
                $body
            }
        }
    };
}

impl Session {
    pub async fn commit(self) -> Result<(), StoreError> {
        match self.tx {
            SessionTx::Sqlite(tx) => tx.commit().await?,
            SessionTx::MySql(tx) => tx.commit().await?,
        }
        Ok(())
    }

    pub async fn rollback(self) -> Result<(), StoreError> {
        match self.tx {
            SessionTx::Sqlite(tx) => tx.rollback().await?,
            SessionTx::MySql(tx) => tx.rollback().await?,
        }
        Ok(())
    }

    /// All contacts, ascending by id.
    pub async fn list_contacts(&mut self) -> Result<Vec<Contact>, StoreError> {
        on_tx!(self, conn => {
            let rows = sqlx::query(LIST_CONTACTS).fetch_all(conn).await?;
            Ok(rows
                .iter()
                .map(|row| Contact {
                    id: row.get("id"),
                    name: row.get("name"),
                    address: row.get("address"),
                })
                .collect())
        })
    }

    /// Insert a contact and return its assigned id.
    pub async fn insert_contact(&mut self, contact: &NewContact) -> Result<i64, StoreError> {
        let id = match &mut self.tx {
            SessionTx::Sqlite(tx) => sqlx::query(INSERT_CONTACT)
                .bind(contact.name())
                .bind(contact.address())
                .execute(&mut **tx)
                .await?
                .last_insert_rowid(),
            SessionTx::MySql(tx) => {
                let id = sqlx::query(INSERT_CONTACT)
                    .bind(contact.name())
                    .bind(contact.address())
                    .execute(&mut **tx)
                    .await?
                    .last_insert_id();
                mysql_insert_id(id)?
            }
        };
        Ok(id)
    }

    /// Insert all `contacts` if, and only if, the table has no rows.
    ///
    /// The write is the first statement, so on SQLite it waits for a
    /// concurrent writer instead of failing on a stale read snapshot.
    /// Returns the number of rows inserted.
    pub async fn insert_contacts_if_empty(
        &mut self,
        contacts: &[NewContact],
    ) -> Result<u64, StoreError> {
        if contacts.is_empty() {
            return Ok(0);
        }
        let sql = insert_if_empty_sql(contacts.len());
        on_tx!(self, conn => {
            let mut query = sqlx::query(&sql);
            for contact in contacts {
                query = query.bind(contact.name()).bind(contact.address());
            }
            Ok(query.execute(conn).await?.rows_affected())
        })
    }

    /// Delete by id, returning the number of rows removed (0 or 1).
    pub async fn delete_contact(&mut self, id: i64) -> Result<u64, StoreError> {
        on_tx!(self, conn => {
            let result = sqlx::query(DELETE_CONTACT).bind(id).execute(conn).await?;
            Ok(result.rows_affected())
        })
    }

    pub async fn count_contacts(&mut self) -> Result<i64, StoreError> {
        on_tx!(self, conn => {
            let row = sqlx::query(COUNT_CONTACTS).fetch_one(conn).await?;
            Ok(row.get::<i64, _>("total"))
        })
    }

    /// Round-trip a trivial query to prove the connection is alive.
    pub async fn ping(&mut self) -> Result<(), StoreError> {
        on_tx!(self, conn => {
            sqlx::query("SELECT 1").execute(conn).await?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrations::schema_for;
    use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions};

    #[test]
    fn test_insert_if_empty_sql_guards_on_empty_table() {
        let sql = insert_if_empty_sql(3);
        assert_eq!(sql.matches('?').count(), 6);
        assert_eq!(sql.matches("UNION ALL").count(), 2);
        assert!(sql.contains("WHERE NOT EXISTS (SELECT 1 FROM contacts)"));
        assert!(sql.ends_with("ORDER BY ord"));
    }

    #[test]
    fn test_mysql_insert_id_conversion() {
        assert_eq!(mysql_insert_id(42).unwrap(), 42);
        assert_eq!(mysql_insert_id(i64::MAX as u64).unwrap(), i64::MAX);
        assert!(matches!(
            mysql_insert_id(u64::MAX),
            Err(StoreError::Database(_))
        ));
    }

    // Nothing listens on port 1, so every connection attempt is refused.
    fn unreachable_mysql_engine() -> Engine {
        let pool = MySqlPoolOptions::new()
            .acquire_timeout(Duration::from_millis(300))
            .connect_lazy_with(MySqlConnectOptions::new().host("127.0.0.1").port(1));
        Engine::new(EnginePool::MySql(pool), None)
    }

    #[tokio::test]
    async fn test_mysql_engine_uses_mysql_dialect() {
        let engine = unreachable_mysql_engine();
        assert_eq!(engine.backend(), BackendKind::Remote);
        assert!(schema_for(engine.pool()).contains("AUTO_INCREMENT"));
        engine.close().await;
    }

    #[tokio::test]
    async fn test_unreachable_mysql_is_connection_unavailable() {
        let engine = unreachable_mysql_engine();

        let err = engine.begin().await.err().expect("begin should fail");
        assert!(
            matches!(err, StoreError::ConnectionUnavailable(_)),
            "unexpected error: {:?}",
            err
        );
        assert_eq!(engine.active_sessions(), 0);

        engine.close().await;
        assert!(matches!(engine.begin().await, Err(StoreError::Closed)));
    }
}
