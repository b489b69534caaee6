//! Schema creation and first-run seeding.

use crate::db::session::{Engine, EnginePool};
use crate::db::StoreError;
use crate::domain::NewContact;
use tracing::info;

const SQLITE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS contacts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name VARCHAR(100) NOT NULL
        CHECK (length(trim(name)) > 0 AND length(name) <= 100),
    address VARCHAR(500) NOT NULL
        CHECK (length(trim(address)) > 0 AND length(address) <= 500)
)
"#;

// VARCHAR limits are enforced by MySQL itself in strict mode.
const MYSQL_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS contacts (
    id INT NOT NULL AUTO_INCREMENT,
    name VARCHAR(100) NOT NULL,
    address VARCHAR(500) NOT NULL,
    PRIMARY KEY (id),
    CONSTRAINT contacts_name_not_blank CHECK (CHAR_LENGTH(TRIM(name)) > 0),
    CONSTRAINT contacts_address_not_blank CHECK (CHAR_LENGTH(TRIM(address)) > 0)
)
"#;

/// Rows inserted into an empty table on first start.
pub const SAMPLE_CONTACTS: [(&str, &str); 3] = [
    ("John Doe", "123 Main Street, New York, NY 10001"),
    ("Jane Smith", "456 Oak Avenue, Los Angeles, CA 90210"),
    ("Mike Johnson", "789 Pine Road, Chicago, IL 60601"),
];

/// Schema statement for the backend the pool talks to.
pub(crate) fn schema_for(pool: &EnginePool) -> &'static str {
    match pool {
        EnginePool::Sqlite(_) => SQLITE_SCHEMA,
        EnginePool::MySql(_) => MYSQL_SCHEMA,
    }
}

/// Create the `contacts` table if it does not exist yet.
pub async fn ensure_schema(engine: &Engine) -> Result<(), StoreError> {
    if engine.is_closed() {
        return Err(StoreError::Closed);
    }
    let schema = schema_for(engine.pool());
    match engine.pool() {
        EnginePool::Sqlite(pool) => {
            sqlx::query(schema).execute(pool).await?;
        }
        EnginePool::MySql(pool) => {
            sqlx::query(schema).execute(pool).await?;
        }
    }
    info!("Contacts table is ready");
    Ok(())
}

/// Insert the sample contacts when the table is empty.
///
/// The emptiness check and the insert are one statement, so the write lock is
/// taken before the table is inspected. Several processes seeding the same
/// empty database at once all succeed and the samples land exactly once.
/// Returns the number of rows inserted; zero when the table already had data.
pub async fn seed_if_empty(engine: &Engine) -> Result<usize, StoreError> {
    let samples = SAMPLE_CONTACTS
        .iter()
        .map(|(name, address)| NewContact::new(*name, *address))
        .collect::<Result<Vec<_>, _>>()?;

    let inserted = engine
        .with_session(move |session| {
            Box::pin(async move { session.insert_contacts_if_empty(&samples).await })
        })
        .await?;

    if inserted == 0 {
        info!("Contacts table already populated, skipping seed");
    } else {
        info!(count = inserted, "Seeded sample contacts");
    }
    Ok(inserted as usize)
}
