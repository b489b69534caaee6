//! Contact operations, one scoped session each.

use crate::db::{Engine, StoreError};
use crate::domain::{Contact, NewContact};
use async_trait::async_trait;
use tracing::{debug, info};

/// Storage operations the HTTP layer depends on.
#[async_trait]
pub trait ContactStore: Send + Sync {
    /// All contacts ordered by ascending id. An empty list is not an error.
    async fn list_contacts(&self) -> Result<Vec<Contact>, StoreError>;

    /// Insert a contact and return its newly assigned id.
    async fn create_contact(&self, name: &str, address: &str) -> Result<i64, StoreError>;

    /// Delete a contact. Deleting an id that does not exist succeeds.
    async fn delete_contact(&self, id: i64) -> Result<(), StoreError>;

    /// Prove the backend answers a trivial query.
    async fn health_check(&self) -> Result<(), StoreError>;
}

/// `ContactStore` backed by the resolved engine.
#[derive(Debug, Clone)]
pub struct ContactRepository {
    engine: Engine,
}

impl ContactRepository {
    pub fn new(engine: Engine) -> Self {
        ContactRepository { engine }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }
}

#[async_trait]
impl ContactStore for ContactRepository {
    async fn list_contacts(&self) -> Result<Vec<Contact>, StoreError> {
        self.engine
            .with_session(|session| Box::pin(async move { session.list_contacts().await }))
            .await
    }

    async fn create_contact(&self, name: &str, address: &str) -> Result<i64, StoreError> {
        // Validate before a connection is leased so invalid input never reaches the table.
        let contact = NewContact::new(name, address)?;

        let id = self
            .engine
            .with_session(move |session| {
                Box::pin(async move { session.insert_contact(&contact).await })
            })
            .await?;

        info!(id, name = %name, "Contact created");
        Ok(id)
    }

    async fn delete_contact(&self, id: i64) -> Result<(), StoreError> {
        let removed = self
            .engine
            .with_session(move |session| {
                Box::pin(async move { session.delete_contact(id).await })
            })
            .await?;

        if removed == 0 {
            debug!(id, "Delete of missing contact ignored");
        } else {
            info!(id, "Contact deleted");
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        self.engine
            .with_session(|session| Box::pin(async move { session.ping().await }))
            .await
    }
}
