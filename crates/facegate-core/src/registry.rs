//! The persisted registry of enrolled users.

use crate::store::{RegistryStore, StoreError};
use crate::types::UserRecord;
use chrono::Utc;
use facegate_hw::EncodedImage;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("invalid enrollment: {0}")]
    Validation(String),
    #[error("storage: {0}")]
    Store(#[from] StoreError),
}

/// Ordered collection of [`UserRecord`]s on top of a [`RegistryStore`].
///
/// Every mutation reloads the current list, applies the change and saves
/// it back while holding one lock, so concurrent adds and removes in the
/// same process never lose updates. Duplicate employee IDs are accepted.
pub struct UserRegistry {
    store: Box<dyn RegistryStore>,
    lock: Mutex<()>,
}

impl UserRegistry {
    pub fn new(store: Box<dyn RegistryStore>) -> Self {
        Self {
            store,
            lock: Mutex::new(()),
        }
    }

    /// All users in insertion order.
    pub async fn list(&self) -> Result<Vec<UserRecord>, RegistryError> {
        let _guard = self.lock.lock().await;
        Ok(self.store.load().await?)
    }

    pub async fn get(&self, id: &str) -> Result<Option<UserRecord>, RegistryError> {
        Ok(self.list().await?.into_iter().find(|u| u.id == id))
    }

    /// Validate and append a new user. Nothing is written when validation fails.
    pub async fn add(
        &self,
        name: &str,
        employee_id: &str,
        image: EncodedImage,
    ) -> Result<UserRecord, RegistryError> {
        let name = name.trim();
        let employee_id = employee_id.trim();
        if name.is_empty() {
            return Err(RegistryError::Validation("name is required".into()));
        }
        if employee_id.is_empty() {
            return Err(RegistryError::Validation("employee ID is required".into()));
        }
        if image.is_empty() {
            return Err(RegistryError::Validation("a captured photo is required".into()));
        }

        let _guard = self.lock.lock().await;
        // Stamped under the lock so list order and timestamps agree.
        let record = UserRecord {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            employee_id: employee_id.to_string(),
            image_data: image,
            registered_at: Utc::now(),
        };
        let mut users = self.store.load().await?;
        users.push(record.clone());
        self.store.save(&users).await?;

        tracing::info!(
            id = %record.id,
            employee_id = %record.employee_id,
            total = users.len(),
            "user registered"
        );
        Ok(record)
    }

    /// Delete the user with `id`. Unknown ids are ignored.
    pub async fn remove(&self, id: &str) -> Result<(), RegistryError> {
        let _guard = self.lock.lock().await;
        let mut users = self.store.load().await?;
        let before = users.len();
        users.retain(|u| u.id != id);
        if users.len() == before {
            tracing::debug!(id, "remove: no such user");
            return Ok(());
        }
        self.store.save(&users).await?;
        tracing::info!(id, remaining = users.len(), "user removed");
        Ok(())
    }
}
