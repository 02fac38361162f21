use chrono::SubsecRound;
use rand::{distributions::Alphanumeric, Rng};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use hooksink_core::{types::Listener, types::API_KEY_PREFIX, Clock};
use hooksink_storage::{Database, ListenerError, ListenerWithCount};

const API_KEY_RANDOM_LEN: usize = 32;
// Retries on api key collisions.
const CREATE_ATTEMPTS: usize = 3;

/// `wh_` followed by 32 random alphanumerics.
pub fn generate_api_key() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(API_KEY_RANDOM_LEN)
        .map(char::from)
        .collect();
    format!("{API_KEY_PREFIX}{suffix}")
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("could not allocate a unique api key")]
    KeyExhausted,
    #[error(transparent)]
    Storage(#[from] ListenerError),
}

/// Create/read/delete over listeners and their API keys.
#[derive(Clone)]
pub struct ListenerRegistry {
    database: Database,
    clock: Clock,
}

impl ListenerRegistry {
    pub fn new(database: Database, clock: Clock) -> Self {
        Self { database, clock }
    }

    pub async fn create(&self, name: Option<String>) -> Result<Listener, RegistryError> {
        let name = name
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        for _ in 0..CREATE_ATTEMPTS {
            let listener = Listener {
                id: Uuid::new_v4().to_string(),
                name: name.clone(),
                api_key: generate_api_key(),
                // Stored with millisecond precision.
                created_at: (self.clock)().trunc_subsecs(3),
            };
            match self.database.listeners().create(&listener).await {
                Ok(()) => {
                    info!(stage = "api", listener_id = %listener.id, "listener created");
                    return Ok(listener);
                }
                Err(ListenerError::DuplicateApiKey) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(RegistryError::KeyExhausted)
    }

    pub async fn get(&self, id: &str) -> Result<Option<ListenerWithCount>, RegistryError> {
        Ok(self.database.listeners().find_with_count(id).await?)
    }

    pub async fn list(&self) -> Result<Vec<ListenerWithCount>, RegistryError> {
        Ok(self.database.listeners().list_with_counts().await?)
    }

    /// Deletes the listener and every request it captured.
    pub async fn delete(&self, id: &str) -> Result<bool, RegistryError> {
        let deleted = self.database.listeners().delete(id).await?;
        if deleted {
            info!(stage = "api", listener_id = %id, "listener deleted");
        }
        Ok(deleted)
    }

    /// Constant-time comparison of a presented key against the listener's key.
    pub fn authorize(listener: &Listener, presented: &str) -> bool {
        listener
            .api_key
            .as_bytes()
            .ct_eq(presented.as_bytes())
            .into()
    }
}
