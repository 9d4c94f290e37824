use crate::config::Config;
use crate::traits::{ContextStore, StoreError};
use std::sync::Arc;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

pub async fn create_store(config: &Config) -> Result<Arc<dyn ContextStore>, StoreError> {
    if config.ephemeral {
        return Ok(Arc::new(MemoryStore::new()));
    }

    let path = config.resolved_db_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| StoreError::Backend(format!("cannot create {}: {e}", parent.display())))?;
    }
    Ok(Arc::new(SqliteStore::open(path).await?))
}

pub(crate) fn default_title(now: chrono::DateTime<chrono::Utc>) -> String {
    format!("Chat {}", now.format("%Y-%m-%d %H:%M"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn factory_respects_ephemeral_flag() {
        let config = Config {
            ephemeral: true,
            ..Config::default()
        };
        let store = create_store(&config).await.unwrap();
        let session = store.create_session("u1", None).await.unwrap();
        assert!(session.title.starts_with("Chat "));
    }
}
