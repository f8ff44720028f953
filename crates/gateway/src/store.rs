use async_trait::async_trait;
use parking_lot::Mutex;
use proto::{Identity, StoreError};
use sqlx::{Row, migrate::Migrator, sqlite::SqlitePool};
use tracing::{debug, info};

/// Schema migrations, embedded at build time.
static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

/// Persisted record of the linked device.
#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Identity of the first stored device, if any.
    async fn first_device(&self) -> Result<Option<Identity>, StoreError>;
    /// Records a newly linked device.
    async fn save_device(&self, identity: &Identity) -> Result<(), StoreError>;
    /// Forgets a device after logout.
    async fn delete_device(&self, identity: &Identity) -> Result<(), StoreError>;
}

/// SQLite-backed device store
pub struct SqliteDeviceStore {
    pool: SqlitePool,
}

impl SqliteDeviceStore {
    /// Open (or create) the SQLite database and run migrations
    pub async fn open(db_url: &str) -> Result<Self, StoreError> {
        // Expand ~ in path
        let url = if db_url.starts_with('~') {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            db_url.replacen('~', &home, 1)
        } else {
            db_url.to_string()
        };

        if let Some(parent) = std::path::Path::new(&url).parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Sqlx(e.to_string()))?;
        }

        let pool = SqlitePool::connect(&format!("sqlite:{url}?mode=rwc"))
            .await
            .map_err(|e| StoreError::Sqlx(e.to_string()))?;
        let store = Self::with_pool(pool).await?;
        info!("Device store opened: {url}");
        Ok(store)
    }

    /// Wraps an existing pool and runs migrations on it.
    pub async fn with_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl DeviceStore for SqliteDeviceStore {
    async fn first_device(&self) -> Result<Option<Identity>, StoreError> {
        let row = sqlx::query("SELECT jid_user FROM devices ORDER BY paired_at ASC LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Sqlx(e.to_string()))?;
        Ok(row.map(|row| Identity(row.get::<String, _>("jid_user"))))
    }

    async fn save_device(&self, identity: &Identity) -> Result<(), StoreError> {
        sqlx::query("INSERT OR REPLACE INTO devices (jid_user, paired_at) VALUES (?, ?)")
            .bind(identity.as_str())
            .bind(chrono::Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Sqlx(e.to_string()))?;
        debug!(identity = %identity, "Device saved");
        Ok(())
    }

    async fn delete_device(&self, identity: &Identity) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM devices WHERE jid_user = ?")
            .bind(identity.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Sqlx(e.to_string()))?;
        debug!(identity = %identity, "Device deleted");
        Ok(())
    }
}

/// Process-local device store, for tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct MemoryDeviceStore {
    devices: Mutex<Vec<Identity>>,
}

impl MemoryDeviceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with one device.
    pub fn with_device(identity: Identity) -> Self {
        Self {
            devices: Mutex::new(vec![identity]),
        }
    }
}

#[async_trait]
impl DeviceStore for MemoryDeviceStore {
    async fn first_device(&self) -> Result<Option<Identity>, StoreError> {
        Ok(self.devices.lock().first().cloned())
    }

    async fn save_device(&self, identity: &Identity) -> Result<(), StoreError> {
        let mut devices = self.devices.lock();
        if !devices.contains(identity) {
            devices.push(identity.clone());
        }
        Ok(())
    }

    async fn delete_device(&self, identity: &Identity) -> Result<(), StoreError> {
        self.devices.lock().retain(|d| d != identity);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    async fn open_temp_store() -> (SqliteDeviceStore, tempfile::TempDir, PathBuf) {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let db_path = tempdir.path().join("nested").join("devices.db");
        let db_path_str = db_path.to_string_lossy().to_string();
        let store = SqliteDeviceStore::open(&db_path_str)
            .await
            .expect("store should open");
        (store, tempdir, db_path)
    }

    #[test]
    fn migrations_are_embedded_in_the_binary() {
        assert!(MIGRATOR.iter().any(|m| m.description.contains("devices")));
    }

    #[tokio::test]
    async fn open_creates_database_and_parent_dir() {
        let (store, _tmp, db_path) = open_temp_store().await;
        assert!(db_path.exists());
        assert_eq!(store.first_device().await.expect("query"), None);
    }

    #[tokio::test]
    async fn save_then_delete_device() {
        let (store, _tmp, _path) = open_temp_store().await;
        let identity = Identity::from("628123");

        store.save_device(&identity).await.expect("save");
        store.save_device(&identity).await.expect("save twice");
        assert_eq!(
            store.first_device().await.expect("query"),
            Some(identity.clone())
        );

        store.delete_device(&identity).await.expect("delete");
        assert_eq!(store.first_device().await.expect("query"), None);
    }

    #[tokio::test]
    async fn device_survives_reopen() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let db_path = tempdir.path().join("devices.db");
        let url = db_path.to_string_lossy().to_string();
        {
            let store = SqliteDeviceStore::open(&url).await.expect("open");
            store
                .save_device(&Identity::from("15551234567"))
                .await
                .expect("save");
        }
        let reopened = SqliteDeviceStore::open(&url).await.expect("reopen");
        assert_eq!(
            reopened.first_device().await.expect("query"),
            Some(Identity::from("15551234567"))
        );
    }

    #[tokio::test]
    async fn in_memory_pool_runs_migrations() {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("pool");
        let store = SqliteDeviceStore::with_pool(pool).await.expect("migrate");
        store
            .save_device(&Identity::from("1"))
            .await
            .expect("save");
        assert!(store.first_device().await.expect("query").is_some());
    }

    #[tokio::test]
    async fn memory_store_behaves_like_a_set() {
        let store = MemoryDeviceStore::new();
        let id = Identity::from("a");
        store.save_device(&id).await.expect("save");
        store.save_device(&id).await.expect("save");
        store.delete_device(&id).await.expect("delete");
        assert_eq!(store.first_device().await.expect("query"), None);
    }
}
