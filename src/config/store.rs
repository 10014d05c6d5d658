use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use super::AppConfig;
use crate::error::{AppError, Result};
use crate::video::parameter_set::{CodecParameterSet, ParameterSetRecord};
use crate::video::quality::QualityDescriptor;

/// Configuration store backed by SQLite
///
/// Uses `ArcSwap` for lock-free reads of the application config. Also keeps
/// the last parameter sets probed for each encoder and quality.
#[derive(Clone)]
pub struct ConfigStore {
    pool: Pool<Sqlite>,
    /// Lock-free cache using ArcSwap for zero-cost reads
    cache: Arc<ArcSwap<AppConfig>>,
}

/// Parameter sets persisted after a successful probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredParameterSet {
    pub mime: String,
    pub encoder: String,
    pub quality: QualityDescriptor,
    pub parameters: ParameterSetRecord,
    pub updated_at: DateTime<Utc>,
}

impl StoredParameterSet {
    pub fn to_parameter_set(&self) -> Result<CodecParameterSet> {
        CodecParameterSet::try_from(self.parameters.clone())
    }
}

type ParameterSetRow = (String, String, i64, i64, i64, i64, String, String, String, String);

impl ConfigStore {
    /// Create a new configuration store
    pub async fn new(db_path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

        let pool = SqlitePoolOptions::new()
            // SQLite is single-writer; one connection for reads, one for writes
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(5))
            .idle_timeout(Duration::from_secs(300))
            .connect(&db_url)
            .await?;

        Self::init_schema(&pool).await?;

        let config = Self::load_config(&pool).await?;
        let cache = Arc::new(ArcSwap::from_pointee(config));

        Ok(Self { pool, cache })
    }

    /// Initialize database schema
    async fn init_schema(pool: &Pool<Sqlite>) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS config (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS parameter_sets (
                mime TEXT NOT NULL,
                encoder TEXT NOT NULL,
                width INTEGER NOT NULL,
                height INTEGER NOT NULL,
                framerate INTEGER NOT NULL,
                bitrate INTEGER NOT NULL,
                sps TEXT NOT NULL,
                pps TEXT NOT NULL,
                profile_level_id TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (mime, encoder, width, height, framerate, bitrate)
            )
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Load configuration from database
    async fn load_config(pool: &Pool<Sqlite>) -> Result<AppConfig> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM config WHERE key = 'app_config'")
                .fetch_optional(pool)
                .await?;

        match row {
            Some((json,)) => {
                serde_json::from_str(&json).map_err(|e| AppError::Config(e.to_string()))
            }
            None => {
                let config = AppConfig::default();
                Self::save_config_to_db(pool, &config).await?;
                Ok(config)
            }
        }
    }

    /// Save configuration to database
    async fn save_config_to_db(pool: &Pool<Sqlite>, config: &AppConfig) -> Result<()> {
        let json = serde_json::to_string(config)?;

        sqlx::query(
            r#"
            INSERT INTO config (key, value, updated_at)
            VALUES ('app_config', ?1, datetime('now'))
            ON CONFLICT(key) DO UPDATE SET value = ?1, updated_at = datetime('now')
            "#,
        )
        .bind(&json)
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Get current configuration (lock-free)
    pub fn get(&self) -> Arc<AppConfig> {
        self.cache.load_full()
    }

    /// Replace the configuration after validating it
    pub async fn set(&self, config: AppConfig) -> Result<()> {
        config.validate()?;
        Self::save_config_to_db(&self.pool, &config).await?;
        self.cache.store(Arc::new(config));
        Ok(())
    }

    /// Update configuration with a closure
    ///
    /// Read-modify-write; with concurrent updates the last write wins.
    pub async fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut AppConfig),
    {
        let current = self.cache.load();
        let mut config = (**current).clone();
        f(&mut config);
        self.set(config).await
    }

    /// Persist the parameter sets probed for `(mime, encoder, quality)`
    pub async fn save_parameter_set(
        &self,
        mime: &str,
        encoder: &str,
        quality: &QualityDescriptor,
        params: &CodecParameterSet,
    ) -> Result<()> {
        let record = params.to_record();
        sqlx::query(
            r#"
            INSERT INTO parameter_sets
                (mime, encoder, width, height, framerate, bitrate, sps, pps, profile_level_id, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(mime, encoder, width, height, framerate, bitrate) DO UPDATE SET
                sps = ?7, pps = ?8, profile_level_id = ?9, updated_at = ?10
            "#,
        )
        .bind(mime)
        .bind(encoder)
        .bind(quality.width as i64)
        .bind(quality.height as i64)
        .bind(quality.framerate as i64)
        .bind(quality.bitrate as i64)
        .bind(&record.sps)
        .bind(&record.pps)
        .bind(&record.profile_level_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Parameter sets stored for one encoder and quality
    pub async fn parameter_set(
        &self,
        mime: &str,
        encoder: &str,
        quality: &QualityDescriptor,
    ) -> Result<Option<StoredParameterSet>> {
        let row: Option<ParameterSetRow> = sqlx::query_as(
            r#"
            SELECT mime, encoder, width, height, framerate, bitrate, sps, pps, profile_level_id, updated_at
            FROM parameter_sets
            WHERE mime = ?1 AND encoder = ?2 AND width = ?3 AND height = ?4
                AND framerate = ?5 AND bitrate = ?6
            "#,
        )
        .bind(mime)
        .bind(encoder)
        .bind(quality.width as i64)
        .bind(quality.height as i64)
        .bind(quality.framerate as i64)
        .bind(quality.bitrate as i64)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_stored).transpose()
    }

    /// All stored parameter sets, most recent first
    pub async fn list_parameter_sets(&self) -> Result<Vec<StoredParameterSet>> {
        let rows: Vec<ParameterSetRow> = sqlx::query_as(
            r#"
            SELECT mime, encoder, width, height, framerate, bitrate, sps, pps, profile_level_id, updated_at
            FROM parameter_sets
            ORDER BY updated_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_stored).collect()
    }

    fn row_to_stored(row: ParameterSetRow) -> Result<StoredParameterSet> {
        let (mime, encoder, width, height, framerate, bitrate, sps, pps, profile_level_id, updated_at) =
            row;
        let updated_at = DateTime::parse_from_rfc3339(&updated_at)
            .map_err(|e| AppError::Config(format!("Invalid timestamp {}: {}", updated_at, e)))?
            .with_timezone(&Utc);
        let dim = |v: i64| {
            u32::try_from(v).map_err(|_| AppError::Config(format!("Invalid stored value {}", v)))
        };

        Ok(StoredParameterSet {
            mime,
            encoder,
            quality: QualityDescriptor::new(dim(width)?, dim(height)?, dim(framerate)?, dim(bitrate)?),
            parameters: ParameterSetRecord {
                sps,
                pps,
                profile_level_id,
            },
            updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_config_store() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");

        let store = ConfigStore::new(&db_path).await.unwrap();
        assert_eq!(*store.get(), AppConfig::default());

        store
            .update(|c| {
                c.pipeline.preview_orientation = 90;
                c.pipeline.preferred_encoder = Some("OMX.qcom.video.encoder.avc".to_string());
            })
            .await
            .unwrap();
        assert_eq!(store.get().pipeline.preview_orientation, 90);

        // Invalid updates are rejected and leave the cache alone
        assert!(store
            .update(|c| c.pipeline.mime_type.clear())
            .await
            .is_err());
        assert_eq!(store.get().pipeline.mime_type, "video/avc");

        // New store instance sees the persisted config
        let store2 = ConfigStore::new(&db_path).await.unwrap();
        let config = store2.get();
        assert_eq!(config.pipeline.preview_orientation, 90);
        assert_eq!(
            config.pipeline.preferred_encoder.as_deref(),
            Some("OMX.qcom.video.encoder.avc")
        );
    }

    #[tokio::test]
    async fn test_parameter_sets_round_trip_and_upsert() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::new(&dir.path().join("params.db")).await.unwrap();
        let quality = QualityDescriptor::new(1280, 720, 30, 3_000_000);

        let first = CodecParameterSet::new(
            vec![0x67, 0x42, 0xc0, 0x1e, 0xda],
            vec![0x68, 0xce, 0x06, 0xe2],
        )
        .unwrap();
        store
            .save_parameter_set("video/avc", "enc", &quality, &first)
            .await
            .unwrap();

        let second = CodecParameterSet::new(
            vec![0x67, 0x64, 0x00, 0x28, 0xac],
            vec![0x68, 0xee, 0x3c, 0x80],
        )
        .unwrap();
        store
            .save_parameter_set("video/avc", "enc", &quality, &second)
            .await
            .unwrap();

        let stored = store
            .parameter_set("video/avc", "enc", &quality)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.quality, quality);
        assert_eq!(stored.parameters.profile_level_id, "640028");
        assert_eq!(stored.to_parameter_set().unwrap(), second);

        assert!(store
            .parameter_set("video/avc", "other", &quality)
            .await
            .unwrap()
            .is_none());
        assert_eq!(store.list_parameter_sets().await.unwrap().len(), 1);
    }
}
