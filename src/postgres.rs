use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::types::Json;
use sqlx::PgPool;

use crate::config::DbCfg;
use crate::fingerprint::{HashAlgorithm, PerceptualHash};
use crate::repository::{ImageRecord, ImageRepository, Metadata, NewImageRecord, RepoError};

const UNIQUE_VIOLATION: &str = "23505";

pub async fn connect(cfg: &DbCfg) -> Result<PgPool> {
    let opts = match &cfg.url {
        Some(url) => url.parse::<PgConnectOptions>().context("invalid DATABASE_URL")?,
        None => {
            let mut o = PgConnectOptions::new().port(cfg.port);
            if let Some(host) = &cfg.host {
                o = o.host(host);
            }
            if let Some(user) = &cfg.user {
                o = o.username(user);
            }
            if let Some(password) = &cfg.password {
                o = o.password(password);
            }
            if let Some(name) = &cfg.name {
                o = o.database(name);
            }
            o
        }
    };

    let pool = PgPoolOptions::new()
        .max_connections(cfg.max_connections)
        .connect_with(opts)
        .await
        .context("failed to connect to postgres")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run migrations")?;

    tracing::info!("database connected and migrations applied");
    Ok(pool)
}

#[derive(Debug, sqlx::FromRow)]
struct ImageRow {
    id: i64,
    phash: i64,
    hash_algorithm: String,
    content_digest: String,
    url: String,
    public_id: String,
    metadata: Json<Metadata>,
    created_at: DateTime<Utc>,
}

impl TryFrom<ImageRow> for ImageRecord {
    type Error = RepoError;

    fn try_from(row: ImageRow) -> Result<Self, Self::Error> {
        let hash_algorithm = row
            .hash_algorithm
            .parse::<HashAlgorithm>()
            .map_err(|message| RepoError::Corrupt { id: row.id, message })?;
        Ok(Self {
            id: row.id,
            hash: PerceptualHash::from_i64(row.phash),
            hash_algorithm,
            content_digest: row.content_digest,
            url: row.url,
            public_id: row.public_id,
            metadata: row.metadata.0,
            created_at: row.created_at,
        })
    }
}

const COLUMNS: &str = "id, phash, hash_algorithm, content_digest, url, public_id, metadata, created_at";

pub struct PgImageRepository {
    pool: PgPool,
}

impl PgImageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn into_record(row: Option<ImageRow>) -> Result<Option<ImageRecord>, RepoError> {
    row.map(ImageRecord::try_from).transpose()
}

#[async_trait]
impl ImageRepository for PgImageRepository {
    async fn find_by_hash(
        &self,
        hash: PerceptualHash,
        algorithm: HashAlgorithm,
    ) -> Result<Option<ImageRecord>, RepoError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM image_meta WHERE phash = $1 AND hash_algorithm = $2 LIMIT 1"
        );
        let row = sqlx::query_as::<_, ImageRow>(&sql)
            .bind(hash.to_i64())
            .bind(algorithm.as_str())
            .fetch_optional(&self.pool)
            .await?;
        into_record(row)
    }

    async fn find_nearest(
        &self,
        hash: PerceptualHash,
        algorithm: HashAlgorithm,
        max_distance: u32,
    ) -> Result<Option<ImageRecord>, RepoError> {
        // `#` is bitwise XOR on bigint; bit_count needs the bit(64) view.
        let sql = format!(
            "SELECT {COLUMNS} FROM image_meta \
             WHERE hash_algorithm = $2 AND bit_count((phash # $1)::bit(64)) <= $3 \
             ORDER BY bit_count((phash # $1)::bit(64)), id LIMIT 1"
        );
        let row = sqlx::query_as::<_, ImageRow>(&sql)
            .bind(hash.to_i64())
            .bind(algorithm.as_str())
            .bind(i64::from(max_distance))
            .fetch_optional(&self.pool)
            .await?;
        into_record(row)
    }

    async fn find_by_digest(&self, digest: &str) -> Result<Option<ImageRecord>, RepoError> {
        let sql = format!("SELECT {COLUMNS} FROM image_meta WHERE content_digest = $1 ORDER BY id LIMIT 1");
        let row = sqlx::query_as::<_, ImageRow>(&sql)
            .bind(digest)
            .fetch_optional(&self.pool)
            .await?;
        into_record(row)
    }

    async fn insert(&self, record: NewImageRecord) -> Result<ImageRecord, RepoError> {
        let sql = format!(
            "INSERT INTO image_meta (phash, hash_algorithm, content_digest, url, public_id, metadata) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING {COLUMNS}"
        );
        let row = sqlx::query_as::<_, ImageRow>(&sql)
            .bind(record.hash.to_i64())
            .bind(record.hash_algorithm.as_str())
            .bind(&record.content_digest)
            .bind(&record.url)
            .bind(&record.public_id)
            .bind(Json(&record.metadata))
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                if let sqlx::Error::Database(ref db_err) = e {
                    if db_err.code().as_deref() == Some(UNIQUE_VIOLATION) {
                        return RepoError::Conflict;
                    }
                }
                RepoError::Database(e)
            })?;
        ImageRecord::try_from(row)
    }

    fn name(&self) -> &'static str {
        "postgres"
    }
}

// These run against a throwaway database per test (`DATABASE_URL`, PostgreSQL 14+ for
// `bit_count`). Run with `cargo test -- --ignored`.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::tests::new_record;

    #[sqlx::test]
    #[ignore = "needs DATABASE_URL"]
    async fn round_trips_hashes_above_i64_max(pool: PgPool) {
        let repo = PgImageRepository::new(pool);
        let mut rec = new_record(u64::MAX, "https://x/max.png");
        rec.metadata.insert("location".into(), "bandung".into());

        let stored = repo.insert(rec).await.unwrap();
        assert_eq!(stored.hash, PerceptualHash(u64::MAX));
        assert_eq!(stored.public_id, format!("pid-{:x}", u64::MAX));
        assert_eq!(stored.metadata.get("location").map(String::as_str), Some("bandung"));

        let found = repo
            .find_by_hash(PerceptualHash(u64::MAX), HashAlgorithm::PHash)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found, stored);
        assert!(repo
            .find_by_hash(PerceptualHash(1 << 63), HashAlgorithm::PHash)
            .await
            .unwrap()
            .is_none());
    }

    #[sqlx::test]
    #[ignore = "needs DATABASE_URL"]
    async fn duplicate_hash_insert_conflicts(pool: PgPool) {
        let repo = PgImageRepository::new(pool.clone());
        repo.insert(new_record(7, "u1")).await.unwrap();
        assert!(matches!(repo.insert(new_record(7, "u2")).await, Err(RepoError::Conflict)));

        let (count,): (i64,) = sqlx::query_as("SELECT count(*) FROM image_meta")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[sqlx::test]
    #[ignore = "needs DATABASE_URL"]
    async fn nearest_prefers_smallest_distance_within_bound(pool: PgPool) {
        let repo = PgImageRepository::new(pool);
        repo.insert(new_record(0b0000_0111, "three-bits")).await.unwrap();
        repo.insert(new_record(0b0000_0001, "one-bit")).await.unwrap();
        // Sign bit set: distance must be counted over all 64 bits, not the signed value.
        repo.insert(new_record(1 << 63, "sign-bit")).await.unwrap();

        let hit = repo.find_nearest(PerceptualHash(0), HashAlgorithm::PHash, 3).await.unwrap();
        assert_eq!(hit.map(|r| r.url), Some("one-bit".to_string()));

        let hit = repo
            .find_nearest(PerceptualHash((1 << 63) | (1 << 62)), HashAlgorithm::PHash, 1)
            .await
            .unwrap();
        assert_eq!(hit.map(|r| r.url), Some("sign-bit".to_string()));

        let miss = repo.find_nearest(PerceptualHash(u64::MAX), HashAlgorithm::PHash, 3).await.unwrap();
        assert!(miss.is_none());
    }

    #[sqlx::test]
    #[ignore = "needs DATABASE_URL"]
    async fn lookup_by_digest(pool: PgPool) {
        let repo = PgImageRepository::new(pool);
        repo.insert(new_record(0xbeef, "u")).await.unwrap();
        assert!(repo.find_by_digest("digest-beef").await.unwrap().is_some());
        assert!(repo.find_by_digest("digest-dead").await.unwrap().is_none());
    }
}
