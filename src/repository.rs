use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fingerprint::{HashAlgorithm, PerceptualHash};

/// Caller-supplied form fields, stored and echoed back untouched.
pub type Metadata = BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum RepoError {
    /// A row with the same `(phash, hash_algorithm)` already exists.
    #[error("image hash already recorded")]
    Conflict,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt row {id}: {message}")]
    Corrupt { id: i64, message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: i64,
    pub hash: PerceptualHash,
    pub hash_algorithm: HashAlgorithm,
    pub content_digest: String,
    pub url: String,
    #[serde(skip)]
    pub public_id: String,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

/// Everything needed to create a record except what the store assigns.
#[derive(Debug, Clone)]
pub struct NewImageRecord {
    pub hash: PerceptualHash,
    pub hash_algorithm: HashAlgorithm,
    pub content_digest: String,
    pub url: String,
    pub public_id: String,
    pub metadata: Metadata,
}

#[async_trait]
pub trait ImageRepository: Send + Sync {
    async fn find_by_hash(
        &self,
        hash: PerceptualHash,
        algorithm: HashAlgorithm,
    ) -> Result<Option<ImageRecord>, RepoError>;

    /// Closest record within `max_distance` bits, ties broken by lowest id.
    async fn find_nearest(
        &self,
        hash: PerceptualHash,
        algorithm: HashAlgorithm,
        max_distance: u32,
    ) -> Result<Option<ImageRecord>, RepoError>;

    async fn find_by_digest(&self, digest: &str) -> Result<Option<ImageRecord>, RepoError>;

    async fn insert(&self, record: NewImageRecord) -> Result<ImageRecord, RepoError>;

    fn name(&self) -> &'static str;
}

/// Process-local repository for development and tests. Enforces the same
/// `(hash, algorithm)` uniqueness as the Postgres schema.
#[derive(Default)]
pub struct MemoryImageRepository {
    rows: Mutex<Vec<ImageRecord>>,
}

impl MemoryImageRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn records(&self) -> Vec<ImageRecord> {
        self.rows.lock().clone()
    }
}

#[async_trait]
impl ImageRepository for MemoryImageRepository {
    async fn find_by_hash(
        &self,
        hash: PerceptualHash,
        algorithm: HashAlgorithm,
    ) -> Result<Option<ImageRecord>, RepoError> {
        let rows = self.rows.lock();
        Ok(rows.iter().find(|r| r.hash == hash && r.hash_algorithm == algorithm).cloned())
    }

    async fn find_nearest(
        &self,
        hash: PerceptualHash,
        algorithm: HashAlgorithm,
        max_distance: u32,
    ) -> Result<Option<ImageRecord>, RepoError> {
        let rows = self.rows.lock();
        Ok(rows
            .iter()
            .filter(|r| r.hash_algorithm == algorithm)
            .map(|r| (r.hash.distance(hash), r))
            .filter(|(d, _)| *d <= max_distance)
            .min_by_key(|(d, r)| (*d, r.id))
            .map(|(_, r)| r.clone()))
    }

    async fn find_by_digest(&self, digest: &str) -> Result<Option<ImageRecord>, RepoError> {
        let rows = self.rows.lock();
        Ok(rows.iter().find(|r| r.content_digest == digest).cloned())
    }

    async fn insert(&self, record: NewImageRecord) -> Result<ImageRecord, RepoError> {
        let mut rows = self.rows.lock();
        if rows.iter().any(|r| r.hash == record.hash && r.hash_algorithm == record.hash_algorithm) {
            return Err(RepoError::Conflict);
        }
        let row = ImageRecord {
            id: rows.len() as i64 + 1,
            hash: record.hash,
            hash_algorithm: record.hash_algorithm,
            content_digest: record.content_digest,
            url: record.url,
            public_id: record.public_id,
            metadata: record.metadata,
            created_at: Utc::now(),
        };
        rows.push(row.clone());
        Ok(row)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
