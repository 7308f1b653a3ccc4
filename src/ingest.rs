//! The upload pipeline: sniff, normalize, fingerprint, resolve duplicates, then
//! upload and persist only when the image is new.
//!
//! Stages run strictly in order and the first failure ends the request. Nothing is
//! retried. Two concurrent uploads of the same picture can both pass the duplicate
//! check; the unique `(hash, algorithm)` index turns the second insert into a
//! duplicate report and its uploaded object is deleted again.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::config::DedupeCfg;
use crate::dedupe::{DuplicateResolver, Resolution};
use crate::fingerprint::{self, Fingerprint, FingerprintError};
use crate::normalize::{self, NormalizeError};
use crate::repository::{ImageRecord, ImageRepository, Metadata, NewImageRecord, RepoError};
use crate::store::{ObjectStore, StoreError, StoredObject};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStage {
    Received,
    Validated,
    Normalized,
    Fingerprinted,
    DuplicateReported,
    Uploading,
    Persisting,
    Created,
}

impl fmt::Display for IngestStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IngestStage::Received => "received",
            IngestStage::Validated => "validated",
            IngestStage::Normalized => "normalized",
            IngestStage::Fingerprinted => "fingerprinted",
            IngestStage::DuplicateReported => "duplicate_reported",
            IngestStage::Uploading => "uploading",
            IngestStage::Persisting => "persisting",
            IngestStage::Created => "created",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
    #[error(transparent)]
    Fingerprint(#[from] FingerprintError),
    #[error("repository failure: {0}")]
    Repository(#[from] RepoError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("object store upload timed out after {0:?}")]
    UploadTimeout(Duration),
    #[error("worker task failed: {0}")]
    Worker(String),
}

impl IngestError {
    /// Caller's fault (4xx) as opposed to ours (5xx).
    pub fn is_bad_input(&self) -> bool {
        matches!(self, IngestError::Normalize(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Created(ImageRecord),
    Duplicate(ImageRecord),
}

pub struct IngestPipeline {
    resolver: DuplicateResolver,
    repo: Arc<dyn ImageRepository>,
    store: Arc<dyn ObjectStore>,
    folder: String,
    upload_timeout: Duration,
    canonical_width: u32,
}

impl IngestPipeline {
    pub fn new(
        repo: Arc<dyn ImageRepository>,
        store: Arc<dyn ObjectStore>,
        dedupe: &DedupeCfg,
        folder: String,
        upload_timeout: Duration,
    ) -> Self {
        Self {
            resolver: DuplicateResolver::new(repo.clone(), dedupe.strategy, dedupe.digest_fast_path),
            repo,
            store,
            folder,
            upload_timeout,
            canonical_width: dedupe.canonical_width,
        }
    }

    pub async fn ingest(&self, bytes: Vec<u8>, metadata: Metadata) -> Result<IngestOutcome, IngestError> {
        tracing::debug!(stage = %IngestStage::Received, len = bytes.len());

        // Cheap gate before handing work to the blocking pool.
        let format = normalize::sniff(&bytes)?;
        tracing::debug!(stage = %IngestStage::Validated, mime = format.mime());

        let width = self.canonical_width;
        let (bytes, fp) = tokio::task::spawn_blocking(move || -> Result<_, IngestError> {
            let normalized = normalize::normalize(&bytes, width)?;
            tracing::debug!(
                stage = %IngestStage::Normalized,
                w = normalized.raster.width(),
                h = normalized.raster.height()
            );
            let fp = fingerprint::fingerprint(&bytes, &normalized)?;
            Ok((bytes, fp))
        })
        .await
        .map_err(|e| IngestError::Worker(e.to_string()))??;
        tracing::debug!(stage = %IngestStage::Fingerprinted, hash = %fp.phash, digest = %fp.content_digest);

        if let Resolution::Duplicate(existing) = self.resolver.resolve(&fp).await? {
            tracing::info!(
                stage = %IngestStage::DuplicateReported,
                id = existing.id,
                hash = %fp.phash,
                url = %existing.url,
                "image already ingested"
            );
            return Ok(IngestOutcome::Duplicate(existing));
        }

        tracing::debug!(stage = %IngestStage::Uploading, store = self.store.name());
        let stored = match tokio::time::timeout(self.upload_timeout, self.store.upload(bytes, &self.folder)).await {
            Ok(res) => res?,
            Err(_) => return Err(IngestError::UploadTimeout(self.upload_timeout)),
        };

        tracing::debug!(stage = %IngestStage::Persisting, url = %stored.url);
        self.persist(fp, stored, metadata).await
    }

    async fn persist(
        &self,
        fp: Fingerprint,
        stored: StoredObject,
        metadata: Metadata,
    ) -> Result<IngestOutcome, IngestError> {
        let new = NewImageRecord {
            hash: fp.phash,
            hash_algorithm: fp.algorithm,
            content_digest: fp.content_digest,
            url: stored.url.clone(),
            public_id: stored.public_id.clone(),
            metadata,
        };

        match self.repo.insert(new).await {
            Ok(record) => {
                tracing::info!(
                    stage = %IngestStage::Created,
                    id = record.id,
                    hash = %record.hash,
                    url = %record.url,
                    "image stored"
                );
                Ok(IngestOutcome::Created(record))
            }
            Err(RepoError::Conflict) => {
                // Lost the race against a concurrent upload of the same picture.
                self.compensate(&stored).await;
                match self.repo.find_by_hash(fp.phash, fp.algorithm).await? {
                    Some(existing) => {
                        tracing::info!(id = existing.id, "concurrent duplicate detected on insert");
                        Ok(IngestOutcome::Duplicate(existing))
                    }
                    None => Err(IngestError::Repository(RepoError::Conflict)),
                }
            }
            Err(e) => {
                self.compensate(&stored).await;
                Err(e.into())
            }
        }
    }

    /// Best effort: a failed delete leaves an orphan behind, which we can only log.
    async fn compensate(&self, stored: &StoredObject) {
        match tokio::time::timeout(self.upload_timeout, self.store.delete(stored)).await {
            Ok(Ok(())) => tracing::warn!(url = %stored.url, "removed uploaded object after failed persist"),
            Ok(Err(e)) => tracing::error!(url = %stored.url, error = %e, "orphaned object: delete failed"),
            Err(_) => tracing::error!(url = %stored.url, "orphaned object: delete timed out"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedupe::MatchStrategy;
    use crate::fingerprint::{HashAlgorithm, PerceptualHash};
    use crate::normalize::tests::{gradient_png, jpeg_bytes, png_bytes};
    use crate::repository::MemoryImageRepository;
    use crate::store::MemoryObjectStore;
    use async_trait::async_trait;

    struct StalledStore;

    #[async_trait]
    impl ObjectStore for StalledStore {
        async fn upload(&self, _bytes: Vec<u8>, _folder: &str) -> Result<StoredObject, StoreError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            unreachable!("upload should have timed out")
        }
        async fn delete(&self, _object: &StoredObject) -> Result<(), StoreError> {
            Ok(())
        }
        fn name(&self) -> &'static str {
            "stalled"
        }
    }

    /// Accepts uploads but fails every insert.
    struct BrokenRepo;

    #[async_trait]
    impl ImageRepository for BrokenRepo {
        async fn find_by_hash(&self, _: PerceptualHash, _: HashAlgorithm) -> Result<Option<ImageRecord>, RepoError> {
            Ok(None)
        }
        async fn find_nearest(&self, _: PerceptualHash, _: HashAlgorithm, _: u32) -> Result<Option<ImageRecord>, RepoError> {
            Ok(None)
        }
        async fn find_by_digest(&self, _: &str) -> Result<Option<ImageRecord>, RepoError> {
            Ok(None)
        }
        async fn insert(&self, _: NewImageRecord) -> Result<ImageRecord, RepoError> {
            Err(RepoError::Database(sqlx::Error::PoolTimedOut))
        }
        fn name(&self) -> &'static str {
            "broken"
        }
    }

    fn pipeline(repo: Arc<dyn ImageRepository>, store: Arc<dyn ObjectStore>) -> IngestPipeline {
        IngestPipeline::new(repo, store, &DedupeCfg::default(), "uploads".into(), Duration::from_millis(200))
    }

    fn meta() -> Metadata {
        Metadata::from([("name".to_string(), "budi".to_string()), ("location".to_string(), "bandung".to_string())])
    }

    #[tokio::test]
    async fn new_image_is_uploaded_then_recorded() {
        let repo = Arc::new(MemoryImageRepository::new());
        let store = Arc::new(MemoryObjectStore::new());
        let p = pipeline(repo.clone(), store.clone());

        let out = p.ingest(png_bytes(10, 10, [255, 0, 0]), meta()).await.unwrap();
        let IngestOutcome::Created(rec) = out else { panic!("expected created") };
        assert!(store.contains(&rec.url));
        assert_eq!(rec.hash_algorithm, HashAlgorithm::PHash);
        assert_eq!(rec.metadata, meta());
        assert_eq!(repo.len(), 1);
    }

    #[tokio::test]
    async fn same_bytes_twice_is_a_duplicate_without_upload() {
        let repo = Arc::new(MemoryImageRepository::new());
        let store = Arc::new(MemoryObjectStore::new());
        let p = pipeline(repo.clone(), store.clone());
        let bytes = gradient_png(40, 30);

        let IngestOutcome::Created(first) = p.ingest(bytes.clone(), meta()).await.unwrap() else {
            panic!("expected created")
        };
        let IngestOutcome::Duplicate(second) = p.ingest(bytes, Metadata::new()).await.unwrap() else {
            panic!("expected duplicate")
        };
        assert_eq!(first.id, second.id);
        assert_eq!(first.url, second.url);
        assert_eq!(store.upload_calls(), 1);
        assert_eq!(repo.len(), 1);
    }

    #[tokio::test]
    async fn same_hash_different_bytes_is_a_duplicate() {
        let repo = Arc::new(MemoryImageRepository::new());
        let store = Arc::new(MemoryObjectStore::new());
        let cfg = DedupeCfg { digest_fast_path: false, ..DedupeCfg::default() };
        let p = IngestPipeline::new(repo.clone(), store.clone(), &cfg, String::new(), Duration::from_secs(1));

        // Flat colour normalizes to the same raster whatever the source size.
        p.ingest(png_bytes(10, 10, [255, 0, 0]), meta()).await.unwrap();
        let out = p.ingest(png_bytes(20, 20, [255, 0, 0]), meta()).await.unwrap();
        assert!(matches!(out, IngestOutcome::Duplicate(_)));
        assert_eq!(store.upload_calls(), 1);
        assert_eq!(repo.len(), 1);
    }

    #[tokio::test]
    async fn unsupported_format_stops_before_any_io() {
        let repo = Arc::new(MemoryImageRepository::new());
        let store = Arc::new(MemoryObjectStore::new());
        let p = pipeline(repo.clone(), store.clone());

        let err = p.ingest(b"GIF89a\x01\x00\x01\x00\x00\x00\x00".to_vec(), meta()).await.unwrap_err();
        assert!(err.is_bad_input());
        assert!(matches!(err, IngestError::Normalize(NormalizeError::UnsupportedFormat(_))));
        assert_eq!(store.upload_calls(), 0);
        assert!(repo.is_empty());
    }

    #[tokio::test]
    async fn undecodable_png_is_bad_input() {
        let p = pipeline(Arc::new(MemoryImageRepository::new()), Arc::new(MemoryObjectStore::new()));
        let mut bytes = png_bytes(8, 8, [1, 1, 1]);
        bytes.truncate(30);
        let err = p.ingest(bytes, meta()).await.unwrap_err();
        assert!(matches!(err, IngestError::Normalize(NormalizeError::Decode(_))));
    }

    #[tokio::test]
    async fn degenerate_image_is_a_server_error() {
        let p = pipeline(Arc::new(MemoryImageRepository::new()), Arc::new(MemoryObjectStore::new()));
        let err = p.ingest(png_bytes(2000, 1, [0, 0, 0]), meta()).await.unwrap_err();
        assert!(matches!(err, IngestError::Fingerprint(_)));
        assert!(!err.is_bad_input());
    }

    #[tokio::test]
    async fn stalled_upload_times_out_and_writes_nothing() {
        let repo = Arc::new(MemoryImageRepository::new());
        let p = pipeline(repo.clone(), Arc::new(StalledStore));

        let err = p.ingest(jpeg_bytes(16, 16, [0, 128, 255]), meta()).await.unwrap_err();
        assert!(matches!(err, IngestError::UploadTimeout(_)));
        assert!(!err.is_bad_input());
        assert!(repo.is_empty());
    }

    #[tokio::test]
    async fn failed_persist_deletes_the_upload() {
        let store = Arc::new(MemoryObjectStore::new());
        let p = pipeline(Arc::new(BrokenRepo), store.clone());

        let err = p.ingest(png_bytes(12, 12, [3, 4, 5]), meta()).await.unwrap_err();
        assert!(matches!(err, IngestError::Repository(RepoError::Database(_))));
        assert_eq!(store.upload_calls(), 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn insert_conflict_reports_the_winner() {
        let repo = Arc::new(MemoryImageRepository::new());
        let store = Arc::new(MemoryObjectStore::new());
        let p = pipeline(repo.clone(), store.clone());
        let bytes = png_bytes(10, 10, [0, 255, 0]);

        // Simulate a concurrent winner that landed between our check and our insert.
        let n = normalize::normalize(&bytes, DedupeCfg::default().canonical_width).unwrap();
        let fp = fingerprint::fingerprint(&bytes, &n).unwrap();
        let winner = repo
            .insert(NewImageRecord {
                hash: fp.phash,
                hash_algorithm: fp.algorithm,
                content_digest: "someone-else".into(),
                url: "memory://winner".into(),
                public_id: "winner".into(),
                metadata: Metadata::new(),
            })
            .await
            .unwrap();

        let stored = store.upload(bytes, "uploads").await.unwrap();
        let out = p.persist(fp, stored.clone(), meta()).await.unwrap();
        assert_eq!(out, IngestOutcome::Duplicate(winner));
        assert!(!store.contains(&stored.url));
        assert_eq!(repo.len(), 1);
    }

    #[tokio::test]
    async fn hamming_strategy_flows_through_pipeline() {
        let repo = Arc::new(MemoryImageRepository::new());
        let store = Arc::new(MemoryObjectStore::new());
        let cfg = DedupeCfg { strategy: MatchStrategy::Hamming { threshold: 64 }, digest_fast_path: false, ..DedupeCfg::default() };
        let p = IngestPipeline::new(repo, store.clone(), &cfg, String::new(), Duration::from_secs(1));

        p.ingest(png_bytes(10, 10, [255, 0, 0]), meta()).await.unwrap();
        // Threshold 64 matches anything with the same algorithm.
        let out = p.ingest(gradient_png(30, 30), meta()).await.unwrap();
        assert!(matches!(out, IngestOutcome::Duplicate(_)));
        assert_eq!(store.upload_calls(), 1);
    }
}
