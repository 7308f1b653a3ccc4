use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::fingerprint::Fingerprint;
use crate::repository::{ImageRecord, ImageRepository, RepoError};

/// How a fresh perceptual hash is matched against stored ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatchStrategy {
    /// Indexed equality on `(hash, algorithm)`. Only catches images that hash identically.
    Exact,
    /// Hamming distance <= threshold. 0 behaves like `Exact`.
    Hamming { threshold: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Duplicate(ImageRecord),
    NoMatch,
}

/// Decides whether a fingerprint was already ingested.
pub struct DuplicateResolver {
    repo: Arc<dyn ImageRepository>,
    strategy: MatchStrategy,
    digest_fast_path: bool,
}

impl DuplicateResolver {
    pub fn new(repo: Arc<dyn ImageRepository>, strategy: MatchStrategy, digest_fast_path: bool) -> Self {
        Self { repo, strategy, digest_fast_path }
    }

    pub fn strategy(&self) -> MatchStrategy {
        self.strategy
    }

    /// Any repository failure aborts: without an answer we cannot tell new from seen.
    pub async fn resolve(&self, fp: &Fingerprint) -> Result<Resolution, RepoError> {
        if self.digest_fast_path {
            if let Some(rec) = self.repo.find_by_digest(&fp.content_digest).await? {
                tracing::debug!(id = rec.id, "exact byte match on content digest");
                return Ok(Resolution::Duplicate(rec));
            }
        }

        let found = match self.strategy {
            MatchStrategy::Exact => self.repo.find_by_hash(fp.phash, fp.algorithm).await?,
            MatchStrategy::Hamming { threshold } => {
                self.repo.find_nearest(fp.phash, fp.algorithm, threshold).await?
            }
        };

        Ok(match found {
            Some(rec) => {
                tracing::debug!(id = rec.id, distance = rec.hash.distance(fp.phash), "perceptual match");
                Resolution::Duplicate(rec)
            }
            None => Resolution::NoMatch,
        })
    }
}
