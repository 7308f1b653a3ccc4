//! Content digest and perceptual hash for an upload.
//!
//! The digest identifies exact bytes. The perceptual hash is a 64-bit DCT signature of
//! the normalized raster; similar pictures land a small Hamming distance apart.

use std::fmt;
use std::str::FromStr;

use img_hash::{HashAlg, HasherConfig};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::normalize::Normalized;

#[derive(Debug, Error)]
pub enum FingerprintError {
    #[error("hash computation failed: {0}")]
    HashComputation(String),
}

/// Tag stored next to every hash so rows from a future algorithm never get compared
/// against this one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    PHash,
}

impl HashAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            HashAlgorithm::PHash => "phash",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "phash" => Ok(HashAlgorithm::PHash),
            other => Err(format!("unknown hash algorithm `{other}`")),
        }
    }
}

/// 64-bit perceptual hash. Serialized as 16 lowercase hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PerceptualHash(pub u64);

impl PerceptualHash {
    /// Number of differing bits.
    pub fn distance(self, other: PerceptualHash) -> u32 {
        (self.0 ^ other.0).count_ones()
    }

    /// Bit-for-bit view for storage in a signed BIGINT column.
    pub fn to_i64(self) -> i64 {
        self.0 as i64
    }

    pub fn from_i64(v: i64) -> Self {
        Self(v as u64)
    }
}

impl fmt::Display for PerceptualHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl Serialize for PerceptualHash {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PerceptualHash {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        u64::from_str_radix(&s, 16).map(PerceptualHash).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub content_digest: String,
    pub phash: PerceptualHash,
    pub algorithm: HashAlgorithm,
}

/// SHA-256 over the raw upload, hex encoded.
pub fn content_digest(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Mean hash over DCT coefficients of an 8x8 grid: the classic pHash.
pub fn perceptual_hash(normalized: &Normalized) -> Result<PerceptualHash, FingerprintError> {
    let (w, h) = normalized.raster.dimensions();
    if w == 0 || h == 0 {
        return Err(FingerprintError::HashComputation(format!("degenerate raster {w}x{h}")));
    }

    // img_hash links its own `image` release, so hand the pixels over as a raw buffer.
    let buf = img_hash::image::RgbaImage::from_raw(w, h, normalized.raster.as_raw().clone())
        .ok_or_else(|| FingerprintError::HashComputation("raster buffer size mismatch".into()))?;
    let img = img_hash::image::DynamicImage::ImageRgba8(buf);

    let hasher = HasherConfig::new()
        .hash_alg(HashAlg::Mean)
        .preproc_dct()
        .hash_size(8, 8)
        .to_hasher();
    let hash = hasher.hash_image(&img);

    let bytes: [u8; 8] = hash.as_bytes().try_into().map_err(|_| {
        FingerprintError::HashComputation(format!("expected 8 hash bytes, got {}", hash.as_bytes().len()))
    })?;
    Ok(PerceptualHash(u64::from_be_bytes(bytes)))
}

pub fn fingerprint(raw: &[u8], normalized: &Normalized) -> Result<Fingerprint, FingerprintError> {
    Ok(Fingerprint {
        content_digest: content_digest(raw),
        phash: perceptual_hash(normalized)?,
        algorithm: HashAlgorithm::PHash,
    })
}
