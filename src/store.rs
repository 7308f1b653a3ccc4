use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use crate::config::StoreCfg;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object store request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("object store rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("object store returned an unexpected body: {0}")]
    Malformed(String),
}

/// Digest used for Cloudinary request signatures. Accounts sign with SHA-1 unless
/// switched to SHA-256 in their security settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureAlgorithm {
    #[default]
    Sha1,
    Sha256,
}

impl std::str::FromStr for SignatureAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha1" => Ok(SignatureAlgorithm::Sha1),
            "sha256" => Ok(SignatureAlgorithm::Sha256),
            other => Err(format!("unknown signature algorithm `{other}`")),
        }
    }
}

/// Where an upload ended up. `public_id` is what a later delete needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub url: String,
    pub public_id: String,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn upload(&self, bytes: Vec<u8>, folder: &str) -> Result<StoredObject, StoreError>;
    async fn delete(&self, object: &StoredObject) -> Result<(), StoreError>;
    fn name(&self) -> &'static str;
}

/// Signed uploads against the Cloudinary REST API.
pub struct CloudinaryStore {
    http: reqwest::Client,
    api_base: String,
    cloud_name: String,
    api_key: String,
    api_secret: String,
    signature_algorithm: SignatureAlgorithm,
}

#[derive(Deserialize)]
struct UploadResp {
    secure_url: String,
    public_id: String,
}

#[derive(Deserialize)]
struct DestroyResp {
    result: String,
}

#[derive(Deserialize)]
struct ErrorResp {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

impl CloudinaryStore {
    pub fn new(cfg: &StoreCfg, cloud_name: String) -> Result<Self, StoreError> {
        // Safety net only; the orchestrator enforces the real upload deadline.
        let http = reqwest::Client::builder()
            .timeout(cfg.upload_timeout + Duration::from_secs(5))
            .build()?;
        Ok(Self {
            http,
            api_base: cfg.api_base.trim_end_matches('/').to_string(),
            cloud_name,
            api_key: cfg.api_key.clone(),
            api_secret: cfg.api_secret.clone(),
            signature_algorithm: cfg.signature_algorithm,
        })
    }

    fn endpoint(&self, action: &str) -> String {
        format!("{}/v1_1/{}/image/{}", self.api_base, self.cloud_name, action)
    }

    /// Builds the signed parameter list: every param except `file`, `api_key` and
    /// `signature`, sorted, joined with `&`, secret appended, hex digest.
    fn signed_params(&self, mut params: Vec<(&'static str, String)>) -> Vec<(&'static str, String)> {
        params.push(("timestamp", chrono::Utc::now().timestamp().to_string()));
        let signature = sign(&params, &self.api_secret, self.signature_algorithm);
        params.push(("api_key", self.api_key.clone()));
        params.push(("signature", signature));
        params
    }
}

pub(crate) fn sign(params: &[(&str, String)], secret: &str, algorithm: SignatureAlgorithm) -> String {
    let mut sorted: Vec<_> = params.iter().filter(|(_, v)| !v.is_empty()).collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    let joined = sorted
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");
    let payload = format!("{joined}{secret}");
    match algorithm {
        SignatureAlgorithm::Sha1 => format!("{:x}", Sha1::digest(payload.as_bytes())),
        SignatureAlgorithm::Sha256 => format!("{:x}", Sha256::digest(payload.as_bytes())),
    }
}

async fn rejection(resp: reqwest::Response) -> StoreError {
    let status = resp.status().as_u16();
    let message = match resp.json::<ErrorResp>().await {
        Ok(body) => body.error.message,
        Err(_) => "no error message".to_string(),
    };
    StoreError::Rejected { status, message }
}

#[async_trait]
impl ObjectStore for CloudinaryStore {
    async fn upload(&self, bytes: Vec<u8>, folder: &str) -> Result<StoredObject, StoreError> {
        let params = self.signed_params(vec![("folder", folder.to_string())]);
        let mut form = Form::new().part("file", Part::bytes(bytes).file_name("upload"));
        for (k, v) in params {
            if !v.is_empty() {
                form = form.text(k, v);
            }
        }

        let resp = self.http.post(self.endpoint("upload")).multipart(form).send().await?;
        if !resp.status().is_success() {
            return Err(rejection(resp).await);
        }
        let body: UploadResp = resp
            .json()
            .await
            .map_err(|e| StoreError::Malformed(e.to_string()))?;
        Ok(StoredObject { url: body.secure_url, public_id: body.public_id })
    }

    async fn delete(&self, object: &StoredObject) -> Result<(), StoreError> {
        let params = self.signed_params(vec![("public_id", object.public_id.clone())]);
        let resp = self.http.post(self.endpoint("destroy")).form(&params).send().await?;
        if !resp.status().is_success() {
            return Err(rejection(resp).await);
        }
        let body: DestroyResp = resp
            .json()
            .await
            .map_err(|e| StoreError::Malformed(e.to_string()))?;
        match body.result.as_str() {
            "ok" | "not found" => Ok(()),
            other => Err(StoreError::Malformed(format!("destroy result `{other}`"))),
        }
    }

    fn name(&self) -> &'static str {
        "cloudinary"
    }
}

/// Keeps uploads in process. Counts calls so callers can assert nothing was stored.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    uploads: AtomicU64,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upload_calls(&self) -> u64 {
        self.uploads.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, url: &str) -> bool {
        self.objects.lock().contains_key(url)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn upload(&self, bytes: Vec<u8>, folder: &str) -> Result<StoredObject, StoreError> {
        self.uploads.fetch_add(1, Ordering::Relaxed);
        let public_id = match folder {
            "" => Uuid::new_v4().to_string(),
            f => format!("{}/{}", f.trim_end_matches('/'), Uuid::new_v4()),
        };
        let url = format!("memory://{public_id}");
        self.objects.lock().insert(url.clone(), bytes);
        Ok(StoredObject { url, public_id })
    }

    async fn delete(&self, object: &StoredObject) -> Result<(), StoreError> {
        self.objects.lock().remove(&object.url);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
