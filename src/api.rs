use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::ingest::{IngestError, IngestOutcome, IngestPipeline};
use crate::normalize::NormalizeError;
use crate::repository::Metadata;

const IMAGE_FIELD: &str = "image";

#[derive(Clone)]
pub struct AppState {
    pipeline: Arc<IngestPipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<IngestPipeline>) -> Self {
        Self { pipeline }
    }
}

pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/check", post(check_image))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(
    bind: String,
    app: Router,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!("phash-gate listening on http://{bind}");
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;
    Ok(())
}

#[derive(Serialize)]
struct HealthResp {
    status: &'static str,
}

async fn health() -> Json<HealthResp> {
    Json(HealthResp { status: "ok" })
}

#[derive(Serialize)]
struct DuplicateResp {
    error: &'static str,
    metadata: Metadata,
    url: String,
}

async fn check_image(State(st): State<AppState>, mut multipart: Multipart) -> Result<Response, ApiErr> {
    let mut image: Option<Vec<u8>> = None;
    let mut metadata = Metadata::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiErr::from_multipart(e, "Bad Request"))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if name == IMAGE_FIELD {
            let bytes = field
                .bytes()
                .await
                .map_err(|e| ApiErr::from_multipart(e, "Cannot open file"))?;
            image = Some(bytes.to_vec());
        } else if !name.is_empty() {
            let value = field
                .text()
                .await
                .map_err(|e| ApiErr::from_multipart(e, format!("Cannot read field `{name}`")))?;
            metadata.insert(name, value);
        }
    }

    let Some(bytes) = image else {
        return Err(ApiErr::bad_request("Bad Request"));
    };

    match st.pipeline.ingest(bytes, metadata).await? {
        IngestOutcome::Created(record) => Ok((StatusCode::OK, Json(record)).into_response()),
        IngestOutcome::Duplicate(record) => Ok((
            StatusCode::ACCEPTED,
            Json(DuplicateResp {
                error: "image already exist",
                metadata: record.metadata,
                url: record.url,
            }),
        )
            .into_response()),
    }
}

#[derive(Debug)]
struct ApiErr {
    status: StatusCode,
    code: String,
    message: String,
}

impl ApiErr {
    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal_error".to_string(),
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "bad_request".to_string(),
            message: message.into(),
        }
    }

    /// Oversized bodies surface as a multipart read error; keep them apart from malformed ones.
    fn from_multipart(e: MultipartError, message: impl Into<String>) -> Self {
        if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
            tracing::warn!(error = %e.body_text(), "upload exceeds body limit");
            return Self {
                status: StatusCode::PAYLOAD_TOO_LARGE,
                code: "payload_too_large".to_string(),
                message: "File too large".to_string(),
            };
        }
        Self::bad_request(message)
    }
}

impl From<IngestError> for ApiErr {
    fn from(e: IngestError) -> Self {
        if e.is_bad_input() {
            tracing::warn!(error = %e, "rejected upload");
        } else {
            tracing::error!(error = %e, "ingest failed");
        }
        match e {
            IngestError::Normalize(NormalizeError::Empty) => Self::bad_request("Empty file"),
            IngestError::Normalize(NormalizeError::UnsupportedFormat(_)) => Self::bad_request("Unsupported image type"),
            IngestError::Normalize(NormalizeError::Decode(_)) => Self::bad_request("Cannot decode image"),
            IngestError::Normalize(NormalizeError::Dimensions { .. }) => {
                Self::bad_request("Unsupported image dimensions")
            }
            IngestError::Fingerprint(_) | IngestError::Worker(_) => Self::internal("Internal Server Error"),
            IngestError::Repository(_) => Self::internal("Metadata store unavailable"),
            IngestError::Store(_) | IngestError::UploadTimeout(_) => Self::internal("Image upload failed"),
        }
    }
}

impl IntoResponse for ApiErr {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            error: String,
            code: String,
        }
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
                code: self.code,
            }),
        )
            .into_response()
    }
}
