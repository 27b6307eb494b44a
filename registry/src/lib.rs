//! The private OCI distribution surface co-hosted by gordon.
//!
//! The storage layer is a content-addressed filesystem store behind the
//! [`storage::RegistryStore`] trait; the HTTP surface implements the
//! subset of the distribution spec a single-host deploy loop needs:
//! monolithic and chunked blob uploads, manifest push/pull by tag or
//! digest, and a token endpoint. Finalised manifest pushes are reported
//! through [`hooks::RegistryHooks`].

use axum::response::{IntoResponse, Response};
use axum::Json;
use http::StatusCode;
use serde_json::json;

pub mod api;
pub mod auth;
pub mod hooks;
pub mod storage;

pub use api::{serve_router, RegistryState};
pub use auth::TokenAuthority;
pub use hooks::RegistryHooks;
pub use storage::{FsStore, RegistryStore, StoredManifest};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid repository name '{0}'")]
    InvalidName(String),
    #[error("invalid reference '{0}'")]
    InvalidReference(String),
    #[error("unknown blob {0}")]
    BlobUnknown(String),
    #[error("unknown manifest {0}")]
    ManifestUnknown(String),
    #[error("unknown upload session {0}")]
    UploadUnknown(String),
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },
    #[error("authorization required")]
    Unauthorized,
    #[error("access denied")]
    Denied,
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),
}

impl Error {
    /// Distribution-spec error code for the JSON error body.
    fn code(&self) -> &'static str {
        match self {
            Self::InvalidName(_) => "NAME_INVALID",
            Self::InvalidReference(_) => "TAG_INVALID",
            Self::BlobUnknown(_) => "BLOB_UNKNOWN",
            Self::ManifestUnknown(_) => "MANIFEST_UNKNOWN",
            Self::UploadUnknown(_) => "BLOB_UPLOAD_UNKNOWN",
            Self::DigestMismatch { .. } => "DIGEST_INVALID",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Denied => "DENIED",
            Self::Storage(_) => "UNKNOWN",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::InvalidName(_) | Self::InvalidReference(_) | Self::DigestMismatch { .. } => {
                StatusCode::BAD_REQUEST
            }
            Self::BlobUnknown(_) | Self::ManifestUnknown(_) | Self::UploadUnknown(_) => {
                StatusCode::NOT_FOUND
            }
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Denied => StatusCode::FORBIDDEN,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        if self.status().is_server_error() {
            tracing::error!(error = %self, "registry request error");
        }
        let body = json!({
            "errors": [{ "code": self.code(), "message": self.to_string() }]
        });
        (self.status(), Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, Error>;
