use std::error::Error as StdError;
use std::fmt::Formatter;
use std::io;

use axum::response::{IntoResponse, Response};
use axum::Json;
use http::StatusCode;
use serde_json::json;
use strum::Display;

pub mod api;
pub mod args;
pub mod bus;
pub mod config;
pub mod deploy;
pub mod envstore;
pub mod handlers;
pub mod health;
pub mod monitor;
pub mod proxy;
pub mod push;
pub mod resolver;
pub mod runtime;
pub mod signals;
pub mod telemetry;

/// The kinds of failure gordon surfaces to callers, metrics, and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    ConfigInvalid,
    RuntimeUnavailable,
    PullFailed,
    PullDenied,
    ImageNotFound,
    CreateFailed,
    StartFailed,
    Unhealthy,
    RouteUnknown,
    Busy,
    Cancelled,
    BusBackpressure,
    Internal,
}

impl ErrorKind {
    /// CLI exit code for this kind of failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConfigInvalid => 2,
            Self::RuntimeUnavailable => 3,
            Self::PullDenied => 4,
            _ => 1,
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::RouteUnknown => StatusCode::NOT_FOUND,
            Self::Busy => StatusCode::CONFLICT,
            Self::ConfigInvalid => StatusCode::BAD_REQUEST,
            Self::PullDenied => StatusCode::FORBIDDEN,
            Self::Unhealthy | Self::RuntimeUnavailable | Self::BusBackpressure => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// All [`Error`]s have an [`ErrorKind`] and an (optional) source.
///
/// [`Error`] is safe to use as an axum endpoint error variant: its
/// [`IntoResponse`] implementation does not leak the source chain.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    source: Option<Box<dyn StdError + Sync + Send + 'static>>,
}

impl Error {
    pub fn source<E: StdError + Sync + Send + 'static>(kind: ErrorKind, err: E) -> Self {
        Self {
            kind,
            source: Some(Box::new(err)),
        }
    }

    pub fn custom<S: AsRef<str>>(kind: ErrorKind, message: S) -> Self {
        Self {
            kind,
            source: Some(Box::new(io::Error::new(
                io::ErrorKind::Other,
                message.as_ref().to_string(),
            ))),
        }
    }

    pub fn from_kind(kind: ErrorKind) -> Self {
        Self { kind, source: None }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::from_kind(kind)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::source(ErrorKind::Internal, err)
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.kind.status_code();
        if status.is_server_error() {
            tracing::error!(error = &self as &dyn StdError, "control plane request error");
        }
        (status, Json(json!({ "error": self.kind.to_string() }))).into_response()
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(source) = self.source.as_ref() {
            write!(f, ": ")?;
            source.fmt(f)?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|err| err as &(dyn StdError + 'static))
    }
}
