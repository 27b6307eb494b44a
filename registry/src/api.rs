//! HTTP surface of the registry: the distribution-spec subset gordon
//! needs, wired over a [`RegistryStore`] and reporting finalised pushes
//! through [`RegistryHooks`].

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post, put};
use axum::{Json, Router};
use base64::Engine;
use bytes::Bytes;
use serde_json::json;
use tracing::{info, warn};

use gordon_common::models::ImagePushedEvent;
use gordon_common::ImageReference;

use crate::auth::{Scope, TokenAuthority};
use crate::hooks::RegistryHooks;
use crate::storage::RegistryStore;
use crate::{Error, Result};

const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

pub struct RegistryState {
    pub store: Arc<dyn RegistryStore>,
    pub auth: Arc<TokenAuthority>,
    pub hooks: Arc<dyn RegistryHooks>,
}

pub fn serve_router(state: Arc<RegistryState>) -> Router {
    Router::new()
        .route("/v2/", get(ping))
        .route("/token", get(issue_token))
        .route("/v2/:name/blobs/uploads/", post(start_upload))
        .route(
            "/v2/:name/blobs/uploads/:session",
            patch(append_upload).put(finish_upload),
        )
        .route("/v2/:name/blobs/:digest", get(get_blob).head(head_blob))
        .route(
            "/v2/:name/manifests/:reference",
            put(put_manifest).get(get_manifest).head(head_manifest),
        )
        .with_state(state)
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
}

async fn ping(
    State(state): State<Arc<RegistryState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse> {
    state.auth.authorize(bearer(&headers), Scope::Pull)?;
    Ok(Json(json!({})))
}

async fn issue_token(
    State(state): State<Arc<RegistryState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse> {
    let encoded = bearer(&headers)
        .and_then(|value| value.strip_prefix("Basic "))
        .ok_or(Error::Unauthorized)?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|_| Error::Unauthorized)?;
    let decoded = String::from_utf8(decoded).map_err(|_| Error::Unauthorized)?;
    let (username, password) = decoded.split_once(':').ok_or(Error::Unauthorized)?;

    let token = state.auth.exchange(username, password)?;
    Ok(Json(json!({ "token": token })))
}

async fn start_upload(
    State(state): State<Arc<RegistryState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<Response> {
    state.auth.authorize(bearer(&headers), Scope::Push)?;
    let session = state.store.start_upload().await?;
    Ok((
        StatusCode::ACCEPTED,
        [
            (
                header::LOCATION,
                format!("/v2/{name}/blobs/uploads/{session}"),
            ),
            (header::RANGE, "0-0".to_string()),
        ],
    )
        .into_response())
}

async fn append_upload(
    State(state): State<Arc<RegistryState>>,
    Path((name, session)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    state.auth.authorize(bearer(&headers), Scope::Push)?;
    let written = state.store.append_upload(&session, body).await?;
    Ok((
        StatusCode::ACCEPTED,
        [
            (
                header::LOCATION,
                format!("/v2/{name}/blobs/uploads/{session}"),
            ),
            (header::RANGE, format!("0-{}", written.saturating_sub(1))),
        ],
    )
        .into_response())
}

#[derive(serde::Deserialize)]
struct FinishParams {
    digest: String,
}

async fn finish_upload(
    State(state): State<Arc<RegistryState>>,
    Path((name, session)): Path<(String, String)>,
    Query(params): Query<FinishParams>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    state.auth.authorize(bearer(&headers), Scope::Push)?;
    if !body.is_empty() {
        state.store.append_upload(&session, body).await?;
    }
    let digest = state.store.finish_upload(&session, &params.digest).await?;
    Ok((
        StatusCode::CREATED,
        [
            (header::LOCATION, format!("/v2/{name}/blobs/{digest}")),
            (docker_content_digest(), digest.clone()),
        ],
    )
        .into_response())
}

async fn head_blob(
    State(state): State<Arc<RegistryState>>,
    Path((_name, digest)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response> {
    state.auth.authorize(bearer(&headers), Scope::Pull)?;
    if state.store.blob_exists(&digest).await? {
        Ok((StatusCode::OK, [(docker_content_digest(), digest)]).into_response())
    } else {
        Err(Error::BlobUnknown(digest))
    }
}

async fn get_blob(
    State(state): State<Arc<RegistryState>>,
    Path((_name, digest)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response> {
    state.auth.authorize(bearer(&headers), Scope::Pull)?;
    let data = state.store.get_blob(&digest).await?;
    Ok((
        StatusCode::OK,
        [(docker_content_digest(), digest)],
        data,
    )
        .into_response())
}

async fn put_manifest(
    State(state): State<Arc<RegistryState>>,
    Path((name, reference)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    state.auth.authorize(bearer(&headers), Scope::Push)?;

    let media_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or(OCI_MANIFEST_MEDIA_TYPE)
        .to_string();

    let digest = state
        .store
        .put_manifest(&name, &reference, &media_type, body.clone())
        .await?;

    info!(%name, %reference, %digest, "manifest upload finalised");

    // Digest-addressed pushes never trigger deploys; only a moved tag
    // names a deployable version.
    if !reference.starts_with("sha256:") {
        match format!("{name}:{reference}").parse::<ImageReference>() {
            Ok(image) => {
                let event = ImagePushedEvent {
                    name: name.clone(),
                    reference: image,
                    digest: digest.clone(),
                    annotations: manifest_annotations(&body),
                };
                state.hooks.on_image_pushed(event).await;
            }
            Err(err) => {
                warn!(%name, %reference, %err, "pushed manifest has an unusable reference");
            }
        }
    }

    Ok((
        StatusCode::CREATED,
        [
            (header::LOCATION, format!("/v2/{name}/manifests/{digest}")),
            (docker_content_digest(), digest),
        ],
    )
        .into_response())
}

async fn get_manifest(
    State(state): State<Arc<RegistryState>>,
    Path((name, reference)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response> {
    state.auth.authorize(bearer(&headers), Scope::Pull)?;
    let manifest = state.store.get_manifest(&name, &reference).await?;
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, manifest.media_type),
            (docker_content_digest(), manifest.digest),
        ],
        manifest.data,
    )
        .into_response())
}

async fn head_manifest(
    State(state): State<Arc<RegistryState>>,
    Path((name, reference)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response> {
    state.auth.authorize(bearer(&headers), Scope::Pull)?;
    let manifest = state.store.get_manifest(&name, &reference).await?;
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, manifest.media_type),
            (docker_content_digest(), manifest.digest),
        ],
    )
        .into_response())
}

fn docker_content_digest() -> header::HeaderName {
    header::HeaderName::from_static("docker-content-digest")
}

fn manifest_annotations(body: &[u8]) -> BTreeMap<String, String> {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|manifest| {
            manifest
                .get("annotations")
                .and_then(|a| serde_json::from_value(a.clone()).ok())
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::storage::FsStore;

    use super::*;

    struct RecordingHooks {
        events: Mutex<Vec<ImagePushedEvent>>,
    }

    #[async_trait]
    impl RegistryHooks for RecordingHooks {
        async fn on_image_pushed(&self, event: ImagePushedEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    async fn test_state(
        enabled: bool,
    ) -> (tempfile::TempDir, Arc<RegistryState>, Arc<RecordingHooks>) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::open(dir.path()).await.unwrap();
        let hooks = Arc::new(RecordingHooks {
            events: Mutex::new(Vec::new()),
        });
        let state = Arc::new(RegistryState {
            store: Arc::new(store),
            auth: Arc::new(TokenAuthority::new(enabled, b"secret", Default::default())),
            hooks: hooks.clone(),
        });
        (dir, state, hooks)
    }

    fn manifest_body() -> String {
        json!({
            "schemaVersion": 2,
            "mediaType": OCI_MANIFEST_MEDIA_TYPE,
            "annotations": { "gordon.port": "3000" }
        })
        .to_string()
    }

    #[tokio::test]
    async fn manifest_push_fires_hook_with_annotations() {
        let (_dir, state, hooks) = test_state(false).await;
        let router = serve_router(state);

        let response = router
            .oneshot(
                Request::put("/v2/myapp/manifests/latest")
                    .header("content-type", OCI_MANIFEST_MEDIA_TYPE)
                    .body(Body::from(manifest_body()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(response.headers().contains_key("docker-content-digest"));

        let events = hooks.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "myapp");
        assert_eq!(events[0].reference.tag(), "latest");
        assert_eq!(
            events[0].annotations.get("gordon.port").map(String::as_str),
            Some("3000")
        );
    }

    #[tokio::test]
    async fn digest_push_does_not_fire_hook() {
        let (_dir, state, hooks) = test_state(false).await;
        let router = serve_router(state);

        let digest = format!("sha256:{}", "b".repeat(64));
        let response = router
            .oneshot(
                Request::put(format!("/v2/myapp/manifests/{digest}"))
                    .body(Body::from(manifest_body()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(hooks.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn push_requires_token_when_auth_enabled() {
        let (_dir, state, hooks) = test_state(true).await;
        let router = serve_router(state.clone());

        let response = router
            .oneshot(
                Request::put("/v2/myapp/manifests/latest")
                    .body(Body::from(manifest_body()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(hooks.events.lock().unwrap().is_empty());

        // The pull-scoped service token is not enough to push.
        let pull_token = state.auth.service_pull_token().unwrap();
        let response = serve_router(state)
            .oneshot(
                Request::put("/v2/myapp/manifests/latest")
                    .header("authorization", format!("Bearer {pull_token}"))
                    .body(Body::from(manifest_body()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
