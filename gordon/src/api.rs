//! Loopback control plane consumed by the CLI: status, logs, deploy,
//! reload.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use gordon_common::DomainName;

use crate::config::{ConfigStore, ReloadMode};
use crate::deploy::{DeployOutcome, DeployReason, DeployRequest, Deployer};
use crate::runtime::ContainerRuntime;
use crate::telemetry::{Counters, CountersSnapshot, LogBuffer};
use crate::{Error, ErrorKind};

pub struct ApiState {
    pub config: Arc<ConfigStore>,
    pub deployer: Arc<Deployer>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub counters: Arc<Counters>,
    pub logs: Arc<LogBuffer>,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/logs", get(logs))
        .route("/deploy/:domain", post(deploy))
        .route("/reload", post(reload))
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct RouteStatus {
    pub domain: String,
    pub image: String,
    pub container: Option<ContainerStatusLine>,
}

#[derive(Debug, Serialize)]
pub struct ContainerStatusLine {
    pub name: String,
    pub state: String,
    pub generation: u64,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub routes: Vec<RouteStatus>,
    pub counters: CountersSnapshot,
}

async fn status(State(state): State<Arc<ApiState>>) -> Result<Json<StatusResponse>, Error> {
    let snapshot = state.config.snapshot();
    let containers = state.runtime.list_managed().await?;

    let routes = snapshot
        .routes
        .values()
        .map(|route| {
            let container = containers
                .iter()
                .filter_map(|view| {
                    let managed = view.managed()?;
                    (managed.domain == route.domain).then_some((managed, view))
                })
                .max_by_key(|(managed, _)| managed.generation)
                .map(|(managed, view)| ContainerStatusLine {
                    name: view.name.clone(),
                    state: view.status.to_string(),
                    generation: managed.generation,
                });
            RouteStatus {
                domain: route.domain.to_string(),
                image: route.image.to_string(),
                container,
            }
        })
        .collect();

    Ok(Json(StatusResponse {
        routes,
        counters: state.counters.snapshot(),
    }))
}

#[derive(Debug, Deserialize)]
struct LogsParams {
    #[serde(default = "default_tail")]
    tail: usize,
}

fn default_tail() -> usize {
    100
}

async fn logs(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<LogsParams>,
) -> Json<Vec<String>> {
    Json(state.logs.tail(params.tail))
}

#[derive(Debug, Serialize)]
struct DeployResponse {
    outcome: String,
    container_id: Option<String>,
    generation: Option<u64>,
}

async fn deploy(
    State(state): State<Arc<ApiState>>,
    Path(domain): Path<String>,
) -> Result<Json<DeployResponse>, Error> {
    let domain: DomainName = domain
        .parse()
        .map_err(|_| Error::from_kind(ErrorKind::RouteUnknown))?;
    let route = state
        .config
        .route(&domain)
        .ok_or_else(|| Error::from_kind(ErrorKind::RouteUnknown))?;

    let outcome = state
        .deployer
        .deploy(DeployRequest::new(domain, route.image, DeployReason::Manual))
        .await?;
    Ok(Json(match outcome {
        DeployOutcome::Deployed {
            container_id,
            generation,
        } => DeployResponse {
            outcome: "deployed".to_string(),
            container_id: Some(container_id),
            generation: Some(generation),
        },
        DeployOutcome::NoOp => DeployResponse {
            outcome: "no-op".to_string(),
            container_id: None,
            generation: None,
        },
    }))
}

#[derive(Debug, Serialize)]
struct ReloadResponse {
    touched: Vec<String>,
}

async fn reload(State(state): State<Arc<ApiState>>) -> Result<Json<ReloadResponse>, Error> {
    let touched = state.config.reload(ReloadMode::Full).await?;
    Ok(Json(ReloadResponse {
        touched: touched.into_iter().map(|domain| domain.to_string()).collect(),
    }))
}
