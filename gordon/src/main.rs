use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use rand::distributions::{Alphanumeric, DistString};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use gordon::api::{self, ApiState};
use gordon::args::{Args, Command};
use gordon::bus::{EventBus, Topic};
use gordon::config::{AuthConfig, ConfigStore};
use gordon::deploy::Deployer;
use gordon::envstore::EnvStore;
use gordon::handlers::{BusHooks, ManualDeployHandler, ReloadHandler, StoreCatalog};
use gordon::monitor::{LifecycleMonitor, MONITOR_INTERVAL};
use gordon::proxy::make_proxy;
use gordon::push::PushToDeploy;
use gordon::resolver::Resolver;
use gordon::runtime::{ContainerRuntime, DockerRuntime, RegistryAuth};
use gordon::signals;
use gordon::telemetry::{Counters, LogBuffer, LogBufferLayer};
use gordon::{Error, ErrorKind};
use gordon_common::DomainName;
use gordon_registry::{FsStore, RegistryState, TokenAuthority};

const AUTH_TOKEN_SECRET_ENV: &str = "GORDON_AUTH_TOKEN_SECRET";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(err) = run(args).await {
        eprintln!("error: {err}");
        std::process::exit(err.kind().exit_code());
    }
}

async fn run(args: Args) -> Result<(), Error> {
    match args.command {
        Command::Start => start(&args.config).await,
        Command::Reload => {
            let runtime_dir = runtime_dir(&args.config).await?;
            signal_running(&runtime_dir, libc::SIGUSR1).await
        }
        Command::Deploy { domain } => deploy(&args.config, domain).await,
        Command::Status => status(&args.config).await,
        Command::Logs { tail } => logs(&args.config, tail).await,
    }
}

async fn start(config_path: &Path) -> Result<(), Error> {
    let config = Arc::new(ConfigStore::load(config_path).await?);
    let snapshot = config.snapshot();

    let logs = LogBuffer::new(2048);
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(LogBufferLayer(logs.clone()))
        .init();

    let counters = Arc::new(Counters::default());
    let cancel = CancellationToken::new();

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::connect()?);
    runtime.ping().await?;
    info!("container runtime is reachable");

    // Registry surface. The pull credential is a startup-minted,
    // pull-scoped service token; it never touches disk.
    let secret = jwt_secret(&snapshot.auth);
    let authority = Arc::new(TokenAuthority::new(
        snapshot.auth.enabled,
        secret.as_bytes(),
        snapshot.auth.users.clone().into_iter().collect(),
    ));
    let store = Arc::new(
        FsStore::open(snapshot.server.runtime_dir.join("registry"))
            .await
            .map_err(|err| Error::custom(ErrorKind::Internal, err.to_string()))?,
    );
    let registry_auth = if snapshot.auth.enabled {
        let token = authority
            .service_pull_token()
            .map_err(|err| Error::custom(ErrorKind::Internal, err.to_string()))?;
        Some(RegistryAuth {
            server: snapshot.server.registry_host.clone(),
            token,
        })
    } else {
        None
    };

    let bus = EventBus::new(counters.clone());
    config.attach_bus(bus.clone());

    let resolver = Resolver::new(runtime.clone(), config.clone(), counters.clone());
    let env_store = Arc::new(EnvStore::new(&snapshot.server.runtime_dir));
    let deployer = Deployer::new(
        runtime.clone(),
        config.clone(),
        resolver.clone(),
        bus.clone(),
        env_store,
        StoreCatalog::new(store.clone()),
        registry_auth,
        counters.clone(),
        cancel.clone(),
    );

    bus.subscribe(
        Topic::ImagePushed,
        PushToDeploy::new(config.clone(), deployer.clone()),
    );
    let reload_handler = ReloadHandler::new(config.clone(), deployer.clone(), resolver.clone());
    bus.subscribe(Topic::ConfigReload, reload_handler.clone());
    bus.subscribe(Topic::ManualReload, reload_handler);
    bus.subscribe(
        Topic::ManualDeploy,
        ManualDeployHandler::new(config.clone(), deployer.clone()),
    );
    bus.start(cancel.clone());

    // Restart recovery is a label scan; unserved routes start fresh.
    let adopted = deployer.adopt().await?;
    info!(adopted, "startup adoption complete");

    write_pid_file(&snapshot.server.runtime_dir).await?;

    let registry_state = Arc::new(RegistryState {
        store,
        auth: authority,
        hooks: BusHooks::new(bus.clone()),
    });

    let proxy_server = hyper::Server::try_bind(&snapshot.server.proxy_addr)
        .map_err(|err| Error::source(ErrorKind::ConfigInvalid, err))?
        .serve(make_proxy(resolver.clone()));
    info!(addr = %snapshot.server.proxy_addr, "proxy listening");

    let registry_server = axum::Server::try_bind(&snapshot.server.registry_addr)
        .map_err(|err| Error::source(ErrorKind::ConfigInvalid, err))?
        .serve(gordon_registry::serve_router(registry_state).into_make_service());
    info!(addr = %snapshot.server.registry_addr, "registry listening");

    let api_state = Arc::new(ApiState {
        config: config.clone(),
        deployer: deployer.clone(),
        runtime: runtime.clone(),
        counters: counters.clone(),
        logs,
    });
    let control_server = axum::Server::try_bind(&snapshot.server.control_addr)
        .map_err(|err| Error::source(ErrorKind::ConfigInvalid, err))?
        .serve(api::router(api_state).into_make_service());
    info!(addr = %snapshot.server.control_addr, "control api listening");

    spawn_server("proxy", cancel.clone(), {
        let stop = cancel.clone();
        proxy_server.with_graceful_shutdown(async move { stop.cancelled().await })
    });
    spawn_server("registry", cancel.clone(), {
        let stop = cancel.clone();
        registry_server.with_graceful_shutdown(async move { stop.cancelled().await })
    });
    spawn_server("control", cancel.clone(), {
        let stop = cancel.clone();
        control_server.with_graceful_shutdown(async move { stop.cancelled().await })
    });

    let monitor = LifecycleMonitor::new(
        runtime,
        config.clone(),
        deployer.clone(),
        // The monitor shares the resolver so removals invalidate it.
        resolver,
        bus.clone(),
        counters.clone(),
        MONITOR_INTERVAL,
    );
    tokio::spawn(monitor.run(cancel.clone()));
    tokio::spawn(config.clone().watch(cancel.clone()));
    tokio::spawn(signals::run(
        bus.clone(),
        signals::deploy_request_path(&snapshot.server.runtime_dir),
        cancel.clone(),
    ));

    cancel.cancelled().await;

    info!("draining event bus and in-flight deployments");
    bus.stop().await;
    deployer.shutdown(SHUTDOWN_GRACE).await;
    remove_pid_file(&snapshot.server.runtime_dir).await;
    info!(
        counters = %serde_json::to_string(&counters.snapshot()).unwrap_or_default(),
        "shutdown complete"
    );
    Ok(())
}

fn spawn_server<F>(name: &'static str, cancel: CancellationToken, server: F)
where
    F: Future<Output = Result<(), hyper::Error>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(err) = server.await {
            error!(%err, "{name} server failed");
        }
        cancel.cancel();
    });
}

fn jwt_secret(auth: &AuthConfig) -> String {
    std::env::var(AUTH_TOKEN_SECRET_ENV)
        .ok()
        .or_else(|| auth.jwt_secret.clone())
        .unwrap_or_else(|| Alphanumeric.sample_string(&mut rand::thread_rng(), 48))
}

async fn runtime_dir(config_path: &Path) -> Result<std::path::PathBuf, Error> {
    let config = ConfigStore::load(config_path).await?;
    Ok(config.snapshot().server.runtime_dir.clone())
}

async fn write_pid_file(runtime_dir: &Path) -> Result<(), Error> {
    tokio::fs::create_dir_all(runtime_dir).await?;
    tokio::fs::write(
        signals::pid_path(runtime_dir),
        format!("{}\n", std::process::id()),
    )
    .await?;
    Ok(())
}

async fn remove_pid_file(runtime_dir: &Path) {
    let _ = tokio::fs::remove_file(signals::pid_path(runtime_dir)).await;
}

async fn read_pid(runtime_dir: &Path) -> Result<i32, Error> {
    let raw = tokio::fs::read_to_string(signals::pid_path(runtime_dir))
        .await
        .map_err(|_| {
            Error::custom(ErrorKind::RuntimeUnavailable, "no pid file; is gordon running?")
        })?;
    raw.trim().parse().map_err(|_| {
        Error::custom(ErrorKind::Internal, "pid file is unreadable")
    })
}

async fn signal_running(runtime_dir: &Path, sig: libc::c_int) -> Result<(), Error> {
    let pid = read_pid(runtime_dir).await?;
    let rc = unsafe { libc::kill(pid, sig) };
    if rc == 0 {
        Ok(())
    } else {
        Err(Error::custom(
            ErrorKind::RuntimeUnavailable,
            "gordon is not running (stale pid file?)",
        ))
    }
}

async fn deploy(config_path: &Path, domain: DomainName) -> Result<(), Error> {
    let runtime_dir = runtime_dir(config_path).await?;
    let request_path = signals::deploy_request_path(&runtime_dir);
    signals::write_deploy_request(&request_path, &domain)
        .await
        .map_err(Error::from)?;
    signal_running(&runtime_dir, libc::SIGUSR2).await?;
    println!("deploy of {domain} requested");
    Ok(())
}

async fn control_get(config_path: &Path, path: &str) -> Result<serde_json::Value, Error> {
    let config = ConfigStore::load(config_path).await?;
    let addr = config.snapshot().server.control_addr;
    let uri: hyper::Uri = format!("http://{addr}{path}")
        .parse()
        .map_err(|_| Error::custom(ErrorKind::ConfigInvalid, "bad control address"))?;

    let client = hyper::Client::new();
    let response = client.get(uri).await.map_err(|_| {
        Error::custom(
            ErrorKind::RuntimeUnavailable,
            "control api unreachable; is gordon running?",
        )
    })?;
    let body = hyper::body::to_bytes(response.into_body())
        .await
        .map_err(|err| Error::custom(ErrorKind::Internal, err.to_string()))?;
    serde_json::from_slice(&body).map_err(|err| Error::custom(ErrorKind::Internal, err.to_string()))
}

async fn status(config_path: &Path) -> Result<(), Error> {
    let status = control_get(config_path, "/status").await?;
    if let Some(routes) = status["routes"].as_array() {
        if routes.is_empty() {
            println!("no routes configured");
        }
        for route in routes {
            let container = route["container"]
                .as_object()
                .map(|container| {
                    format!(
                        "{} ({}, generation {})",
                        container["name"].as_str().unwrap_or("?"),
                        container["state"].as_str().unwrap_or("?"),
                        container["generation"].as_u64().unwrap_or(0),
                    )
                })
                .unwrap_or_else(|| "not deployed".to_string());
            println!(
                "{:<32} {:<32} {container}",
                route["domain"].as_str().unwrap_or("?"),
                route["image"].as_str().unwrap_or("?"),
            );
        }
    }
    println!(
        "\ncounters: {}",
        serde_json::to_string_pretty(&status["counters"]).unwrap_or_default()
    );
    Ok(())
}

async fn logs(config_path: &Path, tail: usize) -> Result<(), Error> {
    let lines = control_get(config_path, &format!("/logs?tail={tail}")).await?;
    if let Some(lines) = lines.as_array() {
        for line in lines {
            if let Some(line) = line.as_str() {
                println!("{line}");
            }
        }
    }
    Ok(())
}
