//! The user-facing data path: hostname in, proxied response out.
//!
//! The proxy consumes exactly one contract from the core, the
//! resolver: every request resolves its `Host` to a live `(host,
//! port)` and is forwarded there. In-flight requests against a
//! displaced container complete naturally because the old container
//! keeps running through its drain window.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::prelude::*;
use http::StatusCode;
use hyper::body::Body;
use hyper::server::conn::AddrStream;
use hyper::{Request, Response};
use serde_json::json;
use tower::Service;
use tracing::debug;

use gordon_common::DomainName;

use crate::resolver::Resolver;
use crate::{Error, ErrorKind};

pub struct ProxyService {
    resolver: Arc<Resolver>,
    remote_addr: SocketAddr,
}

impl Service<Request<Body>> for ProxyService {
    type Response = Response<Body>;
    type Error = Error;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let remote_ip = self.remote_addr.ip();
        let resolver = Arc::clone(&self.resolver);
        Box::pin(
            async move {
                let host = req
                    .headers()
                    .get(http::header::HOST)
                    .and_then(|value| value.to_str().ok())
                    .map(|host| host.split(':').next().unwrap_or(host))
                    .ok_or_else(|| Error::from_kind(ErrorKind::RouteUnknown))?;
                let domain: DomainName = host
                    .parse()
                    .map_err(|_| Error::from_kind(ErrorKind::RouteUnknown))?;

                let target = resolver.resolve(&domain).await?;
                let forward_uri = format!("http://{}:{}", target.host, target.port);
                debug!(%domain, %forward_uri, generation = target.generation, "proxying");

                hyper_reverse_proxy::call(remote_ip, &forward_uri, req)
                    .await
                    .map_err(|_| {
                        Error::custom(ErrorKind::Internal, "upstream container request failed")
                    })
            }
            .or_else(|err: Error| future::ready(Ok(error_response(err)))),
        )
    }
}

fn error_response(err: Error) -> Response<Body> {
    let status = match err.kind() {
        ErrorKind::RouteUnknown => StatusCode::NOT_FOUND,
        ErrorKind::Unhealthy | ErrorKind::RuntimeUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::BAD_GATEWAY,
    };
    let body = json!({ "error": err.kind().to_string() }).to_string();
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .expect("static response construction")
}

pub struct MakeProxyService {
    resolver: Arc<Resolver>,
}

impl<'r> Service<&'r AddrStream> for MakeProxyService {
    type Response = ProxyService;
    type Error = Error;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, target: &'r AddrStream) -> Self::Future {
        let resolver = Arc::clone(&self.resolver);
        let remote_addr = target.remote_addr();
        Box::pin(async move {
            Ok(ProxyService {
                resolver,
                remote_addr,
            })
        })
    }
}

pub fn make_proxy(resolver: Arc<Resolver>) -> MakeProxyService {
    MakeProxyService { resolver }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use gordon_common::labels::ManagedLabels;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use crate::config::ConfigStore;
    use crate::runtime::mock::MockRuntime;
    use crate::runtime::{ContainerStatus, ContainerView};
    use crate::telemetry::Counters;

    use super::*;

    /// A one-connection-at-a-time upstream answering 200 with a body.
    async fn serve_upstream() -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 2048];
                    let _ = stream.read(&mut buf).await;
                    let _ = stream
                        .write_all(
                            b"HTTP/1.1 200 OK\r\ncontent-length: 8\r\n\r\nupstream",
                        )
                        .await;
                });
            }
        });
        addr
    }

    async fn proxy_fixture(
        routes: &str,
    ) -> (tempfile::TempDir, Arc<MockRuntime>, SocketAddr) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gordon.toml");
        tokio::fs::write(&path, routes).await.unwrap();
        let config = Arc::new(ConfigStore::load(&path).await.unwrap());
        let runtime = Arc::new(MockRuntime::new());
        let resolver = Resolver::new(
            runtime.clone(),
            config,
            Arc::new(Counters::default()),
        );

        let proxy_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = hyper::Server::bind(&proxy_addr).serve(make_proxy(resolver));
        let bound = server.local_addr();
        tokio::spawn(server);
        tokio::time::sleep(Duration::from_millis(50)).await;
        (dir, runtime, bound)
    }

    fn serving(domain: &str, port: u16) -> ContainerView {
        let labels = ManagedLabels::new(
            domain.parse().unwrap(),
            "myapp:latest".parse().unwrap(),
            1,
        )
        .with_port(Some(port));
        ContainerView {
            id: "c1".to_string(),
            name: format!("{}-1", domain.replace('.', "-")),
            status: ContainerStatus::Running,
            labels: labels.encode(),
            ip: Some(std::net::IpAddr::from([127, 0, 0, 1])),
            exposed_ports: vec![port],
            published: vec![],
        }
    }

    #[tokio::test]
    async fn proxies_to_the_resolved_container() {
        let upstream = serve_upstream().await;
        let routes = format!(
            "[routes.\"app.example.com\"]\nimage = \"myapp:latest\"\nport = {}\n",
            upstream.port()
        );
        let (_dir, runtime, proxy_addr) = proxy_fixture(&routes).await;
        runtime.seed_container(serving("app.example.com", upstream.port()));

        let client = hyper::Client::new();
        let request = Request::get(format!("http://{proxy_addr}/hello"))
            .header("Host", "app.example.com")
            .body(Body::empty())
            .unwrap();
        let response = client.request(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        assert_eq!(&body[..], b"upstream");
    }

    #[tokio::test]
    async fn unknown_host_is_not_found() {
        let (_dir, _runtime, proxy_addr) = proxy_fixture("").await;

        let client = hyper::Client::new();
        let request = Request::get(format!("http://{proxy_addr}/"))
            .header("Host", "unknown.example.com")
            .body(Body::empty())
            .unwrap();
        let response = client.request(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn route_without_container_is_unavailable() {
        let (_dir, _runtime, proxy_addr) =
            proxy_fixture("[routes.\"app.example.com\"]\nimage = \"myapp:latest\"\n").await;

        let client = hyper::Client::new();
        let request = Request::get(format!("http://{proxy_addr}/"))
            .header("Host", "app.example.com")
            .body(Body::empty())
            .unwrap();
        let response = client.request(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
