//! Gateway frontend
//!
//! Terminates TLS using SNI certificate dispatch and forwards requests
//! to the backend selected from the route table by the `Host` header.
//! Both collaborators are injected as traits; the frontend holds no
//! routing or certificate state of its own.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE, HOST};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::routing::RouteResolver;
use crate::tls::SniResolver;

type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// TLS-terminating frontend server.
pub struct GatewayServer {
    addr: SocketAddr,
    routes: Arc<dyn RouteResolver>,
    tls_config: Arc<rustls::ServerConfig>,
    client: Client<HttpConnector, Incoming>,
}

impl GatewayServer {
    pub fn new(addr: SocketAddr, routes: Arc<dyn RouteResolver>, resolver: Arc<SniResolver>) -> Self {
        let mut tls_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(resolver);
        tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];

        let client = Client::builder(TokioExecutor::new()).build_http();

        Self {
            addr,
            routes,
            tls_config: Arc::new(tls_config),
            client,
        }
    }

    /// Accept connections until the shutdown signal fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.addr)
            .await
            .with_context(|| format!("failed to bind {}", self.addr))?;
        let acceptor = TlsAcceptor::from(Arc::clone(&self.tls_config));

        info!(addr = %self.addr, "gateway listening");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("gateway shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };

                    let acceptor = acceptor.clone();
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        // Handshake failures (no SNI, no certificate) are
                        // routine and already logged by dispatch
                        let tls_stream = match acceptor.accept(stream).await {
                            Ok(tls_stream) => tls_stream,
                            Err(e) => {
                                debug!(peer = %peer, error = %e, "TLS handshake failed");
                                return;
                            }
                        };

                        let io = TokioIo::new(tls_stream);
                        let service = service_fn(move |req| {
                            let server = Arc::clone(&server);
                            async move { server.forward(req).await }
                        });

                        if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                            debug!(peer = %peer, error = %e, "connection error");
                        }
                    });
                }
            }
        }
    }

    /// Forward one request to the backend routed for its `Host` header.
    async fn forward(&self, mut req: Request<Incoming>) -> Result<Response<ProxyBody>, Infallible> {
        let Some(host) = req
            .headers()
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .map(|h| host_without_port(h).to_string())
        else {
            return Ok(status_response(
                StatusCode::BAD_REQUEST,
                "missing Host header",
            ));
        };

        let Some(route) = self.routes.resolve(&host) else {
            warn!(fqdn = %host, "no route for host");
            return Ok(status_response(
                StatusCode::BAD_GATEWAY,
                "no backend service available for this host",
            ));
        };

        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let target = format!("http://{}:{}{}", route.addr, route.port, path_and_query);
        let uri = match target.parse::<Uri>() {
            Ok(uri) => uri,
            Err(e) => {
                error!(fqdn = %host, target = %target, error = %e, "failed to build upstream URI");
                return Ok(status_response(StatusCode::BAD_GATEWAY, "bad upstream target"));
            }
        };

        *req.uri_mut() = uri;
        if let Ok(forwarded_host) = HeaderValue::from_str(&host) {
            req.headers_mut().insert("x-forwarded-host", forwarded_host);
        }
        req.headers_mut()
            .insert("x-forwarded-proto", HeaderValue::from_static("https"));

        debug!(fqdn = %host, target = %route.addr, port = route.port, "forwarding request");

        match self.client.request(req).await {
            Ok(response) => Ok(response.map(|body| body.boxed())),
            Err(e) => {
                error!(fqdn = %host, error = %e, "upstream request failed");
                Ok(status_response(
                    StatusCode::BAD_GATEWAY,
                    "backend request failed",
                ))
            }
        }
    }
}

/// Strip an optional `:port` suffix from a `Host` header value.
fn host_without_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((name, port)) if !name.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

fn status_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let body = Full::new(Bytes::from(format!("{} {}\n", status.as_u16(), message)))
        .map_err(|never| match never {})
        .boxed();
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

impl std::fmt::Debug for GatewayServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayServer")
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_without_port() {
        assert_eq!(host_without_port("app.example.com"), "app.example.com");
        assert_eq!(host_without_port("app.example.com:8443"), "app.example.com");
        assert_eq!(host_without_port("[::1]:8443"), "[::1]");
        // Not a port suffix
        assert_eq!(host_without_port("app.example.com:x"), "app.example.com:x");
    }

    #[test]
    fn test_status_response_shape() {
        let response = status_response(StatusCode::BAD_GATEWAY, "no backend");
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "text/plain; charset=utf-8"
        );
    }
}
