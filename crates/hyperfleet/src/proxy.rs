//! C10: the reverse proxy. Routes inbound HTTP either by URL prefix
//! (`/<prefix>/<machine-id>/<port>/…`) or by host suffix
//! (`<machine-id>-<port>.<suffix>`) to the guest's `guest_ip:port`,
//! waiting for the guest to start listening if it hasn't yet.

use crate::error::{Error, Result};
use crate::store::{MachineStatus, Store};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

/// Overall deadline for a single proxied request to wait for the guest's
/// target port to come up, regardless of the poll interval.
const EXPOSED_PORT_WAIT_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
struct Route {
    machine_id: String,
    port: u16,
    rest: String,
}

fn route_by_prefix(path: &str, prefix: &str) -> Option<Route> {
    let trimmed = path.strip_prefix('/')?;
    let rest = trimmed.strip_prefix(prefix)?.strip_prefix('/')?;
    let mut parts = rest.splitn(3, '/');
    let machine_id = parts.next()?.to_string();
    let port: u16 = parts.next()?.parse().ok()?;
    let rest = parts.next().unwrap_or("").to_string();
    Some(Route { machine_id, port, rest })
}

fn route_by_host(host: &str, host_suffix: &str) -> Option<Route> {
    if host_suffix.is_empty() {
        return None;
    }
    let label = host.strip_suffix(host_suffix)?.trim_end_matches('.');
    let (machine_id, port_str) = label.rsplit_once('-')?;
    let port: u16 = port_str.parse().ok()?;
    Some(Route { machine_id: machine_id.to_string(), port, rest: String::new() })
}

pub struct ReverseProxy {
    store: Store,
    prefix: String,
    host_suffix: String,
    poll_interval: Duration,
    client: Client<HttpConnector, Full<Bytes>>,
}

impl ReverseProxy {
    pub fn new(store: Store, prefix: String, host_suffix: String, poll_interval_ms: u64) -> Self {
        Self {
            store,
            prefix,
            host_suffix,
            poll_interval: Duration::from_millis(poll_interval_ms),
            client: Client::builder(hyper_util::rt::TokioExecutor::new()).build(HttpConnector::new()),
        }
    }

    fn route(&self, req: &Request<Incoming>) -> Option<Route> {
        if let Some(route) = route_by_prefix(req.uri().path(), &self.prefix) {
            return Some(route);
        }
        let host = req.headers().get(hyper::header::HOST)?.to_str().ok()?;
        route_by_host(host, &self.host_suffix)
    }

    async fn resolve_guest_addr(&self, route: &Route) -> Result<SocketAddr> {
        let machine = crate::store::machines::get(self.store.pool(), &route.machine_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("machine {}", route.machine_id)))?;

        if machine.status != MachineStatus::Running {
            return Err(Error::NotFound(format!("machine {} is not running", route.machine_id)));
        }

        let guest_ip = machine.guest_ip.ok_or_else(|| Error::NotFound(format!("machine {} has no guest ip", route.machine_id)))?;
        let addr = format!("{guest_ip}:{}", route.port)
            .parse::<SocketAddr>()
            .map_err(|e| Error::Runtime(format!("invalid guest address: {e}")))?;
        Ok(addr)
    }

    /// Polls `addr` with plain TCP connects until it accepts or the
    /// deadline passes — a side channel independent of C7, since the
    /// guest may be listening on a port with no agent involvement at all.
    async fn wait_for_port(&self, addr: SocketAddr) -> Result<()> {
        let deadline = Instant::now() + EXPOSED_PORT_WAIT_DEADLINE;
        loop {
            if TcpStream::connect(addr).await.is_ok() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::PortUnavailable(format!("guest port {addr} did not become reachable in time")));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn handle(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let Some(route) = self.route(&req) else {
            return error_response(Error::NotFound("no route matched this request".into()));
        };

        let addr = match self.resolve_guest_addr(&route).await {
            Ok(addr) => addr,
            Err(e) => return error_response(e),
        };

        if let Err(e) = self.wait_for_port(addr).await {
            return error_response(e);
        }

        match self.forward(req, &route, addr).await {
            Ok(resp) => resp,
            Err(e) => error_response(e),
        }
    }

    async fn forward(&self, req: Request<Incoming>, route: &Route, addr: SocketAddr) -> Result<Response<Full<Bytes>>> {
        let (parts, body) = req.into_parts();
        let body_bytes = body.collect().await.map_err(|e| Error::Runtime(format!("reading request body: {e}")))?.to_bytes();

        let path = if route.rest.is_empty() { "/".to_string() } else { format!("/{}", route.rest) };
        let uri: hyper::Uri = format!("http://{addr}{path}").parse().map_err(|e| Error::Runtime(format!("{e}")))?;

        let mut forwarded = Request::builder().method(parts.method).uri(uri);
        for (name, value) in parts.headers.iter() {
            forwarded = forwarded.header(name, value);
        }
        let forwarded = forwarded
            .body(Full::new(body_bytes))
            .map_err(|e| Error::Runtime(format!("building proxied request: {e}")))?;

        let resp = self.client.request(forwarded).await.map_err(|e| Error::Vsock(format!("guest unreachable: {e}")))?;

        let (parts, body) = resp.into_parts();
        let bytes = body.collect().await.map_err(|e| Error::Runtime(format!("reading guest response: {e}")))?.to_bytes();
        Ok(Response::from_parts(parts, Full::new(bytes)))
    }
}

fn error_response(err: Error) -> Response<Full<Bytes>> {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let envelope = crate::error::ErrorEnvelope::from(&err);
    let body = serde_json::to_vec(&envelope).unwrap_or_default();
    Response::builder().status(status).body(Full::new(Bytes::from(body))).unwrap_or_else(|_| {
        Response::new(Full::new(Bytes::from_static(b"internal error")))
    })
}

/// Runs the proxy's HTTP/1.1 accept loop on `addr` until the process
/// exits. Each connection is handled on its own task so a slow guest on
/// one connection never blocks another.
pub async fn serve(proxy: Arc<ReverseProxy>, addr: SocketAddr) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "reverse proxy listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        let proxy = proxy.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| {
                let proxy = proxy.clone();
                async move { Ok::<_, std::convert::Infallible>(proxy.handle(req).await) }
            });
            if let Err(e) = hyper::server::conn::http1::Builder::new().serve_connection(io, service).await {
                warn!(%peer, error = %e, "reverse proxy connection ended with an error");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_by_prefix_extracts_machine_port_and_rest() {
        let route = route_by_prefix("/vm/m123/8080/a/b", "vm").unwrap();
        assert_eq!(route.machine_id, "m123");
        assert_eq!(route.port, 8080);
        assert_eq!(route.rest, "a/b");
    }

    #[test]
    fn route_by_host_extracts_machine_and_port_from_suffix() {
        let route = route_by_host("m123-8080.hyperfleet.example", ".hyperfleet.example").unwrap();
        assert_eq!(route.machine_id, "m123");
        assert_eq!(route.port, 8080);
    }

    #[test]
    fn route_by_host_rejects_non_matching_suffix() {
        assert!(route_by_host("m123-8080.other.example", ".hyperfleet.example").is_none());
    }
}
