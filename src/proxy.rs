//! Streaming reverse proxy to worker data planes.
//!
//! One shared connection pool serves every worker; parsed targets are cached
//! by URL string. The response body is handed back frame-by-frame so SSE
//! token streams reach the client as the upstream produces them. Round trips
//! feed the latency tracker: header receipt counts as OK regardless of the
//! upstream status code, transport failures count as errors and surface as
//! 502.

use crate::latency::LatencyTracker;
use axum::body::Body;
use axum::http::header::{HeaderMap, HeaderName, HeaderValue, HOST};
use axum::http::{Request, Response, StatusCode, Uri};
use bytes::Bytes;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// Standard hop-by-hop headers, stripped on both legs.
const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const POOL_MAX_IDLE_PER_HOST: usize = 50;

/// Scheme + authority of a worker data plane, parsed and validated once.
#[derive(Clone)]
struct Target {
    scheme: String,
    authority: String,
    host: HeaderValue,
}

pub struct ProxyClient {
    client: Client<HttpConnector, Body>,
    latency: Arc<LatencyTracker>,
    targets: Mutex<HashMap<String, Target>>,
}

impl ProxyClient {
    pub fn new(latency: Arc<LatencyTracker>) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .build_http();
        Self {
            client,
            latency,
            targets: Mutex::new(HashMap::new()),
        }
    }

    /// Forward `req` (with its buffered body) to `data_plane_url`, keeping
    /// the original path and query. The returned response streams the
    /// upstream body unbuffered.
    pub async fn forward(
        &self,
        node_id: &str,
        data_plane_url: &str,
        req: Request<Body>,
        body: Bytes,
    ) -> Response<Body> {
        let target = match self.target(data_plane_url) {
            Ok(t) => t,
            Err(e) => {
                error!(node_id, url = data_plane_url, error = %e, "invalid data plane url");
                return error_response(StatusCode::BAD_GATEWAY, "invalid node data plane url");
            }
        };

        let (mut parts, _) = req.into_parts();

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri: Uri = match format!("{}://{}{}", target.scheme, target.authority, path_and_query)
            .parse()
        {
            Ok(u) => u,
            Err(e) => {
                error!(node_id, error = %e, "failed to build upstream uri");
                return error_response(StatusCode::BAD_GATEWAY, "invalid node data plane url");
            }
        };
        parts.uri = uri;

        // Upstream virtual-host routing needs the target's host.
        parts.headers.insert(HOST, target.host.clone());
        strip_hop_by_hop(&mut parts.headers);

        // Replay the buffered body with its length restored.
        parts.headers.insert(
            axum::http::header::CONTENT_LENGTH,
            HeaderValue::from(body.len() as u64),
        );
        let upstream_req = Request::from_parts(parts, Body::from(body));

        let start = Instant::now();
        match self.client.request(upstream_req).await {
            Ok(resp) => {
                self.latency.observe_ok(node_id, start.elapsed());
                let (mut parts, body) = resp.into_parts();
                strip_hop_by_hop(&mut parts.headers);
                debug!(node_id, status = %parts.status, "upstream responded");
                Response::from_parts(parts, Body::new(body))
            }
            Err(e) => {
                self.latency.observe_error(node_id, start.elapsed());
                error!(node_id, error = %e, "upstream transport error");
                error_response(StatusCode::BAD_GATEWAY, "upstream error")
            }
        }
    }

    fn target(&self, data_plane_url: &str) -> Result<Target, String> {
        {
            let targets = self.targets.lock().unwrap();
            if let Some(t) = targets.get(data_plane_url) {
                return Ok(t.clone());
            }
        }

        let uri: Uri = data_plane_url
            .parse()
            .map_err(|e| format!("parse: {e}"))?;
        let scheme = uri.scheme_str().unwrap_or("http").to_string();
        let authority = uri
            .authority()
            .ok_or_else(|| "missing authority".to_string())?
            .to_string();
        let host =
            HeaderValue::from_str(&authority).map_err(|e| format!("host header: {e}"))?;

        let target = Target {
            scheme,
            authority,
            host,
        };
        self.targets
            .lock()
            .unwrap()
            .insert(data_plane_url.to_string(), target.clone());
        Ok(target)
    }
}

/// Remove hop-by-hop headers, including any named by `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all("connection")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| name.trim().parse::<HeaderName>().ok())
        .collect();

    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
    for name in listed {
        headers.remove(name);
    }
}

fn error_response(status: StatusCode, message: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from(message.to_string()))
        .unwrap()
}
