//! Forwarding of admitted requests to internal services.
use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, Request, Response, header};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::error::AppError;
use crate::services::request_path::ensure_canonical;

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("route entry `{0}` is not `prefix=url`")]
    Shape(String),
    #[error("route prefix `{0}` must start with '/'")]
    Prefix(String),
    #[error("route upstream `{0}` is not an http(s) URL")]
    Upstream(String),
}

#[derive(Debug, Clone)]
struct Route {
    prefix: String,
    upstream: Url,
}

impl Route {
    /// Segment-aware prefix match: `/api/user` covers `/api/user/1` but not `/api/users`.
    fn covers(&self, path: &str) -> bool {
        if self.prefix == "/" {
            return true;
        }
        match path.strip_prefix(self.prefix.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }
}

/// Path-prefix routing table; the longest matching prefix wins.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    /// Parse `prefix=url` pairs separated by commas.
    pub fn parse(raw: &str) -> Result<Self, RouteError> {
        let mut routes = Vec::new();
        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (prefix, upstream) = entry
                .split_once('=')
                .ok_or_else(|| RouteError::Shape(entry.to_string()))?;
            let prefix = prefix.trim().trim_end_matches('/');
            let prefix = if prefix.is_empty() { "/" } else { prefix };
            if !prefix.starts_with('/') {
                return Err(RouteError::Prefix(prefix.to_string()));
            }

            let upstream = Url::parse(upstream.trim())
                .ok()
                .filter(|u| matches!(u.scheme(), "http" | "https"))
                .ok_or_else(|| RouteError::Upstream(upstream.trim().to_string()))?;

            routes.push(Route {
                prefix: prefix.to_string(),
                upstream,
            });
        }
        routes.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Ok(Self { routes })
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Upstream URL for a request: upstream base + original path + original query.
    ///
    /// `path` must already be canonical; `Url::set_path` resolves dot segments.
    pub fn resolve(&self, path: &str, query: Option<&str>) -> Option<Url> {
        let route = self.routes.iter().find(|r| r.covers(path))?;

        let mut url = route.upstream.clone();
        let base = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{base}{path}"));
        url.set_query(query);
        Some(url)
    }
}

/// Connection-scoped headers that must not cross the proxy.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Headers listed in `Connection` are hop-by-hop too.
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamProxy {
    client: reqwest::Client,
    routes: RouteTable,
}

impl UpstreamProxy {
    pub fn new(routes: RouteTable, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            .redirect(reqwest::redirect::Policy::none())
            // Upstreams are internal; ambient HTTP(S)_PROXY settings must not apply.
            .no_proxy()
            .build()?;
        Ok(Self { client, routes })
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Stream the request to its upstream and stream the answer back.
    pub async fn forward(&self, req: Request<Body>) -> Result<Response<Body>, AppError> {
        let (parts, body) = req.into_parts();
        ensure_canonical(parts.uri.path())?;
        let Some(url) = self.routes.resolve(parts.uri.path(), parts.uri.query()) else {
            debug!(path = %parts.uri.path(), "no upstream route");
            return Err(AppError::NoRoute);
        };

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);

        let upstream = self
            .client
            .request(parts.method, url.clone())
            .headers(headers)
            .body(reqwest::Body::wrap_stream(body.into_data_stream()))
            .send()
            .await
            .map_err(|e| {
                warn!(upstream = %url.origin().ascii_serialization(), error = %e, "upstream call failed");
                AppError::UpstreamUnavailable
            })?;

        let status = upstream.status();
        let mut response_headers = upstream.headers().clone();
        strip_hop_by_hop(&mut response_headers);

        let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        Ok(response)
    }
}
