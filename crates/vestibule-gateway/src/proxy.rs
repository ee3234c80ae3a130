use crate::config::UpstreamConfig;
use crate::error::ApiError;
use crate::middleware::ClientIp;
use crate::state::GatewayState;
use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::{header, uri::PathAndQuery, HeaderMap, HeaderName, HeaderValue};
use axum::response::Response;
use futures_util::TryStreamExt;
use percent_encoding::percent_decode_str;
use reqwest::{redirect, Client, Url};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use vestibule_core::{VestibuleError, VestibuleResult};

/// Headers that describe a single hop and never cross the proxy.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// True for headers that never cross the proxy.
pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Header names listed in `Connection`, which are hop-by-hop for this request.
fn connection_listed(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect()
}

/// Request body after parsing, ready to re-send.
#[derive(Debug, PartialEq)]
pub enum ForwardBody {
    /// No body; content headers are dropped.
    Empty,
    /// Validated and re-serialized JSON.
    Json(Vec<u8>),
    /// Anything that is not JSON, passed through untouched.
    Raw {
        /// Body as received.
        bytes: Bytes,
        /// Original `Content-Type`, if any.
        content_type: Option<HeaderValue>,
    },
}

impl ForwardBody {
    /// Classify and, for JSON, validate a buffered body.
    pub fn parse(content_type: Option<&HeaderValue>, bytes: Bytes) -> VestibuleResult<Self> {
        if bytes.is_empty() {
            return Ok(Self::Empty);
        }
        if content_type.is_some_and(is_json_content_type) {
            let value: serde_json::Value = serde_json::from_slice(&bytes)
                .map_err(|e| VestibuleError::BadRequest(format!("Malformed JSON body: {e}")))?;
            return Ok(Self::Json(serde_json::to_vec(&value)?));
        }
        Ok(Self::Raw {
            bytes,
            content_type: content_type.cloned(),
        })
    }

    fn apply_headers(&self, headers: &mut HeaderMap) {
        let (content_type, len) = match self {
            Self::Empty => return,
            Self::Json(bytes) => (
                Some(HeaderValue::from_static("application/json")),
                bytes.len(),
            ),
            Self::Raw {
                bytes,
                content_type,
            } => (content_type.clone(), bytes.len()),
        };
        if let Some(content_type) = content_type {
            headers.insert(header::CONTENT_TYPE, content_type);
        }
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    }

    fn into_reqwest(self) -> Option<reqwest::Body> {
        match self {
            Self::Empty => None,
            Self::Json(bytes) => Some(bytes.into()),
            Self::Raw { bytes, .. } => Some(bytes.into()),
        }
    }
}

fn is_json_content_type(value: &HeaderValue) -> bool {
    let Ok(value) = value.to_str() else {
        return false;
    };
    let mime = value
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    mime == "application/json" || (mime.starts_with("application/") && mime.ends_with("+json"))
}

/// Forwards HTTP requests to the runtime.
pub struct ReverseProxy {
    client: Client,
    base_url: Url,
    secret_header: HeaderName,
    secret: Option<HeaderValue>,
    status_path: String,
    request_timeout: Duration,
    upgrade_timeout: Duration,
    max_body_bytes: usize,
}

impl ReverseProxy {
    /// Build the client for `config`. Fails on an unusable base URL.
    pub fn new(config: &UpstreamConfig) -> VestibuleResult<Self> {
        let base_url = config.parsed_base_url()?;
        let secret_header = HeaderName::from_bytes(config.secret_header.as_bytes())
            .map_err(|e| VestibuleError::Config(format!("upstream.secret_header: {e}")))?;
        let secret = if config.internal_secret.is_empty() {
            None
        } else {
            let mut value = HeaderValue::from_str(&config.internal_secret).map_err(|_| {
                VestibuleError::Config("upstream.internal_secret is not a valid header value".into())
            })?;
            value.set_sensitive(true);
            Some(value)
        };

        let client = Client::builder()
            .redirect(redirect::Policy::none())
            .connect_timeout(config.request_timeout())
            .build()
            .map_err(|e| VestibuleError::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            secret_header,
            secret,
            status_path: config.status_path.clone(),
            request_timeout: config.request_timeout(),
            upgrade_timeout: config.upgrade_timeout(),
            max_body_bytes: config.max_body_bytes,
        })
    }

    /// Upstream base URL.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Deadline for upstream upgrade handshakes.
    pub fn upgrade_timeout(&self) -> Duration {
        self.upgrade_timeout
    }

    /// `(name, value)` of the shared secret header, when one is configured.
    pub fn secret_header(&self) -> Option<(&HeaderName, &HeaderValue)> {
        self.secret.as_ref().map(|value| (&self.secret_header, value))
    }

    /// Upstream URL for an inbound path and query, under the base URL's path.
    ///
    /// Paths with `.` or `..` segments, raw or percent-encoded, are refused:
    /// URL parsing would resolve them and move the target out from under the
    /// route that matched.
    pub fn upstream_url(&self, path_and_query: &str) -> VestibuleResult<Url> {
        let path = path_and_query
            .split_once('?')
            .map_or(path_and_query, |(path, _)| path);
        if has_dot_segment(path) {
            warn!(path = %path, "Refusing path with dot segments");
            return Err(VestibuleError::BadRequest(
                "request path must not contain '.' or '..' segments".into(),
            ));
        }

        let base = self.base_url.as_str().trim_end_matches('/');
        let suffix = if path_and_query.starts_with('/') {
            path_and_query.to_string()
        } else {
            format!("/{path_and_query}")
        };
        Url::parse(&format!("{base}{suffix}"))
            .map_err(|e| VestibuleError::BadRequest(format!("Invalid request path: {e}")))
    }

    /// Forward one request and stream the response back.
    pub async fn forward(&self, request: Request, client_ip: &str) -> VestibuleResult<Response> {
        let (parts, body) = request.into_parts();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(PathAndQuery::as_str)
            .unwrap_or("/");
        let url = self.upstream_url(path_and_query)?;

        let bytes = axum::body::to_bytes(body, self.max_body_bytes)
            .await
            .map_err(|e| VestibuleError::BadRequest(format!("Failed to read request body: {e}")))?;
        let body = ForwardBody::parse(parts.headers.get(header::CONTENT_TYPE), bytes)?;

        let gateway_host = parts
            .headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let headers = self.forward_headers(&parts.headers, client_ip, &body);

        let mut outbound = self
            .client
            .request(parts.method.clone(), url)
            .headers(headers);
        if let Some(body) = body.into_reqwest() {
            outbound = outbound.body(body);
        }

        let upstream = match tokio::time::timeout(self.request_timeout, outbound.send()).await {
            Err(_) => {
                warn!(method = %parts.method, path = %parts.uri.path(), "Upstream request timed out");
                return Err(VestibuleError::UpstreamTimeout);
            }
            Ok(Err(e)) if e.is_timeout() => return Err(VestibuleError::UpstreamTimeout),
            Ok(Err(e)) => {
                let reason = if e.is_connect() {
                    "connection failed"
                } else {
                    "request failed"
                };
                warn!(method = %parts.method, path = %parts.uri.path(), error = %e, "Upstream {reason}");
                return Err(VestibuleError::UpstreamUnavailable(format!(
                    "upstream {reason}"
                )));
            }
            Ok(Ok(response)) => response,
        };

        if upstream.status().is_redirection() {
            check_redirect_loop(upstream.headers(), gateway_host.as_deref())?;
        }

        debug!(
            method = %parts.method,
            path = %parts.uri.path(),
            status = upstream.status().as_u16(),
            "Proxied request"
        );
        Ok(stream_response(upstream, parts.uri.path().to_string()))
    }

    fn forward_headers(&self, incoming: &HeaderMap, client_ip: &str, body: &ForwardBody) -> HeaderMap {
        let listed = connection_listed(incoming);
        let mut headers = HeaderMap::with_capacity(incoming.len() + 4);

        for (name, value) in incoming {
            let skip = is_hop_by_hop(name)
                || listed.iter().any(|l| l == name.as_str())
                || *name == header::AUTHORIZATION
                || *name == header::HOST
                || *name == header::CONTENT_LENGTH
                || *name == header::CONTENT_TYPE
                || *name == self.secret_header
                || name.as_str().starts_with("x-forwarded-");
            if !skip {
                headers.append(name.clone(), value.clone());
            }
        }

        let prior = incoming
            .get_all("x-forwarded-for")
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect::<Vec<_>>()
            .join(", ");
        let forwarded_for = if prior.is_empty() {
            client_ip.to_string()
        } else {
            format!("{prior}, {client_ip}")
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
            headers.insert("x-forwarded-for", value);
        }
        headers.insert("x-forwarded-proto", HeaderValue::from_static("http"));
        if let Some(host) = incoming.get(header::HOST) {
            headers.insert("x-forwarded-host", host.clone());
        }
        if let Some((name, value)) = self.secret_header() {
            headers.insert(name.clone(), value.clone());
        }

        body.apply_headers(&mut headers);
        headers
    }

    /// GET the runtime's status path; healthy only on `{"status":"ok"}`.
    pub async fn probe(&self) -> VestibuleResult<()> {
        let url = self.upstream_url(&self.status_path)?;
        let mut request = self.client.get(url);
        if let Some((name, value)) = self.secret_header() {
            request = request.header(name.clone(), value.clone());
        }

        let response = match tokio::time::timeout(self.request_timeout, request.send()).await {
            Err(_) => return Err(VestibuleError::UpstreamTimeout),
            Ok(Err(e)) => {
                return Err(VestibuleError::UpstreamUnavailable(format!(
                    "status probe failed: {e}"
                )))
            }
            Ok(Ok(response)) => response,
        };
        if !response.status().is_success() {
            return Err(VestibuleError::UpstreamUnavailable(format!(
                "status probe returned {}",
                response.status()
            )));
        }

        let body: serde_json::Value = response.json().await.map_err(|e| {
            VestibuleError::UpstreamUnavailable(format!("status probe returned invalid JSON: {e}"))
        })?;
        match body.get("status").and_then(serde_json::Value::as_str) {
            Some("ok") => Ok(()),
            other => Err(VestibuleError::UpstreamUnavailable(format!(
                "status probe reported {}",
                other.unwrap_or("no status")
            ))),
        }
    }
}

fn has_dot_segment(path: &str) -> bool {
    path.split(['/', '\\']).any(|segment| {
        let decoded = percent_decode_str(segment).decode_utf8_lossy();
        decoded == "." || decoded == ".."
    })
}

/// A 3xx pointing back at the gateway's own hostname would loop forever.
fn check_redirect_loop(headers: &HeaderMap, gateway_host: Option<&str>) -> VestibuleResult<()> {
    let (Some(location), Some(gateway_host)) = (
        headers.get(header::LOCATION).and_then(|v| v.to_str().ok()),
        gateway_host,
    ) else {
        return Ok(());
    };
    // Relative locations stay on the upstream.
    let Ok(target) = Url::parse(location) else {
        return Ok(());
    };
    let Some(own) = hostname_of(gateway_host) else {
        return Ok(());
    };

    match target.host_str() {
        Some(host) if host.eq_ignore_ascii_case(&own) => {
            Err(VestibuleError::ConfigMismatch(format!(
                "The runtime redirected to {location}, which points back at this gateway. \
                 Check the runtime's public URL setting; it must not be the gateway address."
            )))
        }
        _ => Ok(()),
    }
}

/// Hostname part of a `Host` header value, without port.
fn hostname_of(host_header: &str) -> Option<String> {
    Url::parse(&format!("http://{host_header}"))
        .ok()
        .and_then(|url| url.host_str().map(str::to_string))
}

fn stream_response(upstream: reqwest::Response, path: String) -> Response {
    let status = upstream.status();
    let mut headers = HeaderMap::with_capacity(upstream.headers().len());
    let listed = connection_listed(upstream.headers());
    for (name, value) in upstream.headers() {
        if !is_hop_by_hop(name) && !listed.iter().any(|l| l == name.as_str()) {
            headers.append(name.clone(), value.clone());
        }
    }

    // Headers are already on their way; a broken body can only be logged.
    let stream = upstream.bytes_stream().inspect_err(move |e| {
        warn!(path = %path, error = %e, "Upstream body stream failed");
    });

    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// Fallback handler for every `/api/*` route the gateway does not own.
pub async fn proxy_handler(
    State(state): State<Arc<GatewayState>>,
    ClientIp(ip): ClientIp,
    request: Request,
) -> Result<Response, ApiError> {
    state.proxy.forward(request, &ip).await.map_err(ApiError::from)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn proxy(secret: &str) -> ReverseProxy {
        ReverseProxy::new(&UpstreamConfig {
            base_url: "http://127.0.0.1:4000/runtime/".into(),
            internal_secret: secret.into(),
            ..UpstreamConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_json_body_is_reserialized() {
        let ct = HeaderValue::from_static("application/json; charset=utf-8");
        let body = ForwardBody::parse(Some(&ct), Bytes::from_static(b"{ }")).unwrap();
        assert_eq!(body, ForwardBody::Json(b"{}".to_vec()));

        let mut headers = HeaderMap::new();
        body.apply_headers(&mut headers);
        assert_eq!(headers[header::CONTENT_LENGTH], "2");
        assert_eq!(headers[header::CONTENT_TYPE], "application/json");
    }

    #[test]
    fn test_malformed_json_is_bad_request() {
        let ct = HeaderValue::from_static("application/json");
        let err = ForwardBody::parse(Some(&ct), Bytes::from_static(b"{nope")).unwrap_err();
        assert!(matches!(err, VestibuleError::BadRequest(_)));
    }

    #[test]
    fn test_vendor_json_and_raw_bodies() {
        let vendor = HeaderValue::from_static("application/merge-patch+json");
        assert!(matches!(
            ForwardBody::parse(Some(&vendor), Bytes::from_static(b"[1, 2]")).unwrap(),
            ForwardBody::Json(_)
        ));

        let text = HeaderValue::from_static("text/plain");
        let raw = ForwardBody::parse(Some(&text), Bytes::from_static(b"{not json")).unwrap();
        assert!(matches!(raw, ForwardBody::Raw { .. }));
        assert_eq!(
            ForwardBody::parse(None, Bytes::new()).unwrap(),
            ForwardBody::Empty
        );
    }

    #[test]
    fn test_empty_body_strips_content_headers() {
        let mut incoming = HeaderMap::new();
        incoming.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        incoming.insert(header::CONTENT_LENGTH, HeaderValue::from_static("17"));
        let headers = proxy("").forward_headers(&incoming, "127.0.0.1", &ForwardBody::Empty);
        assert!(headers.get(header::CONTENT_TYPE).is_none());
        assert!(headers.get(header::CONTENT_LENGTH).is_none());
    }

    #[test]
    fn test_header_hygiene() {
        let mut incoming = HeaderMap::new();
        incoming.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        incoming.insert(header::HOST, HeaderValue::from_static("gateway.local:3000"));
        incoming.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-trace"));
        incoming.insert("x-trace", HeaderValue::from_static("1"));
        incoming.insert("x-internal-secret", HeaderValue::from_static("spoofed"));
        incoming.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.1"));
        incoming.insert(header::ACCEPT, HeaderValue::from_static("application/json"));

        let headers = proxy("s3cret").forward_headers(&incoming, "10.0.0.7", &ForwardBody::Empty);

        assert!(headers.get(header::AUTHORIZATION).is_none());
        assert!(headers.get(header::HOST).is_none());
        assert!(headers.get(header::CONNECTION).is_none());
        assert!(headers.get("x-trace").is_none());
        assert_eq!(headers["x-internal-secret"], "s3cret");
        assert_eq!(headers["x-forwarded-for"], "203.0.113.1, 10.0.0.7");
        assert_eq!(headers["x-forwarded-proto"], "http");
        assert_eq!(headers["x-forwarded-host"], "gateway.local:3000");
        assert_eq!(headers[header::ACCEPT], "application/json");
    }

    #[test]
    fn test_no_secret_configured() {
        let headers = proxy("").forward_headers(&HeaderMap::new(), "10.0.0.7", &ForwardBody::Empty);
        assert!(headers.get("x-internal-secret").is_none());
    }

    #[test]
    fn test_upstream_url_keeps_base_path() {
        let url = proxy("").upstream_url("/api/sessions?limit=5").unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:4000/runtime/api/sessions?limit=5");
    }

    #[test]
    fn test_upstream_url_refuses_dot_segments() {
        let proxy = proxy("");
        for path in [
            "/api/../internal/status",
            "/api/%2e%2e/internal/status",
            "/api/%2E./internal",
            "/api/./sessions",
            "/api/..\\internal",
            "/api/..",
        ] {
            assert!(
                matches!(proxy.upstream_url(path), Err(VestibuleError::BadRequest(_))),
                "{path} was accepted"
            );
        }

        let url = proxy.upstream_url("/api/files/..hidden/v1.2?next=../x").unwrap();
        assert_eq!(
            url.as_str(),
            "http://127.0.0.1:4000/runtime/api/files/..hidden/v1.2?next=../x"
        );
    }

    #[test]
    fn test_redirect_loop_detection() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::LOCATION,
            HeaderValue::from_static("http://Gateway.Local:8443/login"),
        );
        assert!(matches!(
            check_redirect_loop(&headers, Some("gateway.local:3000")),
            Err(VestibuleError::ConfigMismatch(_))
        ));
        assert!(check_redirect_loop(&headers, Some("runtime.internal")).is_ok());

        headers.insert(header::LOCATION, HeaderValue::from_static("/login"));
        assert!(check_redirect_loop(&headers, Some("gateway.local:3000")).is_ok());
    }

    #[test]
    fn test_hostname_of_ipv6() {
        assert_eq!(hostname_of("[::1]:3000").as_deref(), Some("[::1]"));
        assert_eq!(hostname_of("localhost").as_deref(), Some("localhost"));
    }
}
