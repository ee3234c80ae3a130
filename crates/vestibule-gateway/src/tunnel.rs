//! Raw WebSocket tunnel.
//!
//! An upgrade request is authenticated from its `token` query parameter,
//! replayed against the runtime over a fresh HTTP/1.1 connection, and on a
//! 101 the two upgraded sockets are spliced byte for byte. The gateway
//! sends its own pings to the client and tears the tunnel down when no pong
//! arrives for two and a half ping intervals.

use crate::connection::TunnelGuard;
use crate::error::ApiError;
use crate::frame::{FrameScanner, PING_FRAME};
use crate::middleware::resolve_client_ip;
use crate::proxy::is_hop_by_hop;
use crate::state::GatewayState;
use axum::body::Body;
use axum::extract::Request;
use axum::http::{
    header, uri::PathAndQuery, HeaderMap, HeaderName, HeaderValue, Method, StatusCode,
};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use http_body_util::Empty;
use hyper::body::Incoming;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use percent_encoding::percent_decode_str;
use reqwest::Url;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use vestibule_core::{VestibuleError, VestibuleResult};

const BUFFER_SIZE: usize = 16 * 1024;

/// Handshake headers copied from the client to the runtime.
static FORWARDED_HANDSHAKE: [HeaderName; 5] = [
    header::SEC_WEBSOCKET_KEY,
    header::SEC_WEBSOCKET_VERSION,
    header::SEC_WEBSOCKET_EXTENSIONS,
    header::SEC_WEBSOCKET_PROTOCOL,
    header::ORIGIN,
];

/// Handshake headers copied from the runtime's 101 back to the client.
static MIRRORED_HANDSHAKE: [HeaderName; 3] = [
    header::SEC_WEBSOCKET_ACCEPT,
    header::SEC_WEBSOCKET_PROTOCOL,
    header::SEC_WEBSOCKET_EXTENSIONS,
];

/// Entry point for every `Upgrade: websocket` request.
pub async fn handle_upgrade(state: Arc<GatewayState>, request: Request) -> Response {
    match open_tunnel(state, request).await {
        Ok(response) => response,
        Err(err) => ApiError(err).into_response(),
    }
}

async fn open_tunnel(state: Arc<GatewayState>, mut request: Request) -> VestibuleResult<Response> {
    let client_ip = resolve_client_ip(
        request.headers(),
        request.extensions(),
        state.config.trust_forwarded_for,
    );
    let path = request.uri().path().to_string();
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(PathAndQuery::as_str)
        .unwrap_or("/");
    let mut target = state.proxy.upstream_url(path_and_query)?;
    let token = take_query_param(&mut target, "token");

    if state.sessions.is_configured() {
        let touched = token
            .as_deref()
            .and_then(|t| state.sessions.touch_session(t));
        if touched.is_none() {
            warn!(client_ip = %client_ip, path = %path, "Rejected tunnel: invalid session token");
            return Err(VestibuleError::Unauthorized);
        }
    }

    let guard = state.tunnels.try_register(&path, &client_ip)?;

    let (authority, host_header) = upstream_authority(&target)?;
    let upstream_request =
        build_upstream_request(&state, request.headers(), &target, &host_header, &client_ip)?;

    let mut upstream_response = tokio::time::timeout(
        state.proxy.upgrade_timeout(),
        connect_upstream(&authority, upstream_request),
    )
    .await
    .map_err(|_| {
        warn!(tunnel_id = %guard.id(), path = %path, "Upstream upgrade timed out");
        VestibuleError::UpstreamTimeout
    })??;

    if upstream_response.status() != StatusCode::SWITCHING_PROTOCOLS {
        debug!(
            tunnel_id = %guard.id(),
            status = upstream_response.status().as_u16(),
            "Upstream declined upgrade, relaying response"
        );
        return Ok(relay_response(upstream_response));
    }

    let response = switching_protocols(upstream_response.headers());
    let client_upgrade = hyper::upgrade::on(&mut request);
    let upstream_upgrade = hyper::upgrade::on(&mut upstream_response);
    let ping_interval = state.config.tunnel.ping_interval();
    let liveness_timeout = state.config.tunnel.liveness_timeout();

    tokio::spawn(async move {
        let upgraded = tokio::select! {
            () = guard.cancelled() => return,
            pair = async { tokio::try_join!(client_upgrade, upstream_upgrade) } => pair,
        };
        match upgraded {
            Ok((client, upstream)) => {
                splice(client, upstream, guard, ping_interval, liveness_timeout).await;
            }
            Err(e) => warn!(tunnel_id = %guard.id(), error = %e, "Upgrade did not complete"),
        }
    });

    Ok(response)
}

/// Remove every `name` pair from the query, returning the first value.
/// Other pairs are kept byte for byte, in order.
fn take_query_param(url: &mut Url, name: &str) -> Option<String> {
    let query = url.query()?.to_string();
    let mut value = None;
    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| {
            let (key, raw_value) = pair.split_once('=').unwrap_or((*pair, ""));
            if decode_component(key) != name {
                return true;
            }
            value.get_or_insert_with(|| decode_component(raw_value));
            false
        })
        .collect();

    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.set_query(Some(&kept.join("&")));
    }
    value
}

/// Decode one `application/x-www-form-urlencoded` component.
fn decode_component(raw: &str) -> String {
    percent_decode_str(&raw.replace('+', " "))
        .decode_utf8_lossy()
        .into_owned()
}

/// `(host:port to dial, Host header value)` for the runtime.
fn upstream_authority(target: &Url) -> VestibuleResult<(String, String)> {
    if target.scheme() != "http" {
        return Err(VestibuleError::UpstreamUnavailable(
            "tunnels need a plain http upstream".into(),
        ));
    }
    let host = target
        .host_str()
        .ok_or_else(|| VestibuleError::UpstreamUnavailable("upstream has no host".into()))?;
    let port = target.port_or_known_default().unwrap_or(80);
    let host_header = match target.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    Ok((format!("{host}:{port}"), host_header))
}

fn build_upstream_request(
    state: &GatewayState,
    incoming: &HeaderMap,
    target: &Url,
    host_header: &str,
    client_ip: &str,
) -> VestibuleResult<hyper::Request<Empty<Bytes>>> {
    let mut uri = target.path().to_string();
    if let Some(query) = target.query() {
        uri.push('?');
        uri.push_str(query);
    }

    let mut builder = hyper::Request::builder()
        .method(Method::GET)
        .uri(uri)
        .header(header::HOST, host_header)
        .header(header::CONNECTION, "Upgrade")
        .header(header::UPGRADE, "websocket");

    for name in &FORWARDED_HANDSHAKE {
        for value in incoming.get_all(name) {
            builder = builder.header(name.clone(), value.clone());
        }
    }

    let forwarded_for = match incoming
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        Some(prior) if !prior.is_empty() => format!("{prior}, {client_ip}"),
        _ => client_ip.to_string(),
    };
    builder = builder.header("x-forwarded-for", forwarded_for);

    if let Some((name, value)) = state.proxy.secret_header() {
        builder = builder.header(name.clone(), value.clone());
    }

    builder
        .body(Empty::new())
        .map_err(|e| VestibuleError::Internal(format!("Failed to build upgrade request: {e}")))
}

async fn connect_upstream(
    authority: &str,
    request: hyper::Request<Empty<Bytes>>,
) -> VestibuleResult<hyper::Response<Incoming>> {
    let stream = TcpStream::connect(authority).await.map_err(|e| {
        warn!(upstream = %authority, error = %e, "Upstream connection failed");
        VestibuleError::UpstreamUnavailable("upstream connection failed".into())
    })?;

    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| VestibuleError::UpstreamUnavailable(format!("upstream handshake failed: {e}")))?;

    tokio::spawn(async move {
        if let Err(e) = connection.with_upgrades().await {
            debug!(error = %e, "Upstream upgrade connection ended");
        }
    });

    sender
        .send_request(request)
        .await
        .map_err(|e| VestibuleError::UpstreamUnavailable(format!("upstream upgrade failed: {e}")))
}

/// Pass a non-101 answer through unchanged apart from hop-by-hop headers.
fn relay_response(upstream: hyper::Response<Incoming>) -> Response {
    let (parts, body) = upstream.into_parts();
    let mut response = Response::new(Body::new(body));
    *response.status_mut() = parts.status;
    let headers = response.headers_mut();
    for (name, value) in &parts.headers {
        if !is_hop_by_hop(name) {
            headers.append(name.clone(), value.clone());
        }
    }
    response
}

fn switching_protocols(upstream: &HeaderMap) -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = response.headers_mut();
    headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
    headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
    for name in &MIRRORED_HANDSHAKE {
        for value in upstream.get_all(name) {
            headers.append(name.clone(), value.clone());
        }
    }
    response
}

/// Last time the client proved it is alive.
struct Liveness {
    last: Mutex<Instant>,
}

impl Liveness {
    fn new() -> Self {
        Self {
            last: Mutex::new(Instant::now()),
        }
    }

    fn mark(&self) {
        *self.last.lock() = Instant::now();
    }

    fn elapsed(&self) -> Duration {
        self.last.lock().elapsed()
    }
}

async fn splice(
    client: Upgraded,
    upstream: Upgraded,
    guard: TunnelGuard,
    ping_interval: Duration,
    liveness_timeout: Duration,
) {
    let (client_rd, client_wr) = tokio::io::split(TokioIo::new(client));
    let (upstream_rd, upstream_wr) = tokio::io::split(TokioIo::new(upstream));
    let liveness = Liveness::new();
    let ping = Notify::new();

    info!(tunnel_id = %guard.id(), "Tunnel established");

    let reason = tokio::select! {
        () = guard.cancelled() => "shutdown",
        result = pump_client_to_upstream(client_rd, upstream_wr, &liveness) => match result {
            Ok(()) => "client closed",
            Err(_) => "client error",
        },
        result = pump_upstream_to_client(upstream_rd, client_wr, &ping) => match result {
            Ok(()) => "upstream closed",
            Err(_) => "upstream error",
        },
        () = watchdog(&liveness, &ping, ping_interval, liveness_timeout) => {
            warn!(tunnel_id = %guard.id(), "No pong from client, tearing tunnel down");
            "liveness timeout"
        }
    };

    info!(tunnel_id = %guard.id(), reason, "Tunnel closed");
}

async fn pump_client_to_upstream<R, W>(mut reader: R, mut writer: W, liveness: &Liveness) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut scanner = FrameScanner::new();
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        if scanner.feed(&buf[..n]).pong_seen {
            liveness.mark();
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
    }
}

/// Copies runtime bytes to the client and slips a ping in at the next frame
/// boundary whenever `ping` is notified.
async fn pump_upstream_to_client<R, W>(mut reader: R, mut writer: W, ping: &Notify) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut scanner = FrameScanner::new();
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut ping_pending = false;

    loop {
        tokio::select! {
            () = ping.notified() => {
                if scanner.at_boundary() {
                    writer.write_all(&PING_FRAME).await?;
                    writer.flush().await?;
                } else {
                    ping_pending = true;
                }
            }
            read = reader.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    return Ok(());
                }
                let chunk = &buf[..n];
                if ping_pending && scanner.at_boundary() {
                    writer.write_all(&PING_FRAME).await?;
                    ping_pending = false;
                }
                let report = scanner.feed(chunk);
                match report.first_boundary.filter(|_| ping_pending) {
                    Some(at) => {
                        writer.write_all(&chunk[..at]).await?;
                        writer.write_all(&PING_FRAME).await?;
                        writer.write_all(&chunk[at..]).await?;
                        ping_pending = false;
                    }
                    None => writer.write_all(chunk).await?,
                }
                writer.flush().await?;
            }
        }
    }
}

/// Requests a ping every interval; returns once the client has been silent
/// for longer than `timeout`.
async fn watchdog(liveness: &Liveness, ping: &Notify, interval: Duration, timeout: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if liveness.elapsed() > timeout {
            return;
        }
        ping.notify_one();
    }
}
