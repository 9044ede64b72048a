//! Demo coordinator - HTTP surface
//!
//! One listener serves everything: the WebSocket client protocol (upgraded
//! out of hyper at /ws), the reverse proxy's auth and invite sub-requests,
//! health, status and metrics.

use std::convert::Infallible;
use std::net::IpAddr;
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{self, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use crate::coordinator::{Coordinator, SessionAuth};
use crate::invite::Validation;
use crate::server::{self, source_address};

/// Cookie carrying the session bearer token
const SESSION_COOKIE: &str = "demo_session";
/// Proxy header naming the authenticated principal
const USER_HEADER: &str = "X-Grafana-User";

/// Accept loop. Each connection gets its own task; WebSocket upgrades are
/// carried by hyper's upgrade machinery.
pub async fn run(
    listener: TcpListener,
    coord: Arc<Coordinator>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let coord = Arc::clone(&coord);
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                route(req, peer.ip(), Arc::clone(&coord))
                            });
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .with_upgrades()
                                .await
                            {
                                debug!("connection error from {}: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => error!("accept error: {}", e),
                }
            }
            _ = shutdown.changed() => {
                info!("listener shutting down");
                break;
            }
        }
    }
}

async fn route(
    req: Request<Incoming>,
    peer: IpAddr,
    coord: Arc<Coordinator>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    if req.method() != Method::GET {
        return Ok(text(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"));
    }

    let path = req.uri().path().to_owned();
    Ok(match path.as_str() {
        "/ws" => upgrade_websocket(req, peer, coord),
        "/health" => json_response(
            StatusCode::OK,
            &json!({
                "status": "ok",
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }),
        ),
        "/status" => {
            let snapshot = coord.status_snapshot().await;
            json_response(StatusCode::OK, &serde_json::to_value(&snapshot).unwrap_or_default())
        }
        "/session/validate" => session_validate(&req, &coord).await,
        "/invite/validate" => invite_validate(&req, peer, &coord).await,
        "/metrics" => {
            let mut resp = text(StatusCode::OK, coord.metrics().render());
            resp.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            resp
        }
        _ => text(StatusCode::NOT_FOUND, "not found"),
    })
}

/// Auth sub-request for the reverse proxy: 200 with the user principal if
/// the bearer token is a live session or a queued client, 401 otherwise.
async fn session_validate(
    req: &Request<Incoming>,
    coord: &Arc<Coordinator>,
) -> Response<Full<Bytes>> {
    let Some(token) = cookie_value(req.headers().get(header::COOKIE), SESSION_COOKIE) else {
        return text(StatusCode::UNAUTHORIZED, "No session cookie");
    };

    match coord.authorize_session_token(&token).await {
        SessionAuth::Active { principal } | SessionAuth::Pending { principal } => {
            let mut resp = text(StatusCode::OK, "OK");
            if let Ok(value) = HeaderValue::from_str(&principal) {
                resp.headers_mut().insert(USER_HEADER, value);
            }
            resp
        }
        SessionAuth::Invalid => text(StatusCode::UNAUTHORIZED, "Session not active"),
    }
}

/// Invite sub-request for the reverse proxy; validation without side
/// effects.
async fn invite_validate(
    req: &Request<Incoming>,
    peer: IpAddr,
    coord: &Arc<Coordinator>,
) -> Response<Full<Bytes>> {
    let token = req
        .headers()
        .get("X-Invite-Token")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .or_else(|| query_param(req.uri().query(), "token"));

    let Some(token) = token else {
        return json_response(
            StatusCode::UNAUTHORIZED,
            &json!({
                "valid": false,
                "reason": "invalid",
                "message": "Missing invite token",
            }),
        );
    };

    let forwarded = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok());
    let source = source_address(forwarded, peer);

    match coord.validate_invite_readonly(&token, source).await {
        Validation::Valid { .. } => json_response(StatusCode::OK, &json!({"valid": true})),
        Validation::Invalid(rejection) => json_response(
            StatusCode::UNAUTHORIZED,
            &json!({
                "valid": false,
                "reason": rejection.as_str(),
                "message": rejection.message(),
            }),
        ),
    }
}

/// Hand the connection over to the WebSocket surface. The 101 response
/// goes out through hyper; the upgraded byte stream is wrapped into a
/// tungstenite server socket.
fn upgrade_websocket(
    mut req: Request<Incoming>,
    peer: IpAddr,
    coord: Arc<Coordinator>,
) -> Response<Full<Bytes>> {
    let is_websocket = req
        .headers()
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let Some(key) = req.headers().get(header::SEC_WEBSOCKET_KEY).cloned() else {
        return text(StatusCode::BAD_REQUEST, "missing Sec-WebSocket-Key");
    };
    if !is_websocket {
        return text(StatusCode::BAD_REQUEST, "expected websocket upgrade");
    }

    let accept_key = derive_accept_key(key.as_bytes());
    let forwarded = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok());
    let source = source_address(forwarded, peer);
    let user_agent = req
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    tokio::spawn(async move {
        match hyper::upgrade::on(&mut req).await {
            Ok(upgraded) => {
                let io = TokioIo::new(upgraded);
                let ws = WebSocketStream::from_raw_socket(io, Role::Server, None).await;
                server::handle_socket(coord, ws, source, user_agent).await;
            }
            Err(e) => warn!("websocket upgrade failed: {}", e),
        }
    });

    let mut resp = Response::new(Full::new(Bytes::new()));
    *resp.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    resp.headers_mut()
        .insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
    resp.headers_mut()
        .insert(header::UPGRADE, HeaderValue::from_static("websocket"));
    if let Ok(value) = HeaderValue::from_str(&accept_key) {
        resp.headers_mut().insert(header::SEC_WEBSOCKET_ACCEPT, value);
    }
    resp
}

fn text(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(body.into()));
    *resp.status_mut() = status;
    resp
}

fn json_response(status: StatusCode, value: &serde_json::Value) -> Response<Full<Bytes>> {
    let mut resp = text(status, value.to_string());
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    resp
}

/// Pull one cookie out of a Cookie header
fn cookie_value(header: Option<&HeaderValue>, name: &str) -> Option<String> {
    let raw = header?.to_str().ok()?;
    for pair in raw.split(';') {
        if let Some((key, value)) = pair.trim().split_once('=') {
            if key == name {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// Pull one parameter out of a query string
fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    for pair in query?.split('&') {
        if let Some((key, value)) = pair.split_once('=') {
            if key == name {
                return Some(value.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cookie_value_parsing() {
        let header = HeaderValue::from_static("a=1; demo_session=tok.abc; b=2");
        assert_eq!(
            cookie_value(Some(&header), "demo_session"),
            Some("tok.abc".to_string())
        );
        assert_eq!(cookie_value(Some(&header), "missing"), None);
        assert_eq!(cookie_value(None, "demo_session"), None);
    }

    #[test]
    fn test_cookie_value_single_cookie() {
        let header = HeaderValue::from_static("demo_session=xyz");
        assert_eq!(
            cookie_value(Some(&header), "demo_session"),
            Some("xyz".to_string())
        );
    }

    #[test]
    fn test_query_param_parsing() {
        assert_eq!(
            query_param(Some("token=T1&other=x"), "token"),
            Some("T1".to_string())
        );
        assert_eq!(query_param(Some("other=x"), "token"), None);
        assert_eq!(query_param(None, "token"), None);
    }
}
