//! Reference ingress.
//!
//! Every request first goes through [`dispatch`]: control-plane requests
//! continue to the API router (with the control prefix stripped in path
//! mode), scratch requests are forwarded over the scratch's bridge socket.
//! A scratch that cannot be reached gets the fallback page with 503, never
//! a raw connection error.

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderValue, StatusCode, Uri},
    middleware::Next,
    response::{IntoResponse, Response},
};
use hyper_util::rt::TokioIo;
use scratch_core::routing::{self, Dispatch, RouteBinding};
use scratch_core::Identity;
use tokio::net::UnixStream;
use tracing::{debug, warn};

use crate::state::AppState;

// ---------------------------------------------------------------------------
// Hop-by-hop headers, never forwarded in either direction.
// ---------------------------------------------------------------------------

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub const IDENTITY_HEADER: &str = "x-scratch-identity";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

/// Outermost middleware: classify the request and either hand it to the
/// control API or forward it to a scratch.
pub async fn dispatch(State(app): State<AppState>, mut req: Request, next: Next) -> Response {
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().host())
        .unwrap_or("")
        .to_string();
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    match routing::dispatch(&app.controller.config().ingress, &host, &path_and_query) {
        Dispatch::Control { path } => {
            if path != path_and_query {
                match path.parse::<Uri>() {
                    Ok(uri) => *req.uri_mut() = uri,
                    Err(_) => return (StatusCode::BAD_REQUEST, "invalid path").into_response(),
                }
            }
            next.run(req).await
        }
        Dispatch::Scratch {
            identity,
            service,
            path,
        } => forward(&app, req, identity, service, path).await,
        Dispatch::Invalid { reason } => (StatusCode::BAD_REQUEST, reason).into_response(),
    }
}

// ---------------------------------------------------------------------------
// Forwarding
// ---------------------------------------------------------------------------

async fn forward(
    app: &AppState,
    req: Request,
    identity: Identity,
    service: String,
    path: String,
) -> Response {
    let ctl = app.controller.clone();
    let id = identity.clone();
    let binding = match tokio::task::spawn_blocking(move || ctl.route(&id, &service)).await {
        Ok(Ok(b)) => b,
        Ok(Err(e)) => {
            debug!(identity = %identity, error = %e, "no route");
            return unavailable(app, &identity);
        }
        Err(e) => {
            warn!(identity = %identity, error = %e, "route lookup panicked");
            return unavailable(app, &identity);
        }
    };

    match send(&binding, req, &path).await {
        Ok(resp) => resp,
        Err(e) => {
            warn!(
                identity = %identity,
                socket = %binding.socket.display(),
                error = %e,
                "forward failed"
            );
            unavailable(app, &identity)
        }
    }
}

async fn send(binding: &RouteBinding, req: Request, path: &str) -> anyhow::Result<Response> {
    let stream = UnixStream::connect(&binding.socket).await?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    let identity = binding.identity.to_string();
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(identity = %identity, error = %e, "upstream connection closed");
        }
    });

    let (parts, body) = req.into_parts();
    let original_host = parts.headers.get(header::HOST).cloned();
    let mut builder = hyper::Request::builder()
        .method(parts.method)
        .uri(path)
        .version(hyper::Version::HTTP_11);
    for (name, value) in &parts.headers {
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        builder = builder.header(name, value);
    }
    if let Some(host) = original_host {
        builder = builder.header("x-forwarded-host", host);
    }
    let request_id = parts
        .headers
        .get(REQUEST_ID_HEADER)
        .cloned()
        .unwrap_or_else(|| {
            HeaderValue::from_str(&uuid::Uuid::new_v4().to_string())
                .unwrap_or_else(|_| HeaderValue::from_static("unknown"))
        });
    builder = builder
        .header(IDENTITY_HEADER, binding.identity.as_str())
        .header(REQUEST_ID_HEADER, request_id);

    let upstream = sender.send_request(builder.body(body)?).await?;
    let (parts, incoming) = upstream.into_parts();
    let mut resp = Response::new(Body::new(incoming));
    *resp.status_mut() = parts.status;
    for (name, value) in &parts.headers {
        if !HOP_BY_HOP.contains(&name.as_str()) {
            resp.headers_mut().append(name, value.clone());
        }
    }
    Ok(resp)
}

/// The fallback page for `identity`, with 503.
pub fn unavailable(app: &AppState, identity: &Identity) -> Response {
    let page = routing::render_fallback(&app.fallback, identity.as_str());
    let mut resp = (StatusCode::SERVICE_UNAVAILABLE, page).into_response();
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    resp.headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    resp
}
