//! Routing bridge.
//!
//! Each running scratch owns one unix socket per exposed service under
//! `<scratch>/sockets/`, bound by the auxiliary bridge container. The ingress
//! never learns about individual scratches: it extracts the identity from
//! every request and targets `<identity>/sockets/<service>.sock`. Adding or
//! removing a scratch adds or removes files, never ingress configuration.

use crate::config::{Config, IngressConfig};
use crate::error::{Result, ScratchError};
use crate::fragment::ServiceFragment;
use crate::identity::Identity;
use crate::paths;
use crate::scratch::{ScratchEnvironment, ScratchState};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const SOCKET_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingMode {
    /// `<identity>.<domain>`
    #[default]
    Subdomain,
    /// `<domain>/<identity>/...`
    Path,
}

impl std::fmt::Display for RoutingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoutingMode::Subdomain => f.write_str("subdomain"),
            RoutingMode::Path => f.write_str("path"),
        }
    }
}

/// Public URL of a scratch's ingress service.
pub fn public_url(ingress: &IngressConfig, identity: &str) -> String {
    match ingress.routing {
        RoutingMode::Subdomain => format!("http://{identity}.{}", ingress.domain),
        RoutingMode::Path => format!("http://{}/{identity}/", ingress.domain),
    }
}

/// Names the ingress claims for the control plane in either routing mode. A
/// scratch with one of these identities could never be reached.
pub fn is_reserved(ingress: &IngressConfig, identity: &str) -> bool {
    [&ingress.control_host, &ingress.control_prefix]
        .iter()
        .any(|name| name.eq_ignore_ascii_case(identity))
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Orchestrator control API; `path` has the control prefix removed.
    Control { path: String },
    /// Forward to a scratch; `path` is what the scratch service sees.
    Scratch {
        identity: Identity,
        service: String,
        path: String,
    },
    /// Looked like a scratch request but the identity is malformed.
    Invalid { reason: String },
}

/// Classify a request by host and path-and-query. Pure: does not consult the
/// filesystem, so it never changes when scratches come and go.
pub fn dispatch(ingress: &IngressConfig, host: &str, path_and_query: &str) -> Dispatch {
    match ingress.routing {
        RoutingMode::Subdomain => dispatch_subdomain(ingress, host, path_and_query),
        RoutingMode::Path => dispatch_path(ingress, path_and_query),
    }
}

fn dispatch_subdomain(ingress: &IngressConfig, host: &str, path: &str) -> Dispatch {
    let host = strip_port(host).to_ascii_lowercase();
    let domain = ingress.domain.to_ascii_lowercase();
    let control = || Dispatch::Control {
        path: path.to_string(),
    };

    let Some(prefix) = host.strip_suffix(&domain).and_then(|p| p.strip_suffix('.')) else {
        // Bare domain, IP or anything outside the wildcard zone.
        return control();
    };
    let label = prefix.split('.').next().unwrap_or(prefix);
    if label.eq_ignore_ascii_case(&ingress.control_host) {
        return control();
    }
    match Identity::parse(label) {
        Ok(identity) => Dispatch::Scratch {
            identity,
            service: ingress.service.clone(),
            path: path.to_string(),
        },
        Err(_) => Dispatch::Invalid {
            reason: format!("'{label}' is not a scratch identity"),
        },
    }
}

fn dispatch_path(ingress: &IngressConfig, path_and_query: &str) -> Dispatch {
    let (path, query) = match path_and_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_and_query, None),
    };
    let trimmed = path.trim_start_matches('/');
    let (first, rest) = match trimmed.split_once('/') {
        Some((first, rest)) => (first, format!("/{rest}")),
        None => (trimmed, "/".to_string()),
    };
    let with_query = |p: String| match query {
        Some(q) => format!("{p}?{q}"),
        None => p,
    };

    if first.is_empty() {
        return Dispatch::Control {
            path: path_and_query.to_string(),
        };
    }
    if first == ingress.control_prefix {
        return Dispatch::Control {
            path: with_query(rest),
        };
    }
    match Identity::parse(first) {
        Ok(identity) => Dispatch::Scratch {
            identity,
            service: ingress.service.clone(),
            path: with_query(rest),
        },
        Err(_) => Dispatch::Invalid {
            reason: format!("'{first}' is not a scratch identity"),
        },
    }
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return host;
    }
    host.rsplit_once(':').map(|(h, _)| h).unwrap_or(host)
}

// ---------------------------------------------------------------------------
// RouteBinding
// ---------------------------------------------------------------------------

/// A resolved forward target. Computed per request, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteBinding {
    pub identity: Identity,
    pub service: String,
    pub socket: PathBuf,
}

/// Resolve the socket for `identity`/`service`. Succeeds only when the
/// scratch exists, is running (or degraded but up) and the bridge socket is
/// present.
pub fn bind(releases: &Path, identity: &Identity, service: &str) -> Result<RouteBinding> {
    let unavailable = || ScratchError::RoutingUnavailable {
        identity: identity.to_string(),
        service: service.to_string(),
    };
    let manifest = paths::manifest_path(releases, identity.as_str());
    let scratch = ScratchEnvironment::load(&manifest).map_err(|_| unavailable())?;
    if !matches!(scratch.state, ScratchState::Running | ScratchState::Degraded) {
        return Err(unavailable());
    }
    let socket = paths::socket_path(releases, identity.as_str(), service);
    if !socket.exists() {
        return Err(unavailable());
    }
    Ok(RouteBinding {
        identity: identity.clone(),
        service: service.to_string(),
        socket,
    })
}

// ---------------------------------------------------------------------------
// Bridge endpoints
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeEndpoint {
    pub service: String,
    pub port: u16,
}

/// Per-scratch services that must be reachable through a socket.
pub fn bridge_endpoints(fragments: &[&ServiceFragment]) -> Vec<BridgeEndpoint> {
    fragments
        .iter()
        .filter(|f| f.is_per_scratch())
        .filter_map(|f| {
            f.expose.map(|port| BridgeEndpoint {
                service: f.name.clone(),
                port,
            })
        })
        .collect()
}

/// Shell program run by the bridge container: one `socat` listener per
/// endpoint, sockets owned by the host uid/gid so the ingress can open them.
pub fn bridge_script(endpoints: &[BridgeEndpoint], uid: u32, gid: u32) -> String {
    let dir = paths::SOCKETS_DIR;
    let mut script = String::from("set -e\n");
    for e in endpoints {
        let sock = format!("/{dir}/{}.{}", e.service, paths::SOCKET_EXT);
        script.push_str(&format!("rm -f {sock}\n"));
        script.push_str(&format!(
            "socat UNIX-LISTEN:{sock},fork,unlink-early,user={uid},group={gid},mode=0666 TCP:{}:{} &\n",
            e.service, e.port
        ));
    }
    script.push_str("wait\n");
    script
}

/// Wait until every endpoint socket exists. Returns the services still
/// missing when `wait` elapses (empty on success).
pub fn establish(
    releases: &Path,
    identity: &str,
    endpoints: &[BridgeEndpoint],
    wait: Duration,
) -> Vec<String> {
    let deadline = Instant::now() + wait;
    loop {
        let missing: Vec<String> = endpoints
            .iter()
            .filter(|e| !paths::socket_path(releases, identity, &e.service).exists())
            .map(|e| e.service.clone())
            .collect();
        if missing.is_empty() || Instant::now() >= deadline {
            return missing;
        }
        std::thread::sleep(SOCKET_POLL);
    }
}

/// Remove dangling socket files after the bridge container is gone.
pub fn reap(releases: &Path, identity: &str) -> Result<usize> {
    crate::io::clear_dir(&paths::sockets_dir(releases, identity))
}

// ---------------------------------------------------------------------------
// Fallback page
// ---------------------------------------------------------------------------

pub const DEFAULT_FALLBACK_PAGE: &str = r#"<!doctype html>
<html>
<head><meta charset="utf-8"><title>Environment unavailable</title></head>
<body style="font-family: sans-serif; max-width: 40em; margin: 4em auto;">
<h1>Environment unavailable</h1>
<p>The scratch environment <code>{{identity}}</code> is not running.</p>
<p>It may still be starting, it may have been stopped, or it may not exist.</p>
</body>
</html>
"#;

/// Fallback page template: the configured file, or the built-in page.
pub fn fallback_template(config: &Config, root: &Path) -> String {
    config
        .ingress
        .fallback_page
        .as_ref()
        .map(|p| if p.is_absolute() { p.clone() } else { root.join(p) })
        .and_then(|p| std::fs::read_to_string(p).ok())
        .unwrap_or_else(|| DEFAULT_FALLBACK_PAGE.to_string())
}

pub fn render_fallback(template: &str, identity: &str) -> String {
    template.replace("{{identity}}", &html_escape(identity))
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

// ---------------------------------------------------------------------------
// nginx rule
// ---------------------------------------------------------------------------

/// Render the single static nginx server block for the configured mode.
/// `socket_root` is the releases directory as the proxy sees it;
/// `control_upstream` is `host:port` of the orchestrator.
pub fn render_nginx_rule(
    ingress: &IngressConfig,
    socket_root: &Path,
    control_upstream: &str,
    fallback: &str,
) -> String {
    let root = socket_root.display().to_string();
    let root = root.trim_end_matches('/');
    let service = &ingress.service;
    let domain = &ingress.domain;
    let page = nginx_string(&fallback.replace("{{identity}}", "$scratch_id"));
    let proxy_headers = "        proxy_http_version 1.1;\n\
        proxy_set_header Host $host;\n\
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;\n\
        proxy_set_header X-Forwarded-Proto $scheme;\n\
        proxy_set_header Upgrade $http_upgrade;\n\
        proxy_set_header Connection \"upgrade\";\n";
    let unavailable = format!(
        "    error_page 502 503 504 =503 @scratch_unavailable;\n\n\
    location @scratch_unavailable {{\n\
        default_type text/html;\n\
        return 503 \"{page}\";\n\
    }}\n"
    );

    let mut out = format!(
        "# Generated by `scratch ingress`. Identity-keyed: no per-scratch entries.\n\
         # routing: {}\n\n",
        ingress.routing
    );
    match ingress.routing {
        RoutingMode::Subdomain => {
            let escaped = regex::escape(domain);
            out.push_str(&format!(
                "server {{\n\
    listen 80;\n\
    server_name {domain} {control}.{domain};\n\n\
    location / {{\n\
        proxy_pass http://{control_upstream};\n\
{proxy_headers}    }}\n\
}}\n\n\
server {{\n\
    listen 80;\n\
    server_name ~^(?<scratch_id>[a-z0-9_-]+)\\.{escaped}$;\n\n\
    location / {{\n\
        proxy_pass http://unix:{root}/$scratch_id/{sockets}/{service}.{ext}:;\n\
{proxy_headers}    }}\n\n\
{unavailable}}}\n",
                control = ingress.control_host,
                sockets = paths::SOCKETS_DIR,
                ext = paths::SOCKET_EXT,
            ));
        }
        RoutingMode::Path => {
            out.push_str(&format!(
                "server {{\n\
    listen 80;\n\
    server_name {domain};\n\n\
    location = / {{\n\
        proxy_pass http://{control_upstream};\n\
{proxy_headers}    }}\n\n\
    location ^~ /{prefix}/ {{\n\
        proxy_pass http://{control_upstream}/;\n\
{proxy_headers}    }}\n\n\
    location ~ ^/(?<scratch_id>[a-z0-9_-]+)(?:/|$) {{\n\
        rewrite ^/[^/]+/?(.*)$ /$1 break;\n\
        proxy_pass http://unix:{root}/$scratch_id/{sockets}/{service}.{ext}:;\n\
{proxy_headers}    }}\n\n\
{unavailable}}}\n",
                prefix = ingress.control_prefix,
                sockets = paths::SOCKETS_DIR,
                ext = paths::SOCKET_EXT,
            ));
        }
    }
    out
}

/// Quote a body for nginx `return`. `$` would start a variable, so it is
/// emitted as an HTML entity unless it introduces `$scratch_id`.
fn nginx_string(s: &str) -> String {
    const VAR: &str = "$scratch_id";
    s.split(VAR)
        .map(|part| {
            part.replace('\\', "\\\\")
                .replace('"', "\\\"")
                .replace('$', "&#36;")
                .replace('\n', " ")
        })
        .collect::<Vec<_>>()
        .join(VAR)
}
