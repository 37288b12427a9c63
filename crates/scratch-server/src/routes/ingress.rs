use axum::extract::{Query, State};
use serde::Deserialize;

use crate::state::AppState;

#[derive(Deserialize)]
pub struct RuleQuery {
    /// `host:port` the proxy reaches this server on.
    #[serde(default)]
    pub upstream: Option<String>,
}

/// GET /api/ingress/nginx: the static proxy rule for this project.
pub async fn nginx_rule(State(app): State<AppState>, Query(q): Query<RuleQuery>) -> String {
    let upstream = q.upstream.unwrap_or_else(|| {
        let server = &app.controller.config().server;
        format!("127.0.0.1:{}", server.port)
    });
    app.controller.ingress_rule(&upstream)
}
