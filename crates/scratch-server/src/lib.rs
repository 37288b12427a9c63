pub mod error;
pub mod ingress;
pub mod routes;
pub mod state;

use anyhow::Context;
use axum::routing::{get, post};
use axum::Router;
use std::path::Path;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use state::AppState;

/// Build the axum Router: the control API behind the ingress dispatch
/// middleware. Used by `serve()` and by integration tests.
pub fn build_router(app_state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = Router::new()
        .route("/api/health", get(routes::health::health))
        .route("/api/config", get(routes::config::get_config))
        // Scratches
        .route(
            "/api/scratches",
            get(routes::scratches::list_scratches).post(routes::scratches::create_scratch),
        )
        .route(
            "/api/scratches/{name}",
            get(routes::scratches::get_scratch).delete(routes::scratches::delete_scratch),
        )
        .route(
            "/api/scratches/{name}/start",
            post(routes::scratches::start_scratch),
        )
        .route(
            "/api/scratches/{name}/stop",
            post(routes::scratches::stop_scratch),
        )
        .route(
            "/api/scratches/{name}/restart",
            post(routes::scratches::restart_scratch),
        )
        .route(
            "/api/scratches/{name}/update",
            post(routes::scratches::update_scratch),
        )
        .route(
            "/api/scratches/{name}/rebuild",
            post(routes::scratches::rebuild_scratch),
        )
        .route(
            "/api/scratches/{name}/wipe-db",
            post(routes::scratches::wipe_database),
        )
        // Env files
        .route(
            "/api/scratches/{name}/env",
            get(routes::env::read_env).put(routes::env::write_env),
        )
        .route(
            "/api/scratches/{name}/env/reset",
            post(routes::env::reset_env),
        )
        // Logs
        .route("/api/scratches/{name}/logs", get(routes::logs::get_logs))
        .route("/api/scratches/{name}/oplogs", get(routes::logs::list_oplogs))
        .route(
            "/api/scratches/{name}/oplogs/{file}",
            get(routes::logs::get_oplog),
        )
        // Webhooks
        .route(
            "/api/webhooks/github",
            post(routes::webhook::github_webhook),
        )
        // Shared services
        .route("/api/services", get(routes::services::list_services))
        .route("/api/services/start", post(routes::services::start_services))
        .route("/api/services/stop", post(routes::services::stop_services))
        // Ingress
        .route("/api/ingress/nginx", get(routes::ingress::nginx_rule))
        .layer(cors)
        .with_state(app_state.clone());

    // Dispatch runs before routing so it can rewrite control-plane paths.
    Router::new()
        .fallback_service(api)
        .layer(axum::middleware::from_fn_with_state(
            app_state,
            ingress::dispatch,
        ))
        .layer(TraceLayer::new_for_http())
}

/// Serve the control API and ingress for the project at `root`. `host` and
/// `port` override the `server` section of `scratch.yaml`.
pub async fn serve(root: &Path, host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    let app_state = AppState::load(root).context("failed to load scratch.yaml")?;
    let server = &app_state.controller.config().server;
    let addr = format!(
        "{}:{}",
        host.unwrap_or_else(|| server.host.clone()),
        port.unwrap_or(server.port)
    );
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    serve_on(app_state, listener).await
}

/// Serve on a pre-bound listener (port 0 lets the OS pick).
pub async fn serve_on(app_state: AppState, listener: tokio::net::TcpListener) -> anyhow::Result<()> {
    let actual = listener.local_addr()?;
    let cancel = app_state.controller.runtime().cancel_token();
    let domain = app_state.controller.config().ingress.domain.clone();
    let app = build_router(app_state);

    tracing::info!(addr = %actual, domain = %domain, "scratch server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "cannot listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            tracing::info!("shutting down; cancelling running runtime commands");
            cancel.cancel();
        })
        .await?;
    Ok(())
}
