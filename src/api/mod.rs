pub mod handlers;
pub mod types;

use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::db::DenylistStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn DenylistStore>,
}

pub fn router(store: Arc<dyn DenylistStore>) -> Router {
    let state = Arc::new(AppState { store });

    Router::new()
        .route("/api/v1/health", get(handlers::health))
        .route("/api/v1/stats", get(handlers::stats))
        .route("/api/v1/blacklist", get(handlers::list_blacklisted))
        .route("/api/v1/blacklist/{address}", get(handlers::lookup))
        .route("/api/v1/export", get(handlers::export_csv))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

pub async fn serve(store: Arc<dyn DenylistStore>, host: &str, port: u16) -> eyre::Result<()> {
    let app = router(store);
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "API server listening");
    axum::serve(listener, app).await?;
    Ok(())
}
