pub mod api;
pub mod app_state;
pub mod config;
pub mod export;
pub mod media_item;
pub mod middleware;
pub mod preparser;
pub mod thumbnail;

use axum::Router;
use axum::extract::Extension;
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

//
// Re-export
//
pub use api::{create_thumbnail, serve_thumbnail, status};
pub use app_state::AppState;
pub use config::Config;
pub use media_item::{MediaItem, OptionTrust};
pub use preparser::{
    DecodedFrame, PreparseEngine, PreparseTypes, Preparser, PreparserCfg, RequestId, ThumbnailArg,
};
pub use thumbnail::ThumbnailGenerator;

pub async fn run(config: Config) {
    let state = AppState::new(&config)
        .await
        .expect("Failed to create app state");

    // CORS layer
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/thumbnails", post(create_thumbnail))
        .route("/thumbnails/{filename}", get(serve_thumbnail))
        .route("/status", get(status))
        .layer(axum::middleware::from_fn(middleware::log_requests))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(Extension(state.clone()));

    let addr = format!("0.0.0.0:{}", config.listen_on_port);
    info!("Thumbnail API listening on {addr}");
    let listener = TcpListener::bind(&addr)
        .await
        .expect("Failed to bind API listener");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await
        .expect("API server error");
}

async fn shutdown_signal(state: AppState) {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown requested, cancelling in-flight thumbnail work");
    state.generator.stop();
}
