use std::env;
use std::path::PathBuf;

use anyhow::Result;

use axum::extract::DefaultBodyLimit;
use axum::routing::post;
use image_meta_rmcp::{
    app::AppState,
    mcp_server::MetadataServer,
    settings::ServiceSettings,
    upload,
};
use rmcp::transport::streamable_http_server::{
    StreamableHttpService, session::local::LocalSessionManager,
};
use tower_http::services::ServeDir;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let port = env::var("MCP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(3000);
    let bind_address = format!("0.0.0.0:{}", port);

    let secret_key = env::var("SECRET_KEY").ok().filter(|value| !value.trim().is_empty());
    let mcp_path = match secret_key.as_deref() {
        Some(value) => format!("/{}/mcp", value),
        None => "/mcp".to_string(),
    };
    let upload_path = match secret_key.as_deref() {
        Some(value) => format!("/{}/upload", value),
        None => "/upload".to_string(),
    };

    let settings = ServiceSettings::from_env()?;
    let data_dir = resolve_data_dir();
    let media_url = resolve_media_url(&bind_address);
    let state = AppState::open(data_dir.clone(), media_url, settings).await?;
    let state_for_service = state.clone();
    let service = StreamableHttpService::new(
        move || Ok(MetadataServer::new(state_for_service.clone())),
        LocalSessionManager::default().into(),
        Default::default(),
    );
    let router = axum::Router::new()
        .route(
            &upload_path,
            post(upload::handle_image_upload).layer(DefaultBodyLimit::max(50 * 1024 * 1024)),
        )
        .nest_service(&mcp_path, service)
        .nest_service("/media/uploads", ServeDir::new(data_dir.join("uploads")))
        .with_state(state);
    let tcp_listener = tokio::net::TcpListener::bind(&bind_address).await?;

    info!("image metadata MCP server started at http://{}{}", bind_address, mcp_path);

    axum::serve(tcp_listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

fn resolve_data_dir() -> PathBuf {
    let data_dir = env::var("DATA_DIR")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(PathBuf::from);
    if let Some(dir) = data_dir {
        return dir;
    }
    let mut base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
    base.push("image-meta-rmcp");
    base
}

fn resolve_media_url(bind_address: &str) -> String {
    if let Ok(media_url) = env::var("MEDIA_URL") {
        let trimmed = media_url.trim();
        if !trimmed.is_empty() {
            return format!("{}/media", trimmed.trim_end_matches('/'));
        }
    }
    let raw_domain = env::var("DOMAIN")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| bind_address.to_string());
    let trimmed = raw_domain.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        format!("{trimmed}/media")
    } else {
        format!("http://{trimmed}/media")
    }
}
