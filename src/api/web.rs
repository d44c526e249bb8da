use axum::http::header;
use bytes::Bytes;
use rust_embed::Embed;

use super::error::ApiError;
use super::routes::{RouteRequest, RouteResponse};
use super::AppState;

#[derive(Embed)]
#[folder = "static/"]
struct StaticAssets;

/// `GET /{path*}`: the embedded UI, or the development asset server when one
/// is configured.
pub(super) async fn static_asset(
    state: AppState,
    req: RouteRequest,
) -> Result<RouteResponse, ApiError> {
    match &state.settings.dev_asset_server {
        Some(base) => dev_asset(&state.settings.dev_client, base, &req).await,
        None => embedded_asset(req.uri.path()),
    }
}

fn embedded_asset(path: &str) -> Result<RouteResponse, ApiError> {
    let path = path.trim_start_matches('/');

    // Exact path first, then index.html for SPA routing.
    let exact = if path.is_empty() {
        None
    } else {
        StaticAssets::get(path)
    };
    let (file, mime) = match exact {
        Some(file) => (
            file,
            mime_guess::from_path(path).first_or_text_plain().to_string(),
        ),
        None => (
            StaticAssets::get("index.html").ok_or(ApiError::NotFound)?,
            "text/html".to_string(),
        ),
    };
    Ok(RouteResponse::bytes(mime, Bytes::from(file.data.into_owned())))
}

async fn dev_asset(
    client: &reqwest::Client,
    base: &str,
    req: &RouteRequest,
) -> Result<RouteResponse, ApiError> {
    let path_and_query = req
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("{}{}", base.trim_end_matches('/'), path_and_query);
    let resp = client
        .get(&url)
        .send()
        .await
        .map_err(|e| ApiError::InternalError(format!("dev asset server: {e}")))?;

    let status = resp.status();
    let content_type = resp
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    let data = resp
        .bytes()
        .await
        .map_err(|e| ApiError::InternalError(format!("dev asset server: {e}")))?;
    Ok(RouteResponse::bytes(content_type, data).with_status(status))
}
