use axum::http::StatusCode;
use serde_json::json;

use crate::helm::{HelmError, UpgradeRequest};
use crate::portforward::{ForwardKey, PortForwardError};
use crate::shell::validate_terminal_id;

use super::error::ApiError;
use super::routes::{RouteRequest, RouteResponse};
use super::AppState;

pub(super) async fn version(_state: AppState, _req: RouteRequest) -> Result<RouteResponse, ApiError> {
    Ok(RouteResponse::json(json!({ "version": env!("CARGO_PKG_VERSION") })))
}

/// `PUT /api/v2/releases/{namespace}/{release}`
pub(super) async fn helm_upgrade(state: AppState, req: RouteRequest) -> Result<RouteResponse, ApiError> {
    let cluster = req.cluster()?;
    let namespace = req.param("namespace")?;
    let release = req.param("release")?;
    let body: UpgradeRequest = serde_json::from_slice(&req.body)
        .map_err(|e| ApiError::InvalidRequest(format!("invalid JSON body: {e}")))?;
    body.validate().map_err(ApiError::InvalidRequest)?;

    let output = state
        .helm
        .upgrade(namespace, release, &body, &cluster.proxy_kubeconfig_path)
        .await
        .map_err(|e| {
            tracing::warn!(cluster = %cluster.id, release, %e, "helm upgrade failed");
            match e {
                HelmError::Failed { stderr, .. } => ApiError::HelmFailed(stderr),
                other => ApiError::HelmFailed(other.to_string()),
            }
        })?;
    Ok(RouteResponse::text(output))
}

fn parse_port(req: &RouteRequest, name: &str) -> Result<Option<u16>, ApiError> {
    req.query
        .get(name)
        .map(|v| {
            v.parse::<u16>()
                .map_err(|_| ApiError::InvalidRequest(format!("{name} must be a port number")))
        })
        .transpose()
}

fn forward_key(req: &RouteRequest) -> Result<ForwardKey, ApiError> {
    let cluster = req.cluster()?;
    let port = parse_port(req, "port")?
        .filter(|p| *p != 0)
        .ok_or_else(|| ApiError::InvalidRequest("port is required".into()))?;
    Ok(ForwardKey {
        cluster_id: cluster.id.clone(),
        namespace: req.param("namespace")?.to_string(),
        resource_type: req.param("resourceType")?.to_string(),
        resource_name: req.param("resourceName")?.to_string(),
        port,
    })
}

/// `POST /api/pods/port-forward/{namespace}/{resourceType}/{resourceName}`
pub(super) async fn port_forward_start(state: AppState, req: RouteRequest) -> Result<RouteResponse, ApiError> {
    let key = forward_key(&req)?;
    let forward_port = parse_port(&req, "forwardPort")?;
    let cluster = req.cluster()?;

    let port = state
        .port_forwards
        .start(cluster, key, forward_port)
        .await
        .map_err(|e| {
            tracing::warn!(cluster = %cluster.id, %e, "port-forward failed");
            match e {
                PortForwardError::Exited(msg) => ApiError::PortForwardFailed(msg),
                other => ApiError::PortForwardFailed(other.to_string()),
            }
        })?;
    Ok(RouteResponse::json(json!({ "port": port })))
}

/// `DELETE /api/pods/port-forward/{namespace}/{resourceType}/{resourceName}`
pub(super) async fn port_forward_stop(state: AppState, req: RouteRequest) -> Result<RouteResponse, ApiError> {
    let key = forward_key(&req)?;
    let forward_port = parse_port(&req, "forwardPort")?;

    if state.port_forwards.stop(&key, forward_port) {
        Ok(RouteResponse::json(json!({ "status": true })))
    } else {
        Ok(RouteResponse::json(json!({
            "status": false,
            "message": format!(
                "no port-forward for {}/{}/{} port {}",
                key.namespace, key.resource_type, key.resource_name, key.port
            ),
        }))
        .with_status(StatusCode::NOT_FOUND))
    }
}

/// `GET /api/pods/port-forwards`
pub(super) async fn port_forward_list(state: AppState, req: RouteRequest) -> Result<RouteResponse, ApiError> {
    let cluster = req.cluster()?;
    let forwards = state.port_forwards.list(&cluster.id);
    let value = serde_json::to_value(forwards).map_err(|e| ApiError::InternalError(e.to_string()))?;
    Ok(RouteResponse::json(value))
}

/// `POST /api/shell-token?id=<terminalId>`
pub(super) async fn shell_token(state: AppState, req: RouteRequest) -> Result<RouteResponse, ApiError> {
    let cluster = req.cluster()?;
    let id = req
        .query
        .get("id")
        .ok_or_else(|| ApiError::InvalidRequest("id is required".into()))?;
    validate_terminal_id(id).map_err(ApiError::InvalidRequest)?;

    let token = state
        .shells
        .tokens
        .create(&cluster.id, id)
        .map_err(|_| ApiError::TooManyShellTokens)?;
    Ok(RouteResponse::json(json!({ "token": token })))
}

/// `DELETE /api/shells/{id}`: the tab was closed.
pub(super) async fn shell_close(state: AppState, req: RouteRequest) -> Result<RouteResponse, ApiError> {
    let id = req.param("id")?;
    if state.shells.close(id) {
        Ok(RouteResponse::empty())
    } else {
        Err(ApiError::ShellNotFound(id.to_string()))
    }
}

/// `GET /api/shells/{id}`: lifecycle state of one terminal.
pub(super) async fn shell_status(state: AppState, req: RouteRequest) -> Result<RouteResponse, ApiError> {
    let id = req.param("id")?;
    validate_terminal_id(id).map_err(ApiError::InvalidRequest)?;
    let registry = &state.shells.registry;
    Ok(RouteResponse::json(json!({
        "id": id,
        "state": registry.state(id),
        "cluster": registry.get(id).map(|p| p.cluster_id.clone()),
    })))
}

/// `GET /api/clusters`
pub(super) async fn clusters(state: AppState, _req: RouteRequest) -> Result<RouteResponse, ApiError> {
    let summaries: Vec<_> = state
        .resolver
        .store()
        .list()
        .iter()
        .map(|c| c.summary())
        .collect();
    let value = serde_json::to_value(summaries).map_err(|e| ApiError::InternalError(e.to_string()))?;
    Ok(RouteResponse::json(value))
}
