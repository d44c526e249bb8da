use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};

/// Error type for internal route handlers.
///
/// Each variant maps to an HTTP status code, a machine-readable code string,
/// and a human-readable message. Rendered as a plain-text body.
#[derive(Debug)]
pub enum ApiError {
    /// 401 - No bearer token provided.
    AuthRequired,
    /// 401 - Bearer token did not match.
    AuthInvalid,
    /// 404 - No route or resource.
    NotFound,
    /// 404 - No shell registered under this terminal id.
    ShellNotFound(String),
    /// 400 - Malformed or invalid request.
    InvalidRequest(String),
    /// 400 - The route needs a resolved cluster and the request has none.
    ClusterRequired,
    /// 503 - Too many unconsumed shell tokens.
    TooManyShellTokens,
    /// 500 - `helm` failed.
    HelmFailed(String),
    /// 500 - `kubectl port-forward` failed.
    PortForwardFailed(String),
    /// 500 - Catch-all internal error.
    InternalError(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::AuthRequired => StatusCode::UNAUTHORIZED,
            ApiError::AuthInvalid => StatusCode::UNAUTHORIZED,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::ShellNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::ClusterRequired => StatusCode::BAD_REQUEST,
            ApiError::TooManyShellTokens => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::HelmFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::PortForwardFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::AuthRequired => "auth_required",
            ApiError::AuthInvalid => "auth_invalid",
            ApiError::NotFound => "not_found",
            ApiError::ShellNotFound(_) => "shell_not_found",
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::ClusterRequired => "cluster_required",
            ApiError::TooManyShellTokens => "too_many_shell_tokens",
            ApiError::HelmFailed(_) => "helm_failed",
            ApiError::PortForwardFailed(_) => "port_forward_failed",
            ApiError::InternalError(_) => "internal_error",
        }
    }

    pub fn message(&self) -> String {
        match self {
            ApiError::AuthRequired => {
                "Authentication required. Provide a token via the Authorization header.".to_string()
            }
            ApiError::AuthInvalid => "Invalid authentication token.".to_string(),
            ApiError::NotFound => "Not found.".to_string(),
            ApiError::ShellNotFound(id) => format!("No shell exists with id '{}'.", id),
            ApiError::InvalidRequest(detail) => format!("Invalid request: {}.", detail),
            ApiError::ClusterRequired => "No cluster selected for this request.".to_string(),
            ApiError::TooManyShellTokens => {
                "Too many pending shell tokens. Try again shortly.".to_string()
            }
            ApiError::HelmFailed(detail) => format!("Helm failed: {}", detail),
            ApiError::PortForwardFailed(detail) => format!("Port forward failed: {}", detail),
            ApiError::InternalError(detail) => format!("Internal error: {}.", detail),
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code(), self.message())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status_code(), self.message()).into_response()
    }
}
