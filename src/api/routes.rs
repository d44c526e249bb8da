//! The internal route table: handler trait, request/response shapes, and
//! the table itself.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::future::BoxFuture;

use crate::cluster::Cluster;
use crate::route::{Params, RouteError, RouteTable};

use super::error::ApiError;
use super::{handlers, web, AppState};

/// What a route handler sees.
#[derive(Debug)]
pub struct RouteRequest {
    pub method: Method,
    pub uri: Uri,
    pub params: Params,
    pub query: HashMap<String, String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub cluster: Option<Arc<Cluster>>,
}

impl RouteRequest {
    pub fn param(&self, name: &str) -> Result<&str, ApiError> {
        self.params
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| ApiError::InvalidRequest(format!("missing path parameter '{name}'")))
    }

    pub fn cluster(&self) -> Result<&Arc<Cluster>, ApiError> {
        self.cluster.as_ref().ok_or(ApiError::ClusterRequired)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RouteBody {
    Json(serde_json::Value),
    Text(String),
    Bytes { content_type: String, data: Bytes },
}

/// What a route handler returns.
///
/// No body and no status renders as 204; a body without a status as 200.
#[derive(Debug, Default)]
pub struct RouteResponse {
    pub status: Option<StatusCode>,
    pub body: Option<RouteBody>,
    pub headers: HeaderMap,
}

impl RouteResponse {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn json(value: serde_json::Value) -> Self {
        Self {
            body: Some(RouteBody::Json(value)),
            ..Self::default()
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            body: Some(RouteBody::Text(text.into())),
            ..Self::default()
        }
    }

    pub fn bytes(content_type: impl Into<String>, data: Bytes) -> Self {
        Self {
            body: Some(RouteBody::Bytes {
                content_type: content_type.into(),
                data,
            }),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = Some(status);
        self
    }
}

impl IntoResponse for RouteResponse {
    fn into_response(self) -> Response {
        let status = self.status.unwrap_or(if self.body.is_some() {
            StatusCode::OK
        } else {
            StatusCode::NO_CONTENT
        });
        let mut response = match self.body {
            None => Response::new(Body::empty()),
            Some(RouteBody::Json(value)) => axum::Json(value).into_response(),
            Some(RouteBody::Text(text)) => text.into_response(),
            Some(RouteBody::Bytes { content_type, data }) => {
                let mut response = Response::new(Body::from(data));
                match HeaderValue::from_str(&content_type) {
                    Ok(value) => {
                        response.headers_mut().insert(header::CONTENT_TYPE, value);
                    }
                    Err(_) => {
                        tracing::debug!(%content_type, "dropping invalid content type");
                    }
                }
                response
            }
        };
        *response.status_mut() = status;
        response.headers_mut().extend(self.headers);
        response
    }
}

pub trait RouteHandler: Send + Sync + 'static {
    fn call(
        &self,
        state: AppState,
        req: RouteRequest,
    ) -> BoxFuture<'static, Result<RouteResponse, ApiError>>;
}

impl<F, Fut> RouteHandler for F
where
    F: Fn(AppState, RouteRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<RouteResponse, ApiError>> + Send + 'static,
{
    fn call(
        &self,
        state: AppState,
        req: RouteRequest,
    ) -> BoxFuture<'static, Result<RouteResponse, ApiError>> {
        Box::pin(self(state, req))
    }
}

pub struct Route {
    pub handler: Box<dyn RouteHandler>,
    /// Requires the internal bearer token.
    pub protected: bool,
}

impl Route {
    pub fn open(handler: impl RouteHandler) -> Self {
        Self {
            handler: Box::new(handler),
            protected: false,
        }
    }

    pub fn protected(handler: impl RouteHandler) -> Self {
        Self {
            handler: Box::new(handler),
            protected: true,
        }
    }
}

const PORT_FORWARD: &str = "/api/pods/port-forward/{namespace}/{resourceType}/{resourceName}";

pub fn route_table() -> Result<RouteTable<Route>, RouteError> {
    let mut t = RouteTable::new();
    t.add(Method::GET, "/version", Route::open(handlers::version))?;
    t.add(Method::GET, "/{path*}", Route::open(web::static_asset))?;
    t.add(
        Method::PUT,
        "/api/v2/releases/{namespace}/{release}",
        Route::protected(handlers::helm_upgrade),
    )?;
    t.add(Method::POST, PORT_FORWARD, Route::protected(handlers::port_forward_start))?;
    t.add(Method::DELETE, PORT_FORWARD, Route::protected(handlers::port_forward_stop))?;
    t.add(
        Method::GET,
        "/api/pods/port-forwards",
        Route::protected(handlers::port_forward_list),
    )?;
    t.add(Method::POST, "/api/shell-token", Route::protected(handlers::shell_token))?;
    t.add(Method::GET, "/api/shells/{id}", Route::protected(handlers::shell_status))?;
    t.add(Method::DELETE, "/api/shells/{id}", Route::protected(handlers::shell_close))?;
    t.add(Method::GET, "/api/clusters", Route::protected(handlers::clusters))?;
    Ok(t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_of(response: Response) -> Bytes {
        response.into_body().collect().await.unwrap().to_bytes()
    }

    #[tokio::test]
    async fn empty_response_is_204() {
        let response = RouteResponse::empty().into_response();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(body_of(response).await.is_empty());
    }

    #[tokio::test]
    async fn body_without_status_is_200() {
        let response = RouteResponse::json(serde_json::json!({"a": 1})).into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
        assert_eq!(body_of(response).await, r#"{"a":1}"#);
    }

    #[tokio::test]
    async fn explicit_status_wins() {
        let response = RouteResponse::text("gone")
            .with_status(StatusCode::NOT_FOUND)
            .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_of(response).await, "gone");

        let response = RouteResponse::empty()
            .with_status(StatusCode::ACCEPTED)
            .into_response();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn bytes_carry_content_type_and_extra_headers() {
        let mut r = RouteResponse::bytes("image/png", Bytes::from_static(b"\x89PNG"));
        r.headers
            .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        let response = r.into_response();
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");
        assert_eq!(body_of(response).await, &b"\x89PNG"[..]);
    }

    #[test]
    fn table_builds_and_prefers_specific_routes() {
        let t = route_table().unwrap();
        assert_eq!(t.len(), 10);

        let m = t.find(&Method::GET, "/version").unwrap();
        assert!(!m.value.protected);
        let m = t.find(&Method::GET, "/api/clusters").unwrap();
        assert!(m.value.protected);
        let m = t.find(&Method::GET, "/api/shells/tab-1").unwrap();
        assert!(m.value.protected);
        assert_eq!(m.params["id"], "tab-1");
        let m = t.find(&Method::GET, "/some/spa/route").unwrap();
        assert!(!m.value.protected);
        assert_eq!(m.params["path"], "some/spa/route");

        let m = t
            .find(&Method::POST, "/api/pods/port-forward/default/pods/nginx")
            .unwrap();
        assert_eq!(m.params["resourceType"], "pods");
        assert!(t.find(&Method::POST, "/version").is_none());
    }
}
