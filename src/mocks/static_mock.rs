use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{delete, get, patch, post, put};
use axum::Router;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::info;

use super::Result;

/// One declared static route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockRoute {
    pub method: String,
    pub path: String,
    pub response: MockResponse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub body: String,
}

struct MockState {
    routes: Vec<MockRoute>,
}

/// Static route HTTP server. For each declared route, returns
/// the literal response with `{{header.X}}` / `{{query.X}}` / `{{params.X}}`
/// template substitution against the incoming request context.
pub struct MockServer {
    routes: Vec<MockRoute>,
}

pub struct MockServerHandle {
    pub port: u16,
    shutdown: Option<oneshot::Sender<()>>,
}

impl MockServerHandle {
    pub(crate) fn new(port: u16, shutdown: oneshot::Sender<()>) -> Self {
        Self { port, shutdown: Some(shutdown) }
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

impl MockServer {
    pub fn new(routes: Vec<MockRoute>) -> Self {
        Self { routes }
    }

    pub async fn start(self, port: u16) -> Result<MockServerHandle> {
        let state = Arc::new(MockState {
            routes: self.routes,
        });

        let mut router = Router::new();
        for (idx, route) in state.routes.iter().enumerate() {
            let axum_path = to_axum_path(&route.path);
            let handler = move |State(state): State<Arc<MockState>>,
                                 Path(params): Path<HashMap<String, String>>,
                                 Query(query): Query<HashMap<String, String>>,
                                 headers: HeaderMap| {
                let route = state.routes[idx].clone();
                async move { render(route, params, query, headers) }
            };

            router = match route.method.to_ascii_uppercase().as_str() {
                "GET" => router.route(&axum_path, get(handler)),
                "POST" => router.route(&axum_path, post(handler)),
                "PUT" => router.route(&axum_path, put(handler)),
                "DELETE" => router.route(&axum_path, delete(handler)),
                "PATCH" => router.route(&axum_path, patch(handler)),
                other => {
                    tracing::warn!(method = other, "unsupported mock route method, defaulting to GET");
                    router.route(&axum_path, get(handler))
                }
            };
        }

        let app = router.with_state(state);
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let bound_port = listener.local_addr()?.port();

        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = rx.await;
                })
                .await;
        });

        info!(port = bound_port, "static mock server listening");
        Ok(MockServerHandle::new(bound_port, tx))
    }
}

fn render(
    route: MockRoute,
    params: HashMap<String, String>,
    query: HashMap<String, String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let status =
        StatusCode::from_u16(route.response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let mut header_ctx = HashMap::new();
    for (name, value) in headers.iter() {
        if let Ok(v) = value.to_str() {
            header_ctx.insert(name.to_string(), v.to_string());
        }
    }

    let body = substitute(&route.response.body, &header_ctx, &query, &params);

    let mut builder = axum::http::Response::builder().status(status);
    for (k, v) in &route.response.headers {
        builder = builder.header(k, v);
    }
    builder
        .body(axum::body::Body::from(body))
        .unwrap_or_else(|_| axum::http::Response::new(axum::body::Body::empty()))
}

/// Converts `{name}` path placeholders into axum's `:name` form.
fn to_axum_path(path: &str) -> String {
    let re = Regex::new(r"\{([^{}]+)\}").unwrap();
    re.replace_all(path, ":$1").to_string()
}

fn substitute(
    template: &str,
    headers: &HashMap<String, String>,
    query: &HashMap<String, String>,
    params: &HashMap<String, String>,
) -> String {
    let re = Regex::new(r"\{\{\s*(header|query|params)\.([\w-]+)\s*\}\}").unwrap();
    re.replace_all(template, |caps: &regex::Captures| {
        let source = &caps[1];
        let key = &caps[2];
        let map = match source {
            "header" => headers,
            "query" => query,
            "params" => params,
            _ => return String::new(),
        };
        map.get(key).cloned().unwrap_or_default()
    })
    .to_string()
}
