//! Canned-response HTTP server behind the `http_mock` server type

use axum::extract::State;
use axum::http::{header, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Response served for one path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MockRoute {
    #[serde(default = "default_status")]
    pub status: u16,
    #[serde(default)]
    pub body: String,
    /// Structured body, served as JSON instead of `body`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json: Option<serde_yaml::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

fn default_status() -> u16 {
    200
}

impl Default for MockRoute {
    fn default() -> Self {
        Self {
            status: default_status(),
            body: String::new(),
            json: None,
            content_type: None,
        }
    }
}

impl MockRoute {
    fn respond(&self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let (body, default_type) = match &self.json {
            Some(value) => match serde_json::to_string(value) {
                Ok(text) => (text, "application/json"),
                Err(e) => {
                    return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
                }
            },
            None => (self.body.clone(), "text/plain; charset=utf-8"),
        };
        let content_type = self.content_type.as_deref().unwrap_or(default_type).to_string();
        (status, [(header::CONTENT_TYPE, content_type)], body).into_response()
    }
}

/// Path → response table
pub type MockRoutes = IndexMap<String, MockRoute>;

/// Read a routes file written by the `http_mock` server type
pub fn load_routes(path: &Path) -> Result<MockRoutes, MockError> {
    let text = std::fs::read_to_string(path).map_err(|e| MockError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    Ok(serde_yaml::from_str::<Option<MockRoutes>>(&text)?.unwrap_or_default())
}

/// Router answering every request from `routes`, 404 for unknown paths
pub fn router(routes: MockRoutes) -> Router {
    Router::new()
        .fallback(respond)
        .with_state(Arc::new(routes))
}

async fn respond(State(routes): State<Arc<MockRoutes>>, method: Method, uri: Uri) -> Response {
    match routes.get(uri.path()) {
        Some(route) => {
            log::info!("{} {} -> {}", method, uri, route.status);
            route.respond()
        }
        None => {
            log::warn!("{} {} -> 404 (no route)", method, uri);
            (StatusCode::NOT_FOUND, "no such route\n").into_response()
        }
    }
}

/// Serve `routes` on `listener` until the task is cancelled
pub async fn serve(listener: TcpListener, routes: MockRoutes) -> Result<(), MockError> {
    if let Ok(addr) = listener.local_addr() {
        log::info!("Mock listening on {} ({} routes)", addr, routes.len());
    }
    axum::serve(listener, router(routes))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| MockError::Io {
            path: "listener".to_string(),
            source: e,
        })
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = sigterm.recv() => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        Err(e) => {
            log::warn!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
    log::info!("Mock shutting down");
}

/// Errors of the mock server
#[derive(Debug, thiserror::Error)]
pub enum MockError {
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse routes: {0}")]
    Parse(#[from] serde_yaml::Error),
}
