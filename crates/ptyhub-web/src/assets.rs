//! Static serving for the mobile SPA.
//!
//! `/` maps to `index.html`; unknown paths fall back to `index.html` so
//! client-side routes survive a reload. Requests that try to walk out of
//! the static root are refused before any filesystem access.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use tokio_util::io::ReaderStream;

use crate::server::AppState;

const IMMUTABLE_CACHE: &str = "public, max-age=31536000, immutable";

/// Read-only SPA directory.
#[derive(Debug, Clone)]
pub struct StaticAssets {
    root: PathBuf,
}

impl StaticAssets {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Map a request path to a file under the root. `None` means the path
    /// escapes the root and the request must be refused.
    fn resolve(&self, request_path: &str) -> Option<PathBuf> {
        let trimmed = request_path.trim_start_matches('/');
        let relative = if trimmed.is_empty() {
            "index.html"
        } else {
            trimmed
        };
        let relative = Path::new(relative);
        let escapes = relative.is_absolute()
            || relative
                .components()
                .any(|component| !matches!(component, Component::Normal(_) | Component::CurDir));
        if escapes {
            return None;
        }
        Some(self.root.join(relative))
    }

    pub async fn serve(&self, request_path: &str) -> Response {
        let Some(path) = self.resolve(request_path) else {
            return (StatusCode::BAD_REQUEST, "bad request").into_response();
        };

        let is_file = tokio::fs::metadata(&path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false);
        let path = if is_file {
            path
        } else {
            self.root.join("index.html")
        };

        match tokio::fs::File::open(&path).await {
            Ok(file) => {
                let mime = mime_for(&path);
                let cache = if mime == "text/html" {
                    "no-cache"
                } else {
                    IMMUTABLE_CACHE
                };
                // Streaming body: an I/O error after the headers are out
                // terminates the response instead of rewriting the status.
                let body = Body::from_stream(ReaderStream::new(file));
                Response::builder()
                    .header(header::CONTENT_TYPE, mime)
                    .header(header::CACHE_CONTROL, cache)
                    .body(body)
                    .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                (StatusCode::NOT_FOUND, "not found").into_response()
            }
            Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        }
    }
}

fn mime_for(path: &Path) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("html") => "text/html",
        Some("js") => "application/javascript",
        Some("css") => "text/css",
        Some("json") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("ico") => "image/x-icon",
        _ => "application/octet-stream",
    }
}

/// Fallback handler: anything that is not `/api/*` or `/ws` is SPA content.
pub async fn serve_spa(State(state): State<Arc<AppState>>, uri: Uri) -> Response {
    state.assets.serve(uri.path()).await
}
