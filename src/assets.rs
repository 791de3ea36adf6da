use std::{
    io::{self, ErrorKind},
    path::Path,
};

use axum::{
    http::{StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
};
use tracing::warn;

const INDEX_DOCUMENT: &str = "index.html";

/// Serves `request_path` from `public_dir`, with `/` mapped to the index document.
///
/// The path is joined as-is: `..` segments are not filtered.
pub async fn serve_asset(public_dir: &Path, request_path: &str) -> Response {
    let relative = if request_path == "/" {
        INDEX_DOCUMENT
    } else {
        request_path.trim_start_matches('/')
    };
    let file_path = public_dir.join(relative);

    match tokio::fs::read(&file_path).await {
        Ok(content) => (
            [(CONTENT_TYPE, content_type_for_path(&file_path))],
            content,
        )
            .into_response(),
        Err(error) if error.kind() == ErrorKind::NotFound => {
            (StatusCode::NOT_FOUND, "404 Not Found").into_response()
        }
        Err(error) => {
            warn!("Could not read asset {:?}: {error}", file_path);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Server Error: {}", error_code(&error)),
            )
                .into_response()
        }
    }
}

fn error_code(error: &io::Error) -> String {
    let code = match error.kind() {
        ErrorKind::PermissionDenied => "EACCES",
        ErrorKind::IsADirectory => "EISDIR",
        ErrorKind::NotADirectory => "ENOTDIR",
        ErrorKind::ResourceBusy => "EBUSY",
        ErrorKind::Interrupted => "EINTR",
        kind => return format!("{kind:?}"),
    };
    code.to_string()
}

// Anything outside this table, binary files included, is sent as text/html.
fn content_type_for_path(path: &Path) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("js") => "text/javascript",
        Some("css") => "text/css",
        Some("json") => "application/json",
        _ => "text/html",
    }
}
