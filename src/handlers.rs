use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use warp::http::header::{HeaderValue, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE};
use warp::http::{Method, StatusCode};
use warp::path::FullPath;
use warp::reply::Reply;
use warp::{http::Response, hyper::Body};

use crate::errors::{MirrorError, MirrorErrorType};
use crate::index::IndexDocument;
use crate::provider::SnapshotProvider;
use crate::settings::SettingsHandle;
use crate::transfer::{unsatisfiable_content_range, ByteRange, RangeFileTransfer, OCTET_STREAM};
use crate::vfs::{resolve, VirtualItem};

const FAVICON: &[u8] = include_bytes!("../assets/favicon.ico");

/// Everything a request needs from the running service.
#[derive(Clone)]
pub struct ServeContext {
    pub provider: Arc<SnapshotProvider>,
    pub settings: SettingsHandle,
    /// Cancelled when the server shuts down; every transfer gets a child token.
    pub shutdown: CancellationToken,
}

enum Target {
    Index(IndexDocument),
    File { path: PathBuf, size: u64 },
}

#[instrument(name = "handlers.favicon", level = "debug")]
pub(crate) fn favicon() -> Response<Body> {
    let mut response = Response::new(Body::from(FAVICON));
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("image/x-icon"));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(FAVICON.len()));
    response
}

#[instrument(
    name = "handlers.serve_path",
    level = "info",
    skip(ctx, path, method, range),
    fields(
        path = %path.as_str(),
        method = %method,
        range = ?range
    )
)]
pub(crate) async fn serve_path(
    ctx: ServeContext,
    path: FullPath,
    method: Method,
    range: Option<String>,
) -> Result<Response<Body>, Infallible> {
    if method != Method::GET && method != Method::HEAD {
        tracing::info!("Method {} is not served", method);
        return Ok(MirrorError::not_found(format!("{} {} not found", method, path.as_str()))
            .into_response());
    }
    let head_only = method == Method::HEAD;

    let decoded = match urlencoding::decode(path.as_str()) {
        Ok(decoded) => decoded.into_owned(),
        Err(e) => {
            tracing::info!("Request path is not valid UTF-8: {}", e);
            return Ok(MirrorError::new(
                MirrorErrorType::InvalidPath,
                format!("Invalid path {}", path.as_str()),
            )
            .into_response());
        }
    };

    // Everything below works on the tree that was current when the request came in.
    let tree = ctx.provider.current();
    let target = match resolve(&tree, &decoded) {
        None => {
            tracing::info!("Nothing at {}", decoded);
            return Ok(MirrorError::not_found(format!("{} does not exist", decoded))
                .into_response());
        }
        Some(VirtualItem::File(file)) => Target::File {
            path: file.real_path().to_path_buf(),
            size: file.size(),
        },
        Some(VirtualItem::Directory(dir)) | Some(VirtualItem::Root(dir)) => {
            Target::Index(IndexDocument::for_directory(&tree, dir))
        }
    };
    drop(tree);

    match target {
        Target::Index(document) => Ok(index_response(&document, head_only)),
        Target::File { path, size } => Ok(file_response(&ctx, path, size, range, head_only).await),
    }
}

fn index_response(document: &IndexDocument, head_only: bool) -> Response<Body> {
    let json = match serde_json::to_vec(document) {
        Ok(json) => json,
        Err(e) => {
            tracing::error!("Failed to serialize index document: {}", e);
            return MirrorError::new(
                MirrorErrorType::InternalError,
                "Failed to build index".to_string(),
            )
            .into_response();
        }
    };
    let length = json.len();
    let body = if head_only { Body::empty() } else { Body::from(json) };
    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
    response
}

fn range_not_satisfiable(error: MirrorError, size: u64) -> Response<Body> {
    tracing::info!("Rejecting range: {}", error.message);
    let mut response = error.into_response();
    if let Ok(value) = HeaderValue::from_str(&unsatisfiable_content_range(size)) {
        response.headers_mut().insert(CONTENT_RANGE, value);
    }
    response
}

async fn file_response(
    ctx: &ServeContext,
    path: PathBuf,
    size: u64,
    range_header: Option<String>,
    head_only: bool,
) -> Response<Body> {
    let range = match range_header.as_deref().map(ByteRange::parse) {
        None => None,
        Some(Ok(range)) => Some(range),
        Some(Err(e)) => return range_not_satisfiable(e, size),
    };

    let buffer_size = ctx.settings.current().transfer_buffer_size;
    let transfer = match RangeFileTransfer::open(&path, size, range, buffer_size).await {
        Ok(transfer) => transfer,
        Err(e) if e.error_type == MirrorErrorType::InvalidRange => {
            return range_not_satisfiable(e, size)
        }
        Err(e) => {
            tracing::error!("Cannot open {}: {}", path.display(), e);
            return e.into_response();
        }
    };

    let resolved = *transfer.range();
    let body = if head_only {
        Body::empty()
    } else {
        Body::wrap_stream(transfer.into_stream(ctx.shutdown.child_token()))
    };
    let mut response = Response::new(body);
    *response.status_mut() = resolved.status();
    response.headers_mut().extend(resolved.headers(OCTET_STREAM));
    if resolved.status() == StatusCode::PARTIAL_CONTENT {
        tracing::info!("Serving {} of {}", resolved.content_range(), path.display());
    }
    response
}
