use std::{
    fs::Metadata,
    io,
    path::PathBuf,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{ready, Context, Poll},
};

use axum::{
    body::Body,
    extract::{Path as AxumPath, State},
    http::{header, HeaderMap, HeaderValue, Uri},
    response::{IntoResponse, Json, Redirect, Response},
    routing::get,
    Router,
};
use humansize::{format_size, BINARY};
use tokio::{
    fs,
    io::{AsyncRead, DuplexStream, ReadBuf},
};
use tokio_util::io::{ReaderStream, SyncIoBridge};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    services::{ServeDir, ServeFile},
    trace::TraceLayer,
};
use tracing::{error, info, warn};

use crate::{
    archive::{download_name, stream_archive},
    entry::{ContentCategory, MimeClassifier},
    error::AppError,
    listing::{describe_entry, list_directory},
    paths::Root,
    thumbnail::{Thumbnail, ThumbnailError, ThumbnailGenerator},
};

/// Bytes buffered between the archive walk and the response body.
const ARCHIVE_PIPE_CAPACITY: usize = 64 * 1024;

const NO_CACHE: &str = "no-cache";
const THUMBNAIL_CACHE: &str = "max-age=3600";

// --- State ---
pub type SharedState = Arc<AppState>;

/// Everything a request needs. Built once at startup and never mutated.
pub struct AppState {
    pub root: Root,
    pub classifier: Arc<dyn MimeClassifier>,
    /// `None` disables the thumbnail endpoint.
    pub thumbnails: Option<ThumbnailGenerator>,
    pub ui_dir: PathBuf,
}

pub fn router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([http::Method::GET])
        .allow_origin(Any);

    let index = state.ui_dir.join("index.html");

    // A trailing `/` addresses a directory; anything else addresses a file.
    Router::new()
        .route("/", get(|| async { Redirect::temporary("/home/") }))
        .route("/files", get(files_root_handler))
        .route("/files/", get(files_root_handler))
        .route("/files/*path", get(files_handler))
        .route("/thumbnails/*path", get(thumbnail_handler))
        .nest_service("/resources", ServeDir::new(&state.ui_dir))
        .route_service("/home", ServeFile::new(&index))
        .route_service("/home/*path", ServeFile::new(&index))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}

// --- Handlers ---

async fn files_root_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    serve_path(&state, "", true, wants_json(&headers)).await
}

async fn files_handler(
    State(state): State<SharedState>,
    AxumPath(path): AxumPath<String>,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let directory_style = uri.path().ends_with('/');
    serve_path(&state, &path, directory_style, wants_json(&headers)).await
}

/// Listing, info record, file download or directory archive, depending on
/// how the path was addressed and what the client prefers.
async fn serve_path(
    state: &AppState,
    request_path: &str,
    directory_style: bool,
    json: bool,
) -> Result<Response, AppError> {
    let resolved = state.root.resolve(request_path).map_err(|e| {
        warn!("Rejected request path {:?}: {}", request_path, e);
        e
    })?;

    if json {
        if directory_style {
            let entries = list_directory(&resolved, state.classifier.as_ref()).await?;
            return Ok(no_cache(Json(entries)));
        }
        let name = display_name(&state.root, &resolved);
        let entry = describe_entry(&resolved, name, state.classifier.as_ref()).await?;
        return Ok(no_cache(Json(entry)));
    }

    let metadata = fs::metadata(&resolved).await.map_err(|e| {
        info!("Path not found {}: {}", resolved.display(), e);
        AppError::NotFound
    })?;

    if metadata.is_dir() {
        Ok(download_directory(state, resolved))
    } else {
        download_file(state, resolved, &metadata).await
    }
}

async fn download_file(
    state: &AppState,
    path: PathBuf,
    metadata: &Metadata,
) -> Result<Response, AppError> {
    let file = fs::File::open(&path).await.map_err(|e| {
        error!("Failed to open file for download {}: {}", path.display(), e);
        AppError::NotFound
    })?;

    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());
    let mime_type = state
        .classifier
        .classify(&path)
        .unwrap_or_else(|| "application/octet-stream".to_string());

    info!(
        "Serving {} ({})",
        path.display(),
        format_size(metadata.len(), BINARY)
    );

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&mime_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(metadata.len()));
    headers.insert(header::CONTENT_DISPOSITION, content_disposition(&filename));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(NO_CACHE));

    let body = Body::from_stream(ReaderStream::new(file));
    Ok((headers, body).into_response())
}

/// Streams `dir` as a ZIP. The walk runs on a blocking thread and writes into
/// a bounded pipe whose other end is the response body; if the client goes
/// away the pipe closes and the walk fails on its next write.
fn download_directory(state: &AppState, dir: PathBuf) -> Response {
    let name = download_name(&state.root, &dir);
    let (reader, writer) = tokio::io::duplex(ARCHIVE_PIPE_CAPACITY);
    let mut sink = SyncIoBridge::new(writer);
    let finished = Arc::new(AtomicBool::new(false));

    info!("Streaming archive {} of {}", name, dir.display());
    let archive_name = name.clone();
    let walk_finished = Arc::clone(&finished);
    tokio::task::spawn_blocking(move || {
        match stream_archive(&dir, &mut sink) {
            Ok(summary) => {
                walk_finished.store(true, Ordering::Release);
                info!(
                    "Finished archive {}: {} entries, {}",
                    archive_name,
                    summary.entries,
                    format_size(summary.bytes, BINARY)
                );
            }
            Err(e) => error!("Archive {} aborted: {} ({})", archive_name, e, e.source),
        }
        // The pipe closes only once `finished` is settled.
        drop(sink);
    });

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/zip"));
    headers.insert(header::CONTENT_DISPOSITION, content_disposition(&name));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(NO_CACHE));

    let body = ArchiveBody {
        pipe: reader,
        finished,
    };
    (headers, Body::from_stream(ReaderStream::new(body))).into_response()
}

/// Read half of the archive pipe. The end of the pipe is passed on as a
/// clean end of body only after the walk finished the archive; otherwise the
/// body fails, so the connection is aborted rather than ending like a
/// complete download.
struct ArchiveBody {
    pipe: DuplexStream,
    finished: Arc<AtomicBool>,
}

impl AsyncRead for ArchiveBody {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.pipe).poll_read(cx, buf))?;

        let at_end = buf.filled().len() == before && buf.remaining() > 0;
        if at_end && !this.finished.load(Ordering::Acquire) {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "archive stream aborted",
            )));
        }
        Poll::Ready(Ok(()))
    }
}

async fn thumbnail_handler(
    State(state): State<SharedState>,
    AxumPath(path): AxumPath<String>,
) -> Result<Response, AppError> {
    let Some(generator) = &state.thumbnails else {
        return Err(AppError::NotFound);
    };

    let resolved = state.root.resolve(&path).map_err(|e| {
        warn!("Rejected thumbnail path {:?}: {}", path, e);
        e
    })?;

    let metadata = fs::metadata(&resolved).await.map_err(|e| {
        info!("Thumbnail source not found {}: {}", resolved.display(), e);
        AppError::NotFound
    })?;
    if !metadata.is_file() {
        return Err(AppError::UnsupportedClassification);
    }

    let mime_type = state.classifier.classify(&resolved).unwrap_or_default();
    let category = ContentCategory::from_mime(&mime_type);

    match generator.generate(&resolved, category).await {
        Ok(Thumbnail::Jpeg(bytes)) => Ok((
            [
                (header::CONTENT_TYPE, "image/jpeg"),
                (header::CACHE_CONTROL, THUMBNAIL_CACHE),
            ],
            bytes,
        )
            .into_response()),
        Ok(Thumbnail::Original) => {
            let file = fs::File::open(&resolved).await.map_err(|e| {
                error!("Failed to open {}: {}", resolved.display(), e);
                AppError::NotFound
            })?;
            let mut headers = HeaderMap::new();
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_str(&mime_type)
                    .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
            );
            headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(THUMBNAIL_CACHE));
            Ok((headers, Body::from_stream(ReaderStream::new(file))).into_response())
        }
        Err(ThumbnailError::Unsupported(_)) => {
            info!("No thumbnail for {} ({:?})", resolved.display(), mime_type);
            Err(AppError::UnsupportedClassification)
        }
        Err(e) => {
            error!("Thumbnail generation failed for {}: {}", resolved.display(), e);
            Err(AppError::Internal)
        }
    }
}

// --- Utility Functions ---

/// JSON is requested through `Accept`, or through `Content-Type` as older
/// clients of this API do.
fn wants_json(headers: &HeaderMap) -> bool {
    let mentions_json = |name: header::HeaderName| {
        headers
            .get_all(name)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .any(|value| value.contains("application/json"))
    };
    mentions_json(header::ACCEPT) || mentions_json(header::CONTENT_TYPE)
}

/// Name reported for an info request. The root is never reported by its
/// real name.
fn display_name(root: &Root, path: &std::path::Path) -> String {
    if root.is_root(path) {
        return "/".to_string();
    }
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "/".to_string())
}

fn no_cache(body: impl IntoResponse) -> Response {
    ([(header::CACHE_CONTROL, NO_CACHE)], body).into_response()
}

/// `attachment` disposition with a plain ASCII fallback name and the exact
/// name percent-encoded per RFC 6266.
fn content_disposition(filename: &str) -> HeaderValue {
    let fallback: String = filename
        .chars()
        .map(|c| {
            if (c.is_ascii_graphic() && c != '"' && c != '\\') || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let value = format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback,
        urlencoding::encode(filename)
    );
    HeaderValue::from_str(&value)
        .unwrap_or_else(|_| HeaderValue::from_static("attachment; filename=\"download\""))
}
