use crate::AppState;
use axum::body::Body;
use axum::extract::{Extension, Path as AxumPath};
use axum::http::{Response, StatusCode, header};
use axum::response::{IntoResponse, Json};
use bytes::Bytes;
use futures::StreamExt;
use mime_guess::from_path;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::atomic::Ordering;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, trace, warn};

const MAX_THUMBNAIL_DIM: u32 = 4096;

#[derive(Serialize, Deserialize)]
pub struct ThumbnailRequest {
    pub media_id: String,
    pub mrl: String,
    pub width: u32,
    pub height: u32,
    #[serde(default = "default_position")]
    pub position: f32,
}

fn default_position() -> f32 {
    0.3
}

#[derive(Serialize, Deserialize)]
pub struct ThumbnailResponse {
    pub media_id: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
}

#[derive(Serialize, Deserialize)]
pub struct StatusResponse {
    pub in_flight: bool,
    pub generated: u64,
    pub failed: u64,
    pub bytes_served: u64,
}

/// Validate media ID with basic rules; it becomes part of a filename
fn is_valid_media_id(media_id: &str) -> bool {
    !media_id.is_empty()
        && media_id.len() <= 128
        && media_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn bad_request(media_id: String, message: &str) -> (StatusCode, Json<ThumbnailResponse>) {
    (
        StatusCode::BAD_REQUEST,
        Json(ThumbnailResponse {
            media_id,
            message: message.to_string(),
            thumbnail: None,
        }),
    )
}

#[axum::debug_handler]
pub async fn create_thumbnail(
    Extension(state): Extension<AppState>,
    Json(request): Json<ThumbnailRequest>,
) -> impl IntoResponse {
    let media_id = request.media_id.clone();

    if !is_valid_media_id(&media_id) {
        return bad_request(media_id, "Invalid media ID format");
    }
    if request.width == 0
        || request.height == 0
        || request.width > MAX_THUMBNAIL_DIM
        || request.height > MAX_THUMBNAIL_DIM
    {
        return bad_request(
            media_id,
            "Invalid parameters: width and height must be in 1-4096",
        );
    }
    if !(0.0..=1.0).contains(&request.position) {
        return bad_request(media_id, "Invalid parameters: position must be in 0.0-1.0");
    }

    let filename = format!("{}-{}x{}.jpg", media_id, request.width, request.height);
    let dest = state.thumbnails_dir().join(&filename);
    let mrl = state.resolve_mrl(&request.mrl);

    info!(%media_id, %mrl, width = request.width, height = request.height, "Generating thumbnail");

    // generate() blocks on the engine and owns a single request slot:
    // serialize callers, then push the wait onto the blocking pool.
    let gate = state.generate_gate.lock().await;
    let generator = state.generator.clone();
    let task_media_id = media_id.clone();
    let produced = tokio::task::spawn_blocking(move || {
        generator.generate(
            &task_media_id,
            &mrl,
            request.width,
            request.height,
            request.position,
            &dest,
        )
    })
    .await
    .unwrap_or_else(|error| {
        error!(%media_id, ?error, "Thumbnail task panicked");
        false
    });
    drop(gate);

    if produced {
        state.stats.generated.fetch_add(1, Ordering::Relaxed);
        (
            StatusCode::CREATED,
            Json(ThumbnailResponse {
                media_id,
                message: "Thumbnail generated".into(),
                thumbnail: Some(filename),
            }),
        )
    } else {
        state.stats.failed.fetch_add(1, Ordering::Relaxed);
        (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(ThumbnailResponse {
                media_id,
                message: "No thumbnail produced".into(),
                thumbnail: None,
            }),
        )
    }
}

pub async fn serve_thumbnail(
    Extension(state): Extension<AppState>,
    AxumPath(filename): AxumPath<String>,
) -> Result<Response<Body>, Infallible> {
    if filename.contains(['/', '\\']) || filename.contains("..") {
        warn!(%filename, "Invalid thumbnail filename");
        return Ok(err_response(StatusCode::BAD_REQUEST, "Invalid filename"));
    }

    let path = state.thumbnails_dir().join(&filename);
    debug!(%filename, ?path, "Serving thumbnail");

    let Ok(file) = tokio::fs::File::open(&path).await else {
        return Ok(file_not_found());
    };
    let Ok(metadata) = file.metadata().await else {
        return Ok(file_not_found());
    };

    let stats = state.stats.clone();
    let stream = ReaderStream::new(file).map(move |chunk: Result<Bytes, std::io::Error>| {
        if let Ok(chunk) = &chunk {
            trace!(len = chunk.len(), "Thumbnail chunk served");
            stats.bytes_served.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        }
        chunk
    });

    let mut res = Response::new(Body::from_stream(stream));
    let headers = res.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        from_path(&filename)
            .first_or_octet_stream()
            .to_string()
            .parse()
            .unwrap(),
    );
    headers.insert(
        header::CONTENT_LENGTH,
        metadata.len().to_string().parse().unwrap(),
    );
    headers.insert(
        header::CACHE_CONTROL,
        "public,max-age=3600".parse().unwrap(),
    );
    Ok(res)
}

#[axum::debug_handler]
pub async fn status(Extension(state): Extension<AppState>) -> impl IntoResponse {
    let in_flight = state.generate_gate.try_lock().is_err();

    (
        StatusCode::OK,
        Json(StatusResponse {
            in_flight,
            generated: state.stats.generated.load(Ordering::Relaxed),
            failed: state.stats.failed.load(Ordering::Relaxed),
            bytes_served: state.stats.bytes_served.load(Ordering::Relaxed),
        }),
    )
}

fn file_not_found() -> Response<Body> {
    err_response(StatusCode::NOT_FOUND, "File not found")
}

pub(crate) fn err_response(status: StatusCode, body_str: &'static str) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::from(body_str))
        .unwrap()
}
