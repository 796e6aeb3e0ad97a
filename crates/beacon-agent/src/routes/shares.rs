use std::io::SeekFrom;
use std::path::{Path as FsPath, PathBuf};
use std::time::UNIX_EPOCH;

use axum::Json;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use beacon_types::models::{ListingPayload, SearchPayload};

use crate::db::LocalShareRow;
use crate::error::ApiError;
use crate::files::{guess_mimetype, list_directory, search_entries};
use crate::paths::resolve_share_path;
use crate::state::AppState;

fn get_share(state: &AppState, share_id: &str) -> Result<LocalShareRow, ApiError> {
    state
        .db
        .get_local_share(share_id)?
        .ok_or_else(|| ApiError::NotFound("Share not found".into()))
}

fn share_root(share: &LocalShareRow) -> Result<PathBuf, ApiError> {
    let root = PathBuf::from(&share.root_path);
    let root = root.canonicalize().unwrap_or(root);
    if !root.is_dir() {
        return Err(ApiError::NotFound("Share root unavailable".into()));
    }
    Ok(root)
}

fn resolve_directory(root: &FsPath, raw_path: &str) -> Result<PathBuf, ApiError> {
    let target = resolve_share_path(root, raw_path)
        .map_err(|err| ApiError::BadRequest(err.to_string()))?;
    if !target.is_dir() {
        return Err(ApiError::NotFound("Directory not found".into()));
    }
    Ok(target)
}

fn map_fs_error(err: std::io::Error) -> ApiError {
    match err.kind() {
        std::io::ErrorKind::PermissionDenied => ApiError::Forbidden("Permission denied".into()),
        std::io::ErrorKind::NotFound => ApiError::NotFound("Directory not found".into()),
        _ => ApiError::Internal(err.into()),
    }
}

fn parse_flag(raw: Option<&str>, default: bool) -> bool {
    match raw.map(|value| value.trim().to_ascii_lowercase()) {
        Some(value) if !value.is_empty() => matches!(value.as_str(), "1" | "true" | "yes" | "on"),
        _ => default,
    }
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub max_results: Option<usize>,
    pub ticket: String,
}

/// GET /agent/v1/shares/{share_id}/list
pub async fn list_share_files(
    State(state): State<AppState>,
    Path(share_id): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListingPayload>, ApiError> {
    beacon_ticket::verify_read_ticket(
        &state.config.coordinator_secret_key,
        &query.ticket,
        &share_id,
        "read",
    )?;
    let max_results = query.max_results.unwrap_or(300);
    if !(50..=5000).contains(&max_results) {
        return Err(ApiError::BadRequest("max_results out of range".into()));
    }

    let share = get_share(&state, &share_id)?;
    let root = share_root(&share)?;
    let target = resolve_directory(&root, &query.path)?;

    let listing = tokio::task::spawn_blocking(move || list_directory(&root, &target, max_results))
        .await
        .map_err(|err| ApiError::Internal(anyhow::anyhow!("join error: {err}")))?
        .map_err(map_fs_error)?;
    Ok(Json(listing))
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub recursive: Option<String>,
    #[serde(default)]
    pub max_results: Option<usize>,
    pub ticket: String,
}

/// GET /agent/v1/shares/{share_id}/search
pub async fn search_share_files(
    State(state): State<AppState>,
    Path(share_id): Path<String>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<SearchPayload>, ApiError> {
    beacon_ticket::verify_read_ticket(
        &state.config.coordinator_secret_key,
        &query.ticket,
        &share_id,
        "read",
    )?;
    let q = query.q.trim().to_string();
    if q.is_empty() || q.len() > 120 {
        return Err(ApiError::BadRequest("Invalid search query".into()));
    }
    let recursive = parse_flag(query.recursive.as_deref(), true);
    let max_results = query.max_results.unwrap_or(300);
    if !(1..=1000).contains(&max_results) {
        return Err(ApiError::BadRequest("max_results out of range".into()));
    }

    let share = get_share(&state, &share_id)?;
    let root = share_root(&share)?;
    let target = resolve_directory(&root, &query.path)?;

    let found = tokio::task::spawn_blocking(move || {
        search_entries(&root, &target, &q, recursive, max_results)
    })
    .await
    .map_err(|err| ApiError::Internal(anyhow::anyhow!("join error: {err}")))?
    .map_err(map_fs_error)?;
    Ok(Json(found))
}

#[derive(Debug, Deserialize)]
pub struct FileQuery {
    #[serde(default)]
    pub path: String,
    pub ticket: String,
}

/// GET /agent/v1/shares/{share_id}/stream -- inline, ranged, conditional.
pub async fn stream_share_file(
    State(state): State<AppState>,
    Path(share_id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<FileQuery>,
) -> Result<Response, ApiError> {
    beacon_ticket::verify_read_ticket(
        &state.config.coordinator_secret_key,
        &query.ticket,
        &share_id,
        "read",
    )?;
    let share = get_share(&state, &share_id)?;
    let root = share_root(&share)?;
    let target = resolve_file(&root, &query.path)?;
    serve_file(target, None, &headers).await
}

/// GET /agent/v1/shares/{share_id}/download -- attachment disposition.
pub async fn download_share_file(
    State(state): State<AppState>,
    Path(share_id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<FileQuery>,
) -> Result<Response, ApiError> {
    beacon_ticket::verify_read_ticket(
        &state.config.coordinator_secret_key,
        &query.ticket,
        &share_id,
        "download",
    )?;
    let share = get_share(&state, &share_id)?;
    let root = share_root(&share)?;
    let target = resolve_file(&root, &query.path)?;
    let filename = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());
    serve_file(target, Some(filename), &headers).await
}

fn resolve_file(root: &FsPath, raw_path: &str) -> Result<PathBuf, ApiError> {
    let target = resolve_share_path(root, raw_path)
        .map_err(|err| ApiError::BadRequest(err.to_string()))?;
    if !target.is_file() {
        return Err(ApiError::NotFound("File not found".into()));
    }
    Ok(target)
}

/// Parse `bytes=START-` / `bytes=START-END`. Suffix ranges are not served.
fn parse_range(headers: &HeaderMap, len: u64) -> Option<(u64, u64)> {
    let raw = headers.get(header::RANGE)?.to_str().ok()?;
    let value = raw.strip_prefix("bytes=")?;
    let (start_raw, end_raw) = value.split_once('-')?;
    let start: u64 = start_raw.trim().parse().ok()?;
    let end: u64 = match end_raw.trim() {
        "" => len.saturating_sub(1),
        value => value.parse().ok()?,
    };
    let end = end.min(len.saturating_sub(1));
    if start >= len {
        // Out of bounds: surfaced as 416 by the caller.
        return Some((start, end));
    }
    if start > end {
        return None;
    }
    Some((start, end))
}

/// Stream a file with ETag conditionals and single-range support.
async fn serve_file(
    path: PathBuf,
    attachment: Option<String>,
    req_headers: &HeaderMap,
) -> Result<Response, ApiError> {
    let metadata = tokio::fs::metadata(&path)
        .await
        .map_err(|_| ApiError::NotFound("File not found".into()))?;
    let len = metadata.len();
    let mtime_seconds = metadata
        .modified()
        .ok()
        .and_then(|modified| modified.duration_since(UNIX_EPOCH).ok())
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);
    let etag = format!("\"{mtime_seconds}-{len}\"");

    if let Some(candidate) = req_headers
        .get(header::IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
    {
        if candidate == etag {
            let mut response = StatusCode::NOT_MODIFIED.into_response();
            response
                .headers_mut()
                .insert(header::ETAG, etag.parse().expect("etag header value"));
            return Ok(response);
        }
    }

    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mime = guess_mimetype(&filename);

    let range = parse_range(req_headers, len);
    if let Some((start, _)) = range {
        if start >= len {
            let mut response = StatusCode::RANGE_NOT_SATISFIABLE.into_response();
            response.headers_mut().insert(
                header::CONTENT_RANGE,
                format!("bytes */{len}").parse().expect("range header value"),
            );
            return Ok(response);
        }
    }
    let (start, end) = range.unwrap_or((0, len.saturating_sub(1)));
    let content_length = if len == 0 { 0 } else { end - start + 1 };

    let stream_path = path.clone();
    let stream = async_stream::stream! {
        let mut file = match tokio::fs::File::open(&stream_path).await {
            Ok(file) => file,
            Err(err) => {
                yield Err(err);
                return;
            }
        };
        if start > 0 {
            if let Err(err) = file.seek(SeekFrom::Start(start)).await {
                yield Err(err);
                return;
            }
        }
        let mut remaining = content_length;
        let mut buf = vec![0u8; 64 * 1024];
        while remaining > 0 {
            let to_read = (remaining as usize).min(buf.len());
            match file.read(&mut buf[..to_read]).await {
                Ok(0) => break,
                Ok(n) => {
                    remaining -= n as u64;
                    yield Ok(Bytes::copy_from_slice(&buf[..n]));
                }
                Err(err) => {
                    yield Err(err);
                    return;
                }
            }
        }
    };

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, mime.parse().expect("mime header value"));
    headers.insert(
        header::CONTENT_LENGTH,
        content_length.to_string().parse().expect("length header"),
    );
    headers.insert(header::ACCEPT_RANGES, "bytes".parse().expect("ranges header"));
    headers.insert(header::ETAG, etag.parse().expect("etag header value"));
    if let Some(name) = attachment {
        let disposition = format!("attachment; filename=\"{}\"", name.replace('"', ""));
        if let Ok(value) = disposition.parse() {
            headers.insert(header::CONTENT_DISPOSITION, value);
        }
    }

    let body = Body::from_stream(stream);
    if range.is_some() {
        headers.insert(
            header::CONTENT_RANGE,
            format!("bytes {start}-{end}/{len}")
                .parse()
                .expect("range header value"),
        );
        Ok((StatusCode::PARTIAL_CONTENT, headers, body).into_response())
    } else {
        Ok((StatusCode::OK, headers, body).into_response())
    }
}
