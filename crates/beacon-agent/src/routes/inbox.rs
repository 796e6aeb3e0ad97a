use std::io::SeekFrom;
use std::path::PathBuf;

use axum::Json;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, header};
use futures_util::StreamExt;
use http_body_util::BodyStream;
use serde::Deserialize;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use beacon_types::api::{ChunkResponse, CommitResponse, FinalizeRequest, FinalizeResponse};
use beacon_types::models::InboxItemView;

use crate::db::{InboxItemRow, LocalShareRow};
use crate::error::ApiError;
use crate::paths::{next_available_path, resolve_share_path, safe_filename};
use crate::state::AppState;

/// All-zeros digest sentinel: size is still enforced at commit, the hash
/// check is skipped.
pub const UNKNOWN_SHA256: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

fn verify_ticket(state: &AppState, ticket: &str, transfer_id: &str, share_id: &str) -> Result<(), ApiError> {
    beacon_ticket::verify_transfer_ticket(
        &state.config.coordinator_secret_key,
        ticket,
        transfer_id,
        share_id,
    )?;
    Ok(())
}

fn get_share(state: &AppState, share_id: &str) -> Result<LocalShareRow, ApiError> {
    state
        .db
        .get_local_share(share_id)?
        .ok_or_else(|| ApiError::NotFound("Share not found".into()))
}

async fn part_dir(state: &AppState, transfer_id: &str) -> Result<PathBuf, ApiError> {
    let dir = state.config.inbox_dir.join("transfers").join(transfer_id);
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|err| ApiError::Internal(err.into()))?;
    Ok(dir)
}

async fn committed_dir(state: &AppState, transfer_id: &str) -> Result<PathBuf, ApiError> {
    let dir = state.config.inbox_dir.join("committed").join(transfer_id);
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|err| ApiError::Internal(err.into()))?;
    Ok(dir)
}

#[derive(Debug, Deserialize)]
pub struct ScopedQuery {
    pub share_id: String,
    pub ticket: String,
}

/// GET /agent/v1/inbox/transfers/{transfer_id}/status
pub async fn transfer_status(
    State(state): State<AppState>,
    Path(transfer_id): Path<String>,
    Query(query): Query<ScopedQuery>,
) -> Result<Json<Value>, ApiError> {
    verify_ticket(&state, &query.ticket, &transfer_id, &query.share_id)?;
    let items = state.db.list_inbox_items(&transfer_id, &query.share_id)?;
    let views: Vec<InboxItemView> = items
        .iter()
        .map(|item| InboxItemView {
            item_id: item.item_id.clone(),
            filename: item.filename.clone(),
            expected_size: item.expected_size.max(0) as u64,
            received_size: item.received_size.max(0) as u64,
            state: item.state.clone(),
        })
        .collect();
    Ok(Json(json!({ "transfer_id": transfer_id, "items": views })))
}

/// POST /agent/v1/inbox/transfers/{transfer_id}/pause
pub async fn pause_transfer(
    State(state): State<AppState>,
    Path(transfer_id): Path<String>,
    Query(query): Query<ScopedQuery>,
) -> Result<Json<Value>, ApiError> {
    verify_ticket(&state, &query.ticket, &transfer_id, &query.share_id)?;
    let items = state.db.list_inbox_items(&transfer_id, &query.share_id)?;
    for item in items {
        if matches!(item.state.as_str(), "pending" | "receiving" | "staged") {
            state.db.set_inbox_state(&item.id, "paused")?;
            state
                .coordinator
                .notify_item_state(&transfer_id, &item.item_id, "paused")
                .await;
        }
    }
    Ok(Json(json!({ "ok": true })))
}

/// POST /agent/v1/inbox/transfers/{transfer_id}/resume
pub async fn resume_transfer(
    State(state): State<AppState>,
    Path(transfer_id): Path<String>,
    Query(query): Query<ScopedQuery>,
) -> Result<Json<Value>, ApiError> {
    verify_ticket(&state, &query.ticket, &transfer_id, &query.share_id)?;
    let items = state.db.list_inbox_items(&transfer_id, &query.share_id)?;
    for item in items {
        if item.state == "paused" {
            state.db.set_inbox_state(&item.id, "receiving")?;
            state
                .coordinator
                .notify_item_state(&transfer_id, &item.item_id, "receiving")
                .await;
        }
    }
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
pub struct ChunkQuery {
    pub share_id: String,
    pub item_id: String,
    pub filename: String,
    pub size: u64,
    pub sha256: String,
    pub ticket: String,
}

fn chunk_offset(headers: &HeaderMap) -> Result<u64, ApiError> {
    let raw = headers
        .get("x-chunk-offset")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("0");
    raw.trim()
        .parse()
        .map_err(|_| ApiError::BadRequest("Invalid x-chunk-offset header".into()))
}

fn is_last_chunk(headers: &HeaderMap) -> bool {
    headers
        .get("x-chunk-last")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim() == "1")
        .unwrap_or(false)
}

/// POST /agent/v1/inbox/transfers/{transfer_id}/chunk
///
/// Strictly append-only resumable upload. The part file on disk is the
/// source of truth for progress: `received_size` is reconciled with the
/// actual file length on every request, and a failed write truncates back
/// to the last good offset so the client can resend from there.
pub async fn upload_chunk(
    State(state): State<AppState>,
    Path(transfer_id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<ChunkQuery>,
    body: Body,
) -> Result<Json<ChunkResponse>, ApiError> {
    verify_ticket(&state, &query.ticket, &transfer_id, &query.share_id)?;

    if let Some(content_length) = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
    {
        let parsed: i64 = content_length
            .trim()
            .parse()
            .map_err(|_| ApiError::BadRequest("Invalid content-length header".into()))?;
        if parsed < 0 {
            return Err(ApiError::BadRequest("Invalid content-length header".into()));
        }
        if parsed as u64 > state.config.upload_chunk_max_bytes {
            return Err(ApiError::PayloadTooLarge("Chunk too large".into()));
        }
    }

    let offset = chunk_offset(&headers)?;
    let last_chunk = is_last_chunk(&headers);
    let safe_name =
        safe_filename(&query.filename).map_err(|err| ApiError::BadRequest(err.to_string()))?;
    let sha256_lower = query.sha256.to_lowercase();
    if sha256_lower.len() != 64 {
        return Err(ApiError::BadRequest("Invalid sha256".into()));
    }

    let record_id = InboxItemRow::composite_id(&transfer_id, &query.item_id);
    let mut record = match state.db.get_inbox_item(&record_id)? {
        Some(record) => record,
        None => {
            // First sight of this item: the coordinator's manifest is the
            // authority on filename/size/hash for the target share.
            let manifest = state
                .coordinator
                .fetch_item_manifest(&transfer_id, &query.item_id)
                .await
                .ok_or_else(|| ApiError::NotFound("Transfer item not approved".into()))?;
            if manifest.receiver_share_id != query.share_id {
                return Err(ApiError::Forbidden("Share mismatch for transfer item".into()));
            }
            let expected_filename = safe_filename(&manifest.filename)
                .map_err(|_| ApiError::Conflict("Transfer item manifest is invalid".into()))?;
            let expected_sha256 = manifest.sha256.to_lowercase();
            if expected_sha256.len() != 64 {
                return Err(ApiError::Conflict("Transfer item manifest is invalid".into()));
            }
            if safe_name != expected_filename
                || query.size != manifest.size
                || sha256_lower != expected_sha256
            {
                return Err(ApiError::Conflict("Chunk metadata mismatch".into()));
            }

            let part_path = part_dir(&state, &transfer_id)
                .await?
                .join(format!("{}.part", query.item_id));
            let stamp = chrono::Utc::now();
            let record = InboxItemRow {
                id: record_id.clone(),
                transfer_id: transfer_id.clone(),
                item_id: query.item_id.clone(),
                share_id: query.share_id.clone(),
                filename: expected_filename,
                expected_size: manifest.size as i64,
                expected_sha256,
                received_size: 0,
                part_path: part_path.to_string_lossy().into_owned(),
                inbox_path: None,
                state: "pending".into(),
                created_at: stamp,
                updated_at: stamp,
            };
            state.db.insert_inbox_item(&record)?;
            record
        }
    };

    if record.share_id != query.share_id {
        return Err(ApiError::Forbidden("Share mismatch for item".into()));
    }
    if matches!(record.state.as_str(), "committed" | "finalized") {
        return Err(ApiError::Conflict("Item already committed".into()));
    }
    if record.state == "paused" {
        return Err(ApiError::Conflict("Transfer is paused".into()));
    }
    if record.expected_sha256 != sha256_lower || record.expected_size != query.size as i64 {
        return Err(ApiError::Conflict("Chunk metadata mismatch".into()));
    }

    let part_path = PathBuf::from(&record.part_path);
    if let Some(parent) = part_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| ApiError::Internal(err.into()))?;
    }

    // The file length is authoritative; a crashed request may have left the
    // record behind it.
    let current_size = tokio::fs::metadata(&part_path)
        .await
        .map(|metadata| metadata.len())
        .unwrap_or(0);
    if current_size as i64 != record.received_size {
        record.received_size = current_size as i64;
    }
    if offset != record.received_size as u64 {
        return Err(ApiError::Conflict(format!(
            "Unexpected chunk offset, expected {}",
            record.received_size
        )));
    }
    if offset > record.expected_size as u64 {
        return Err(ApiError::Conflict("Chunk offset exceeds expected size".into()));
    }
    let remaining_expected = record.expected_size as u64 - offset;

    let written = append_body_to_part(
        &part_path,
        offset,
        remaining_expected,
        state.config.upload_chunk_max_bytes,
        body,
    )
    .await?;

    let received = offset + written;
    if last_chunk && received != record.expected_size as u64 {
        state
            .db
            .update_inbox_progress(&record.id, received as i64, &record.state)?;
        return Err(ApiError::Conflict(
            "Final chunk does not match expected size".into(),
        ));
    }

    let new_state = if last_chunk { "staged" } else { "receiving" };
    let state_changed = record.state != new_state;
    state
        .db
        .update_inbox_progress(&record.id, received as i64, new_state)?;
    if state_changed {
        state
            .coordinator
            .notify_item_state(&transfer_id, &record.item_id, new_state)
            .await;
    }

    Ok(Json(ChunkResponse {
        item_id: record.item_id,
        received_size: received,
        expected_size: record.expected_size.max(0) as u64,
        state: new_state.to_string(),
    }))
}

/// Stream a request body into the part file at `offset`, enforcing the
/// per-request and per-item caps. On any failure the file is truncated back
/// to `offset` so the client can resend from the last good byte. Returns
/// the number of bytes written.
async fn append_body_to_part(
    part_path: &std::path::Path,
    offset: u64,
    remaining_expected: u64,
    chunk_max_bytes: u64,
    body: Body,
) -> Result<u64, ApiError> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(part_path)
        .await
        .map_err(|err| ApiError::Internal(err.into()))?;
    file.seek(SeekFrom::Start(offset))
        .await
        .map_err(|err| ApiError::Internal(err.into()))?;

    let mut stream = BodyStream::new(body);
    let mut written: u64 = 0;
    let mut failure: Option<ApiError> = None;
    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(_) => {
                failure = Some(ApiError::BadRequest("Failed to read chunk payload".into()));
                break;
            }
        };
        let Ok(data) = frame.into_data() else {
            continue;
        };
        if data.is_empty() {
            continue;
        }
        written += data.len() as u64;
        if written > chunk_max_bytes {
            failure = Some(ApiError::PayloadTooLarge("Chunk too large".into()));
            break;
        }
        if written > remaining_expected {
            failure = Some(ApiError::Conflict("Chunk exceeds expected item size".into()));
            break;
        }
        if let Err(err) = file.write_all(&data).await {
            failure = Some(ApiError::Internal(err.into()));
            break;
        }
    }

    if let Some(err) = failure {
        let _ = file.set_len(offset).await;
        return Err(err);
    }
    file.flush()
        .await
        .map_err(|err| ApiError::Internal(err.into()))?;
    Ok(written)
}

/// Streamed SHA-256 of a file in 1 MiB reads; runs on the blocking pool.
fn file_sha256_blocking(path: &std::path::Path) -> std::io::Result<String> {
    use std::io::Read;
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[derive(Debug, Deserialize)]
pub struct CommitQuery {
    pub share_id: String,
    pub item_id: String,
    pub ticket: String,
}

/// POST /agent/v1/inbox/transfers/{transfer_id}/commit
///
/// Verify the staged part file (length, then streamed SHA-256 unless the
/// sentinel digest was declared) and promote it into the per-transfer
/// committed directory.
pub async fn commit_transfer_item(
    State(state): State<AppState>,
    Path(transfer_id): Path<String>,
    Query(query): Query<CommitQuery>,
) -> Result<Json<CommitResponse>, ApiError> {
    verify_ticket(&state, &query.ticket, &transfer_id, &query.share_id)?;
    let record_id = InboxItemRow::composite_id(&transfer_id, &query.item_id);
    let record = state
        .db
        .get_inbox_item(&record_id)?
        .filter(|record| record.transfer_id == transfer_id && record.share_id == query.share_id)
        .ok_or_else(|| ApiError::NotFound("Transfer item not found".into()))?;

    let part_path = PathBuf::from(&record.part_path);
    let metadata = tokio::fs::metadata(&part_path)
        .await
        .map_err(|_| ApiError::NotFound("Transfer chunk file missing".into()))?;
    if metadata.len() != record.expected_size.max(0) as u64 {
        return Err(ApiError::Conflict(
            "Received size does not match expected size".into(),
        ));
    }

    if record.expected_sha256 != UNKNOWN_SHA256 {
        let hash_path = part_path.clone();
        let digest = tokio::task::spawn_blocking(move || file_sha256_blocking(&hash_path))
            .await
            .map_err(|err| ApiError::Internal(anyhow::anyhow!("join error: {err}")))?
            .map_err(|err| ApiError::Internal(err.into()))?;

        if digest != record.expected_sha256 {
            return Err(ApiError::Conflict("Checksum mismatch".into()));
        }
    }

    let committed_base = committed_dir(&state, &transfer_id).await?;
    let target_name =
        safe_filename(&record.filename).map_err(|err| ApiError::BadRequest(err.to_string()))?;
    let committed_path = next_available_path(&committed_base.join(target_name))
        .map_err(|err| ApiError::Conflict(err.to_string()))?;
    move_file(&part_path, &committed_path).await?;

    let committed_str = committed_path.to_string_lossy().into_owned();
    state
        .db
        .set_inbox_destination(&record.id, &committed_str, "committed")?;
    state
        .coordinator
        .notify_item_state(&transfer_id, &record.item_id, "committed")
        .await;

    Ok(Json(CommitResponse {
        item_id: record.item_id,
        state: "committed".into(),
        inbox_path: committed_str,
    }))
}

#[derive(Debug, Deserialize)]
pub struct FinalizeQuery {
    pub share_id: String,
    pub ticket: String,
}

/// POST /agent/v1/inbox/transfers/{transfer_id}/finalize
///
/// Move a committed file into the share's visible tree under a safe,
/// collision-free destination.
pub async fn finalize_transfer_item(
    State(state): State<AppState>,
    Path(transfer_id): Path<String>,
    Query(query): Query<FinalizeQuery>,
    Json(body): Json<FinalizeRequest>,
) -> Result<Json<FinalizeResponse>, ApiError> {
    verify_ticket(&state, &query.ticket, &transfer_id, &query.share_id)?;
    let record_id = InboxItemRow::composite_id(&transfer_id, &body.item_id);
    let record = state
        .db
        .get_inbox_item(&record_id)?
        .filter(|record| record.transfer_id == transfer_id && record.share_id == query.share_id)
        .ok_or_else(|| ApiError::NotFound("Transfer item not found".into()))?;
    if !matches!(record.state.as_str(), "committed" | "finalized") {
        return Err(ApiError::Conflict("Transfer item is not committed".into()));
    }

    let share = get_share(&state, &query.share_id)?;
    if share.read_only {
        return Err(ApiError::Forbidden("Share is read-only".into()));
    }

    let source_path = PathBuf::from(record.inbox_path.clone().unwrap_or_default());
    if !source_path.is_file() {
        return Err(ApiError::NotFound("Committed file not found".into()));
    }

    let share_root = PathBuf::from(&share.root_path);
    let share_root = share_root.canonicalize().unwrap_or(share_root);
    let destination_dir = resolve_share_path(&share_root, &body.destination_path)
        .map_err(|err| ApiError::BadRequest(err.to_string()))?;
    tokio::fs::create_dir_all(&destination_dir)
        .await
        .map_err(|err| ApiError::Internal(err.into()))?;

    let source_name = source_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let target_name = if body.keep_original_name {
        safe_filename(&record.filename)
    } else {
        safe_filename(&source_name)
    }
    .map_err(|err| ApiError::BadRequest(err.to_string()))?;
    let destination_path = next_available_path(&destination_dir.join(target_name))
        .map_err(|err| ApiError::Conflict(err.to_string()))?;
    move_file(&source_path, &destination_path).await?;

    let destination_str = destination_path.to_string_lossy().into_owned();
    state
        .db
        .set_inbox_destination(&record.id, &destination_str, "finalized")?;
    state
        .coordinator
        .notify_item_state(&transfer_id, &record.item_id, "finalized")
        .await;

    Ok(Json(FinalizeResponse {
        item_id: record.item_id,
        state: "finalized".into(),
        final_path: destination_str,
    }))
}

/// Rename, falling back to copy+unlink for cross-device moves.
async fn move_file(source: &PathBuf, destination: &PathBuf) -> Result<(), ApiError> {
    if tokio::fs::rename(source, destination).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(source, destination)
        .await
        .map_err(|err| ApiError::Internal(err.into()))?;
    tokio::fs::remove_file(source)
        .await
        .map_err(|err| ApiError::Internal(err.into()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("beacon_inbox_{}_{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn chunks_append_sequentially() {
        let dir = scratch("append");
        let part = dir.join("item.part");

        let written = append_body_to_part(&part, 0, 10, 1024, Body::from("hello"))
            .await
            .unwrap();
        assert_eq!(written, 5);
        let written = append_body_to_part(&part, 5, 5, 1024, Body::from("world"))
            .await
            .unwrap();
        assert_eq!(written, 5);
        assert_eq!(std::fs::read(&part).unwrap(), b"helloworld");

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn oversized_chunk_truncates_back_to_offset() {
        let dir = scratch("cap");
        let part = dir.join("item.part");
        append_body_to_part(&part, 0, 100, 1024, Body::from("abcd"))
            .await
            .unwrap();

        // Per-request cap of 2 bytes: the write must fail and roll back.
        let err = append_body_to_part(&part, 4, 96, 2, Body::from("efghij"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::PayloadTooLarge(_)));
        assert_eq!(std::fs::metadata(&part).unwrap().len(), 4);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn chunk_beyond_expected_size_truncates_back() {
        let dir = scratch("expected");
        let part = dir.join("item.part");
        append_body_to_part(&part, 0, 100, 1024, Body::from("abcd"))
            .await
            .unwrap();

        // Only 3 bytes remain for the item; sending 6 is a conflict.
        let err = append_body_to_part(&part, 4, 3, 1024, Body::from("efghij"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));
        assert_eq!(std::fs::metadata(&part).unwrap().len(), 4);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn streamed_digest_matches_whole_file_hash() {
        let dir = scratch("digest");
        let path = dir.join("payload.bin");
        let data: Vec<u8> = (0..100u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        let expected = hex::encode(Sha256::digest(&data));
        assert_eq!(file_sha256_blocking(&path).unwrap(), expected);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn unknown_sha_sentinel_is_64_zeros() {
        assert_eq!(UNKNOWN_SHA256.len(), 64);
        assert!(UNKNOWN_SHA256.chars().all(|c| c == '0'));
    }

    #[test]
    fn chunk_offset_header_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(chunk_offset(&headers).unwrap(), 0);
        headers.insert("x-chunk-offset", "1048576".parse().unwrap());
        assert_eq!(chunk_offset(&headers).unwrap(), 1_048_576);
        headers.insert("x-chunk-offset", "-1".parse().unwrap());
        assert!(chunk_offset(&headers).is_err());

        let mut last = HeaderMap::new();
        assert!(!is_last_chunk(&last));
        last.insert("x-chunk-last", "1".parse().unwrap());
        assert!(is_last_chunk(&last));
    }
}
