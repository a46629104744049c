//! 分片上传处理器、媒体删除与分片暂存区清理。

use axum::extract::{Extension, Multipart, Path as AxumPath, connect_info::ConnectInfo};
use axum::http::{HeaderMap, StatusCode};
use axum_extra::extract::CookieJar;
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::assembly::{Caller, ChunkAssemblyService, ChunkOutcome};
use crate::auth::session_token;
use crate::config::CSRF_HEADER_NAME;
use crate::error::ApiError;
use crate::http::TrustedProxies;
use crate::protocol::{
    ChunkRequest, FIELD_ALBUM_ID, FIELD_CHUNK, FIELD_CHUNK_INDEX, FIELD_CSRF_TOKEN,
    FIELD_FILENAME, FIELD_TOTAL_CHUNKS, FIELD_UPLOAD_ID, MAX_CHUNK_BYTES, SUCCESS_TOKEN,
};
use crate::storage::{ARENA_DIR_NAME, MediaLayout};

/// 单个分片请求体上限，预留 multipart 边界与文本字段的空间。
pub const UPLOAD_BODY_LIMIT: usize = MAX_CHUNK_BYTES as usize + 64 * 1024;

fn caller_from(
    proxies: &TrustedProxies,
    headers: &HeaderMap,
    addr: SocketAddr,
    jar: &CookieJar,
) -> Caller {
    let client_ip = proxies.client_ip(headers, addr.ip());
    Caller {
        session: session_token(jar),
        client_ip: client_ip.to_string(),
    }
}

fn header_csrf(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CSRF_HEADER_NAME)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

/// 上传单个分片；最后一个分片触发合并、校验、缩略图与入库。
pub async fn upload_chunk(
    Extension(service): Extension<Arc<ChunkAssemblyService>>,
    Extension(proxies): Extension<TrustedProxies>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    jar: CookieJar,
    multipart: Multipart,
) -> Result<&'static str, ApiError> {
    let caller = caller_from(&proxies, &headers, addr, &jar);
    let request = match read_chunk_form(multipart, header_csrf(&headers)).await {
        Ok(request) => request,
        Err(error) => {
            warn!(
                client_ip = %caller.client_ip,
                op = "upload",
                error = ?error,
                "malformed chunk request"
            );
            return Err(error);
        }
    };
    debug!(
        client_ip = %caller.client_ip,
        upload_id = %request.upload_id,
        index = request.chunk_index,
        bytes = request.chunk.len(),
        "chunk received"
    );
    match service.accept(&caller, request).await? {
        ChunkOutcome::Stored { index } => debug!(index, "chunk accepted"),
        ChunkOutcome::Committed(media) => debug!(media_id = media.id, "upload finished"),
    }
    Ok(SUCCESS_TOKEN)
}

/// 读取分片请求的 multipart 字段。CSRF token 优先取表单字段，否则取 `X-CSRF-Token` 头。
async fn read_chunk_form(
    mut multipart: Multipart,
    header_csrf: Option<String>,
) -> Result<ChunkRequest, ApiError> {
    let mut chunk: Option<Bytes> = None;
    let mut fields: HashMap<String, String> = HashMap::new();

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::BadRequest(err.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if name == FIELD_CHUNK {
            let mut buffer = BytesMut::new();
            while let Some(piece) = field
                .chunk()
                .await
                .map_err(|err| ApiError::BadRequest(err.body_text()))?
            {
                if (buffer.len() + piece.len()) as u64 > MAX_CHUNK_BYTES {
                    return Err(ApiError::BadRequest("chunk too large".into()));
                }
                buffer.extend_from_slice(&piece);
            }
            chunk = Some(buffer.freeze());
        } else {
            let value = field
                .text()
                .await
                .map_err(|err| ApiError::BadRequest(err.body_text()))?;
            fields.insert(name, value);
        }
    }

    let chunk = chunk.ok_or_else(|| ApiError::BadRequest("chunk is required".into()))?;
    let csrf_token = fields
        .remove(FIELD_CSRF_TOKEN)
        .filter(|token| !token.is_empty())
        .or(header_csrf)
        .unwrap_or_default();

    Ok(ChunkRequest {
        chunk,
        chunk_index: parse_field(&fields, FIELD_CHUNK_INDEX)?,
        total_chunks: parse_field(&fields, FIELD_TOTAL_CHUNKS)?,
        filename: required_field(&mut fields, FIELD_FILENAME)?,
        upload_id: required_field(&mut fields, FIELD_UPLOAD_ID)?,
        album_id: parse_field(&fields, FIELD_ALBUM_ID)?,
        csrf_token,
    })
}

fn required_field(fields: &mut HashMap<String, String>, name: &str) -> Result<String, ApiError> {
    fields
        .remove(name)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::BadRequest(format!("{name} is required")))
}

fn parse_field<T: FromStr>(fields: &HashMap<String, String>, name: &str) -> Result<T, ApiError> {
    fields
        .get(name)
        .and_then(|value| value.trim().parse().ok())
        .ok_or_else(|| ApiError::BadRequest(format!("{name} is invalid")))
}

/// `DELETE /api/media/{id}`：删除记录、原图与缩略图。
pub async fn delete_media(
    Extension(service): Extension<Arc<ChunkAssemblyService>>,
    Extension(proxies): Extension<TrustedProxies>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    AxumPath(media_id): AxumPath<i64>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<StatusCode, ApiError> {
    let caller = caller_from(&proxies, &headers, addr, &jar);
    if caller.session.is_none() {
        warn!(client_ip = %caller.client_ip, op = "delete", media_id, "delete without session");
        return Err(ApiError::Unauthorized);
    }
    let csrf_token = header_csrf(&headers).unwrap_or_default();
    service.remove_media(&caller, &csrf_token, media_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// 清理过期的分片文件，并删除空的 `.chunks` 目录。
pub async fn sweep_stale_chunks(
    layout: &MediaLayout,
    ttl: Duration,
) -> Result<usize, std::io::Error> {
    if ttl.is_zero() {
        return Ok(0);
    }
    let root = layout.media_root();
    if fs::metadata(root).await.is_err() {
        return Ok(0);
    }

    let now = SystemTime::now();
    let mut removed = 0;
    let mut albums = fs::read_dir(root).await?;
    while let Some(album) = albums.next_entry().await? {
        if !album.file_type().await?.is_dir() {
            continue;
        }
        let arena = album.path().join(ARENA_DIR_NAME);
        let mut chunks = match fs::read_dir(&arena).await {
            Ok(dir) => dir,
            Err(_) => continue,
        };
        while let Some(entry) = chunks.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let modified = match metadata.modified() {
                Ok(value) => value,
                Err(_) => continue,
            };
            let age = match now.duration_since(modified) {
                Ok(value) => value,
                Err(_) => continue,
            };
            if age >= ttl {
                let path = entry.path();
                if let Err(err) = fs::remove_file(&path).await {
                    warn!(path = ?path, error = %err, "failed to remove stale chunk");
                } else {
                    removed += 1;
                }
            }
        }
        // 仅在目录为空时成功。
        if fs::remove_dir(&arena).await.is_ok() {
            debug!(path = ?arena, "removed empty chunk arena");
        }
    }

    if removed > 0 {
        info!(removed, "removed stale chunks");
    }
    Ok(removed)
}
