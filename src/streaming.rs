//! 媒体读取：整文件、Range 分段、下载与缩略图。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, Path as AxumPath, connect_info::ConnectInfo};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum_extra::extract::CookieJar;
use httpdate::fmt_http_date;
use serde::Deserialize;
use std::io::{ErrorKind, SeekFrom};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::auth::{AuthGate, session_token};
use crate::config::{StreamStrategy, VIDEO_THUMBNAIL_AT_SECS, VIDEO_THUMBNAIL_WIDTH};
use crate::error::ApiError;
use crate::etag::{etag_from_metadata, if_range_matches};
use crate::http::TrustedProxies;
use crate::storage::{MediaLayout, MediaTree, StorageError, sanitize_slug};
use crate::store::MetadataStore;
use crate::transform::{MediaTransformer, TransformKind, TransformSpec};

/// 流式输出的单次拷贝大小。
const STREAM_BUFFER_SIZE: usize = 8 * 1024;

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MediaMode {
    Stream,
    Thumbnail,
    Download,
}

/// 本次请求选中的文件。
#[derive(Debug)]
struct Located {
    path: PathBuf,
    tree: MediaTree,
    slug: String,
    /// 目录树中的文件名。
    stored_name: String,
    /// 媒体记录中的文件名，用于下载。
    display_name: String,
}

pub struct StreamingService {
    layout: MediaLayout,
    store: Arc<dyn MetadataStore>,
    gate: Arc<dyn AuthGate>,
    frames: Arc<dyn MediaTransformer>,
    strategy: StreamStrategy,
    proxy_prefix: String,
}

impl StreamingService {
    pub fn new(
        layout: MediaLayout,
        store: Arc<dyn MetadataStore>,
        gate: Arc<dyn AuthGate>,
        frames: Arc<dyn MediaTransformer>,
        strategy: StreamStrategy,
        proxy_prefix: String,
    ) -> Self {
        Self {
            layout,
            store,
            gate,
            frames,
            strategy,
            proxy_prefix: proxy_prefix.trim_end_matches('/').to_string(),
        }
    }

    async fn respond(
        &self,
        session: Option<&str>,
        mode: MediaMode,
        media_id: i64,
        request_headers: &HeaderMap,
    ) -> Result<Response, ApiError> {
        let located = self.locate(session, mode, media_id).await?;
        info!(op = "media", media_id, mode = ?mode, tree = ?located.tree, "serve media");

        if self.strategy == StreamStrategy::Proxy {
            return self.redirect(&located, mode);
        }
        serve_file(&located, mode, request_headers).await
    }

    async fn locate(
        &self,
        session: Option<&str>,
        mode: MediaMode,
        media_id: i64,
    ) -> Result<Located, ApiError> {
        let (media, album) = self
            .store
            .media(media_id)
            .await?
            .ok_or_else(|| ApiError::NotFound("Media not found".into()))?;
        if !album.is_public && !self.gate.authorize(session).await {
            return Err(ApiError::Unauthorized);
        }
        let slug = sanitize_slug(&album.slug)
            .ok_or_else(|| ApiError::NotFound("Media not found".into()))?;

        if mode == MediaMode::Thumbnail {
            return self.locate_thumbnail(&slug, &media.filename).await;
        }

        // 优先使用预先转码的版本。
        match self
            .layout
            .resolve_checked(MediaTree::Variant, &slug, &media.filename, false)
            .await
        {
            Ok(path) if is_file(&path).await => {
                return Ok(Located {
                    path,
                    tree: MediaTree::Variant,
                    slug,
                    stored_name: media.filename.clone(),
                    display_name: media.filename,
                });
            }
            Ok(_) | Err(StorageError::Io(_)) => {}
            Err(err) => return Err(err.into()),
        }

        let path = self
            .layout
            .resolve_checked(MediaTree::Original, &slug, &media.filename, false)
            .await
            .map_err(not_found_on_missing)?;
        Ok(Located {
            path,
            tree: MediaTree::Original,
            slug,
            stored_name: media.filename.clone(),
            display_name: media.filename,
        })
    }

    async fn locate_thumbnail(&self, slug: &str, filename: &str) -> Result<Located, ApiError> {
        let video = is_video(filename);
        let stored_name = if video {
            let stem = Path::new(filename)
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| filename.to_string());
            format!("{stem}.jpg")
        } else {
            filename.to_string()
        };
        let path = self
            .layout
            .resolve_checked(MediaTree::Thumbnail, slug, &stored_name, true)
            .await?;

        if !is_file(&path).await {
            if !video {
                return Err(ApiError::NotFound("Thumbnail not found".into()));
            }
            let original = self
                .layout
                .resolve_checked(MediaTree::Original, slug, filename, false)
                .await
                .map_err(not_found_on_missing)?;
            let spec = TransformSpec {
                output: path.clone(),
                kind: TransformKind::VideoFrame {
                    at_secs: VIDEO_THUMBNAIL_AT_SECS,
                    width: VIDEO_THUMBNAIL_WIDTH,
                },
            };
            if let Err(err) = self.frames.transform(&original, &spec).await {
                warn!(slug, filename, error = %err, "video thumbnail generation failed");
                return Err(ApiError::Internal("Thumbnail generation failed".into()));
            }
            info!(slug, filename, "video thumbnail generated");
        }

        Ok(Located {
            path,
            tree: MediaTree::Thumbnail,
            slug: slug.to_string(),
            stored_name: stored_name.clone(),
            display_name: stored_name,
        })
    }

    /// 交由前置代理输出文件内容。
    fn redirect(&self, located: &Located, mode: MediaMode) -> Result<Response, ApiError> {
        let target = format!(
            "{}/{}/{}/{}",
            self.proxy_prefix,
            located.tree.proxy_segment(),
            located.slug,
            located.stored_name
        );
        let mut headers = base_headers(located, mode)?;
        headers.insert(
            "x-accel-redirect",
            HeaderValue::from_str(&target).map_err(|_| header_error())?,
        );
        debug!(target, "media handed to proxy");
        Ok((StatusCode::OK, headers).into_response())
    }
}

fn not_found_on_missing(err: StorageError) -> ApiError {
    match err {
        StorageError::Io(io) if io.kind() == ErrorKind::NotFound => {
            ApiError::NotFound("File not found".into())
        }
        other => other.into(),
    }
}

async fn is_file(path: &Path) -> bool {
    fs::metadata(path)
        .await
        .map(|metadata| metadata.is_file())
        .unwrap_or(false)
}

fn is_video(filename: &str) -> bool {
    mime_guess::from_path(filename)
        .first()
        .is_some_and(|mime| mime.type_() == mime_guess::mime::VIDEO)
}

fn header_error() -> ApiError {
    ApiError::Internal("Failed to build response headers".into())
}

fn base_headers(located: &Located, mode: MediaMode) -> Result<HeaderMap, ApiError> {
    let mime = mime_guess::from_path(&located.stored_name).first_or_octet_stream();
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime.essence_str()).map_err(|_| header_error())?,
    );
    match mode {
        MediaMode::Download => {
            headers.insert(
                header::CONTENT_DISPOSITION,
                HeaderValue::from_str(&format!(
                    "attachment; filename=\"{}\"",
                    located.display_name
                ))
                .map_err(|_| header_error())?,
            );
        }
        MediaMode::Thumbnail => {
            headers.insert(
                header::CACHE_CONTROL,
                HeaderValue::from_static("public, max-age=86400"),
            );
        }
        MediaMode::Stream => {}
    }
    Ok(headers)
}

/// 媒体读取接口 `GET /api/media/{mode}/{id}`。
pub async fn serve_media(
    Extension(service): Extension<Arc<StreamingService>>,
    Extension(proxies): Extension<TrustedProxies>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    AxumPath((mode, media_id)): AxumPath<(MediaMode, i64)>,
    request_headers: HeaderMap,
    jar: CookieJar,
) -> Result<Response, ApiError> {
    let client_ip = proxies.client_ip(&request_headers, addr.ip());
    let session = session_token(&jar);
    let result = service
        .respond(session.as_deref(), mode, media_id, &request_headers)
        .await;
    if let Err(error) = &result {
        warn!(
            client_ip = %client_ip,
            op = "media",
            media_id,
            mode = ?mode,
            error = ?error,
            "media request failed"
        );
    }
    result
}

async fn serve_file(
    located: &Located,
    mode: MediaMode,
    request_headers: &HeaderMap,
) -> Result<Response, ApiError> {
    let file = File::open(&located.path).await.map_err(|err| match err.kind() {
        ErrorKind::NotFound => ApiError::NotFound("File not found".into()),
        _ => ApiError::Internal("Storage failure".into()),
    })?;
    let metadata = file
        .metadata()
        .await
        .map_err(|_| ApiError::Internal("Storage failure".into()))?;
    if !metadata.is_file() {
        return Err(ApiError::NotFound("File not found".into()));
    }
    let file_size = metadata.len();
    let modified = metadata.modified().ok();

    let mut response_headers = base_headers(located, mode)?;
    response_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Some(value) = modified.map(fmt_http_date) {
        response_headers.insert(
            header::LAST_MODIFIED,
            HeaderValue::from_str(&value).map_err(|_| header_error())?,
        );
    }
    let etag = etag_from_metadata(&metadata);
    response_headers.insert(
        header::ETAG,
        HeaderValue::from_str(&etag).map_err(|_| header_error())?,
    );

    let range = if if_range_matches(request_headers, &etag, modified) {
        parse_range(request_headers.get(header::RANGE), file_size)?
    } else {
        None
    };

    if let Some((start, end)) = range {
        let length = end - start + 1;
        debug!(path = ?located.path, start, end, length, "range request accepted");
        let mut file = file;
        file.seek(SeekFrom::Start(start))
            .await
            .map_err(|_| ApiError::Internal("Storage failure".into()))?;
        let stream = ReaderStream::with_capacity(file.take(length), STREAM_BUFFER_SIZE);
        response_headers.insert(
            header::CONTENT_RANGE,
            HeaderValue::from_str(&format!("bytes {}-{}/{}", start, end, file_size))
                .map_err(|_| header_error())?,
        );
        response_headers.insert(
            header::CONTENT_LENGTH,
            HeaderValue::from_str(&length.to_string()).map_err(|_| header_error())?,
        );
        return Ok((
            StatusCode::PARTIAL_CONTENT,
            response_headers,
            AxumBody::from_stream(stream),
        )
            .into_response());
    }

    response_headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&file_size.to_string()).map_err(|_| header_error())?,
    );
    let stream = ReaderStream::with_capacity(file, STREAM_BUFFER_SIZE);
    Ok((
        StatusCode::OK,
        response_headers,
        AxumBody::from_stream(stream),
    )
        .into_response())
}

/// 解析 Range 头，返回可读取的闭区间；`None` 表示整文件。
fn parse_range(
    value: Option<&HeaderValue>,
    file_size: u64,
) -> Result<Option<(u64, u64)>, ApiError> {
    let Some(value) = value else {
        return Ok(None);
    };
    let value = value
        .to_str()
        .map_err(|_| ApiError::BadRequest("invalid Range header".into()))?;
    let Some(range) = value.trim().strip_prefix("bytes=") else {
        return Err(ApiError::BadRequest("invalid Range header".into()));
    };
    if range.contains(',') {
        return Err(ApiError::BadRequest("multiple ranges not supported".into()));
    }
    let Some((start_part, end_part)) = range.split_once('-') else {
        return Err(ApiError::BadRequest("invalid Range header".into()));
    };
    let (start_part, end_part) = (start_part.trim(), end_part.trim());

    let (start, end) = if start_part.is_empty() {
        let suffix: u64 = end_part
            .parse()
            .map_err(|_| ApiError::BadRequest("invalid Range header".into()))?;
        if suffix == 0 || file_size == 0 {
            return Err(ApiError::RangeNotSatisfiable(file_size));
        }
        (file_size.saturating_sub(suffix), file_size - 1)
    } else {
        let start: u64 = start_part
            .parse()
            .map_err(|_| ApiError::BadRequest("invalid Range header".into()))?;
        let end: u64 = if end_part.is_empty() {
            file_size.saturating_sub(1)
        } else {
            end_part
                .parse()
                .map_err(|_| ApiError::BadRequest("invalid Range header".into()))?
        };
        (start, end)
    };

    if file_size == 0 || start > end || start >= file_size || end >= file_size {
        return Err(ApiError::RangeNotSatisfiable(file_size));
    }
    Ok(Some((start, end)))
}
