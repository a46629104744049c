//! 服务端分片合并。
//!
//! 每个分片请求独立处理，请求之间唯一共享的状态是磁盘上各相册的 `.chunks` 暂存区。
//! 携带最后一个序号的请求负责推进合并、内容校验、缩略图与元数据入库；
//! 任一阶段失败时，先删除本次上传产生的所有文件再返回错误。
//!
//! 同一 upload id 的并发请求之间不做串行化。最坏情况是最后一个分片与某个序号的重传赛跑，
//! 结果只可能是“缺少分片”错误或内容相同的分片文件；正常客户端不会这样发送。

use image::ImageFormat;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, File};
use tracing::{debug, info, warn};

use crate::atomic::AtomicFile;
use crate::auth::AuthGate;
use crate::config::{THUMBNAIL_QUALITY, THUMBNAIL_WIDTH};
use crate::protocol::{ChunkRequest, MAX_CHUNK_BYTES};
use crate::storage::{
    MediaLayout, MediaTree, StorageError, extension_of, sanitize_filename, sanitize_slug,
    sanitize_upload_id,
};
use crate::store::{Media, MetadataStore, NewMedia};
use crate::transform::{MediaTransformer, TransformKind, TransformSpec, probe_image};

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("session or csrf token rejected")]
    Auth,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("chunk {index} missing at assembly")]
    MissingChunk { index: u64 },
    #[error("content rejected: {0}")]
    Content(String),
    #[error("thumbnail failed: {0}")]
    Thumbnail(String),
    #[error("metadata commit failed: {0}")]
    Persistence(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl UploadError {
    /// 返回给上传方的错误文本，不包含路径或外部工具输出。
    pub fn public_message(&self) -> String {
        match self {
            UploadError::Validation(msg) | UploadError::NotFound(msg) => msg.clone(),
            UploadError::Auth => "Invalid CSRF token".into(),
            UploadError::MissingChunk { index } => format!("Missing chunk {index}"),
            UploadError::Content(_) => "Uploaded file is not a valid image".into(),
            UploadError::Thumbnail(_) => "Thumbnail generation failed".into(),
            UploadError::Persistence(_) => "Failed to save media record".into(),
            UploadError::Io(_) => "Storage failure".into(),
        }
    }
}

impl From<StorageError> for UploadError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::InvalidPath => UploadError::Validation("Invalid path".into()),
            StorageError::Io(err) => UploadError::Io(err),
        }
    }
}

/// 上传所处阶段。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssemblyStage {
    Receiving,
    Assembling,
    Validating,
    Thumbnailing,
    Committing,
    Done,
    FailedCleanup,
}

/// 接收单个分片的结果。
#[derive(Debug)]
pub enum ChunkOutcome {
    /// 分片已保存，等待后续分片。
    Stored { index: u64 },
    /// 最后一个分片到达，媒体已入库。
    Committed(Media),
}

/// 请求方。
#[derive(Clone, Debug, Default)]
pub struct Caller {
    pub session: Option<String>,
    pub client_ip: String,
}

/// 校验并清洗后的分片请求。
struct Target {
    album_id: i64,
    slug: String,
    filename: String,
    upload_id: String,
    total_chunks: u64,
    destination: PathBuf,
}

pub struct ChunkAssemblyService {
    layout: MediaLayout,
    store: Arc<dyn MetadataStore>,
    gate: Arc<dyn AuthGate>,
    thumbnailer: Arc<dyn MediaTransformer>,
    allowed_extensions: Vec<String>,
    allowed_formats: Vec<ImageFormat>,
    max_chunks: u64,
}

impl ChunkAssemblyService {
    pub fn new(
        layout: MediaLayout,
        store: Arc<dyn MetadataStore>,
        gate: Arc<dyn AuthGate>,
        thumbnailer: Arc<dyn MediaTransformer>,
        allowed_extensions: &[String],
        max_chunks: u64,
    ) -> Self {
        let allowed_extensions: Vec<String> = allowed_extensions
            .iter()
            .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|ext| !ext.is_empty())
            .collect();
        let mut allowed_formats = Vec::new();
        for ext in &allowed_extensions {
            if let Some(format) = ImageFormat::from_extension(ext)
                && !allowed_formats.contains(&format)
            {
                allowed_formats.push(format);
            }
        }
        Self {
            layout,
            store,
            gate,
            thumbnailer,
            allowed_extensions,
            allowed_formats,
            max_chunks,
        }
    }

    /// 保存一个分片；若为最后一个分片则完成整个上传。
    pub async fn accept(
        &self,
        caller: &Caller,
        request: ChunkRequest,
    ) -> Result<ChunkOutcome, UploadError> {
        if !self
            .gate
            .verify_csrf(caller.session.as_deref(), &request.csrf_token)
            .await
        {
            warn!(client_ip = %caller.client_ip, op = "upload", "csrf check failed");
            return Err(UploadError::Auth);
        }

        let target = match self.validate(&request).await {
            Ok(target) => target,
            Err(error) => {
                warn!(
                    client_ip = %caller.client_ip,
                    op = "upload",
                    album_id = request.album_id,
                    upload_id = ?request.upload_id,
                    filename = ?request.filename,
                    index = request.chunk_index,
                    error = %error,
                    "chunk rejected"
                );
                return Err(error);
            }
        };
        if let Err(error) = self.store_chunk(&target, &request).await {
            warn!(
                client_ip = %caller.client_ip,
                op = "upload",
                album_id = target.album_id,
                upload_id = %target.upload_id,
                index = request.chunk_index,
                error = %error,
                "chunk write failed"
            );
            return Err(error);
        }
        debug!(
            upload_id = %target.upload_id,
            index = request.chunk_index,
            total = target.total_chunks,
            stage = ?AssemblyStage::Receiving,
            "chunk stored"
        );

        if !request.is_final() {
            return Ok(ChunkOutcome::Stored {
                index: request.chunk_index,
            });
        }

        match self.finish(&target).await {
            Ok(media) => {
                info!(
                    client_ip = %caller.client_ip,
                    op = "upload",
                    album_id = target.album_id,
                    upload_id = %target.upload_id,
                    media_id = media.id,
                    filename = %target.filename,
                    stage = ?AssemblyStage::Done,
                    "upload committed"
                );
                Ok(ChunkOutcome::Committed(media))
            }
            Err((stage, error)) => {
                warn!(
                    client_ip = %caller.client_ip,
                    op = "upload",
                    album_id = target.album_id,
                    upload_id = %target.upload_id,
                    failed_at = ?stage,
                    stage = ?AssemblyStage::FailedCleanup,
                    error = %error,
                    "upload failed"
                );
                Err(error)
            }
        }
    }

    /// 删除媒体记录，再删除原图与缩略图。
    pub async fn remove_media(
        &self,
        caller: &Caller,
        csrf_token: &str,
        media_id: i64,
    ) -> Result<(), UploadError> {
        if !self
            .gate
            .verify_csrf(caller.session.as_deref(), csrf_token)
            .await
        {
            warn!(client_ip = %caller.client_ip, op = "delete", media_id, "csrf check failed");
            return Err(UploadError::Auth);
        }
        let (media, album) = self
            .store
            .media(media_id)
            .await
            .map_err(|err| UploadError::Persistence(err.to_string()))?
            .ok_or_else(|| UploadError::NotFound("Media not found".into()))?;
        let slug = sanitize_slug(&album.slug)
            .ok_or_else(|| UploadError::Validation("Invalid album".into()))?;
        let original = self
            .layout
            .resolve_checked(MediaTree::Original, &slug, &media.filename, true)
            .await?;
        let thumbnail = self
            .layout
            .resolve_checked(MediaTree::Thumbnail, &slug, &media.filename, true)
            .await?;

        let deleted = self
            .store
            .delete_media(media_id)
            .await
            .map_err(|err| UploadError::Persistence(err.to_string()))?;
        if !deleted {
            return Err(UploadError::NotFound("Media not found".into()));
        }
        remove_quietly(&original).await;
        remove_quietly(&thumbnail).await;
        info!(
            client_ip = %caller.client_ip,
            op = "delete",
            album_id = album.id,
            media_id,
            filename = %media.filename,
            "media deleted"
        );
        Ok(())
    }

    async fn validate(&self, request: &ChunkRequest) -> Result<Target, UploadError> {
        let filename = sanitize_filename(&request.filename)
            .ok_or_else(|| UploadError::Validation("Invalid filename".into()))?;
        let extension = extension_of(&filename).unwrap_or_default();
        if !self.allowed_extensions.contains(&extension) {
            return Err(UploadError::Validation("File type not allowed".into()));
        }
        let upload_id = sanitize_upload_id(&request.upload_id)
            .ok_or_else(|| UploadError::Validation("Invalid upload id".into()))?;
        if request.total_chunks == 0 || request.chunk_index >= request.total_chunks {
            return Err(UploadError::Validation("Invalid chunk index".into()));
        }
        if self.max_chunks > 0 && request.total_chunks > self.max_chunks {
            return Err(UploadError::Validation("Too many chunks".into()));
        }
        if request.chunk.is_empty() {
            return Err(UploadError::Validation("Empty chunk".into()));
        }
        if request.chunk.len() as u64 > MAX_CHUNK_BYTES {
            return Err(UploadError::Validation("Chunk too large".into()));
        }

        let album = self
            .store
            .album(request.album_id)
            .await
            .map_err(|err| UploadError::Persistence(err.to_string()))?
            .ok_or_else(|| UploadError::NotFound("Album not found".into()))?;
        let slug = sanitize_slug(&album.slug)
            .ok_or_else(|| UploadError::Validation("Invalid album".into()))?;

        let destination = self
            .layout
            .resolve_checked(MediaTree::Original, &slug, &filename, true)
            .await?;
        if fs::symlink_metadata(&destination).await.is_ok() {
            return Err(UploadError::Validation("File already exists".into()));
        }

        Ok(Target {
            album_id: album.id,
            slug,
            filename,
            upload_id,
            total_chunks: request.total_chunks,
            destination,
        })
    }

    async fn store_chunk(&self, target: &Target, request: &ChunkRequest) -> Result<(), UploadError> {
        fs::create_dir_all(self.layout.arena_dir(&target.slug)).await?;
        let path = self
            .layout
            .chunk_path(&target.slug, &target.upload_id, request.chunk_index);
        AtomicFile::write(&path, &request.chunk).await?;
        Ok(())
    }

    async fn finish(&self, target: &Target) -> Result<Media, (AssemblyStage, UploadError)> {
        self.assemble(target)
            .await
            .map_err(|err| (AssemblyStage::Assembling, err))?;
        self.remove_arena(target).await;

        if let Err(err) = self.validate_content(&target.destination).await {
            remove_quietly(&target.destination).await;
            return Err((AssemblyStage::Validating, err));
        }

        let thumbnail = self
            .layout
            .resolve_checked(MediaTree::Thumbnail, &target.slug, &target.filename, true)
            .await
            .map_err(|err| (AssemblyStage::Thumbnailing, UploadError::from(err)));
        let thumbnail = match thumbnail {
            Ok(path) => path,
            Err(failure) => {
                remove_quietly(&target.destination).await;
                return Err(failure);
            }
        };
        let spec = TransformSpec {
            output: thumbnail.clone(),
            kind: TransformKind::Resize {
                width: THUMBNAIL_WIDTH,
                quality: THUMBNAIL_QUALITY,
            },
        };
        if let Err(err) = self
            .thumbnailer
            .transform(&target.destination, &spec)
            .await
        {
            remove_quietly(&target.destination).await;
            remove_quietly(&thumbnail).await;
            return Err((
                AssemblyStage::Thumbnailing,
                UploadError::Thumbnail(err.to_string()),
            ));
        }

        let title = Path::new(&target.filename)
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| target.filename.clone());
        let record = NewMedia {
            album_id: target.album_id,
            filename: target.filename.clone(),
            title,
        };
        match self.store.insert_media(record).await {
            Ok(media) => Ok(media),
            Err(err) => {
                remove_quietly(&target.destination).await;
                remove_quietly(&thumbnail).await;
                Err((
                    AssemblyStage::Committing,
                    UploadError::Persistence(err.to_string()),
                ))
            }
        }
    }

    /// 经临时文件按顺序拼接分片 `0..total` 到目标文件。
    async fn assemble(&self, target: &Target) -> Result<(), UploadError> {
        let mut output = AtomicFile::new(&target.destination).await?;
        for index in 0..target.total_chunks {
            let path = self
                .layout
                .chunk_path(&target.slug, &target.upload_id, index);
            let mut chunk = match File::open(&path).await {
                Ok(file) => file,
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    output.cleanup().await;
                    return Err(UploadError::MissingChunk { index });
                }
                Err(err) => {
                    output.cleanup().await;
                    return Err(err.into());
                }
            };
            if let Err(err) = tokio::io::copy(&mut chunk, output.file_mut()).await {
                output.cleanup().await;
                return Err(err.into());
            }
        }
        output.finalize().await?;
        Ok(())
    }

    /// 删除本次上传的分片文件，暂存区为空时一并删除。
    async fn remove_arena(&self, target: &Target) {
        for index in 0..target.total_chunks {
            let path = self
                .layout
                .chunk_path(&target.slug, &target.upload_id, index);
            if let Err(err) = fs::remove_file(&path).await
                && err.kind() != ErrorKind::NotFound
            {
                warn!(path = ?path, error = %err, "failed to remove chunk");
            }
        }
        // 其他上传仍有分片时会失败。
        let _ = fs::remove_dir(self.layout.arena_dir(&target.slug)).await;
    }

    async fn validate_content(&self, path: &Path) -> Result<(), UploadError> {
        let format = probe_image(path)
            .await
            .map_err(|err| UploadError::Content(err.to_string()))?;
        if !self.allowed_formats.contains(&format) {
            return Err(UploadError::Content(format!(
                "detected {format:?}, not an allowed type"
            )));
        }
        Ok(())
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(err) = fs::remove_file(path).await
        && err.kind() != ErrorKind::NotFound
    {
        warn!(path = ?path, error = %err, "cleanup failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::testing::StaticGate;
    use crate::logging::testing::CapturedLogs;
    use crate::store::testing::MemoryStore;
    use crate::transform::ImageThumbnailer;
    use crate::transform::testing::{FailingTransformer, sample_jpeg};
    use bytes::Bytes;
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        _temp: TempDir,
        layout: MediaLayout,
        store: Arc<MemoryStore>,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = tempdir().expect("tempdir");
            let layout = MediaLayout::new(
                temp.path().join("media"),
                temp.path().join("thumbs"),
                temp.path().join("variants"),
            );
            Self {
                _temp: temp,
                layout,
                store: Arc::new(MemoryStore::with_album(1, "trip", false)),
            }
        }

        fn service_with(&self, thumbnailer: Arc<dyn MediaTransformer>) -> ChunkAssemblyService {
            ChunkAssemblyService::new(
                self.layout.clone(),
                self.store.clone(),
                StaticGate::allow_all(),
                thumbnailer,
                &["jpg".to_string(), "jpeg".to_string()],
                8192,
            )
        }

        fn service(&self) -> ChunkAssemblyService {
            self.service_with(Arc::new(ImageThumbnailer))
        }

        fn original(&self, filename: &str) -> PathBuf {
            self.layout.path(MediaTree::Original, "trip", filename)
        }

        fn thumbnail(&self, filename: &str) -> PathBuf {
            self.layout.path(MediaTree::Thumbnail, "trip", filename)
        }
    }

    fn chunk(data: &[u8], index: u64, total: u64, filename: &str) -> ChunkRequest {
        ChunkRequest {
            chunk: Bytes::copy_from_slice(data),
            chunk_index: index,
            total_chunks: total,
            filename: filename.to_string(),
            upload_id: "u1".to_string(),
            album_id: 1,
            csrf_token: "token".to_string(),
        }
    }

    fn split(data: &[u8], parts: usize) -> Vec<&[u8]> {
        let size = data.len().div_ceil(parts);
        data.chunks(size).collect()
    }

    #[tokio::test]
    async fn chunks_in_order_reassemble_identically() {
        let fx = Fixture::new();
        let service = fx.service();
        let image = sample_jpeg(640, 480);
        let parts = split(&image, 3);
        let total = parts.len() as u64;
        let caller = Caller::default();

        for (index, part) in parts.iter().enumerate() {
            let outcome = service
                .accept(&caller, chunk(part, index as u64, total, "beach.jpg"))
                .await
                .expect("accept chunk");
            if (index as u64) < total - 1 {
                assert!(matches!(outcome, ChunkOutcome::Stored { .. }));
            } else {
                let ChunkOutcome::Committed(media) = outcome else {
                    panic!("final chunk should commit");
                };
                assert_eq!(media.title, "beach");
                assert_eq!(media.filename, "beach.jpg");
            }
        }

        assert_eq!(fs::read(fx.original("beach.jpg")).await.expect("read"), image);
        assert!(fs::metadata(fx.thumbnail("beach.jpg")).await.is_ok());
        assert!(fs::metadata(fx.layout.arena_dir("trip")).await.is_err());
        assert_eq!(fx.store.media_count(), 1);
    }

    #[tokio::test]
    async fn resending_a_chunk_is_idempotent() {
        let fx = Fixture::new();
        let service = fx.service();
        let image = sample_jpeg(64, 64);
        let parts = split(&image, 2);
        let caller = Caller::default();

        for _ in 0..2 {
            service
                .accept(&caller, chunk(parts[0], 0, 2, "a.jpg"))
                .await
                .expect("resend chunk 0");
        }
        service
            .accept(&caller, chunk(parts[1], 1, 2, "a.jpg"))
            .await
            .expect("final chunk");
        assert_eq!(fs::read(fx.original("a.jpg")).await.expect("read"), image);
    }

    #[tokio::test]
    async fn missing_chunk_discards_destination_and_keeps_arena() {
        let fx = Fixture::new();
        let service = fx.service();
        let caller = Caller::default();

        service
            .accept(&caller, chunk(b"first", 0, 3, "gap.jpg"))
            .await
            .expect("chunk 0");
        let result = service.accept(&caller, chunk(b"last", 2, 3, "gap.jpg")).await;

        assert!(matches!(result, Err(UploadError::MissingChunk { index: 1 })));
        assert!(fs::metadata(fx.original("gap.jpg")).await.is_err());
        assert!(
            fs::metadata(fx.layout.chunk_path("trip", "u1", 0))
                .await
                .is_ok()
        );
        let mut entries = fs::read_dir(fx.layout.album_dir(MediaTree::Original, "trip"))
            .await
            .expect("album dir");
        while let Some(entry) = entries.next_entry().await.expect("entry") {
            let name = entry.file_name();
            assert_eq!(name.to_string_lossy(), ".chunks", "stray file {name:?}");
        }
    }

    #[tokio::test]
    async fn undecodable_content_is_removed() {
        let fx = Fixture::new();
        let service = fx.service();
        let result = service
            .accept(&Caller::default(), chunk(b"not really a jpeg", 0, 1, "fake.jpg"))
            .await;

        assert!(matches!(result, Err(UploadError::Content(_))));
        assert!(fs::metadata(fx.original("fake.jpg")).await.is_err());
        assert_eq!(fx.store.media_count(), 0);
    }

    #[tokio::test]
    async fn thumbnail_failure_removes_original_and_partial_thumbnail() {
        let fx = Fixture::new();
        let service = fx.service_with(Arc::new(FailingTransformer {
            leave_partial: true,
        }));
        let result = service
            .accept(&Caller::default(), chunk(&sample_jpeg(32, 32), 0, 1, "t.jpg"))
            .await;

        assert!(matches!(result, Err(UploadError::Thumbnail(_))));
        assert!(fs::metadata(fx.original("t.jpg")).await.is_err());
        assert!(fs::metadata(fx.thumbnail("t.jpg")).await.is_err());
        assert_eq!(fx.store.media_count(), 0);
    }

    #[tokio::test]
    async fn commit_failure_removes_all_files() {
        let fx = Fixture::new();
        fx.store.fail_inserts();
        let service = fx.service();
        let result = service
            .accept(&Caller::default(), chunk(&sample_jpeg(32, 32), 0, 1, "c.jpg"))
            .await;

        assert!(matches!(result, Err(UploadError::Persistence(_))));
        assert!(fs::metadata(fx.original("c.jpg")).await.is_err());
        assert!(fs::metadata(fx.thumbnail("c.jpg")).await.is_err());
    }

    #[tokio::test]
    async fn rejects_bad_requests_before_writing() {
        let fx = Fixture::new();
        let service = fx.service();
        let caller = Caller::default();

        let result = service.accept(&caller, chunk(b"x", 0, 1, "evil.php")).await;
        assert!(matches!(result, Err(UploadError::Validation(_))));

        let result = service.accept(&caller, chunk(b"x", 3, 3, "a.jpg")).await;
        assert!(matches!(result, Err(UploadError::Validation(_))));

        let result = service.accept(&caller, chunk(b"x", 0, 1, "...")).await;
        assert!(matches!(result, Err(UploadError::Validation(_))));

        let mut request = chunk(b"x", 0, 1, "a.jpg");
        request.album_id = 42;
        let result = service.accept(&caller, request).await;
        assert!(matches!(result, Err(UploadError::NotFound(_))));

        assert!(fs::metadata(fx.layout.media_root()).await.is_err());
    }

    #[tokio::test]
    async fn rejected_chunks_are_logged_with_caller_and_target() {
        let (logs, _guard) = CapturedLogs::install();
        let fx = Fixture::new();
        let service = fx.service();
        let caller = Caller {
            session: None,
            client_ip: "203.0.113.5".into(),
        };

        let mut request = chunk(b"x", 0, 1, "a.jpg");
        request.album_id = 42;
        let result = service.accept(&caller, request).await;
        assert!(matches!(result, Err(UploadError::NotFound(_))));

        let output = logs.contents();
        assert!(output.contains("chunk rejected"), "{output}");
        assert!(output.contains("client_ip=203.0.113.5"), "{output}");
        assert!(output.contains("op=\"upload\""), "{output}");
        assert!(output.contains("album_id=42"), "{output}");
        assert!(output.contains("upload_id=\"u1\""), "{output}");
    }

    #[tokio::test]
    async fn traversal_filename_stays_inside_album() {
        let fx = Fixture::new();
        let service = fx.service();
        service
            .accept(
                &Caller::default(),
                chunk(&sample_jpeg(16, 16), 0, 1, "../../escape.jpg"),
            )
            .await
            .expect("sanitized upload");
        assert!(fs::metadata(fx.original("_.._escape.jpg")).await.is_ok());
    }

    #[tokio::test]
    async fn existing_destination_is_refused() {
        let fx = Fixture::new();
        let service = fx.service();
        let caller = Caller::default();
        let image = sample_jpeg(16, 16);
        service
            .accept(&caller, chunk(&image, 0, 1, "dup.jpg"))
            .await
            .expect("first upload");
        let result = service.accept(&caller, chunk(&image, 0, 1, "dup.jpg")).await;
        assert!(matches!(result, Err(UploadError::Validation(_))));
        assert_eq!(fx.store.media_count(), 1);
    }

    #[tokio::test]
    async fn remove_media_deletes_record_and_files() {
        let fx = Fixture::new();
        let service = fx.service();
        let caller = Caller::default();
        let outcome = service
            .accept(&caller, chunk(&sample_jpeg(32, 32), 0, 1, "gone.jpg"))
            .await
            .expect("upload");
        let ChunkOutcome::Committed(media) = outcome else {
            panic!("single chunk should commit");
        };

        service
            .remove_media(&caller, "token", media.id)
            .await
            .expect("remove");
        assert_eq!(fx.store.media_count(), 0);
        assert!(fs::metadata(fx.original("gone.jpg")).await.is_err());
        assert!(fs::metadata(fx.thumbnail("gone.jpg")).await.is_err());

        let again = service.remove_media(&caller, "token", media.id).await;
        assert!(matches!(again, Err(UploadError::NotFound(_))));
    }

    #[tokio::test]
    async fn rejected_csrf_has_no_side_effects() {
        let fx = Fixture::new();
        let service = ChunkAssemblyService::new(
            fx.layout.clone(),
            fx.store.clone(),
            Arc::new(StaticGate {
                authorized: true,
                csrf_ok: false,
            }),
            Arc::new(ImageThumbnailer),
            &["jpg".to_string()],
            0,
        );
        let result = service
            .accept(&Caller::default(), chunk(b"x", 0, 2, "a.jpg"))
            .await;
        assert!(matches!(result, Err(UploadError::Auth)));
        assert!(fs::metadata(fx.layout.arena_dir("trip")).await.is_err());
    }
}
