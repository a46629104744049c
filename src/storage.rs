//! 相册、缩略图、转码版本与分片暂存区的磁盘布局。

use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::ErrorKind;

/// 相册内存放未合并分片的目录。
pub const ARENA_DIR_NAME: &str = ".chunks";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("invalid path")]
    InvalidPath,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// 媒体路径所属的目录树。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaTree {
    Original,
    Thumbnail,
    Variant,
}

impl MediaTree {
    /// 交给前置代理时使用的路径段。
    pub fn proxy_segment(self) -> &'static str {
        match self {
            MediaTree::Original => "media",
            MediaTree::Thumbnail => "thumbnails",
            MediaTree::Variant => "variants",
        }
    }
}

#[derive(Clone, Debug)]
pub struct MediaLayout {
    media_root: PathBuf,
    thumb_root: PathBuf,
    variant_root: PathBuf,
}

impl MediaLayout {
    pub fn new(media_root: PathBuf, thumb_root: PathBuf, variant_root: PathBuf) -> Self {
        Self {
            media_root,
            thumb_root,
            variant_root,
        }
    }

    pub async fn ensure_roots(&self) -> io::Result<()> {
        fs::create_dir_all(&self.media_root).await?;
        fs::create_dir_all(&self.thumb_root).await?;
        fs::create_dir_all(&self.variant_root).await
    }

    pub fn media_root(&self) -> &Path {
        &self.media_root
    }

    fn root(&self, tree: MediaTree) -> &Path {
        match tree {
            MediaTree::Original => &self.media_root,
            MediaTree::Thumbnail => &self.thumb_root,
            MediaTree::Variant => &self.variant_root,
        }
    }

    /// 指定目录树下的 `<root>/<slug>/<filename>`，两个路径段须已清洗。
    pub fn path(&self, tree: MediaTree, slug: &str, filename: &str) -> PathBuf {
        self.root(tree).join(slug).join(filename)
    }

    pub fn album_dir(&self, tree: MediaTree, slug: &str) -> PathBuf {
        self.root(tree).join(slug)
    }

    pub fn arena_dir(&self, slug: &str) -> PathBuf {
        self.album_dir(MediaTree::Original, slug).join(ARENA_DIR_NAME)
    }

    /// `<media_root>/<slug>/.chunks/<upload_id>.<index>`
    pub fn chunk_path(&self, slug: &str, upload_id: &str, index: u64) -> PathBuf {
        self.arena_dir(slug).join(format!("{upload_id}.{index}"))
    }

    /// 解析 `<root>/<slug>/<filename>`，拒绝路径穿越与符号链接。
    pub async fn resolve_checked(
        &self,
        tree: MediaTree,
        slug: &str,
        filename: &str,
        allow_missing_leaf: bool,
    ) -> Result<PathBuf, StorageError> {
        let root = self.root(tree);
        let mut target = root.to_path_buf();
        for segment in [slug, filename] {
            let mut components = Path::new(segment).components();
            match (components.next(), components.next()) {
                (Some(Component::Normal(part)), None) => target.push(part),
                _ => return Err(StorageError::InvalidPath),
            }
        }
        ensure_no_symlink_components(root, &target, allow_missing_leaf).await?;
        Ok(target)
    }
}

async fn ensure_no_symlink_components(
    root: &Path,
    target: &Path,
    allow_missing_leaf: bool,
) -> Result<(), StorageError> {
    let relative = target
        .strip_prefix(root)
        .map_err(|_| StorageError::InvalidPath)?;
    let mut current = root.to_path_buf();
    let mut components = relative.components().peekable();

    while let Some(component) = components.next() {
        current.push(component.as_os_str());
        match fs::symlink_metadata(&current).await {
            Ok(metadata) => {
                if metadata.file_type().is_symlink() {
                    return Err(StorageError::InvalidPath);
                }
                if components.peek().is_some() && !metadata.is_dir() {
                    return Err(StorageError::InvalidPath);
                }
            }
            Err(err) if err.kind() == ErrorKind::NotFound && allow_missing_leaf => {
                return Ok(());
            }
            Err(err) => return Err(StorageError::Io(err)),
        }
    }

    Ok(())
}

/// 将客户端文件名限制为 `[A-Za-z0-9._-]`，其余字符替换为 `_`。
///
/// 去掉开头的点，上传文件不会与暂存区或临时文件同名。
/// 清洗后为空时返回 `None`。
pub fn sanitize_filename(raw: &str) -> Option<String> {
    let replaced: String = raw
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = replaced.trim_start_matches('.');
    if trimmed.is_empty() || trimmed.chars().all(|c| c == '.') {
        return None;
    }
    Some(trimmed.to_string())
}

/// upload id 只保留 `[A-Za-z0-9_-]`。
pub fn sanitize_upload_id(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
        .collect();
    (!cleaned.is_empty()).then_some(cleaned)
}

/// 相册 slug 转小写，`[a-z0-9_-]` 以外的字符替换为 `_`。
pub fn sanitize_slug(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    (!cleaned.is_empty()).then_some(cleaned)
}

/// 文件扩展名（小写）。
pub fn extension_of(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_layout(base: &Path) -> MediaLayout {
        MediaLayout::new(
            base.join("media"),
            base.join("thumbs"),
            base.join("variants"),
        )
    }

    #[test]
    fn sanitize_filename_replaces_unsafe_characters() {
        assert_eq!(
            sanitize_filename("my photo (1).JPG").as_deref(),
            Some("my_photo__1_.JPG")
        );
        assert_eq!(
            sanitize_filename("../../etc/passwd").as_deref(),
            Some("_.._etc_passwd")
        );
        assert_eq!(sanitize_filename(".chunks").as_deref(), Some("chunks"));
        assert_eq!(sanitize_filename(".."), None);
        assert_eq!(sanitize_filename("   "), None);
    }

    #[test]
    fn sanitize_upload_id_drops_everything_else() {
        assert_eq!(
            sanitize_upload_id("1712_ab/../c9").as_deref(),
            Some("1712_abc9")
        );
        assert_eq!(sanitize_upload_id("../"), None);
    }

    #[test]
    fn sanitize_slug_lowercases() {
        assert_eq!(sanitize_slug("Summer 2024!").as_deref(), Some("summer_2024_"));
    }

    #[test]
    fn chunk_path_follows_arena_layout() {
        let layout = make_layout(Path::new("/srv"));
        assert_eq!(
            layout.chunk_path("trip", "abc", 3),
            PathBuf::from("/srv/media/trip/.chunks/abc.3")
        );
    }

    #[tokio::test]
    async fn resolve_checked_rejects_traversal_segments() {
        let temp = tempdir().expect("tempdir");
        let layout = make_layout(temp.path());
        layout.ensure_roots().await.expect("roots");
        let result = layout
            .resolve_checked(MediaTree::Original, "trip", "../x.jpg", true)
            .await;
        assert!(matches!(result, Err(StorageError::InvalidPath)));
        let result = layout
            .resolve_checked(MediaTree::Original, "..", "x.jpg", true)
            .await;
        assert!(matches!(result, Err(StorageError::InvalidPath)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn resolve_checked_rejects_symlink() {
        use std::os::unix::fs::symlink;

        let temp = tempdir().expect("tempdir");
        let layout = make_layout(temp.path());
        layout.ensure_roots().await.expect("roots");
        std::fs::create_dir_all(temp.path().join("media/trip")).expect("album dir");

        let outside = temp.path().join("outside.jpg");
        std::fs::write(&outside, b"secret").expect("write outside file");
        symlink(&outside, temp.path().join("media/trip/link.jpg")).expect("symlink");

        let result = layout
            .resolve_checked(MediaTree::Original, "trip", "link.jpg", false)
            .await;
        assert!(matches!(result, Err(StorageError::InvalidPath)));
    }
}
