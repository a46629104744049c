//! 临时写入与原子替换的辅助方法。

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// 与目标同目录的临时文件，提交时重命名覆盖目标。
///
/// 读取 `target` 的一方只会看到旧内容或完整的新内容。
pub struct AtomicFile {
    target: PathBuf,
    temp_path: PathBuf,
    file: File,
}

impl AtomicFile {
    /// 在目标路径同目录创建临时文件。
    pub async fn new(target: &Path) -> io::Result<Self> {
        let parent = target
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "target has no parent"))?;
        let base = target
            .file_name()
            .map(|name| name.to_string_lossy())
            .unwrap_or_else(|| "file".into());
        let temp_name = format!(".{base}.tmp.{}", Uuid::new_v4().simple());
        let temp_path = parent.join(temp_name);
        let file = File::create(&temp_path).await?;
        Ok(Self {
            target: target.to_path_buf(),
            temp_path,
            file,
        })
    }

    /// 一次原子替换写入 `bytes`。
    pub async fn write(target: &Path, bytes: &[u8]) -> io::Result<()> {
        let mut atomic = Self::new(target).await?;
        if let Err(err) = atomic.file_mut().write_all(bytes).await {
            atomic.cleanup().await;
            return Err(err);
        }
        atomic.finalize().await
    }

    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    /// 放弃并清理临时文件。
    pub async fn cleanup(self) {
        drop(self.file);
        let _ = fs::remove_file(&self.temp_path).await;
    }

    /// 同步并原子替换目标文件。
    pub async fn finalize(mut self) -> io::Result<()> {
        if let Err(err) = self.file.flush().await {
            self.cleanup().await;
            return Err(err);
        }
        if let Err(err) = self.file.sync_all().await {
            self.cleanup().await;
            return Err(err);
        }
        drop(self.file);

        if let Err(err) = fs::rename(&self.temp_path, &self.target).await {
            #[cfg(windows)]
            {
                if fs::remove_file(&self.target).await.is_ok() {
                    return fs::rename(&self.temp_path, &self.target).await;
                }
            }
            let _ = fs::remove_file(&self.temp_path).await;
            return Err(err);
        }

        if let Some(parent) = self.target.parent() {
            let _ = sync_dir(parent).await;
        }

        Ok(())
    }
}

async fn sync_dir(path: &Path) -> io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let dir = std::fs::File::open(path)?;
        dir.sync_all()
    })
    .await
    .map_err(|err| io::Error::other(err.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn write_replaces_whole_file() {
        let temp = tempdir().expect("tempdir");
        let target = temp.path().join("state.json");
        AtomicFile::write(&target, b"first version").await.expect("write");
        AtomicFile::write(&target, b"second").await.expect("rewrite");
        assert_eq!(fs::read(&target).await.expect("read"), b"second");

        let leftovers = std::fs::read_dir(temp.path())
            .expect("read dir")
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().contains(".tmp."))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn cleanup_leaves_target_untouched() {
        let temp = tempdir().expect("tempdir");
        let target = temp.path().join("photo.jpg");
        let mut atomic = AtomicFile::new(&target).await.expect("create");
        atomic
            .file_mut()
            .write_all(b"partial")
            .await
            .expect("write");
        atomic.cleanup().await;
        assert!(fs::metadata(&target).await.is_err());
        assert_eq!(std::fs::read_dir(temp.path()).expect("dir").count(), 0);
    }
}
