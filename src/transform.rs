//! 缩略图生成与图片探测。
//!
//! 转换只接收已清洗的路径，外部工具以参数数组启动，不经过 shell。

use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, ImageReader, Limits};
use std::io::{self, BufReader, Cursor};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::atomic::AtomicFile;
use crate::config::{MAX_DECODE_ALLOC_BYTES, MAX_IMAGE_DIMENSION};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransformKind {
    /// 按宽度等比缩放，以 `quality` 重新编码。
    Resize { width: u32, quality: u8 },
    /// 截取视频第 `at_secs` 秒的一帧并缩放到 `width`。
    VideoFrame { at_secs: u32, width: u32 },
}

#[derive(Clone, Debug)]
pub struct TransformSpec {
    pub output: PathBuf,
    pub kind: TransformKind,
}

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("transform not supported by this tool")]
    Unsupported,
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("unrecognized image format")]
    UnknownFormat,
    #[error("tool failed: {0}")]
    ToolFailed(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// `transform(input, spec) -> output | failure`
#[async_trait]
pub trait MediaTransformer: Send + Sync {
    async fn transform(&self, input: &Path, spec: &TransformSpec)
    -> Result<PathBuf, TransformError>;
}

/// 进程内图片缩略图生成器。
#[derive(Clone, Debug, Default)]
pub struct ImageThumbnailer;

#[async_trait]
impl MediaTransformer for ImageThumbnailer {
    async fn transform(
        &self,
        input: &Path,
        spec: &TransformSpec,
    ) -> Result<PathBuf, TransformError> {
        let TransformKind::Resize { width, quality } = spec.kind else {
            return Err(TransformError::Unsupported);
        };
        let input = input.to_path_buf();
        let encoded = tokio::task::spawn_blocking(move || resize_encode(&input, width, quality))
            .await
            .map_err(|err| io::Error::other(err.to_string()))??;

        if let Some(parent) = spec.output.parent() {
            fs::create_dir_all(parent).await?;
        }
        AtomicFile::write(&spec.output, &encoded).await?;
        debug!(output = ?spec.output, bytes = encoded.len(), "thumbnail written");
        Ok(spec.output.clone())
    }
}

fn decode_limits() -> Limits {
    let mut limits = Limits::default();
    limits.max_image_width = Some(MAX_IMAGE_DIMENSION);
    limits.max_image_height = Some(MAX_IMAGE_DIMENSION);
    limits.max_alloc = Some(MAX_DECODE_ALLOC_BYTES);
    limits
}

/// 以流式解码方式打开 `path`，只读取解码器需要的字节。
fn open_bounded(
    path: &Path,
) -> Result<(ImageReader<BufReader<std::fs::File>>, ImageFormat), TransformError> {
    let mut reader = ImageReader::open(path)?.with_guessed_format()?;
    let format = reader.format().ok_or(TransformError::UnknownFormat)?;
    reader.limits(decode_limits());
    Ok((reader, format))
}

fn resize_encode(input: &Path, width: u32, quality: u8) -> Result<Vec<u8>, TransformError> {
    let (reader, format) = open_bounded(input)?;
    let img = reader.decode()?;
    let resized = img.resize(width, u32::MAX, FilterType::Lanczos3);

    let mut buffer = Vec::new();
    if format == ImageFormat::Jpeg {
        let encoder = JpegEncoder::new_with_quality(&mut buffer, quality);
        DynamicImage::ImageRgb8(resized.to_rgb8()).write_with_encoder(encoder)?;
    } else {
        resized.write_to(&mut Cursor::new(&mut buffer), format)?;
    }
    Ok(buffer)
}

/// 基于 `ffmpeg` 的视频截帧。
#[derive(Clone, Debug)]
pub struct FfmpegFrameExtractor {
    binary: PathBuf,
}

impl FfmpegFrameExtractor {
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }
}

#[async_trait]
impl MediaTransformer for FfmpegFrameExtractor {
    async fn transform(
        &self,
        input: &Path,
        spec: &TransformSpec,
    ) -> Result<PathBuf, TransformError> {
        let TransformKind::VideoFrame { at_secs, width } = spec.kind else {
            return Err(TransformError::Unsupported);
        };
        if let Some(parent) = spec.output.parent() {
            fs::create_dir_all(parent).await?;
        }
        let staging = staging_path(&spec.output);

        let output = Command::new(&self.binary)
            .arg("-y")
            .arg("-i")
            .arg(input)
            .arg("-ss")
            .arg(format_timestamp(at_secs))
            .args(["-vframes", "1", "-vf"])
            .arg(format!("scale={width}:-1"))
            .args(["-q:v", "3", "-update", "1"])
            .arg(&staging)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr.lines().rev().take(3).collect::<Vec<_>>().join(" | ");
            warn!(input = ?input, status = %output.status, stderr = %tail, "ffmpeg failed");
            let _ = fs::remove_file(&staging).await;
            return Err(TransformError::ToolFailed(output.status.to_string()));
        }
        if fs::metadata(&staging).await.is_err() {
            return Err(TransformError::ToolFailed("no output produced".into()));
        }
        if let Err(err) = fs::rename(&staging, &spec.output).await {
            let _ = fs::remove_file(&staging).await;
            return Err(err.into());
        }
        Ok(spec.output.clone())
    }
}

/// `output` 同目录的隐藏临时文件，保留扩展名供 ffmpeg 选择输出格式。
fn staging_path(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = output
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();
    output.with_file_name(format!(".{stem}.{}{extension}", Uuid::new_v4().simple()))
}

fn format_timestamp(secs: u32) -> String {
    format!(
        "{:02}:{:02}:{:02}",
        secs / 3600,
        (secs / 60) % 60,
        secs % 60
    )
}

/// 识别图片真实格式并确认可以完整解码。
pub async fn probe_image(path: &Path) -> Result<ImageFormat, TransformError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<ImageFormat, TransformError> {
        let (reader, format) = open_bounded(&path)?;
        reader.decode()?;
        Ok(format)
    })
    .await
    .map_err(|err| io::Error::other(err.to_string()))?
}

#[cfg(test)]
pub mod testing {
    //! [`MediaTransformer`] 的测试替身。

    use super::*;

    /// 总是失败，可选择留下不完整的输出文件。
    pub struct FailingTransformer {
        pub leave_partial: bool,
    }

    #[async_trait]
    impl MediaTransformer for FailingTransformer {
        async fn transform(
            &self,
            _input: &Path,
            spec: &TransformSpec,
        ) -> Result<PathBuf, TransformError> {
            if self.leave_partial {
                if let Some(parent) = spec.output.parent() {
                    fs::create_dir_all(parent).await?;
                }
                fs::write(&spec.output, b"half a thumbnail").await?;
            }
            Err(TransformError::ToolFailed("exit status: 1".into()))
        }
    }

    /// 生成一张渐变 JPEG。
    pub fn sample_jpeg(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
        });
        let mut buffer = Vec::new();
        let encoder = JpegEncoder::new_with_quality(&mut buffer, 90);
        DynamicImage::ImageRgb8(img)
            .write_with_encoder(encoder)
            .expect("encode sample jpeg");
        buffer
    }
}

#[cfg(test)]
mod tests {
    use super::testing::sample_jpeg;
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn thumbnail_is_scaled_to_width() {
        let temp = tempdir().expect("tempdir");
        let input = temp.path().join("in.jpg");
        fs::write(&input, sample_jpeg(800, 600)).await.expect("write");
        let spec = TransformSpec {
            output: temp.path().join("thumbs/trip/in.jpg"),
            kind: TransformKind::Resize {
                width: 400,
                quality: 95,
            },
        };

        let output = ImageThumbnailer
            .transform(&input, &spec)
            .await
            .expect("transform");
        let thumb = image::open(&output).expect("open thumbnail");
        assert_eq!(thumb.width(), 400);
        assert_eq!(thumb.height(), 300);
    }

    #[tokio::test]
    async fn thumbnailer_rejects_video_spec() {
        let temp = tempdir().expect("tempdir");
        let input = temp.path().join("in.jpg");
        fs::write(&input, sample_jpeg(10, 10)).await.expect("write");
        let spec = TransformSpec {
            output: temp.path().join("out.jpg"),
            kind: TransformKind::VideoFrame {
                at_secs: 5,
                width: 120,
            },
        };
        let result = ImageThumbnailer.transform(&input, &spec).await;
        assert!(matches!(result, Err(TransformError::Unsupported)));
    }

    #[tokio::test]
    async fn detects_jpeg_and_rejects_garbage() {
        let temp = tempdir().expect("tempdir");
        let good = temp.path().join("good.jpg");
        fs::write(&good, sample_jpeg(16, 16)).await.expect("write");
        assert_eq!(probe_image(&good).await.expect("probe"), ImageFormat::Jpeg);

        let bad = temp.path().join("bad.jpg");
        fs::write(&bad, b"definitely not an image").await.expect("write");
        assert!(probe_image(&bad).await.is_err());
    }

    #[tokio::test]
    async fn oversized_images_are_refused_before_decode() {
        let temp = tempdir().expect("tempdir");
        let wide = temp.path().join("wide.jpg");
        fs::write(&wide, sample_jpeg(MAX_IMAGE_DIMENSION + 1, 1))
            .await
            .expect("write");
        assert!(matches!(
            probe_image(&wide).await,
            Err(TransformError::Image(image::ImageError::Limits(_)))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn frame_extractor_renames_staged_output() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempdir().expect("tempdir");
        let record = temp.path().join("written-to");
        let tool = temp.path().join("fake-ffmpeg");
        std::fs::write(
            &tool,
            format!(
                "#!/bin/sh\nfor last; do :; done\nprintf frame > \"$last\"\nprintf %s \"$last\" > '{}'\n",
                record.display()
            ),
        )
        .expect("write tool");
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).expect("chmod");

        let output = temp.path().join("thumbs/trip/movie.jpg");
        let spec = TransformSpec {
            output: output.clone(),
            kind: TransformKind::VideoFrame {
                at_secs: 5,
                width: 120,
            },
        };
        FfmpegFrameExtractor::new(tool)
            .transform(&temp.path().join("movie.mp4"), &spec)
            .await
            .expect("transform");

        let written_to = PathBuf::from(std::fs::read_to_string(&record).expect("record"));
        assert_ne!(written_to, output);
        assert_eq!(written_to.parent(), output.parent());
        assert_eq!(written_to.extension().and_then(|ext| ext.to_str()), Some("jpg"));
        assert!(fs::metadata(&written_to).await.is_err());
        assert_eq!(fs::read(&output).await.expect("read output"), b"frame");
    }

    #[test]
    fn timestamp_is_hms() {
        assert_eq!(format_timestamp(5), "00:00:05");
        assert_eq!(format_timestamp(3725), "01:02:05");
    }
}
