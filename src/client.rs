//! `upload` 子命令使用的 HTTP 客户端。

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use reqwest::Client;
use reqwest::multipart::{Form, Part};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{info, warn};

use crate::auth::SessionInfo;
use crate::config::{CSRF_HEADER_NAME, UploadArgs};
use crate::protocol::{
    ChunkRequest, FIELD_ALBUM_ID, FIELD_CHUNK, FIELD_CHUNK_INDEX, FIELD_CSRF_TOKEN,
    FIELD_FILENAME, FIELD_TOTAL_CHUNKS, FIELD_UPLOAD_ID, is_success_body,
};
use crate::queue::{
    ChunkSender, ChunkSource, FileSource, SendError, TaskId, UploadObserver,
    UploadQueueController, UploadTarget,
};

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .cookie_store(true)
            .timeout(Duration::from_secs(300))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn build_url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// 登录并返回 CSRF token，会话 Cookie 保存在客户端内。
    pub async fn login(&self, username: &str, password: &str) -> Result<String> {
        let response = self
            .client
            .post(self.build_url("/api/auth/login"))
            .json(&LoginRequest { username, password })
            .send()
            .await
            .context("Failed to send login request")?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            bail!("Login failed with status {}: {}", status, error_text);
        }
        let session: SessionInfo = response
            .json()
            .await
            .context("Failed to parse login response")?;
        Ok(session.csrf_token)
    }
}

#[async_trait]
impl ChunkSender for ApiClient {
    async fn send(&self, request: ChunkRequest) -> Result<(), SendError> {
        let length = request.chunk.len() as u64;
        let part = Part::stream_with_length(reqwest::Body::from(request.chunk), length)
            .file_name("blob")
            .mime_str("application/octet-stream")
            .map_err(|err| SendError::Transport(err.to_string()))?;
        let form = Form::new()
            .part(FIELD_CHUNK, part)
            .text(FIELD_CHUNK_INDEX, request.chunk_index.to_string())
            .text(FIELD_TOTAL_CHUNKS, request.total_chunks.to_string())
            .text(FIELD_FILENAME, request.filename)
            .text(FIELD_UPLOAD_ID, request.upload_id)
            .text(FIELD_ALBUM_ID, request.album_id.to_string())
            .text(FIELD_CSRF_TOKEN, request.csrf_token.clone());

        let response = self
            .client
            .post(self.build_url("/api/upload"))
            .header(CSRF_HEADER_NAME, request.csrf_token)
            .multipart(form)
            .send()
            .await
            .map_err(|err| SendError::Transport(err.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| SendError::Transport(err.to_string()))?;
        if status.is_success() && is_success_body(&body) {
            return Ok(());
        }
        let detail = body.trim();
        Err(SendError::Rejected(if detail.is_empty() {
            status.to_string()
        } else {
            detail.to_string()
        }))
    }
}

/// 将队列事件写入日志并统计失败数。
#[derive(Default)]
pub struct LogObserver {
    failed: AtomicUsize,
    rejected: AtomicUsize,
}

impl LogObserver {
    pub fn failures(&self) -> usize {
        self.failed.load(Ordering::SeqCst) + self.rejected.load(Ordering::SeqCst)
    }
}

impl UploadObserver for LogObserver {
    fn on_rejected(&self, name: &str, reason: &str) {
        self.rejected.fetch_add(1, Ordering::SeqCst);
        warn!(file = name, reason, "file skipped");
    }

    fn on_started(&self, task: TaskId, name: &str) {
        info!(task = %task, file = name, "upload started");
    }

    fn on_progress(&self, task: TaskId, uploaded: u64, total: u64) {
        info!(task = %task, "{uploaded}/{total} chunks");
    }

    fn on_done(&self, task: TaskId) {
        info!(task = %task, "upload complete");
    }

    fn on_failed(&self, task: TaskId, error: &str) {
        self.failed.fetch_add(1, Ordering::SeqCst);
        warn!(task = %task, error, "upload failed");
    }

    fn on_cancelled(&self, task: TaskId) {
        info!(task = %task, "upload cancelled");
    }

    fn on_drained(&self) {
        info!("upload queue drained");
    }
}

/// `photo-vault upload`：登录、入队全部文件并等待队列清空。
pub async fn run_upload(args: UploadArgs) -> Result<()> {
    let client = Arc::new(ApiClient::new(&args.server)?);
    let csrf_token = client.login(&args.user, &args.pass).await?;
    info!(server = %args.server, album_id = args.album, "logged in");

    let observer = Arc::new(LogObserver::default());
    let mut sources: Vec<Arc<dyn ChunkSource>> = Vec::new();
    for path in &args.files {
        match FileSource::open(path).await {
            Ok(source) => sources.push(Arc::new(source)),
            Err(err) => observer.on_rejected(&path.display().to_string(), &err.to_string()),
        }
    }

    let mut queue = UploadQueueController::new(
        UploadTarget {
            album_id: args.album,
            csrf_token,
        },
        args.parallel,
        client,
        observer.clone(),
    );
    let tasks = queue.drop_files(sources);
    queue.run().await;

    let failures = observer.failures();
    if failures > 0 {
        bail!("{failures} of {} file(s) not uploaded", args.files.len());
    }
    info!(count = tasks.len(), "all uploads complete");
    Ok(())
}
