//! 客户端上传队列。
//!
//! 由一个控制循环持有全部任务。分片发送是同一个 `FuturesUnordered` 中的 future，
//! 每个任务同时最多一个分片在途，同时最多 `limit` 个任务处于活动状态。
//! 取消通过可克隆的 [`QueueHandle`] 发出，只阻止任务的下一个分片；
//! 已在途的请求会执行完毕，其结果被忽略。

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::{BoxFuture, FutureExt};
use futures_util::stream::{FuturesUnordered, StreamExt};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::protocol::{CHUNK_SIZE, ChunkRequest, chunk_span, total_chunks};

/// 待上传文件的数据源。
#[async_trait]
pub trait ChunkSource: Send + Sync {
    fn name(&self) -> &str;
    fn size(&self) -> u64;
    async fn read_range(&self, start: u64, len: u64) -> io::Result<Bytes>;
}

/// 磁盘文件，每个分片重新打开读取。
#[derive(Debug)]
pub struct FileSource {
    path: PathBuf,
    name: String,
    size: u64,
}

impl FileSource {
    pub async fn open(path: &Path) -> io::Result<Self> {
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "not a file"));
        }
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no file name"))?;
        Ok(Self {
            path: path.to_path_buf(),
            name,
            size: metadata.len(),
        })
    }
}

#[async_trait]
impl ChunkSource for FileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.size
    }

    async fn read_range(&self, start: u64, len: u64) -> io::Result<Bytes> {
        let mut file = File::open(&self.path).await?;
        file.seek(SeekFrom::Start(start)).await?;
        let mut buffer = vec![0u8; len as usize];
        file.read_exact(&mut buffer).await?;
        Ok(Bytes::from(buffer))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// 服务端返回的不是成功标记。
    #[error("{0}")]
    Rejected(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("read error: {0}")]
    Io(#[from] io::Error),
}

/// 发送单个分片请求。
#[async_trait]
pub trait ChunkSender: Send + Sync {
    async fn send(&self, request: ChunkRequest) -> Result<(), SendError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Sending { next_index: u64 },
    Done,
    Failed(String),
    Cancelled,
}

/// 展示队列状态的界面，所有方法默认不做任何事。
pub trait UploadObserver: Send + Sync {
    fn on_rejected(&self, _name: &str, _reason: &str) {}
    fn on_started(&self, _task: TaskId, _name: &str) {}
    fn on_progress(&self, _task: TaskId, _uploaded: u64, _total: u64) {}
    fn on_done(&self, _task: TaskId) {}
    fn on_failed(&self, _task: TaskId, _error: &str) {}
    fn on_cancelled(&self, _task: TaskId) {}
    /// 队列为空且无活动任务，界面应整体刷新。
    fn on_drained(&self) {}
}

/// 上传目标。
#[derive(Clone, Debug)]
pub struct UploadTarget {
    pub album_id: i64,
    pub csrf_token: String,
}

struct UploadTask {
    source: Arc<dyn ChunkSource>,
    upload_id: String,
    total_chunks: u64,
    uploaded: u64,
    state: TaskState,
}

enum QueueCommand {
    Cancel(TaskId),
}

/// 运行中控制器的可克隆遥控句柄。
#[derive(Clone)]
pub struct QueueHandle {
    commands: mpsc::UnboundedSender<QueueCommand>,
}

impl QueueHandle {
    /// 控制器已结束时返回 `false`。
    pub fn cancel(&self, task: TaskId) -> bool {
        self.commands.send(QueueCommand::Cancel(task)).is_ok()
    }
}

struct ChunkResult {
    task: TaskId,
    index: u64,
    result: Result<(), SendError>,
}

pub struct UploadQueueController {
    target: UploadTarget,
    limit: usize,
    chunk_size: u64,
    sender: Arc<dyn ChunkSender>,
    observer: Arc<dyn UploadObserver>,
    tasks: HashMap<TaskId, UploadTask>,
    finished: HashMap<TaskId, TaskState>,
    queue: VecDeque<TaskId>,
    active: HashSet<TaskId>,
    next_id: u64,
    commands_tx: mpsc::UnboundedSender<QueueCommand>,
    commands_rx: mpsc::UnboundedReceiver<QueueCommand>,
}

impl UploadQueueController {
    pub fn new(
        target: UploadTarget,
        limit: usize,
        sender: Arc<dyn ChunkSender>,
        observer: Arc<dyn UploadObserver>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        Self {
            target,
            limit: limit.max(1),
            chunk_size: CHUNK_SIZE,
            sender,
            observer,
            tasks: HashMap::new(),
            finished: HashMap::new(),
            queue: VecDeque::new(),
            active: HashSet::new(),
            next_id: 1,
            commands_tx,
            commands_rx,
        }
    }

    #[cfg(test)]
    fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn handle(&self) -> QueueHandle {
        QueueHandle {
            commands: self.commands_tx.clone(),
        }
    }

    pub fn state(&self, task: TaskId) -> Option<TaskState> {
        self.tasks
            .get(&task)
            .map(|t| t.state.clone())
            .or_else(|| self.finished.get(&task).cloned())
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// 为每个可接受的文件创建任务，按拖入顺序返回任务 id。
    pub fn drop_files(&mut self, sources: Vec<Arc<dyn ChunkSource>>) -> Vec<TaskId> {
        let mut created = Vec::new();
        for source in sources {
            if !is_image(source.name()) {
                self.observer.on_rejected(source.name(), "not an image");
                continue;
            }
            if source.size() == 0 {
                self.observer.on_rejected(source.name(), "empty file");
                continue;
            }
            let id = TaskId(self.next_id);
            self.next_id += 1;
            let task = UploadTask {
                total_chunks: total_chunks(source.size(), self.chunk_size),
                upload_id: Uuid::new_v4().simple().to_string(),
                uploaded: 0,
                state: TaskState::Queued,
                source,
            };
            debug!(task = %id, name = task.source.name(), chunks = task.total_chunks, "task queued");
            self.tasks.insert(id, task);
            self.queue.push_back(id);
            created.push(id);
        }
        created
    }

    /// 持续调度直到队列为空且无活动任务。
    pub async fn run(&mut self) {
        let mut in_flight: FuturesUnordered<BoxFuture<'static, ChunkResult>> =
            FuturesUnordered::new();
        loop {
            self.pump(&mut in_flight);
            if self.active.is_empty() && self.queue.is_empty() {
                break;
            }
            tokio::select! {
                biased;
                Some(command) = self.commands_rx.recv() => self.apply(command),
                Some(done) = in_flight.next() => self.on_chunk_result(done, &mut in_flight),
            }
        }
        self.observer.on_drained();

        // 已取消任务遗留的在途请求。
        while let Some(orphan) = in_flight.next().await {
            debug!(task = %orphan.task, index = orphan.index, "orphaned chunk send finished");
        }
    }

    fn pump(&mut self, in_flight: &mut FuturesUnordered<BoxFuture<'static, ChunkResult>>) {
        while self.active.len() < self.limit {
            let Some(id) = self.queue.pop_front() else {
                break;
            };
            let Some(task) = self.tasks.get_mut(&id) else {
                continue;
            };
            task.state = TaskState::Sending { next_index: 0 };
            self.active.insert(id);
            self.observer.on_started(id, task.source.name());
            if let Some(send) = self.chunk_send(id, 0) {
                in_flight.push(send);
            }
        }
    }

    fn chunk_send(&self, id: TaskId, index: u64) -> Option<BoxFuture<'static, ChunkResult>> {
        let task = self.tasks.get(&id)?;
        let source = task.source.clone();
        let sender = self.sender.clone();
        let (start, len) = chunk_span(index, source.size(), self.chunk_size);
        let upload_id = task.upload_id.clone();
        let total_chunks = task.total_chunks;
        let target = self.target.clone();
        Some(
            async move {
                let result = match source.read_range(start, len).await {
                    Ok(chunk) => {
                        sender
                            .send(ChunkRequest {
                                chunk,
                                chunk_index: index,
                                total_chunks,
                                filename: source.name().to_string(),
                                upload_id,
                                album_id: target.album_id,
                                csrf_token: target.csrf_token,
                            })
                            .await
                    }
                    Err(err) => Err(SendError::from(err)),
                };
                ChunkResult {
                    task: id,
                    index,
                    result,
                }
            }
            .boxed(),
        )
    }

    fn on_chunk_result(
        &mut self,
        done: ChunkResult,
        in_flight: &mut FuturesUnordered<BoxFuture<'static, ChunkResult>>,
    ) {
        let Some(task) = self.tasks.get_mut(&done.task) else {
            debug!(task = %done.task, index = done.index, "result for finished task ignored");
            return;
        };
        if task.state != (TaskState::Sending { next_index: done.index }) {
            return;
        }

        match done.result {
            Ok(()) => {
                task.uploaded = done.index + 1;
                self.observer
                    .on_progress(done.task, task.uploaded, task.total_chunks);
                if task.uploaded == task.total_chunks {
                    self.finish(done.task, TaskState::Done);
                    self.observer.on_done(done.task);
                } else {
                    let next_index = done.index + 1;
                    task.state = TaskState::Sending { next_index };
                    if let Some(send) = self.chunk_send(done.task, next_index) {
                        in_flight.push(send);
                    }
                }
            }
            Err(err) => {
                let message = err.to_string();
                self.finish(done.task, TaskState::Failed(message.clone()));
                self.observer.on_failed(done.task, &message);
            }
        }
    }

    fn apply(&mut self, command: QueueCommand) {
        match command {
            QueueCommand::Cancel(id) => {
                let queued = self.queue.iter().position(|queued| *queued == id);
                if let Some(position) = queued {
                    self.queue.remove(position);
                } else if !self.active.contains(&id) {
                    return;
                }
                self.finish(id, TaskState::Cancelled);
                self.observer.on_cancelled(id);
            }
        }
    }

    /// 移除任务、释放并发名额并记录最终状态。
    fn finish(&mut self, id: TaskId, state: TaskState) {
        self.active.remove(&id);
        self.tasks.remove(&id);
        self.finished.insert(id, state);
    }
}

fn is_image(name: &str) -> bool {
    mime_guess::from_path(name)
        .first()
        .is_some_and(|mime| mime.type_() == mime_guess::mime::IMAGE)
}
