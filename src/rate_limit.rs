//! 基于文件的登录失败限流。
//!
//! 全部状态保存为一个 JSON 文件。每次修改在一把粗粒度锁内读取、合并并原子写回。

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::warn;

use crate::atomic::AtomicFile;

#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn locked(&self, id: &str) -> Result<bool, RateLimitError>;
    async fn record_failure(&self, id: &str) -> Result<(), RateLimitError>;
    async fn clear(&self, id: &str) -> Result<(), RateLimitError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Entry {
    #[serde(default)]
    attempts: Vec<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    locked_until: Option<i64>,
}

type State = HashMap<String, Entry>;

#[derive(Debug)]
pub struct FileRateLimiter {
    path: PathBuf,
    max_attempts: u32,
    lockout: Duration,
    guard: Mutex<()>,
}

impl FileRateLimiter {
    /// `max_attempts == 0` 时不限流。
    pub fn new(path: PathBuf, max_attempts: u32, lockout: Duration) -> Self {
        Self {
            path,
            max_attempts,
            lockout,
            guard: Mutex::new(()),
        }
    }

    pub fn lockout(&self) -> Duration {
        self.lockout
    }

    async fn load(&self) -> Result<State, RateLimitError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(State::new()),
            Err(err) => return Err(err.into()),
        };
        match serde_json::from_slice(&bytes) {
            Ok(state) => Ok(state),
            Err(err) => {
                warn!(path = ?self.path, error = %err, "discarding unreadable rate limit state");
                Ok(State::new())
            }
        }
    }

    async fn save(&self, state: &State) -> Result<(), RateLimitError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec(state)?;
        AtomicFile::write(&self.path, &bytes).await?;
        Ok(())
    }

    fn window_secs(&self) -> i64 {
        self.lockout.as_secs() as i64
    }
}

#[async_trait]
impl RateLimiter for FileRateLimiter {
    async fn locked(&self, id: &str) -> Result<bool, RateLimitError> {
        if self.max_attempts == 0 {
            return Ok(false);
        }
        let _guard = self.guard.lock().await;
        let state = self.load().await?;
        let Some(entry) = state.get(id) else {
            return Ok(false);
        };
        let now = Utc::now().timestamp();
        if entry.locked_until.is_some_and(|until| now < until) {
            return Ok(true);
        }
        let window = self.window_secs();
        let recent = entry
            .attempts
            .iter()
            .filter(|&&at| now - at < window)
            .count();
        Ok(recent >= self.max_attempts as usize)
    }

    async fn record_failure(&self, id: &str) -> Result<(), RateLimitError> {
        if self.max_attempts == 0 {
            return Ok(());
        }
        let _guard = self.guard.lock().await;
        let mut state = self.load().await?;
        let now = Utc::now().timestamp();
        let window = self.window_secs();
        let entry = state.entry(id.to_string()).or_default();
        entry.attempts.push(now);
        entry.attempts.retain(|&at| now - at < window);
        if entry.attempts.len() >= self.max_attempts as usize {
            entry.locked_until = Some(now + window);
            warn!(client = id, "login locked out");
        }
        self.save(&state).await
    }

    async fn clear(&self, id: &str) -> Result<(), RateLimitError> {
        let _guard = self.guard.lock().await;
        let mut state = self.load().await?;
        if state.remove(id).is_some() {
            self.save(&state).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn locks_after_max_failures() {
        let temp = tempdir().expect("tempdir");
        let limiter = FileRateLimiter::new(
            temp.path().join("rate.json"),
            3,
            Duration::from_secs(900),
        );
        for _ in 0..2 {
            limiter.record_failure("10.0.0.1").await.expect("record");
        }
        assert!(!limiter.locked("10.0.0.1").await.expect("check"));
        limiter.record_failure("10.0.0.1").await.expect("record");
        assert!(limiter.locked("10.0.0.1").await.expect("check"));
        assert!(!limiter.locked("10.0.0.2").await.expect("check"));
    }

    #[tokio::test]
    async fn clear_unlocks_and_state_survives_restart() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("state/rate.json");
        let limiter = FileRateLimiter::new(path.clone(), 1, Duration::from_secs(900));
        limiter.record_failure("ip").await.expect("record");

        let reopened = FileRateLimiter::new(path.clone(), 1, Duration::from_secs(900));
        assert!(reopened.locked("ip").await.expect("check"));
        reopened.clear("ip").await.expect("clear");
        assert!(!limiter.locked("ip").await.expect("check"));
    }

    #[tokio::test]
    async fn expired_attempts_do_not_count() {
        let temp = tempdir().expect("tempdir");
        let limiter = FileRateLimiter::new(temp.path().join("rate.json"), 1, Duration::ZERO);
        limiter.record_failure("ip").await.expect("record");
        assert!(!limiter.locked("ip").await.expect("check"));
    }

    #[tokio::test]
    async fn corrupt_state_is_treated_as_empty() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("rate.json");
        fs::write(&path, b"{not json").await.expect("write");
        let limiter = FileRateLimiter::new(path, 2, Duration::from_secs(60));
        assert!(!limiter.locked("ip").await.expect("check"));
        limiter.record_failure("ip").await.expect("record");
    }

    #[tokio::test]
    async fn zero_max_attempts_disables_limiting() {
        let temp = tempdir().expect("tempdir");
        let limiter = FileRateLimiter::new(temp.path().join("rate.json"), 0, Duration::from_secs(60));
        limiter.record_failure("ip").await.expect("record");
        assert!(!limiter.locked("ip").await.expect("check"));
        assert!(fs::metadata(temp.path().join("rate.json")).await.is_err());
    }
}
