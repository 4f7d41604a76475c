//! 错误日志
//!
//! 加载失败的只追加记录，供运维和外部工具查阅。宿主内部从不读取。
//! 写入失败只会以 WARN 日志体现，不会影响调用方。

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::metadata::LoadFailure;
use crate::utils::Result;

/// 错误日志接口
#[async_trait]
pub trait ErrorSink: Send + Sync {
    /// 追加一条失败记录
    async fn log(&self, failure: LoadFailure);
}

/// NDJSON 文件错误日志
///
/// 每行一个 JSON 对象，只追加不修改。
pub struct NdjsonErrorSink {
    path: PathBuf,
    // 保证多个并发加载的记录不会交错写入同一行
    write_lock: Mutex<()>,
}

impl NdjsonErrorSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        debug!(path = %path.display(), "错误日志已就绪");
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, failure: &LoadFailure) -> Result<()> {
        let mut line = serde_json::to_string(failure)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// 读取全部记录（运维工具使用），无法解析的行被跳过
    pub async fn read_all(&self) -> Result<Vec<LoadFailure>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}

#[async_trait]
impl ErrorSink for NdjsonErrorSink {
    async fn log(&self, failure: LoadFailure) {
        if let Err(e) = self.append(&failure).await {
            warn!(
                path = %self.path.display(),
                module = ?failure.module_name,
                error = %e,
                "写入错误日志失败"
            );
        }
    }
}

/// 内存错误日志，用于测试
#[derive(Default)]
pub struct MemoryErrorSink {
    entries: StdMutex<Vec<LoadFailure>>,
}

impl MemoryErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// 已记录的条目快照
    pub fn entries(&self) -> Vec<LoadFailure> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ErrorSink for MemoryErrorSink {
    async fn log(&self, failure: LoadFailure) {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(failure);
    }
}
