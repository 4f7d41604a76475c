//! 模块注册表
//!
//! 模块元数据的持久化存储，宿主重启后依然存在。默认实现把整张 `modules`
//! 表以 JSON 快照的形式写入数据目录，每次修改后先写临时文件再原子替换。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::module::metadata::{ModuleRecord, Origin, RecordFilter};
use crate::utils::{CoreError, Result};

/// 注册表接口
///
/// 所有存储失败都以 `CoreError::Registry` 返回，调用方不得吞掉。
#[async_trait]
pub trait ModuleRegistry: Send + Sync {
    /// 创建或更新记录
    ///
    /// 记录已存在时覆盖制品位置、置为激活并推进 `updated_at`。
    /// 系统来源不会被降级为用户来源。
    async fn upsert(&self, name: &str, source_location: &str, origin: Origin)
        -> Result<ModuleRecord>;

    /// 获取记录
    async fn get(&self, name: &str) -> Result<Option<ModuleRecord>>;

    /// 删除用户模块记录
    ///
    /// 记录不存在或为系统模块时返回 `false`，不做任何修改。
    async fn delete(&self, name: &str) -> Result<bool>;

    /// 按条件列出记录（按名称排序）
    async fn list(&self, filter: RecordFilter) -> Result<Vec<ModuleRecord>>;
}

/// 磁盘快照格式
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    modules: Vec<ModuleRecord>,
}

/// 基于 JSON 文件的注册表
///
/// `path` 为空时只保存在内存中（测试使用）。
#[derive(Debug)]
pub struct FileModuleRegistry {
    records: RwLock<BTreeMap<String, ModuleRecord>>,
    path: Option<PathBuf>,
}

impl FileModuleRegistry {
    /// 打开注册表文件，文件不存在时从空表开始
    ///
    /// # Errors
    ///
    /// 文件存在但无法读取或解析时返回 `Registry`
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let records = match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let snapshot: Snapshot = serde_json::from_str(&content).map_err(|e| {
                    CoreError::Registry(format!("解析注册表 {} 失败: {}", path.display(), e))
                })?;
                snapshot
                    .modules
                    .into_iter()
                    .map(|r| (r.name.clone(), r))
                    .collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(CoreError::Registry(format!(
                    "读取注册表 {} 失败: {}",
                    path.display(),
                    e
                )))
            }
        };

        tracing::debug!(path = %path.display(), count = records.len(), "注册表已打开");
        Ok(Self {
            records: RwLock::new(records),
            path: Some(path),
        })
    }

    /// 创建纯内存注册表
    pub fn in_memory() -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
            path: None,
        }
    }

    /// 注册表文件路径
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    async fn persist(&self, records: &BTreeMap<String, ModuleRecord>) -> Result<()> {
        let Some(ref path) = self.path else {
            return Ok(());
        };
        let snapshot = Snapshot {
            modules: records.values().cloned().collect(),
        };
        write_json_atomic(path, &snapshot)
            .await
            .map_err(|e| CoreError::Registry(format!("写入注册表 {} 失败: {}", path.display(), e)))
    }
}

/// 先写临时文件再原子替换，读者只会看到完整的旧快照或新快照
pub(crate) async fn write_json_atomic<T: Serialize>(
    path: &Path,
    value: &T,
) -> std::io::Result<()> {
    let content = serde_json::to_vec_pretty(value)?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, content).await?;
    tokio::fs::rename(&tmp, path).await
}

/// 时间戳单调推进，避免同一时钟刻度内的两次更新无法区分
fn next_timestamp(previous: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    if now > previous {
        now
    } else {
        previous + Duration::microseconds(1)
    }
}

#[async_trait]
impl ModuleRegistry for FileModuleRegistry {
    async fn upsert(
        &self,
        name: &str,
        source_location: &str,
        origin: Origin,
    ) -> Result<ModuleRecord> {
        let mut records = self.records.write().await;
        let previous = records.get(name).cloned();

        let record = match previous {
            Some(ref existing) => ModuleRecord {
                source_location: source_location.to_string(),
                origin: if origin.is_system() {
                    Origin::System
                } else {
                    existing.origin
                },
                is_active: true,
                updated_at: next_timestamp(existing.updated_at),
                ..existing.clone()
            },
            None => {
                let now = Utc::now();
                ModuleRecord {
                    name: name.to_string(),
                    source_location: source_location.to_string(),
                    origin,
                    is_active: true,
                    created_at: now,
                    updated_at: now,
                }
            }
        };
        records.insert(name.to_string(), record.clone());

        if let Err(e) = self.persist(&records).await {
            // 回滚内存状态，保持与磁盘一致
            match previous {
                Some(existing) => records.insert(name.to_string(), existing),
                None => records.remove(name),
            };
            return Err(e);
        }

        tracing::debug!(module = %name, origin = %record.origin, "注册表记录已更新");
        Ok(record)
    }

    async fn get(&self, name: &str) -> Result<Option<ModuleRecord>> {
        Ok(self.records.read().await.get(name).cloned())
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        let mut records = self.records.write().await;
        let Some(existing) = records.get(name) else {
            return Ok(false);
        };
        if existing.origin.is_system() {
            tracing::debug!(module = %name, "系统模块记录不可删除");
            return Ok(false);
        }

        let removed = records.remove(name);
        if let Err(e) = self.persist(&records).await {
            if let Some(record) = removed {
                records.insert(name.to_string(), record);
            }
            return Err(e);
        }

        tracing::debug!(module = %name, "注册表记录已删除");
        Ok(true)
    }

    async fn list(&self, filter: RecordFilter) -> Result<Vec<ModuleRecord>> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect())
    }
}
