//! 权限检查
//!
//! 修改模块的操作需要调用者是宿主所有者或管理员。配置文件中的管理员固定不变，
//! 运行时添加的管理员写入数据目录下的 `admins.json`，重启后依然有效。

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::core::config::HostConfig;
use crate::module::registry::write_json_atomic;
use crate::utils::{CoreError, Result};

/// 权限检查接口
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// 调用者是否可以修改模块
    fn is_admin(&self, actor: &str) -> bool;

    /// 添加管理员，列表不可修改或已存在时返回 false
    async fn add_admin(&self, _actor: &str) -> Result<bool> {
        Ok(false)
    }

    /// 移除管理员，列表不可修改或不存在时返回 false
    async fn remove_admin(&self, _actor: &str) -> Result<bool> {
        Ok(false)
    }

    /// 当前管理员列表
    fn admins(&self) -> Vec<String> {
        Vec::new()
    }
}

/// 磁盘快照格式
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    admins: BTreeSet<String>,
}

/// 所有者 + 配置中的管理员 + 运行时维护的管理员
///
/// `path` 为空时运行时的修改只保存在内存中。
#[derive(Debug)]
pub struct FileAuthorizer {
    principal: String,
    configured: BTreeSet<String>,
    added: RwLock<BTreeSet<String>>,
    path: Option<PathBuf>,
    /// 串行化修改与落盘
    write_lock: Mutex<()>,
}

impl FileAuthorizer {
    pub fn in_memory<I, S>(principal: impl Into<String>, admins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            principal: principal.into(),
            configured: admins.into_iter().map(Into::into).collect(),
            added: RwLock::new(BTreeSet::new()),
            path: None,
            write_lock: Mutex::new(()),
        }
    }

    /// 读取配置中的管理员与 `paths.admins_file()` 中的持久化列表
    ///
    /// # Errors
    ///
    /// 管理员文件存在但无法读取或解析
    pub async fn open(config: &HostConfig) -> Result<Self> {
        let path = config.paths.admins_file();
        let added = match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let snapshot: Snapshot = serde_json::from_str(&content).map_err(|e| {
                    CoreError::ConfigLoadFailed(format!(
                        "解析管理员列表 {} 失败: {}",
                        path.display(),
                        e
                    ))
                })?;
                snapshot.admins
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeSet::new(),
            Err(e) => {
                return Err(CoreError::ConfigLoadFailed(format!(
                    "读取管理员列表 {} 失败: {}",
                    path.display(),
                    e
                )))
            }
        };

        debug!(path = %path.display(), count = added.len(), "管理员列表已加载");
        let mut auth = Self::in_memory(config.principal.clone(), config.admins.iter().cloned());
        auth.added = RwLock::new(added);
        auth.path = Some(path);
        Ok(auth)
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn added(&self) -> std::sync::RwLockReadGuard<'_, BTreeSet<String>> {
        self.added.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// 应用修改并落盘，写入失败时恢复内存状态
    async fn update(&self, change: impl FnOnce(&mut BTreeSet<String>) -> bool) -> Result<bool> {
        let _writer = self.write_lock.lock().await;

        let previous = self.added().clone();
        let mut next = previous.clone();
        if !change(&mut next) {
            return Ok(false);
        }
        *self.added.write().unwrap_or_else(PoisonError::into_inner) = next.clone();

        if let Some(ref path) = self.path {
            let snapshot = Snapshot { admins: next };
            if let Err(e) = write_json_atomic(path, &snapshot).await {
                *self.added.write().unwrap_or_else(PoisonError::into_inner) = previous;
                return Err(CoreError::Io(e));
            }
        }
        Ok(true)
    }
}

#[async_trait]
impl Authorizer for FileAuthorizer {
    fn is_admin(&self, actor: &str) -> bool {
        actor == self.principal || self.configured.contains(actor) || self.added().contains(actor)
    }

    /// 添加管理员，已是所有者或管理员时返回 false
    async fn add_admin(&self, actor: &str) -> Result<bool> {
        if actor == self.principal || self.configured.contains(actor) {
            return Ok(false);
        }
        self.update(|admins| admins.insert(actor.to_string())).await
    }

    /// 移除运行时添加的管理员，所有者与配置中的管理员不可移除
    async fn remove_admin(&self, actor: &str) -> Result<bool> {
        self.update(|admins| admins.remove(actor)).await
    }

    /// 当前管理员列表（不含所有者）
    fn admins(&self) -> Vec<String> {
        let added = self.added();
        self.configured.union(&added).cloned().collect()
    }
}
