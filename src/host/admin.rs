//! 模块管理入口
//!
//! 面向操作者的管理操作：加载、覆盖确认、卸载、重载、删除、管理员维护与帮助。
//! 修改模块的操作都要求调用者通过权限检查；用户模块的命令在
//! `public_user_modules` 关闭时同样只对管理员开放。

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::auth::{Authorizer, FileAuthorizer};
use super::dispatch::{CommandReply, CommandRequest};
use crate::module::artifact::ArtifactSource;
use crate::module::lifecycle::{LifecycleManager, LoadOutcome};
use crate::module::metadata::{ModuleDescriptor, Origin};
use crate::utils::{CoreError, Result};

/// 模块管理入口
pub struct ModuleAdmin {
    manager: Arc<LifecycleManager>,
    auth: Arc<dyn Authorizer>,
}

impl ModuleAdmin {
    pub fn new(manager: Arc<LifecycleManager>, auth: Arc<dyn Authorizer>) -> Self {
        Self { manager, auth }
    }

    /// 使用配置中的所有者、管理员以及数据目录中持久化的管理员列表
    ///
    /// # Errors
    ///
    /// 管理员文件存在但无法读取或解析
    pub async fn open(manager: Arc<LifecycleManager>) -> Result<Self> {
        let auth = Arc::new(FileAuthorizer::open(manager.config()).await?);
        Ok(Self::new(manager, auth))
    }

    pub fn manager(&self) -> &Arc<LifecycleManager> {
        &self.manager
    }

    pub fn authorizer(&self) -> &Arc<dyn Authorizer> {
        &self.auth
    }

    fn require_admin(&self, actor: &str, action: &str) -> Result<()> {
        if self.auth.is_admin(actor) {
            return Ok(());
        }
        warn!(actor = %actor, action = %action, "非管理员尝试修改模块");
        Err(CoreError::PermissionDenied(format!(
            "'{}' 无权执行 {}",
            actor, action
        )))
    }

    // ==================== 生命周期操作 ====================

    /// 从本地路径或 http(s) 地址加载用户模块
    pub async fn load(
        &self,
        actor: &str,
        location: &str,
        cancel: &CancellationToken,
    ) -> Result<LoadOutcome> {
        self.require_admin(actor, "load")?;
        let source = ArtifactSource::parse(location);
        self.manager.load(&source, Origin::User, cancel).await
    }

    /// 确认覆盖提案
    pub async fn confirm(
        &self,
        actor: &str,
        token: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<ModuleDescriptor>> {
        self.require_admin(actor, "confirm")?;
        self.manager.confirm(token, cancel).await
    }

    /// 取消覆盖提案
    pub fn cancel(&self, actor: &str, token: &str) -> Result<bool> {
        self.require_admin(actor, "cancel")?;
        Ok(self.manager.cancel(token))
    }

    pub async fn unload(&self, actor: &str, name: &str) -> Result<bool> {
        self.require_admin(actor, "unload")?;
        Ok(self.manager.unload(name).await)
    }

    pub async fn reload(
        &self,
        actor: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        self.require_admin(actor, "reload")?;
        self.manager.reload(name, cancel).await
    }

    pub async fn delete(&self, actor: &str, name: &str) -> Result<bool> {
        self.require_admin(actor, "delete")?;
        self.manager.delete(name).await
    }

    /// 读取模块制品内容
    ///
    /// # Errors
    ///
    /// 没有注册表记录或制品不在本地时返回 `ModuleNotFound`
    pub async fn artifact_bytes(&self, actor: &str, name: &str) -> Result<Vec<u8>> {
        self.require_admin(actor, "get")?;
        let path = self
            .manager
            .artifact_path(name)
            .await?
            .ok_or_else(|| CoreError::ModuleNotFound(name.to_string()))?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| CoreError::ArtifactNotFound {
                source_location: path.to_string_lossy().into_owned(),
                reason: e.to_string(),
            })
    }

    // ==================== 管理员维护 ====================

    pub async fn add_admin(&self, actor: &str, target: &str) -> Result<bool> {
        self.require_admin(actor, "add_admin")?;
        let added = self.auth.add_admin(target).await?;
        if added {
            info!(actor = %actor, target = %target, "已添加管理员");
        }
        Ok(added)
    }

    pub async fn remove_admin(&self, actor: &str, target: &str) -> Result<bool> {
        self.require_admin(actor, "remove_admin")?;
        let removed = self.auth.remove_admin(target).await?;
        if removed {
            info!(actor = %actor, target = %target, "已移除管理员");
        }
        Ok(removed)
    }

    // ==================== 命令与帮助 ====================

    /// 分发命令
    ///
    /// 用户模块的命令在未公开时只允许管理员调用。
    pub async fn dispatch(&self, request: CommandRequest) -> Result<CommandReply> {
        let commands = self.manager.services().commands();
        let Some((module, origin)) = commands.owner(&request.command).await else {
            return Err(CoreError::CommandNotFound(request.command));
        };

        if origin == Origin::User
            && !self.manager.config().public_user_modules
            && !self.auth.is_admin(&request.actor)
        {
            warn!(
                actor = %request.actor,
                module = %module,
                command = %request.command,
                "用户模块未公开"
            );
            return Err(CoreError::PermissionDenied(format!(
                "命令 '{}' 仅对管理员开放",
                request.command
            )));
        }

        commands.dispatch(request).await
    }

    /// 帮助文本：系统模块在前，用户模块在后
    pub async fn help(&self) -> String {
        let localization = self.manager.services().localization();
        let label = |key: &str, default: &str| {
            localization
                .strings()
                .get(key)
                .cloned()
                .unwrap_or_else(|| default.to_string())
        };

        let mut out = String::new();
        let sections = [
            (label("help.system", "系统模块"), self.manager.system_modules().await),
            (label("help.user", "用户模块"), self.manager.user_modules().await),
        ];
        for (title, modules) in sections {
            if modules.is_empty() {
                continue;
            }
            out.push_str(&format!("== {} ==\n", title));
            for module in modules {
                if module.description.is_empty() {
                    out.push_str(&format!("[{}]\n", module.name));
                } else {
                    out.push_str(&format!("[{}] {}\n", module.name, module.description));
                }
                for (command, help) in &module.commands {
                    out.push_str(&format!("  /{} - {}\n", command, help));
                }
            }
        }

        if out.is_empty() {
            out = label("help.empty", "当前没有已加载的模块");
        }
        out
    }
}
