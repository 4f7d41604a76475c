//! 命令分发表
//!
//! 管理命令名到模块处理器的映射。模块在注册阶段通过 [`CommandRegistrar`]
//! 暂存命令，加载成功后才整体提交；卸载时按模块整体移除。

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::module::metadata::Origin;
use crate::module::runtime::join_fault;
use crate::utils::{CoreError, Result};

/// 命令调用请求
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    /// 命令名
    pub command: String,
    /// 调用者标识
    pub actor: String,
    /// 参数
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandRequest {
    pub fn new(command: impl Into<String>, actor: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            actor: actor.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// 命令回复
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandReply {
    /// 回复文本
    pub text: String,
}

impl CommandReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// 命令处理器
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, request: CommandRequest) -> anyhow::Result<CommandReply>;
}

/// 闭包处理器
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> CommandHandler for FnHandler<F>
where
    F: Fn(CommandRequest) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<CommandReply>> + Send,
{
    async fn handle(&self, request: CommandRequest) -> anyhow::Result<CommandReply> {
        (self.0)(request).await
    }
}

/// 用异步闭包创建处理器
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn CommandHandler>
where
    F: Fn(CommandRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<CommandReply>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// 暂存的命令集合
pub type StagedCommands = BTreeMap<String, Arc<dyn CommandHandler>>;

/// 单次加载的命令登记器
///
/// 模块注册入口通过它登记命令。登记只写入暂存区，不会影响正在服务的分发表。
#[derive(Clone, Default)]
pub struct CommandRegistrar {
    staged: Arc<StdMutex<StagedCommands>>,
}

impl CommandRegistrar {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记命令，同名命令以最后一次为准
    pub fn register(&self, command: impl Into<String>, handler: Arc<dyn CommandHandler>) {
        self.staged
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(command.into(), handler);
    }

    /// 已登记的命令名
    pub fn commands(&self) -> Vec<String> {
        self.staged
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// 取出全部暂存命令
    pub fn take(&self) -> StagedCommands {
        std::mem::take(&mut *self.staged.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// 分发表条目
#[derive(Clone)]
pub struct CommandEntry {
    /// 所属模块
    pub module: String,
    /// 所属模块来源
    pub origin: Origin,
    handler: Arc<dyn CommandHandler>,
}

/// 命令分发表
#[derive(Default)]
pub struct CommandTable {
    entries: RwLock<HashMap<String, CommandEntry>>,
}

impl CommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 命令当前的所属模块
    pub async fn owner(&self, command: &str) -> Option<(String, Origin)> {
        self.entries
            .read()
            .await
            .get(command)
            .map(|e| (e.module.clone(), e.origin))
    }

    /// 检查命令是否都可由 `module` 使用
    ///
    /// # Errors
    ///
    /// 任一命令已被其他模块占用时返回 `CommandConflict`
    pub async fn check_available<'a, I>(&self, module: &str, commands: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let entries = self.entries.read().await;
        Self::check_locked(&entries, module, commands)
    }

    fn check_locked<'a, I>(
        entries: &HashMap<String, CommandEntry>,
        module: &str,
        commands: I,
    ) -> Result<()>
    where
        I: IntoIterator<Item = &'a String>,
    {
        for command in commands {
            if let Some(entry) = entries.get(command) {
                if entry.module != module {
                    return Err(CoreError::CommandConflict {
                        command: command.clone(),
                        owner: entry.module.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// 提交模块的命令
    ///
    /// 先移除该模块旧的命令，再整体写入新命令。检查与写入在同一把写锁内完成。
    pub async fn commit(&self, module: &str, origin: Origin, staged: StagedCommands) -> Result<()> {
        let mut entries = self.entries.write().await;
        Self::check_locked(&entries, module, staged.keys())?;

        entries.retain(|_, e| e.module != module);
        for (command, handler) in staged {
            entries.insert(
                command,
                CommandEntry {
                    module: module.to_string(),
                    origin,
                    handler,
                },
            );
        }
        debug!(module = %module, "命令已提交到分发表");
        Ok(())
    }

    /// 移除模块的全部命令，返回移除数量
    pub async fn remove_module(&self, module: &str) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.module != module);
        before - entries.len()
    }

    /// 模块当前提供的命令（排序）
    pub async fn commands_of(&self, module: &str) -> Vec<String> {
        let mut commands: Vec<String> = self
            .entries
            .read()
            .await
            .iter()
            .filter(|(_, e)| e.module == module)
            .map(|(c, _)| c.clone())
            .collect();
        commands.sort();
        commands
    }

    /// 分发命令
    ///
    /// 处理器在独立任务中运行，panic 或返回错误都被转换为 `ExecutionFault`。
    pub async fn dispatch(&self, request: CommandRequest) -> Result<CommandReply> {
        let entry = self
            .entries
            .read()
            .await
            .get(&request.command)
            .cloned()
            .ok_or_else(|| CoreError::CommandNotFound(request.command.clone()))?;

        let command = request.command.clone();
        let handler = entry.handler.clone();
        match tokio::spawn(async move { handler.handle(request).await }).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => {
                warn!(module = %entry.module, command = %command, error = %e, "命令执行失败");
                Err(CoreError::execution_fault(
                    &entry.module,
                    format!("命令 '{}' 执行失败: {}", command, e),
                    Some(format!("{:?}", e)),
                ))
            }
            Err(join_error) => {
                warn!(module = %entry.module, command = %command, "命令处理器崩溃");
                Err(join_fault(&entry.module, "执行命令", join_error))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo() -> Arc<dyn CommandHandler> {
        handler_fn(|req: CommandRequest| async move { Ok(CommandReply::text(req.args.join(" "))) })
    }

    fn staged(commands: &[&str]) -> StagedCommands {
        commands.iter().map(|c| (c.to_string(), echo())).collect()
    }

    #[tokio::test]
    async fn test_registrar_stages_commands() {
        let registrar = CommandRegistrar::new();
        registrar.register("echo", echo());
        registrar.register("say", echo());
        assert_eq!(registrar.commands(), vec!["echo", "say"]);

        let taken = registrar.take();
        assert_eq!(taken.len(), 2);
        assert!(registrar.commands().is_empty());
    }

    #[tokio::test]
    async fn test_commit_and_dispatch() {
        let table = CommandTable::new();
        table.commit("echo", Origin::User, staged(&["echo"])).await.unwrap();

        let reply = table
            .dispatch(CommandRequest::new("echo", "42").with_args(["hello", "world"]))
            .await
            .unwrap();
        assert_eq!(reply.text, "hello world");
        assert_eq!(table.owner("echo").await, Some(("echo".to_string(), Origin::User)));
    }

    #[tokio::test]
    async fn test_conflict_with_other_module() {
        let table = CommandTable::new();
        table.commit("a", Origin::User, staged(&["ping"])).await.unwrap();

        let err = table.commit("b", Origin::User, staged(&["ping"])).await.unwrap_err();
        assert!(matches!(err, CoreError::CommandConflict { ref owner, .. } if owner == "a"));

        // 同一模块重新提交不冲突，并替换旧命令
        table.commit("a", Origin::User, staged(&["pong"])).await.unwrap();
        assert_eq!(table.commands_of("a").await, vec!["pong"]);
    }

    #[tokio::test]
    async fn test_remove_module() {
        let table = CommandTable::new();
        table.commit("a", Origin::User, staged(&["x", "y"])).await.unwrap();
        assert_eq!(table.remove_module("a").await, 2);
        assert_eq!(table.remove_module("a").await, 0);

        let err = table.dispatch(CommandRequest::new("x", "1")).await.unwrap_err();
        assert!(matches!(err, CoreError::CommandNotFound(_)));
    }

    #[tokio::test]
    async fn test_handler_error_and_panic_are_contained() {
        let table = CommandTable::new();
        let mut commands = StagedCommands::new();
        commands.insert(
            "fail".to_string(),
            handler_fn(|_| async { Err::<CommandReply, _>(anyhow::anyhow!("weather api down")) }),
        );
        commands.insert(
            "boom".to_string(),
            handler_fn(|req: CommandRequest| async move {
                if req.command == "boom" {
                    panic!("handler exploded");
                }
                Ok(CommandReply::text("unreachable"))
            }),
        );
        table.commit("bad", Origin::User, commands).await.unwrap();

        let err = table.dispatch(CommandRequest::new("fail", "1")).await.unwrap_err();
        assert_eq!(err.kind(), "ExecutionFault");
        assert!(err.to_string().contains("weather api down"));

        let err = table.dispatch(CommandRequest::new("boom", "1")).await.unwrap_err();
        assert_eq!(err.kind(), "ExecutionFault");
    }
}
