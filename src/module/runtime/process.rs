//! 子进程执行上下文
//!
//! 模块运行在独立子进程中，宿主与它通过标准输入输出逐行交换 JSON：
//!
//! ```text
//! 宿主 -> 模块  {"type":"register","module":"weather","settings":{..},"strings":{..}}
//! 模块 -> 宿主  {"type":"descriptor","name":"weather","commands":{..},..}
//! 宿主 -> 模块  {"type":"invoke","command":"weather","actor":"42","args":["Paris"]}
//! 模块 -> 宿主  {"type":"reply","text":".."} 或 {"type":"error","message":".."}
//! 宿主 -> 模块  {"type":"shutdown"}
//! ```
//!
//! 子进程退出或输出无法解析都只会影响这个模块。命令应答超时后通道即关闭，
//! 进程被终止，迟到的应答不会被后续命令读到。

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{ExecutionContext, ModuleRuntime};
use crate::core::config::RuntimeConfig;
use crate::host::dispatch::{CommandHandler, CommandReply, CommandRequest};
use crate::host::services::ModuleHost;
use crate::module::artifact::{ArtifactManifest, RuntimeKind};
use crate::module::metadata::ModuleDescriptor;
use crate::utils::{CoreError, Result};

/// 保留的 stderr 行数
const STDERR_TAIL_LINES: usize = 20;

/// 宿主发给模块的消息
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum HostMessage<'a> {
    Register {
        module: &'a str,
        settings: &'a Value,
        strings: &'a HashMap<String, String>,
    },
    Invoke {
        command: &'a str,
        actor: &'a str,
        args: &'a [String],
    },
    Shutdown,
}

/// 模块发给宿主的消息
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ModuleMessage {
    Descriptor(ModuleDescriptor),
    Reply { text: String },
    Error { message: String },
}

/// 通道故障
enum ChannelError {
    /// 进程已退出或管道断开
    Closed(String),
    /// 输出不是合法消息
    Malformed(String),
}

struct Channel {
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl Channel {
    async fn request(
        &mut self,
        message: &HostMessage<'_>,
    ) -> std::result::Result<ModuleMessage, ChannelError> {
        self.send(message).await?;
        let line = self
            .stdout
            .next_line()
            .await
            .map_err(|e| ChannelError::Closed(e.to_string()))?
            .ok_or_else(|| ChannelError::Closed("模块进程已退出".to_string()))?;
        serde_json::from_str(&line).map_err(|e| ChannelError::Malformed(format!("{}: {}", e, line)))
    }

    async fn send(&mut self, message: &HostMessage<'_>) -> std::result::Result<(), ChannelError> {
        let mut line = serde_json::to_string(message)
            .map_err(|e| ChannelError::Malformed(e.to_string()))?;
        line.push('\n');
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ChannelError::Closed(e.to_string()))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| ChannelError::Closed(e.to_string()))
    }
}

/// 子进程 stderr 的最后若干行
#[derive(Clone, Default)]
struct StderrTail(Arc<StdMutex<VecDeque<String>>>);

impl StderrTail {
    fn push(&self, line: String) {
        let mut lines = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if lines.len() == STDERR_TAIL_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    fn snapshot(&self) -> Option<String> {
        let lines = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if lines.is_empty() {
            None
        } else {
            Some(lines.iter().cloned().collect::<Vec<_>>().join("\n"))
        }
    }
}

/// 子进程执行上下文工厂
pub struct ProcessRuntime {
    request_timeout: Duration,
    shutdown_grace: Duration,
}

impl ProcessRuntime {
    pub fn new(request_timeout: Duration, shutdown_grace: Duration) -> Self {
        Self {
            request_timeout,
            shutdown_grace,
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(
            Duration::from_millis(config.register_timeout_ms),
            Duration::from_millis(config.shutdown_grace_ms),
        )
    }
}

impl Default for ProcessRuntime {
    fn default() -> Self {
        Self::from_config(&RuntimeConfig::default())
    }
}

/// 解析程序路径：带路径分隔符的入口相对清单目录
fn resolve_program(entry: &str, base_dir: &Path) -> PathBuf {
    let path = Path::new(entry);
    if path.is_absolute() || !entry.contains(['/', '\\']) {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

#[async_trait]
impl ModuleRuntime for ProcessRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Process
    }

    async fn instantiate(
        &self,
        module: &str,
        manifest: &ArtifactManifest,
        base_dir: &Path,
    ) -> Result<Box<dyn ExecutionContext>> {
        let program = resolve_program(&manifest.entry, base_dir);
        let mut command = Command::new(&program);
        command
            .args(&manifest.args)
            .envs(&manifest.env)
            .env("MODHOST_MODULE", module)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if base_dir.is_dir() {
            command.current_dir(base_dir);
        }

        let mut child = command.spawn().map_err(|e| {
            CoreError::invalid_schema(
                module,
                format!("无法启动模块进程 '{}': {}", program.display(), e),
            )
        })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(CoreError::Internal("子进程标准输入输出不可用".to_string()));
        };

        let stderr_tail = StderrTail::default();
        if let Some(stderr) = child.stderr.take() {
            let tail = stderr_tail.clone();
            let name = module.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(module = %name, "{}", line);
                    tail.push(line);
                }
            });
        }

        info!(module = %module, pid = ?child.id(), program = %program.display(), "模块进程已启动");
        Ok(Box::new(ProcessContext {
            module: module.to_string(),
            channel: Arc::new(Mutex::new(Some(Channel {
                stdin,
                stdout: BufReader::new(stdout).lines(),
            }))),
            child: Arc::new(Mutex::new(Some(child))),
            stderr_tail,
            request_timeout: self.request_timeout,
            shutdown_grace: self.shutdown_grace,
        }))
    }
}

type SharedChannel = Arc<Mutex<Option<Channel>>>;
type SharedChild = Arc<Mutex<Option<Child>>>;

struct ProcessContext {
    module: String,
    channel: SharedChannel,
    child: SharedChild,
    stderr_tail: StderrTail,
    request_timeout: Duration,
    shutdown_grace: Duration,
}

impl ProcessContext {
    fn closed_fault(&self, reason: String) -> CoreError {
        CoreError::execution_fault(
            &self.module,
            format!("模块进程意外终止: {}", reason),
            self.stderr_tail.snapshot(),
        )
    }
}

#[async_trait]
impl ExecutionContext for ProcessContext {
    async fn register(&self, host: ModuleHost) -> Result<ModuleDescriptor> {
        let reply = {
            let mut guard = self.channel.lock().await;
            let channel = guard
                .as_mut()
                .ok_or_else(|| self.closed_fault("执行上下文已关闭".to_string()))?;
            let message = HostMessage::Register {
                module: &self.module,
                settings: host.config().settings(),
                strings: host.localization().strings(),
            };
            channel.request(&message).await
        };

        let descriptor = match reply {
            Ok(ModuleMessage::Descriptor(descriptor)) => descriptor,
            Ok(ModuleMessage::Error { message }) => {
                return Err(CoreError::execution_fault(
                    &self.module,
                    format!("注册入口返回错误: {}", message),
                    self.stderr_tail.snapshot(),
                ))
            }
            Ok(ModuleMessage::Reply { .. }) => {
                return Err(CoreError::invalid_schema(&self.module, "注册应答不是描述符"))
            }
            Err(ChannelError::Malformed(reason)) => {
                return Err(CoreError::invalid_schema(
                    &self.module,
                    format!("注册应答无法解析: {}", reason),
                ))
            }
            Err(ChannelError::Closed(reason)) => return Err(self.closed_fault(reason)),
        };

        for command in descriptor.commands.keys() {
            host.commands().register(
                command.clone(),
                Arc::new(ProxyHandler {
                    module: self.module.clone(),
                    channel: self.channel.clone(),
                    child: self.child.clone(),
                    timeout: self.request_timeout,
                }),
            );
        }

        Ok(descriptor)
    }

    async fn shutdown(&self) {
        if let Some(mut channel) = self.channel.lock().await.take() {
            // 进程可能已经退出，发送失败无需处理
            let _ = channel.send(&HostMessage::Shutdown).await;
        }

        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };
        match tokio::time::timeout(self.shutdown_grace, child.wait()).await {
            Ok(Ok(status)) => debug!(module = %self.module, %status, "模块进程已退出"),
            Ok(Err(e)) => warn!(module = %self.module, error = %e, "等待模块进程退出失败"),
            Err(_) => {
                warn!(module = %self.module, "模块进程未在宽限期内退出，强制终止");
                if let Err(e) = child.kill().await {
                    warn!(module = %self.module, error = %e, "终止模块进程失败");
                }
            }
        }
    }

    fn runtime(&self) -> RuntimeKind {
        RuntimeKind::Process
    }
}

/// 把命令转发到子进程
struct ProxyHandler {
    module: String,
    channel: SharedChannel,
    child: SharedChild,
    timeout: Duration,
}

impl ProxyHandler {
    /// 应答已不可信：终止进程，宿主侧的回收留给卸载
    async fn abandon(&self) {
        if let Some(child) = self.child.lock().await.as_mut() {
            if let Err(e) = child.start_kill() {
                warn!(module = %self.module, error = %e, "终止模块进程失败");
            }
        }
    }
}

#[async_trait]
impl CommandHandler for ProxyHandler {
    async fn handle(&self, request: CommandRequest) -> anyhow::Result<CommandReply> {
        let mut guard = self.channel.lock().await;
        let channel = guard
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("模块 '{}' 的进程通道已关闭", self.module))?;

        let message = HostMessage::Invoke {
            command: &request.command,
            actor: &request.actor,
            args: &request.args,
        };
        let reply = match tokio::time::timeout(self.timeout, channel.request(&message)).await {
            Ok(reply) => reply,
            Err(_) => {
                // 迟到的应答会错位到下一条命令，通道不能再用
                guard.take();
                drop(guard);
                warn!(
                    module = %self.module,
                    command = %request.command,
                    "模块响应超时，关闭进程通道"
                );
                self.abandon().await;
                return Err(anyhow::anyhow!("模块 '{}' 响应超时", self.module));
            }
        };

        match reply {
            Ok(ModuleMessage::Reply { text }) => Ok(CommandReply { text }),
            Ok(ModuleMessage::Error { message }) => Err(anyhow::anyhow!(message)),
            Ok(ModuleMessage::Descriptor(_)) => Err(anyhow::anyhow!("命令应答类型错误")),
            Err(ChannelError::Malformed(reason)) => {
                Err(anyhow::anyhow!("命令应答无法解析: {}", reason))
            }
            Err(ChannelError::Closed(reason)) => {
                // 通道已断开，后续调用直接失败
                guard.take();
                Err(anyhow::anyhow!("模块进程意外终止: {}", reason))
            }
        }
    }
}
