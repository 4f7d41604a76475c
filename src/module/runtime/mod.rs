//! 执行上下文
//!
//! 每个已加载模块对应一个执行上下文：
//!
//! - `native`：宿主进程内编译进来的入口，在独立任务中运行，panic 被隔离
//! - `process`：独立子进程，经标准输入输出以逐行 JSON 通信
//!
//! 清单中的 `runtime` 字段决定使用哪一种。

pub mod native;
pub mod process;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use super::artifact::{ArtifactManifest, RuntimeKind};
use super::metadata::ModuleDescriptor;
use crate::host::services::ModuleHost;
use crate::utils::{CoreError, Result};

pub use native::{entrypoint_fn, ModuleEntrypoint, NativeRuntime};
pub use process::ProcessRuntime;

/// 模块执行上下文
#[async_trait]
pub trait ExecutionContext: Send + Sync {
    /// 调用模块注册入口
    ///
    /// 模块代码的任何故障都以 `ExecutionFault` 返回，不会向上传播 panic。
    async fn register(&self, host: ModuleHost) -> Result<ModuleDescriptor>;

    /// 释放执行上下文，可重复调用
    async fn shutdown(&self);

    /// 上下文类型
    fn runtime(&self) -> RuntimeKind;
}

/// 执行上下文工厂
#[async_trait]
pub trait ModuleRuntime: Send + Sync {
    /// 支持的上下文类型
    fn kind(&self) -> RuntimeKind;

    /// 为清单创建执行上下文
    ///
    /// `base_dir` 为清单所在目录，相对路径以它为基准。
    async fn instantiate(
        &self,
        module: &str,
        manifest: &ArtifactManifest,
        base_dir: &Path,
    ) -> Result<Box<dyn ExecutionContext>>;
}

/// 已启用的执行上下文工厂集合
#[derive(Clone, Default)]
pub struct RuntimeSet {
    runtimes: HashMap<RuntimeKind, Arc<dyn ModuleRuntime>>,
}

impl RuntimeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加工厂，同类型的旧工厂被替换
    pub fn with(mut self, runtime: Arc<dyn ModuleRuntime>) -> Self {
        self.runtimes.insert(runtime.kind(), runtime);
        self
    }

    /// 获取工厂
    ///
    /// 宿主未启用该类型时返回 `InvalidModuleSchema`。
    pub fn get(&self, module: &str, kind: RuntimeKind) -> Result<Arc<dyn ModuleRuntime>> {
        self.runtimes.get(&kind).cloned().ok_or_else(|| {
            CoreError::invalid_schema(module, format!("宿主未启用 {} 执行上下文", kind))
        })
    }
}

/// 从 panic 负载中取出可读消息
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "未知 panic".to_string()
    }
}

/// 把任务的 JoinError 转换为模块执行故障
pub(crate) fn join_fault(module: &str, stage: &str, error: tokio::task::JoinError) -> CoreError {
    if error.is_panic() {
        let payload = error.into_panic();
        let message = panic_message(payload.as_ref());
        CoreError::execution_fault(
            module,
            format!("{}时发生 panic: {}", stage, message),
            Some(message),
        )
    } else {
        CoreError::execution_fault(module, format!("{}任务被取消", stage), None)
    }
}
