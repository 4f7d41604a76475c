//! 原生执行上下文
//!
//! 宿主在启动时登记一组编译进来的模块入口，清单的 `entry` 字段按标识选择其中之一。
//! 入口在独立的 tokio 任务中运行，panic 只会让这一次加载失败。
//! 注册超时或被取消时任务随之中止。

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, warn};

use super::{join_fault, ExecutionContext, ModuleRuntime};
use crate::host::services::ModuleHost;
use crate::module::artifact::{ArtifactManifest, RuntimeKind};
use crate::module::metadata::ModuleDescriptor;
use crate::utils::{CoreError, Result};

/// 原生模块入口
#[async_trait]
pub trait ModuleEntrypoint: Send + Sync {
    /// 注册入口：登记命令并返回描述符
    async fn register(&self, host: ModuleHost) -> anyhow::Result<ModuleDescriptor>;

    /// 卸载时调用
    async fn shutdown(&self) {}
}

/// 闭包入口
pub struct FnEntrypoint<F>(F);

#[async_trait]
impl<F, Fut> ModuleEntrypoint for FnEntrypoint<F>
where
    F: Fn(ModuleHost) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<ModuleDescriptor>> + Send,
{
    async fn register(&self, host: ModuleHost) -> anyhow::Result<ModuleDescriptor> {
        (self.0)(host).await
    }
}

/// 用异步闭包创建入口
pub fn entrypoint_fn<F, Fut>(f: F) -> Arc<dyn ModuleEntrypoint>
where
    F: Fn(ModuleHost) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<ModuleDescriptor>> + Send + 'static,
{
    Arc::new(FnEntrypoint(f))
}

/// 原生执行上下文工厂
#[derive(Default)]
pub struct NativeRuntime {
    entrypoints: RwLock<HashMap<String, Arc<dyn ModuleEntrypoint>>>,
}

impl NativeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记入口（构建器形式）
    pub fn with_entrypoint(
        self,
        id: impl Into<String>,
        entrypoint: Arc<dyn ModuleEntrypoint>,
    ) -> Self {
        self.add_entrypoint(id, entrypoint);
        self
    }

    /// 登记入口，同名入口被替换
    pub fn add_entrypoint(&self, id: impl Into<String>, entrypoint: Arc<dyn ModuleEntrypoint>) {
        let id = id.into();
        debug!(entry = %id, "登记原生模块入口");
        self.entrypoints
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, entrypoint);
    }

    /// 已登记的入口标识
    pub fn entrypoints(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .entrypoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl ModuleRuntime for NativeRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Native
    }

    async fn instantiate(
        &self,
        module: &str,
        manifest: &ArtifactManifest,
        _base_dir: &Path,
    ) -> Result<Box<dyn ExecutionContext>> {
        let entrypoint = self
            .entrypoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&manifest.entry)
            .cloned()
            .ok_or_else(|| {
                CoreError::invalid_schema(module, format!("原生入口 '{}' 不存在", manifest.entry))
            })?;

        Ok(Box::new(NativeContext {
            module: module.to_string(),
            entrypoint,
        }))
    }
}

struct NativeContext {
    module: String,
    entrypoint: Arc<dyn ModuleEntrypoint>,
}

#[async_trait]
impl ExecutionContext for NativeContext {
    async fn register(&self, host: ModuleHost) -> Result<ModuleDescriptor> {
        let entrypoint = self.entrypoint.clone();
        let task = AbortOnDropHandle::new(tokio::spawn(async move {
            entrypoint.register(host).await
        }));
        match task.await {
            Ok(Ok(descriptor)) => Ok(descriptor),
            Ok(Err(e)) => Err(CoreError::execution_fault(
                &self.module,
                format!("注册入口返回错误: {}", e),
                Some(format!("{:?}", e)),
            )),
            Err(join_error) => Err(join_fault(&self.module, "注册", join_error)),
        }
    }

    async fn shutdown(&self) {
        let entrypoint = self.entrypoint.clone();
        if let Err(join_error) = tokio::spawn(async move { entrypoint.shutdown().await }).await {
            warn!(module = %self.module, error = %join_error, "模块关闭钩子崩溃");
        }
    }

    fn runtime(&self) -> RuntimeKind {
        RuntimeKind::Native
    }
}
