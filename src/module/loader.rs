//! 模块加载器
//!
//! 把制品解析成可调用的已加载模块，或者移除一个已加载模块的全部绑定。
//! 加载过程中任何一步失败，目录、注册表和分发表都保持原样。

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::artifact::{materialize, ArtifactFetcher, ArtifactManifest, ArtifactSource};
use super::catalog::{LoadedModule, ModuleCatalog};
use super::error_sink::ErrorSink;
use super::metadata::{LoadFailure, ModuleDescriptor, Origin};
use super::provisioner::DependencyProvisioner;
use super::registry::ModuleRegistry;
use super::runtime::{ExecutionContext, RuntimeSet};
use crate::host::dispatch::StagedCommands;
use crate::host::services::HostServices;
use crate::utils::logger::ALERT_TARGET;
use crate::utils::{CoreError, Result};

/// 在取消令牌触发时放弃等待
pub(crate) async fn cancellable<T, F>(cancel: &CancellationToken, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        result = future => result,
        _ = cancel.cancelled() => Err(CoreError::Cancelled),
    }
}

/// 模块加载器
pub struct ModuleLoader {
    runtimes: RuntimeSet,
    fetcher: Arc<dyn ArtifactFetcher>,
    provisioner: Arc<DependencyProvisioner>,
    services: Arc<HostServices>,
    registry: Arc<dyn ModuleRegistry>,
    catalog: Arc<ModuleCatalog>,
    sink: Arc<dyn ErrorSink>,
    /// 远程系统模块落地目录
    system_dir: PathBuf,
    /// 远程用户模块落地目录
    user_dir: PathBuf,
    register_timeout: Duration,
}

impl ModuleLoader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        runtimes: RuntimeSet,
        fetcher: Arc<dyn ArtifactFetcher>,
        provisioner: Arc<DependencyProvisioner>,
        services: Arc<HostServices>,
        registry: Arc<dyn ModuleRegistry>,
        catalog: Arc<ModuleCatalog>,
        sink: Arc<dyn ErrorSink>,
        system_dir: PathBuf,
        user_dir: PathBuf,
        register_timeout: Duration,
    ) -> Self {
        Self {
            runtimes,
            fetcher,
            provisioner,
            services,
            registry,
            catalog,
            sink,
            system_dir,
            user_dir,
            register_timeout,
        }
    }

    /// 远程制品按来源落地到各自的模块目录
    fn download_dir(&self, origin: Origin) -> &Path {
        match origin {
            Origin::System => &self.system_dir,
            Origin::User => &self.user_dir,
        }
    }

    /// 加载模块
    ///
    /// # 加载流程
    /// 1. 系统模块保护检查
    /// 2. 获取并解析制品清单
    /// 3. 创建执行上下文，调用注册入口
    /// 4. 校验描述符与登记的命令
    /// 5. 安装依赖
    /// 6. 提交命令、写注册表、放入目录
    ///
    /// 调用方负责同名互斥与冲突判断。失败会写入错误日志，注册表错误额外告警。
    pub async fn load(
        &self,
        name: &str,
        source: &ArtifactSource,
        origin: Origin,
        cancel: &CancellationToken,
    ) -> Result<ModuleDescriptor> {
        info!(module = %name, source = %source, origin = %origin, "开始加载模块");
        match self.try_load(name, source, origin, cancel).await {
            Ok(descriptor) => {
                info!(
                    module = %name,
                    commands = descriptor.commands.len(),
                    "模块加载完成"
                );
                Ok(descriptor)
            }
            Err(e) => {
                self.report(Some(name), &e).await;
                Err(e)
            }
        }
    }

    /// 记录失败
    ///
    /// 加载类错误写入错误日志；注册表错误以告警级别输出。
    pub async fn report(&self, name: Option<&str>, error: &CoreError) {
        if error.requires_alert() {
            error!(
                target: ALERT_TARGET,
                module = ?name,
                error_code = error.error_code(),
                error = %error,
                "注册表与目录可能已不一致"
            );
        } else {
            warn!(
                module = ?name,
                error_code = error.error_code(),
                error = %error,
                "模块操作失败"
            );
        }

        if error.is_load_failure() {
            self.sink.log(LoadFailure::from_error(name, error)).await;
        }
    }

    /// 系统模块不能被用户来源覆盖
    pub async fn check_protection(&self, name: &str, origin: Origin) -> Result<()> {
        if origin.is_system() {
            return Ok(());
        }
        match self.registry.get(name).await? {
            Some(record) if record.origin.is_system() => {
                Err(CoreError::ProtectedModule(name.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn try_load(
        &self,
        name: &str,
        source: &ArtifactSource,
        origin: Origin,
        cancel: &CancellationToken,
    ) -> Result<ModuleDescriptor> {
        self.check_protection(name, origin).await?;

        let content = cancellable(cancel, self.fetcher.fetch(source)).await?;
        let manifest = ArtifactManifest::parse(name, &content)?;
        debug!(
            module = %name,
            runtime = %manifest.runtime,
            entry = %manifest.entry,
            "清单解析完成"
        );

        let base_dir = match source {
            ArtifactSource::Local(path) => path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
            ArtifactSource::Remote(_) => self.download_dir(origin).to_path_buf(),
        };

        let runtime = self.runtimes.get(name, manifest.runtime)?;
        let context = runtime.instantiate(name, &manifest, &base_dir).await?;

        let activated = self
            .activate(name, source, origin, &content, context.as_ref(), cancel)
            .await;
        match activated {
            Ok((descriptor, location)) => {
                let replaced = self
                    .catalog
                    .insert(LoadedModule::new(descriptor.clone(), location, context))
                    .await;
                if let Some(old) = replaced {
                    // 调用方已先卸载，这里只是兜底释放
                    warn!(module = %name, "目录中残留旧条目，已释放");
                    old.shutdown().await;
                }
                Ok(descriptor)
            }
            Err(e) => {
                context.shutdown().await;
                Err(e)
            }
        }
    }

    /// 注册、校验、安装依赖并写入注册表，返回描述符与记录的制品位置
    async fn activate(
        &self,
        name: &str,
        source: &ArtifactSource,
        origin: Origin,
        content: &[u8],
        context: &dyn ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<(ModuleDescriptor, String)> {
        let host = self.services.scoped(name);
        let registrar = host.commands().clone();

        let registration = async {
            tokio::time::timeout(self.register_timeout, context.register(host))
                .await
                .map_err(|_| {
                    CoreError::Timeout(format!(
                        "模块 '{}' 注册超过 {} 毫秒",
                        name,
                        self.register_timeout.as_millis()
                    ))
                })?
        };
        let mut descriptor = cancellable(cancel, registration).await?;
        descriptor.validate(name)?;
        descriptor.origin = origin;

        let staged = registrar.take();
        check_commands(name, &descriptor, &staged)?;

        let commands = self.services.commands();
        commands.check_available(name, staged.keys()).await?;

        if !descriptor.dependencies.is_empty() {
            info!(module = %name, count = descriptor.dependencies.len(), "安装模块依赖");
            self.provisioner
                .install(&descriptor.dependencies, cancel)
                .await?;
        }

        let location = match source {
            ArtifactSource::Local(_) => source.location(),
            ArtifactSource::Remote(url) => {
                materialize(self.download_dir(origin), name, content)
                    .await
                    .map_err(|e| CoreError::ArtifactNotFound {
                        source_location: url.clone(),
                        reason: format!("落地失败: {}", e),
                    })?
                    .to_string_lossy()
                    .into_owned()
            }
        };

        // 命令先于注册表提交，检查与写入在分发表锁内一次完成
        commands.commit(name, origin, staged).await?;

        if let Err(e) = self.registry.upsert(name, &location, origin).await {
            commands.remove_module(name).await;
            return Err(e);
        }

        Ok((descriptor, location))
    }

    /// 卸载模块
    ///
    /// 移除目录条目与命令绑定并释放执行上下文，不修改注册表。
    /// 模块不在目录中时返回 false。
    pub async fn unload(&self, name: &str) -> bool {
        let Some(module) = self.catalog.remove(name).await else {
            debug!(module = %name, "模块未加载，无需卸载");
            return false;
        };

        let removed = self.services.commands().remove_module(name).await;
        module.shutdown().await;
        info!(module = %name, commands = removed, "模块已卸载");
        true
    }
}

/// 描述符声明的命令必须与登记的处理器一一对应
fn check_commands(
    name: &str,
    descriptor: &ModuleDescriptor,
    staged: &StagedCommands,
) -> Result<()> {
    let missing: Vec<&str> = descriptor
        .commands
        .keys()
        .filter(|c| !staged.contains_key(*c))
        .map(String::as_str)
        .collect();
    let undeclared: Vec<&str> = staged
        .keys()
        .filter(|c| !descriptor.commands.contains_key(*c))
        .map(String::as_str)
        .collect();

    let mut errors = Vec::new();
    if !missing.is_empty() {
        errors.push(format!("命令未登记处理器: {}", missing.join(", ")));
    }
    if !undeclared.is_empty() {
        errors.push(format!("命令未在描述符中声明: {}", undeclared.join(", ")));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(CoreError::invalid_schema(name, errors.join("; ")))
    }
}
