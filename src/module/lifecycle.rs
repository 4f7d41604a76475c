//! 生命周期管理器
//!
//! 外部协作方唯一的入口：加载、卸载、重载、删除、覆盖确认与查询。
//! 同一模块名上的修改操作互斥执行，不同模块名之间互不阻塞。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::artifact::{scan_manifests, ArtifactFetcher, ArtifactSource, DefaultFetcher};
use super::catalog::ModuleCatalog;
use super::conflict::{ConflictResolver, Proposal};
use super::error_sink::{ErrorSink, NdjsonErrorSink};
use super::loader::{cancellable, ModuleLoader};
use super::metadata::{ModuleDescriptor, ModuleRecord, Origin, RecordFilter};
use super::provisioner::{DependencyProvisioner, PackageInstaller};
use super::registry::{FileModuleRegistry, ModuleRegistry};
use super::runtime::{ModuleRuntime, NativeRuntime, ProcessRuntime, RuntimeSet};
use crate::core::config::HostConfig;
use crate::host::dispatch::{CommandReply, CommandRequest};
use crate::host::localization::Localization;
use crate::host::services::HostServices;
use crate::utils::Result;

/// 加载结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// 加载成功
    Loaded(ModuleDescriptor),
    /// 同名模块正在运行，等待用令牌确认覆盖
    ConflictPending(String),
}

/// 启动加载报告
#[derive(Debug, Clone, Default)]
pub struct BootReport {
    /// 加载成功的模块
    pub loaded: Vec<String>,
    /// 已在运行而跳过的模块
    pub skipped: Vec<String>,
    /// 加载失败的制品位置与原因
    pub failed: Vec<(String, String)>,
}

/// 按模块名划分的互斥锁
///
/// 锁对象在无人持有时自动回收。
#[derive(Default)]
struct NameLocks {
    locks: StdMutex<HashMap<String, Weak<Mutex<()>>>>,
}

impl NameLocks {
    async fn acquire(&self, name: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.retain(|_, weak| weak.strong_count() > 0);
            match locks.get(name).and_then(Weak::upgrade) {
                Some(lock) => lock,
                None => {
                    let lock = Arc::new(Mutex::new(()));
                    locks.insert(name.to_string(), Arc::downgrade(&lock));
                    lock
                }
            }
        };
        lock.lock_owned().await
    }
}

/// 生命周期管理器
pub struct LifecycleManager {
    config: Arc<HostConfig>,
    services: Arc<HostServices>,
    registry: Arc<dyn ModuleRegistry>,
    catalog: Arc<ModuleCatalog>,
    loader: ModuleLoader,
    conflicts: ConflictResolver,
    locks: NameLocks,
}

impl LifecycleManager {
    /// 创建构建器
    pub fn builder(config: HostConfig) -> LifecycleBuilder {
        LifecycleBuilder::new(config)
    }

    async fn lock_name(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<OwnedMutexGuard<()>> {
        cancellable(cancel, async { Ok(self.locks.acquire(name).await) }).await
    }

    // ==================== 修改操作 ====================

    /// 加载模块
    ///
    /// 同名模块正在运行时不做任何修改，返回 `ConflictPending` 令牌。
    ///
    /// # Errors
    ///
    /// 加载失败的各类错误，目录与注册表保持不变
    #[instrument(skip(self, source, cancel), fields(source = %source))]
    pub async fn load(
        &self,
        source: &ArtifactSource,
        origin: Origin,
        cancel: &CancellationToken,
    ) -> Result<LoadOutcome> {
        let name = match source.module_name() {
            Ok(name) => name,
            Err(e) => {
                self.loader.report(None, &e).await;
                return Err(e);
            }
        };

        let _guard = self.lock_name(&name, cancel).await?;

        if self.catalog.contains(&name).await {
            if let Err(e) = self.loader.check_protection(&name, origin).await {
                self.loader.report(Some(&name), &e).await;
                return Err(e);
            }
            let token = self.conflicts.propose(&name, source.clone(), origin);
            return Ok(LoadOutcome::ConflictPending(token));
        }

        let descriptor = self.loader.load(&name, source, origin, cancel).await?;
        Ok(LoadOutcome::Loaded(descriptor))
    }

    /// 确认覆盖提案：卸载旧模块后加载新制品
    ///
    /// 令牌不存在或已被处理时返回 `Ok(None)`。
    #[instrument(skip(self, cancel))]
    pub async fn confirm(
        &self,
        token: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<ModuleDescriptor>> {
        let Some(proposal) = self.conflicts.peek(token) else {
            debug!(token = %token, "提案不存在或已处理");
            return Ok(None);
        };

        let _guard = self.lock_name(&proposal.name, cancel).await?;
        // 等锁期间可能已被其他调用处理
        let Some(proposal) = self.conflicts.take(token) else {
            return Ok(None);
        };

        if let Err(e) = self
            .loader
            .check_protection(&proposal.name, proposal.origin)
            .await
        {
            self.loader.report(Some(&proposal.name), &e).await;
            return Err(e);
        }

        info!(module = %proposal.name, source = %proposal.source, "确认覆盖模块");
        self.loader.unload(&proposal.name).await;
        let descriptor = self
            .loader
            .load(&proposal.name, &proposal.source, proposal.origin, cancel)
            .await?;
        Ok(Some(descriptor))
    }

    /// 取消覆盖提案，没有副作用
    pub fn cancel(&self, token: &str) -> bool {
        self.conflicts.cancel(token)
    }

    /// 卸载模块，不修改注册表
    ///
    /// 模块未加载时返回 false。
    #[instrument(skip(self))]
    pub async fn unload(&self, name: &str) -> bool {
        let _guard = self.locks.acquire(name).await;
        self.loader.unload(name).await
    }

    /// 按注册表记录重新加载模块
    ///
    /// 没有记录时返回 `Ok(false)`。先卸载再加载，加载失败时模块保持卸载状态。
    #[instrument(skip(self, cancel))]
    pub async fn reload(&self, name: &str, cancel: &CancellationToken) -> Result<bool> {
        let _guard = self.lock_name(name, cancel).await?;

        let record = match self.registry.get(name).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!(module = %name, "注册表中没有记录，无法重载");
                return Ok(false);
            }
            Err(e) => {
                self.loader.report(Some(name), &e).await;
                return Err(e);
            }
        };

        self.loader.unload(name).await;
        let source = ArtifactSource::parse(&record.source_location);
        self.loader
            .load(name, &source, record.origin, cancel)
            .await?;
        Ok(true)
    }

    /// 删除用户模块：卸载、删除注册表记录并移除制品文件
    ///
    /// 记录不存在或为系统模块时返回 `Ok(false)`，不做任何修改。
    /// 只删除位于用户模块目录内的制品文件。
    #[instrument(skip(self))]
    pub async fn delete(&self, name: &str) -> Result<bool> {
        let _guard = self.locks.acquire(name).await;

        let record = match self.registry.get(name).await {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(false),
            Err(e) => {
                self.loader.report(Some(name), &e).await;
                return Err(e);
            }
        };
        if record.origin.is_system() {
            info!(module = %name, "系统模块不可删除");
            return Ok(false);
        }

        self.loader.unload(name).await;
        match self.registry.delete(name).await {
            Ok(true) => {}
            Ok(false) => return Ok(false),
            Err(e) => {
                self.loader.report(Some(name), &e).await;
                return Err(e);
            }
        }

        self.remove_artifact(name, Path::new(&record.source_location))
            .await;
        info!(module = %name, "模块已删除");
        Ok(true)
    }

    async fn remove_artifact(&self, name: &str, path: &Path) {
        if !path.starts_with(&self.config.paths.user_modules) {
            debug!(module = %name, path = %path.display(), "制品不在用户模块目录，保留文件");
            return;
        }
        match tokio::fs::remove_file(path).await {
            Ok(()) => debug!(module = %name, path = %path.display(), "制品文件已删除"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(module = %name, path = %path.display(), error = %e, "删除制品文件失败"),
        }
    }

    /// 启动时加载模块
    ///
    /// 依次加载系统模块目录、用户模块目录中的清单，再恢复注册表中仍处于激活状态
    /// 但尚未加载的记录。单个模块失败只记录并跳过。
    #[instrument(skip(self, cancel))]
    pub async fn boot(&self, cancel: &CancellationToken) -> BootReport {
        let mut report = BootReport::default();

        let dirs = [
            (self.config.paths.system_modules.clone(), Origin::System),
            (self.config.paths.user_modules.clone(), Origin::User),
        ];
        for (dir, origin) in dirs {
            let manifests = match scan_manifests(&dir).await {
                Ok(manifests) => manifests,
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "扫描模块目录失败");
                    continue;
                }
            };
            for path in manifests {
                if cancel.is_cancelled() {
                    return report;
                }
                self.boot_one(ArtifactSource::Local(path), origin, cancel, &mut report)
                    .await;
            }
        }

        match self.registry.list(RecordFilter::all().active()).await {
            Ok(records) => {
                for record in records {
                    if cancel.is_cancelled() {
                        return report;
                    }
                    let source = ArtifactSource::parse(&record.source_location);
                    self.boot_one(source, record.origin, cancel, &mut report)
                        .await;
                }
            }
            Err(e) => self.loader.report(None, &e).await,
        }

        info!(
            loaded = report.loaded.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "启动加载完成"
        );
        report
    }

    async fn boot_one(
        &self,
        source: ArtifactSource,
        origin: Origin,
        cancel: &CancellationToken,
        report: &mut BootReport,
    ) {
        let location = source.location();
        let name = match source.module_name() {
            Ok(name) => name,
            Err(e) => {
                self.loader.report(None, &e).await;
                report.failed.push((location, e.to_string()));
                return;
            }
        };

        let _guard = match self.lock_name(&name, cancel).await {
            Ok(guard) => guard,
            Err(e) => {
                report.failed.push((location, e.to_string()));
                return;
            }
        };
        if self.catalog.contains(&name).await {
            report.skipped.push(name);
            return;
        }

        match self.loader.load(&name, &source, origin, cancel).await {
            Ok(_) => report.loaded.push(name),
            Err(e) => report.failed.push((location, e.to_string())),
        }
    }

    /// 卸载全部模块（宿主退出时调用）
    pub async fn shutdown(&self) {
        for name in self.catalog.names().await {
            self.unload(&name).await;
        }
        info!("全部模块已卸载");
    }

    // ==================== 查询 ====================

    /// 已加载模块的描述符
    pub async fn descriptor(&self, name: &str) -> Option<ModuleDescriptor> {
        self.catalog.descriptor(name).await
    }

    /// 已加载模块（可按来源过滤）
    pub async fn modules(&self, origin: Option<Origin>) -> Vec<ModuleDescriptor> {
        self.catalog.descriptors(origin).await
    }

    pub async fn system_modules(&self) -> Vec<ModuleDescriptor> {
        self.modules(Some(Origin::System)).await
    }

    pub async fn user_modules(&self) -> Vec<ModuleDescriptor> {
        self.modules(Some(Origin::User)).await
    }

    /// 注册表记录
    pub async fn record(&self, name: &str) -> Result<Option<ModuleRecord>> {
        self.registry.get(name).await
    }

    /// 注册表记录列表
    pub async fn records(&self, filter: RecordFilter) -> Result<Vec<ModuleRecord>> {
        self.registry.list(filter).await
    }

    /// 待确认的覆盖提案
    pub fn pending_proposals(&self) -> Vec<Proposal> {
        self.conflicts.pending()
    }

    /// 模块制品的本地路径
    pub async fn artifact_path(&self, name: &str) -> Result<Option<PathBuf>> {
        Ok(self
            .registry
            .get(name)
            .await?
            .map(|r| ArtifactSource::parse(&r.source_location))
            .and_then(|source| match source {
                ArtifactSource::Local(path) => Some(path),
                ArtifactSource::Remote(_) => None,
            }))
    }

    /// 分发命令
    pub async fn dispatch(&self, request: CommandRequest) -> Result<CommandReply> {
        self.services.commands().dispatch(request).await
    }

    /// 宿主服务
    pub fn services(&self) -> &Arc<HostServices> {
        &self.services
    }

    /// 宿主配置
    pub fn config(&self) -> &HostConfig {
        &self.config
    }
}

/// 生命周期管理器构建器
///
/// 未显式提供的组件按配置创建：JSON 文件注册表、NDJSON 错误日志、
/// 外部命令安装器以及本地文件与 HTTP 获取器。
pub struct LifecycleBuilder {
    config: HostConfig,
    runtimes: Vec<Arc<dyn ModuleRuntime>>,
    registry: Option<Arc<dyn ModuleRegistry>>,
    sink: Option<Arc<dyn ErrorSink>>,
    fetcher: Option<Arc<dyn ArtifactFetcher>>,
    installer: Option<Arc<dyn PackageInstaller>>,
    localization: Option<Localization>,
}

impl LifecycleBuilder {
    pub fn new(config: HostConfig) -> Self {
        Self {
            config,
            runtimes: Vec::new(),
            registry: None,
            sink: None,
            fetcher: None,
            installer: None,
            localization: None,
        }
    }

    /// 添加执行上下文工厂，替换同类型的默认工厂
    pub fn runtime(mut self, runtime: Arc<dyn ModuleRuntime>) -> Self {
        self.runtimes.push(runtime);
        self
    }

    /// 使用指定的原生入口表
    pub fn native(self, native: NativeRuntime) -> Self {
        self.runtime(Arc::new(native))
    }

    pub fn registry(mut self, registry: Arc<dyn ModuleRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn ArtifactFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn installer(mut self, installer: Arc<dyn PackageInstaller>) -> Self {
        self.installer = Some(installer);
        self
    }

    pub fn localization(mut self, localization: Localization) -> Self {
        self.localization = Some(localization);
        self
    }

    /// 构建生命周期管理器
    ///
    /// # Errors
    ///
    /// 注册表无法打开、本地化文件无法读取或安装器配置无效
    pub async fn build(self) -> Result<LifecycleManager> {
        let config = Arc::new(self.config);

        let mut runtimes = RuntimeSet::new()
            .with(Arc::new(NativeRuntime::new()))
            .with(Arc::new(ProcessRuntime::from_config(&config.runtime)));
        for runtime in self.runtimes {
            runtimes = runtimes.with(runtime);
        }

        let registry: Arc<dyn ModuleRegistry> = match self.registry {
            Some(registry) => registry,
            None => Arc::new(FileModuleRegistry::open(config.paths.registry_file()).await?),
        };

        let sink: Arc<dyn ErrorSink> = match self.sink {
            Some(sink) => sink,
            None => Arc::new(NdjsonErrorSink::new(config.paths.error_log_file())),
        };

        let fetcher: Arc<dyn ArtifactFetcher> = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(DefaultFetcher::new(Duration::from_secs(
                config.fetch.timeout_secs,
            ))?),
        };

        let provisioner = match self.installer {
            Some(installer) => {
                let provisioner = DependencyProvisioner::new(
                    installer,
                    Duration::from_secs(config.provisioning.timeout_secs),
                );
                if config.provisioning.serialize {
                    provisioner.serialized()
                } else {
                    provisioner
                }
            }
            None => DependencyProvisioner::from_config(&config.provisioning)?,
        };

        let localization = match (self.localization, &config.localization.file) {
            (Some(localization), _) => localization,
            (None, Some(path)) => Localization::from_file(path).await?,
            (None, None) => Localization::default(),
        };

        let services = Arc::new(HostServices::new(config.clone(), localization));
        let catalog = Arc::new(ModuleCatalog::new());
        let loader = ModuleLoader::new(
            runtimes,
            fetcher,
            Arc::new(provisioner),
            services.clone(),
            registry.clone(),
            catalog.clone(),
            sink,
            config.paths.system_modules.clone(),
            config.paths.user_modules.clone(),
            Duration::from_millis(config.runtime.register_timeout_ms),
        );

        info!(
            system_modules = %config.paths.system_modules.display(),
            user_modules = %config.paths.user_modules.display(),
            "生命周期管理器已创建"
        );
        Ok(LifecycleManager {
            config,
            services,
            registry,
            catalog,
            loader,
            conflicts: ConflictResolver::new(),
            locks: NameLocks::default(),
        })
    }
}
