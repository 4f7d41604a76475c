//! # 生命周期集成测试
//!
//! 通过原生入口模拟各种模块，覆盖：
//! - 加载 → 同名冲突 → 确认覆盖 → 删除的完整流程
//! - 失败加载不留痕迹（描述符无效、panic、依赖安装失败、注册表故障）
//! - 卸载、重载、系统模块保护与启动恢复

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use modhost::module::error_sink::{MemoryErrorSink, NdjsonErrorSink};
use modhost::module::{ArtifactFetcher, PackageInstaller};
use modhost::{
    entrypoint_fn, handler_fn, ArtifactSource, CommandReply, CommandRequest, CoreError,
    FileModuleRegistry, HostConfig, HostConfigBuilder, LifecycleManager, LoadOutcome,
    ModuleDescriptor, ModuleRecord, ModuleRegistry, NativeRuntime, Origin, RecordFilter,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

// ============================================================================
// 测试辅助
// ============================================================================

/// 记录安装顺序，声明中包含 "broken" 的依赖安装失败
#[derive(Default)]
struct FakeInstaller {
    installed: StdMutex<Vec<String>>,
}

impl FakeInstaller {
    fn installed(&self) -> Vec<String> {
        self.installed.lock().unwrap().clone()
    }
}

#[async_trait]
impl PackageInstaller for FakeInstaller {
    async fn install(&self, spec: &str) -> Result<(), String> {
        self.installed.lock().unwrap().push(spec.to_string());
        if spec.contains("broken") {
            Err(format!("ERROR: No matching distribution found for {}", spec))
        } else {
            Ok(())
        }
    }
}

/// 写入失败的注册表
struct FailingRegistry;

#[async_trait]
impl ModuleRegistry for FailingRegistry {
    async fn upsert(&self, _: &str, _: &str, _: Origin) -> modhost::Result<ModuleRecord> {
        Err(CoreError::Registry("磁盘已满".to_string()))
    }

    async fn get(&self, _: &str) -> modhost::Result<Option<ModuleRecord>> {
        Ok(None)
    }

    async fn delete(&self, _: &str) -> modhost::Result<bool> {
        Ok(false)
    }

    async fn list(&self, _: RecordFilter) -> modhost::Result<Vec<ModuleRecord>> {
        Ok(Vec::new())
    }
}

/// 远程地址从内存表读取，本地路径照常读文件
#[derive(Default)]
struct StubFetcher {
    remote: StdMutex<HashMap<String, Vec<u8>>>,
}

impl StubFetcher {
    fn serve(&self, url: &str, entry: &str) -> ArtifactSource {
        self.remote.lock().unwrap().insert(
            url.to_string(),
            format!("runtime: native\nentry: {}\n", entry).into_bytes(),
        );
        ArtifactSource::Remote(url.to_string())
    }
}

#[async_trait]
impl ArtifactFetcher for StubFetcher {
    async fn fetch(&self, source: &ArtifactSource) -> modhost::Result<Vec<u8>> {
        let not_found = |reason: String| CoreError::ArtifactNotFound {
            source_location: source.location(),
            reason,
        };
        match source {
            ArtifactSource::Local(path) => tokio::fs::read(path)
                .await
                .map_err(|e| not_found(e.to_string())),
            ArtifactSource::Remote(url) => self
                .remote
                .lock()
                .unwrap()
                .get(url)
                .cloned()
                .ok_or_else(|| not_found("HTTP 404".to_string())),
        }
    }
}

/// 测试用原生入口
fn natives() -> NativeRuntime {
    NativeRuntime::new()
        .with_entrypoint(
            "greeter",
            entrypoint_fn(|host| async move {
                host.commands().register(
                    "hello",
                    handler_fn(|req: CommandRequest| async move {
                        Ok(CommandReply::text(format!("hello {}", req.args.join(" "))))
                    }),
                );
                Ok(ModuleDescriptor::new(host.name()).with_command("hello", "打招呼"))
            }),
        )
        .with_entrypoint(
            "greeter_v2",
            entrypoint_fn(|host| async move {
                host.commands().register(
                    "hello",
                    handler_fn(|_| async { Ok(CommandReply::text("hi from v2")) }),
                );
                Ok(ModuleDescriptor::new(host.name()).with_command("hello", "打招呼 v2"))
            }),
        )
        .with_entrypoint(
            "wrong_name",
            entrypoint_fn(|_host| async move { Ok(ModuleDescriptor::new("someone_else")) }),
        )
        .with_entrypoint(
            "bad_command",
            entrypoint_fn(|host| async move {
                host.commands().register(
                    "Bad-Cmd",
                    handler_fn(|_| async { Ok(CommandReply::text("x")) }),
                );
                Ok(ModuleDescriptor::new(host.name()).with_command("Bad-Cmd", "非法命令名"))
            }),
        )
        .with_entrypoint(
            "panics",
            entrypoint_fn(|host| async move {
                if host.name() != "" {
                    panic!("注册时崩溃");
                }
                Ok(ModuleDescriptor::new(host.name()))
            }),
        )
        .with_entrypoint(
            "stalls",
            entrypoint_fn(|host| async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(ModuleDescriptor::new(host.name()))
            }),
        )
        .with_entrypoint(
            "needs_deps",
            entrypoint_fn(|host| async move {
                let deps: Vec<String> = host.config().get("deps").unwrap_or_default();
                let mut descriptor = ModuleDescriptor::new(host.name());
                for dep in deps {
                    descriptor = descriptor.with_dependency(dep);
                }
                Ok(descriptor)
            }),
        )
        .with_entrypoint(
            "crashy",
            entrypoint_fn(|host| async move {
                host.commands().register(
                    "crash",
                    handler_fn(|req: CommandRequest| async move {
                        if req.args.is_empty() {
                            panic!("命令处理器崩溃");
                        }
                        Ok(CommandReply::text("ok"))
                    }),
                );
                Ok(ModuleDescriptor::new(host.name()).with_command("crash", "会崩溃的命令"))
            }),
        )
}

struct Harness {
    dir: TempDir,
    manager: LifecycleManager,
    sink: Arc<MemoryErrorSink>,
    installer: Arc<FakeInstaller>,
    fetcher: Arc<StubFetcher>,
}

impl Harness {
    async fn new() -> Self {
        Self::with(|builder| builder, Arc::new(FileModuleRegistry::in_memory())).await
    }

    async fn with(
        configure: impl FnOnce(HostConfigBuilder) -> HostConfigBuilder,
        registry: Arc<dyn ModuleRegistry>,
    ) -> Self {
        let dir = TempDir::new().unwrap();
        let config = configure(base_config(dir.path())).build();
        let sink = Arc::new(MemoryErrorSink::new());
        let installer = Arc::new(FakeInstaller::default());
        let fetcher = Arc::new(StubFetcher::default());

        let manager = LifecycleManager::builder(config)
            .native(natives())
            .registry(registry)
            .error_sink(sink.clone())
            .installer(installer.clone())
            .fetcher(fetcher.clone())
            .build()
            .await
            .unwrap();

        Self {
            dir,
            manager,
            sink,
            installer,
            fetcher,
        }
    }

    fn path(&self, relative: &str) -> PathBuf {
        self.dir.path().join(relative)
    }

    /// 在 `relative` 位置写入指向原生入口 `entry` 的清单
    async fn manifest(&self, relative: &str, entry: &str) -> ArtifactSource {
        write_manifest(&self.path(relative), entry).await
    }

    async fn load(&self, source: &ArtifactSource) -> modhost::Result<LoadOutcome> {
        self.manager
            .load(source, Origin::User, &CancellationToken::new())
            .await
    }

    async fn call(&self, command: &str) -> modhost::Result<String> {
        self.manager
            .dispatch(CommandRequest::new(command, "tester").with_args(["world"]))
            .await
            .map(|reply| reply.text)
    }
}

fn base_config(root: &Path) -> HostConfigBuilder {
    HostConfig::builder()
        .principal("owner")
        .system_modules(root.join("system"))
        .user_modules(root.join("user"))
        .data_dir(root.join("data"))
}

async fn write_manifest(path: &Path, entry: &str) -> ArtifactSource {
    tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
    tokio::fs::write(path, format!("runtime: native\nentry: {}\n", entry))
        .await
        .unwrap();
    ArtifactSource::Local(path.to_path_buf())
}

// ============================================================================
// 正常流程
// ============================================================================

/// 加载 → 冲突 → 确认覆盖 → 删除
#[tokio::test]
async fn test_load_conflict_confirm_and_delete() {
    let h = Harness::new().await;
    let a = h.manifest("user/a/foo.yaml", "greeter").await;
    let b = h.manifest("user/b/foo.yaml", "greeter_v2").await;

    let outcome = h.load(&a).await.unwrap();
    assert!(matches!(outcome, LoadOutcome::Loaded(ref d) if d.name == "foo"));
    let first = h.manager.record("foo").await.unwrap().unwrap();
    assert_eq!(first.source_location, a.location());
    assert_eq!(first.origin, Origin::User);
    assert!(first.is_active);
    assert_eq!(h.call("hello").await.unwrap(), "hello world");

    tokio::time::sleep(Duration::from_millis(5)).await;

    // 同名加载只生成提案，不改变任何状态
    let token = match h.load(&b).await.unwrap() {
        LoadOutcome::ConflictPending(token) => token,
        other => panic!("应当等待确认，实际为 {:?}", other),
    };
    assert_eq!(h.manager.record("foo").await.unwrap().unwrap(), first);
    assert_eq!(h.call("hello").await.unwrap(), "hello world");
    assert_eq!(h.manager.pending_proposals().len(), 1);

    let descriptor = h
        .manager
        .confirm(&token, &CancellationToken::new())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(descriptor.commands["hello"], "打招呼 v2");

    let second = h.manager.record("foo").await.unwrap().unwrap();
    assert_eq!(second.source_location, b.location());
    assert_eq!(second.created_at, first.created_at);
    assert!(second.updated_at > first.updated_at);
    assert_eq!(h.call("hello").await.unwrap(), "hi from v2");

    // 令牌只能使用一次
    assert!(h
        .manager
        .confirm(&token, &CancellationToken::new())
        .await
        .unwrap()
        .is_none());

    assert!(h.manager.delete("foo").await.unwrap());
    assert!(h.manager.record("foo").await.unwrap().is_none());
    assert!(h.manager.descriptor("foo").await.is_none());
    assert!(!h.path("user/b/foo.yaml").exists());
    assert!(matches!(h.call("hello").await, Err(CoreError::CommandNotFound(_))));

    assert!(!h.manager.delete("foo").await.unwrap());
}

#[tokio::test]
async fn test_cancel_proposal_has_no_effect() {
    let h = Harness::new().await;
    let a = h.manifest("user/a/foo.yaml", "greeter").await;
    let b = h.manifest("user/b/foo.yaml", "greeter_v2").await;
    h.load(&a).await.unwrap();
    let before = h.manager.record("foo").await.unwrap();
    let descriptor = h.manager.descriptor("foo").await;

    let LoadOutcome::ConflictPending(token) = h.load(&b).await.unwrap() else {
        panic!("应当等待确认");
    };
    assert!(h.manager.cancel(&token));
    assert!(!h.manager.cancel(&token));

    assert_eq!(h.manager.record("foo").await.unwrap(), before);
    assert_eq!(h.manager.descriptor("foo").await, descriptor);
    assert!(h
        .manager
        .confirm(&token, &CancellationToken::new())
        .await
        .unwrap()
        .is_none());
    assert!(h.manager.pending_proposals().is_empty());
}

#[tokio::test]
async fn test_unload_twice_keeps_record() {
    let h = Harness::new().await;
    let a = h.manifest("user/foo.yaml", "greeter").await;
    h.load(&a).await.unwrap();

    assert!(h.manager.unload("foo").await);
    assert!(!h.manager.unload("foo").await);

    assert!(h.manager.descriptor("foo").await.is_none());
    assert!(matches!(h.call("hello").await, Err(CoreError::CommandNotFound(_))));
    // 卸载不修改注册表
    assert!(h.manager.record("foo").await.unwrap().is_some());
}

#[tokio::test]
async fn test_reload_bumps_updated_at() {
    let h = Harness::new().await;
    let a = h.manifest("user/foo.yaml", "greeter").await;
    h.load(&a).await.unwrap();
    let before = h.manager.record("foo").await.unwrap().unwrap();

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert!(h.manager.reload("foo", &CancellationToken::new()).await.unwrap());

    let after = h.manager.record("foo").await.unwrap().unwrap();
    assert!(after.updated_at > before.updated_at);
    assert_eq!(h.call("hello").await.unwrap(), "hello world");

    assert!(!h
        .manager
        .reload("unknown", &CancellationToken::new())
        .await
        .unwrap());
}

#[tokio::test]
async fn test_distinct_names_load_concurrently() {
    let h = Arc::new(Harness::new().await);
    let mut sources = Vec::new();
    for i in 0..5 {
        sources.push(
            h.manifest(&format!("user/mod_{}.yaml", i), "needs_deps")
                .await,
        );
    }

    let tasks: Vec<_> = sources
        .into_iter()
        .map(|source| {
            let h = h.clone();
            tokio::spawn(async move { h.load(&source).await })
        })
        .collect();
    for task in tasks {
        assert!(matches!(task.await.unwrap(), Ok(LoadOutcome::Loaded(_))));
    }

    assert_eq!(h.manager.user_modules().await.len(), 5);
    let records = h.manager.records(RecordFilter::all()).await.unwrap();
    assert_eq!(records.len(), 5);
}

// ============================================================================
// 失败加载
// ============================================================================

#[tokio::test]
async fn test_invalid_descriptor_leaves_no_trace() {
    let h = Harness::new().await;

    for (file, entry) in [("user/broken.yaml", "wrong_name"), ("user/badcmd.yaml", "bad_command")] {
        let source = h.manifest(file, entry).await;
        let err = h.load(&source).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidModuleSchema { .. }), "{}", err);
    }

    assert!(h.manager.modules(None).await.is_empty());
    assert!(h.manager.records(RecordFilter::all()).await.unwrap().is_empty());

    let entries = h.sink.entries();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].module_name.as_deref(), Some("broken"));
    assert_eq!(entries[0].error_type, "InvalidModuleSchema");
    assert_eq!(entries[1].module_name.as_deref(), Some("badcmd"));
}

#[tokio::test]
async fn test_missing_artifact() {
    let h = Harness::new().await;
    let source = ArtifactSource::Local(h.path("user/nowhere.yaml"));

    let err = h.load(&source).await.unwrap_err();
    assert!(matches!(err, CoreError::ArtifactNotFound { .. }));
    assert_eq!(h.sink.entries()[0].error_type, "ArtifactNotFound");
}

#[tokio::test]
async fn test_unknown_native_entry() {
    let h = Harness::new().await;
    let source = h.manifest("user/ghost.yaml", "no_such_entry").await;

    let err = h.load(&source).await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidModuleSchema { .. }));
}

#[tokio::test]
async fn test_register_panic_is_contained() {
    let h = Harness::new().await;
    let bad = h.manifest("user/boom.yaml", "panics").await;
    let good = h.manifest("user/fine.yaml", "greeter").await;

    let err = h.load(&bad).await.unwrap_err();
    match err {
        CoreError::ExecutionFault { ref message, .. } => assert!(message.contains("注册时崩溃")),
        other => panic!("应当是执行故障，实际为 {:?}", other),
    }
    assert!(h.manager.descriptor("boom").await.is_none());
    assert!(h.manager.record("boom").await.unwrap().is_none());
    assert_eq!(h.sink.entries()[0].error_type, "ExecutionFault");

    // 宿主继续正常工作
    assert!(matches!(h.load(&good).await, Ok(LoadOutcome::Loaded(_))));
}

#[tokio::test]
async fn test_register_timeout() {
    let h = Harness::with(
        |b| b.register_timeout_ms(50),
        Arc::new(FileModuleRegistry::in_memory()),
    )
    .await;
    let source = h.manifest("user/slow.yaml", "stalls").await;

    let err = h.load(&source).await.unwrap_err();
    assert!(matches!(err, CoreError::Timeout(_)));
    assert!(h.manager.descriptor("slow").await.is_none());
    assert_eq!(h.sink.entries()[0].error_type, "Timeout");
}

#[tokio::test]
async fn test_cancelled_load_changes_nothing() {
    let h = Harness::new().await;
    let source = h.manifest("user/slow.yaml", "stalls").await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let err = h
        .manager
        .load(&source, Origin::User, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Cancelled));
    assert!(h.manager.descriptor("slow").await.is_none());
    assert!(h.manager.record("slow").await.unwrap().is_none());
}

#[tokio::test]
async fn test_command_panic_is_contained() {
    let h = Harness::new().await;
    let source = h.manifest("user/crashy.yaml", "crashy").await;
    h.load(&source).await.unwrap();

    let err = h
        .manager
        .dispatch(CommandRequest::new("crash", "tester"))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::ExecutionFault { .. }));

    // 模块仍然可用
    assert!(h.manager.descriptor("crashy").await.is_some());
    assert_eq!(h.call("crash").await.unwrap(), "ok");
}

#[tokio::test]
async fn test_command_conflict_between_modules() {
    let h = Harness::new().await;
    let first = h.manifest("user/first.yaml", "greeter").await;
    let second = h.manifest("user/second.yaml", "greeter").await;
    h.load(&first).await.unwrap();

    let err = h.load(&second).await.unwrap_err();
    assert!(matches!(err, CoreError::CommandConflict { ref owner, .. } if owner == "first"));
    assert!(h.manager.record("second").await.unwrap().is_none());
    assert_eq!(h.call("hello").await.unwrap(), "hello world");
}

// ============================================================================
// 依赖安装
// ============================================================================

#[tokio::test]
async fn test_dependencies_installed_in_order() {
    let h = Harness::with(
        |b| {
            b.module_settings(
                "weather",
                serde_json::json!({ "deps": ["requests==2.31", "pyyaml"] }),
            )
        },
        Arc::new(FileModuleRegistry::in_memory()),
    )
    .await;
    let source = h.manifest("user/weather.yaml", "needs_deps").await;

    let LoadOutcome::Loaded(descriptor) = h.load(&source).await.unwrap() else {
        panic!("应当加载成功");
    };
    assert_eq!(descriptor.dependencies, vec!["requests==2.31", "pyyaml"]);
    assert_eq!(h.installer.installed(), vec!["requests==2.31", "pyyaml"]);
}

#[tokio::test]
async fn test_provisioning_failure_stops_at_first_error() {
    let h = Harness::with(
        |b| {
            b.module_settings(
                "weather",
                serde_json::json!({ "deps": ["requests==2.31", "broken-pkg", "never-tried"] }),
            )
        },
        Arc::new(FileModuleRegistry::in_memory()),
    )
    .await;
    let source = h.manifest("user/weather.yaml", "needs_deps").await;

    let err = h.load(&source).await.unwrap_err();
    match err {
        CoreError::ProvisionError { ref spec, ref diagnostic } => {
            assert_eq!(spec, "broken-pkg");
            assert!(diagnostic.contains("No matching distribution"));
        }
        other => panic!("应当是依赖安装失败，实际为 {:?}", other),
    }
    assert_eq!(h.installer.installed(), vec!["requests==2.31", "broken-pkg"]);

    assert!(h.manager.descriptor("weather").await.is_none());
    assert!(h.manager.record("weather").await.unwrap().is_none());
    let entries = h.sink.entries();
    assert_eq!(entries[0].error_type, "ProvisionError");
    assert!(entries[0].traceback.as_deref().unwrap().contains("broken-pkg"));
}

// ============================================================================
// 重载失败、系统模块与注册表故障
// ============================================================================

#[tokio::test]
async fn test_failed_reload_leaves_module_unloaded() {
    let h = Harness::new().await;
    let source = h.manifest("user/foo.yaml", "greeter").await;
    h.load(&source).await.unwrap();

    // 制品被替换成会崩溃的版本
    h.manifest("user/foo.yaml", "panics").await;
    let err = h
        .manager
        .reload("foo", &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::ExecutionFault { .. }));

    assert!(h.manager.descriptor("foo").await.is_none());
    assert!(matches!(h.call("hello").await, Err(CoreError::CommandNotFound(_))));
    assert!(h.manager.record("foo").await.unwrap().is_some());
}

#[tokio::test]
async fn test_system_module_is_protected() {
    let h = Harness::new().await;
    h.manifest("system/core.yaml", "greeter").await;
    let report = h.manager.boot(&CancellationToken::new()).await;
    assert_eq!(report.loaded, vec!["core"]);

    let record = h.manager.record("core").await.unwrap().unwrap();
    assert_eq!(record.origin, Origin::System);

    // 用户来源不能覆盖系统模块
    let impostor = h.manifest("elsewhere/core.yaml", "greeter_v2").await;
    let err = h.load(&impostor).await.unwrap_err();
    assert!(matches!(err, CoreError::ProtectedModule(ref name) if name == "core"));
    assert!(h.manager.pending_proposals().is_empty());

    // 系统模块不能删除
    assert!(!h.manager.delete("core").await.unwrap());
    assert!(h.manager.descriptor("core").await.is_some());
    assert!(h.path("system/core.yaml").exists());

    assert_eq!(h.manager.system_modules().await.len(), 1);
    assert!(h.manager.user_modules().await.is_empty());
}

#[tokio::test]
async fn test_registry_failure_rolls_back_commands() {
    let h = Harness::with(|b| b, Arc::new(FailingRegistry)).await;
    let source = h.manifest("user/foo.yaml", "greeter").await;

    let err = h.load(&source).await.unwrap_err();
    assert!(matches!(err, CoreError::Registry(_)));
    assert!(h.manager.descriptor("foo").await.is_none());
    assert!(matches!(h.call("hello").await, Err(CoreError::CommandNotFound(_))));
    // 注册表故障走告警，不写入加载错误日志
    assert!(h.sink.entries().is_empty());
}

#[tokio::test]
async fn test_delete_keeps_artifact_outside_user_dir() {
    let h = Harness::new().await;
    let source = h.manifest("elsewhere/foo.yaml", "greeter").await;
    h.load(&source).await.unwrap();

    assert!(h.manager.delete("foo").await.unwrap());
    assert!(h.path("elsewhere/foo.yaml").exists());
    assert!(h.manager.descriptor("foo").await.is_none());
}

#[tokio::test]
async fn test_reload_system_module() {
    let h = Harness::new().await;
    h.manifest("system/core.yaml", "greeter").await;
    h.manager.boot(&CancellationToken::new()).await;
    let before = h.manager.record("core").await.unwrap().unwrap();

    tokio::time::sleep(Duration::from_millis(5)).await;
    h.manifest("system/core.yaml", "greeter_v2").await;
    assert!(h
        .manager
        .reload("core", &CancellationToken::new())
        .await
        .unwrap());

    let after = h.manager.record("core").await.unwrap().unwrap();
    assert_eq!(after.origin, Origin::System);
    assert_eq!(after.created_at, before.created_at);
    assert!(after.updated_at > before.updated_at);
    assert_eq!(h.call("hello").await.unwrap(), "hi from v2");
    assert_eq!(h.manager.system_modules().await.len(), 1);
}

// ============================================================================
// 远程制品
// ============================================================================

#[tokio::test]
async fn test_remote_artifact_materialized_and_deleted() {
    let h = Harness::new().await;
    let source = h
        .fetcher
        .serve("https://modules.example.com/weather.yaml?v=2", "greeter");

    let outcome = h.load(&source).await.unwrap();
    assert!(matches!(outcome, LoadOutcome::Loaded(ref d) if d.name == "weather"));

    // 注册表记录的是落地后的本地路径
    let stored = h.path("user/weather.yaml");
    let record = h.manager.record("weather").await.unwrap().unwrap();
    assert_eq!(record.source_location, stored.to_string_lossy());
    assert_eq!(record.origin, Origin::User);
    assert!(stored.exists());
    assert_eq!(h.call("hello").await.unwrap(), "hello world");

    assert!(h.manager.delete("weather").await.unwrap());
    assert!(!stored.exists());
    assert!(h.manager.record("weather").await.unwrap().is_none());
}

#[tokio::test]
async fn test_remote_system_artifact_lands_in_system_dir() {
    let h = Harness::new().await;
    let source = h.fetcher.serve("https://modules.example.com/core.yaml", "greeter");
    h.manager
        .load(&source, Origin::System, &CancellationToken::new())
        .await
        .unwrap();

    let record = h.manager.record("core").await.unwrap().unwrap();
    assert_eq!(record.origin, Origin::System);
    assert_eq!(
        record.source_location,
        h.path("system/core.yaml").to_string_lossy()
    );
    assert!(!h.path("user/core.yaml").exists());

    // 新实例启动时按系统模块加载，不产生失败
    let fresh = LifecycleManager::builder(base_config(h.dir.path()).build())
        .native(natives())
        .registry(Arc::new(FileModuleRegistry::in_memory()))
        .error_sink(Arc::new(MemoryErrorSink::new()))
        .build()
        .await
        .unwrap();
    let report = fresh.boot(&CancellationToken::new()).await;
    assert_eq!(report.loaded, vec!["core"]);
    assert!(report.failed.is_empty());
    assert_eq!(
        fresh.record("core").await.unwrap().unwrap().origin,
        Origin::System
    );
}

#[tokio::test]
async fn test_remote_artifact_not_found() {
    let h = Harness::new().await;
    let err = h
        .load(&ArtifactSource::Remote(
            "https://modules.example.com/ghost.yaml".to_string(),
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::ArtifactNotFound { .. }));
    assert!(!h.path("user/ghost.yaml").exists());
    assert!(h.manager.record("ghost").await.unwrap().is_none());
}

// ============================================================================
// 启动恢复与错误日志
// ============================================================================

#[tokio::test]
async fn test_boot_restores_active_records() {
    let dir = TempDir::new().unwrap();
    let registry_file = dir.path().join("data/modules.json");
    let source = write_manifest(&dir.path().join("elsewhere/foo.yaml"), "greeter").await;
    write_manifest(&dir.path().join("user/bar.yaml"), "greeter_v2").await;

    {
        let manager = LifecycleManager::builder(base_config(dir.path()).build())
            .native(natives())
            .error_sink(Arc::new(MemoryErrorSink::new()))
            .build()
            .await
            .unwrap();
        manager
            .load(&source, Origin::User, &CancellationToken::new())
            .await
            .unwrap();
        manager.shutdown().await;
    }
    assert!(registry_file.exists());

    let manager = LifecycleManager::builder(base_config(dir.path()).build())
        .native(natives())
        .error_sink(Arc::new(MemoryErrorSink::new()))
        .build()
        .await
        .unwrap();
    let report = manager.boot(&CancellationToken::new()).await;

    assert_eq!(report.loaded, vec!["bar", "foo"]);
    assert!(report.failed.is_empty());
    assert!(manager.descriptor("foo").await.is_some());
    assert!(manager.descriptor("bar").await.is_some());

    // 再次启动时已加载的模块被跳过
    let again = manager.boot(&CancellationToken::new()).await;
    assert!(again.loaded.is_empty());
    assert_eq!(again.skipped, vec!["bar", "bar", "foo"]);
}

#[tokio::test]
async fn test_failures_written_to_ndjson_log() {
    let dir = TempDir::new().unwrap();
    let manager = LifecycleManager::builder(base_config(dir.path()).build())
        .native(natives())
        .registry(Arc::new(FileModuleRegistry::in_memory()))
        .build()
        .await
        .unwrap();

    let source = write_manifest(&dir.path().join("user/boom.yaml"), "panics").await;
    assert!(manager
        .load(&source, Origin::User, &CancellationToken::new())
        .await
        .is_err());

    let log = NdjsonErrorSink::new(manager.config().paths.error_log_file());
    let entries = log.read_all().await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].module_name.as_deref(), Some("boom"));
    assert_eq!(entries[0].error_type, "ExecutionFault");
}
