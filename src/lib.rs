//! # modhost - 热插拔模块宿主
//!
//! 在一个长期运行的宿主进程中管理扩展模块的完整生命周期：
//!
//! - **生命周期管理**: 加载、卸载、重载、删除，同名覆盖需要令牌确认
//! - **依赖安装**: 模块声明的外部依赖在激活前按顺序安装
//! - **故障隔离**: 模块代码的 panic 与错误只影响这一次操作，并写入错误日志
//! - **持久化注册表**: 记录模块的制品位置与来源，宿主重启后自动恢复
//! - **系统模块保护**: 系统来源的模块不能被用户来源覆盖或删除
//!
//! ## 快速开始
//!
//! ```rust,no_run
//! use modhost::{ArtifactSource, HostConfig, LifecycleManager, Origin};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = HostConfig::builder().principal("owner").build();
//!     let manager = LifecycleManager::builder(config).build().await?;
//!
//!     let cancel = CancellationToken::new();
//!     manager.boot(&cancel).await;
//!     manager
//!         .load(&ArtifactSource::parse("modules/user/weather.yaml"), Origin::User, &cancel)
//!         .await?;
//!
//!     manager.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## 模块结构
//!
//! - `module` - 生命周期、注册表、执行上下文
//! - `host` - 命令分发、宿主服务、权限与管理入口
//! - `core` - 宿主配置
//! - `utils` - 错误类型、令牌与日志

#![warn(rustdoc::missing_crate_level_docs)]

pub mod core;
pub mod host;
pub mod module;
pub mod utils;

// 重导出常用类型，方便使用
pub use module::{
    entrypoint_fn, ArtifactSource, BootReport, DependencySpec, ErrorSink, FileModuleRegistry,
    LifecycleBuilder, LifecycleManager, LoadFailure, LoadOutcome, ModuleDescriptor,
    ModuleEntrypoint, ModuleRecord, ModuleRegistry, NativeRuntime, Origin, PackageInstaller,
    ProcessRuntime, RecordFilter,
};

pub use host::{
    handler_fn, Authorizer, CommandReply, CommandRequest, FileAuthorizer, ModuleAdmin,
    ModuleHost,
};

pub use utils::{error_code, generate_token, CoreError, Result};
pub use utils::logger::{LogGuard, Logger, LoggerConfig, LoggerConfigBuilder, RotationStrategy};

pub use core::config::{HostConfig, HostConfigBuilder, LogConfig};

/// 库版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
