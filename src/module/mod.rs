//! 模块管理
//!
//! 包含模块生命周期的全部组件：
//! - 元数据、制品与执行上下文
//! - 依赖安装、注册表与错误日志
//! - 目录、冲突提案、加载器与生命周期管理器

pub mod artifact;
pub mod catalog;
pub mod conflict;
pub mod error_sink;
pub mod lifecycle;
pub mod loader;
pub mod metadata;
pub mod provisioner;
pub mod registry;
pub mod runtime;

// 重导出常用类型
pub use artifact::{ArtifactFetcher, ArtifactManifest, ArtifactSource, DefaultFetcher, RuntimeKind};
pub use catalog::{LoadedModule, ModuleCatalog};
pub use conflict::{ConflictResolver, Proposal};
pub use error_sink::{ErrorSink, MemoryErrorSink, NdjsonErrorSink};
pub use lifecycle::{BootReport, LifecycleBuilder, LifecycleManager, LoadOutcome};
pub use metadata::{
    DependencySpec, LoadFailure, ModuleDescriptor, ModuleRecord, Origin, RecordFilter,
};
pub use provisioner::{CommandInstaller, DependencyProvisioner, PackageInstaller};
pub use registry::{FileModuleRegistry, ModuleRegistry};
pub use runtime::{
    entrypoint_fn, ExecutionContext, ModuleEntrypoint, ModuleRuntime, NativeRuntime, ProcessRuntime,
};
