//! 模块宿主错误类型定义
//!
//! 本模块定义了宿主中使用的所有错误类型。加载阶段的错误（制品缺失、
//! 描述符无效、依赖安装失败、模块代码故障）都是本地可恢复的；
//! `Registry` 是唯一可能让目录与注册表失去同步的错误，需要告警。

use thiserror::Error;

/// 模块宿主核心错误类型
#[derive(Error, Debug)]
pub enum CoreError {
    // ==================== 模块加载错误 ====================

    /// 制品不存在或无法获取
    #[error("制品未找到: '{source_location}' - {reason}")]
    ArtifactNotFound {
        /// 制品位置（路径或 URI）
        source_location: String,
        /// 失败原因
        reason: String,
    },

    /// 入口缺失或描述符不符合约定
    #[error("模块 '{module}' 描述无效: {reason}")]
    InvalidModuleSchema {
        /// 模块名称
        module: String,
        /// 失败原因
        reason: String,
    },

    /// 依赖安装失败
    #[error("依赖安装失败: '{spec}' - {diagnostic}")]
    ProvisionError {
        /// 安装失败的依赖声明
        spec: String,
        /// 安装器输出的诊断信息
        diagnostic: String,
    },

    /// 模块自身代码抛出的故障（含 panic 与执行上下文意外退出）
    #[error("模块 '{module}' 执行故障: {message}")]
    ExecutionFault {
        /// 模块名称
        module: String,
        /// 故障消息
        message: String,
        /// 诊断详情（错误链、panic 负载、子进程 stderr 等）
        detail: Option<String>,
    },

    /// 注册表存储错误
    #[error("注册表存储错误: {0}")]
    Registry(String),

    /// 受保护的系统模块不能被用户来源覆盖
    #[error("模块 '{0}' 为系统模块，受保护")]
    ProtectedModule(String),

    /// 命令已被其他模块占用
    #[error("命令 '{command}' 已由模块 '{owner}' 提供")]
    CommandConflict {
        /// 命令名称
        command: String,
        /// 当前持有该命令的模块
        owner: String,
    },

    // ==================== 查询与调度错误 ====================

    /// 模块未找到
    #[error("模块未找到: '{0}'")]
    ModuleNotFound(String),

    /// 命令未找到
    #[error("命令未找到: '{0}'")]
    CommandNotFound(String),

    /// 权限被拒绝
    #[error("权限被拒绝: {0}")]
    PermissionDenied(String),

    /// 操作超时
    #[error("操作超时: {0}")]
    Timeout(String),

    /// 操作被取消
    #[error("操作被取消")]
    Cancelled,

    // ==================== 配置错误 ====================

    /// 配置加载失败
    #[error("配置加载失败: {0}")]
    ConfigLoadFailed(String),

    /// 配置值无效
    #[error("配置值无效: '{key}' - {reason}")]
    InvalidConfigValue {
        /// 配置键
        key: String,
        /// 原因
        reason: String,
    },

    // ==================== IO 和序列化错误 ====================

    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    /// JSON 序列化/反序列化错误
    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML 序列化/反序列化错误
    #[error("YAML 错误: {0}")]
    Yaml(#[from] serde_yaml::Error),

    // ==================== 通用错误 ====================

    /// 初始化失败
    #[error("初始化失败: {0}")]
    InitFailed(String),

    /// 内部错误
    #[error("内部错误: {0}")]
    Internal(String),

    /// 其他错误
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// 宿主操作结果类型别名
pub type Result<T> = std::result::Result<T, CoreError>;

/// 错误码常量
pub mod error_code {
    // 模块错误 (MODULE-xxx)
    pub const MODULE_NOT_FOUND: &str = "MODULE-001";
    pub const MODULE_EXECUTION_FAULT: &str = "MODULE-002";
    pub const MODULE_INVALID_SCHEMA: &str = "MODULE-003";
    pub const MODULE_PROTECTED: &str = "MODULE-004";
    pub const MODULE_COMMAND_CONFLICT: &str = "MODULE-005";

    // 制品错误 (ARTIFACT-xxx)
    pub const ARTIFACT_NOT_FOUND: &str = "ARTIFACT-001";

    // 依赖错误 (PROVISION-xxx)
    pub const PROVISION_FAILED: &str = "PROVISION-001";

    // 存储错误 (REGISTRY-xxx)
    pub const REGISTRY_STORAGE: &str = "REGISTRY-001";

    // 权限错误 (PERMISSION-xxx)
    pub const PERMISSION_DENIED: &str = "PERMISSION-001";

    // 调度错误 (DISPATCH-xxx)
    pub const COMMAND_NOT_FOUND: &str = "DISPATCH-001";

    // 配置错误 (CONFIG-xxx)
    pub const CONFIG_LOAD_FAILED: &str = "CONFIG-001";
    pub const CONFIG_INVALID_VALUE: &str = "CONFIG-002";

    // 超时与取消 (TIMEOUT-xxx)
    pub const TIMEOUT: &str = "TIMEOUT-001";
    pub const CANCELLED: &str = "TIMEOUT-002";
}

impl CoreError {
    /// 获取错误码
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::ArtifactNotFound { .. } => error_code::ARTIFACT_NOT_FOUND,
            CoreError::InvalidModuleSchema { .. } => error_code::MODULE_INVALID_SCHEMA,
            CoreError::ProvisionError { .. } => error_code::PROVISION_FAILED,
            CoreError::ExecutionFault { .. } => error_code::MODULE_EXECUTION_FAULT,
            CoreError::Registry(_) => error_code::REGISTRY_STORAGE,
            CoreError::ProtectedModule(_) => error_code::MODULE_PROTECTED,
            CoreError::CommandConflict { .. } => error_code::MODULE_COMMAND_CONFLICT,
            CoreError::ModuleNotFound(_) => error_code::MODULE_NOT_FOUND,
            CoreError::CommandNotFound(_) => error_code::COMMAND_NOT_FOUND,
            CoreError::PermissionDenied(_) => error_code::PERMISSION_DENIED,
            CoreError::Timeout(_) => error_code::TIMEOUT,
            CoreError::Cancelled => error_code::CANCELLED,
            CoreError::ConfigLoadFailed(_) => error_code::CONFIG_LOAD_FAILED,
            CoreError::InvalidConfigValue { .. } => error_code::CONFIG_INVALID_VALUE,
            _ => "UNKNOWN",
        }
    }

    /// 错误分类名称，写入错误日志的 `error_type` 列
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::ArtifactNotFound { .. } => "ArtifactNotFound",
            CoreError::InvalidModuleSchema { .. } => "InvalidModuleSchema",
            CoreError::ProvisionError { .. } => "ProvisionError",
            CoreError::ExecutionFault { .. } => "ExecutionFault",
            CoreError::Registry(_) => "RegistryError",
            CoreError::ProtectedModule(_) => "ProtectedModule",
            CoreError::CommandConflict { .. } => "CommandConflict",
            CoreError::ModuleNotFound(_) => "ModuleNotFound",
            CoreError::CommandNotFound(_) => "CommandNotFound",
            CoreError::PermissionDenied(_) => "PermissionDenied",
            CoreError::Timeout(_) => "Timeout",
            CoreError::Cancelled => "Cancelled",
            CoreError::ConfigLoadFailed(_) | CoreError::InvalidConfigValue { .. } => "ConfigError",
            CoreError::Io(_) => "Io",
            CoreError::Json(_) | CoreError::Yaml(_) => "Serialization",
            CoreError::InitFailed(_) => "InitFailed",
            CoreError::Internal(_) => "Internal",
            CoreError::Other(_) => "Other",
        }
    }

    /// 诊断详情（若有）
    pub fn diagnostic(&self) -> Option<String> {
        match self {
            CoreError::ExecutionFault { detail, .. } => detail.clone(),
            CoreError::ProvisionError { diagnostic, .. } => Some(diagnostic.clone()),
            CoreError::Other(e) => Some(format!("{:?}", e)),
            _ => None,
        }
    }

    /// 是否为加载阶段的本地可恢复错误
    ///
    /// 这些错误会报告给调用方并写入错误日志，目录与注册表保持不变。
    pub fn is_load_failure(&self) -> bool {
        matches!(
            self,
            CoreError::ArtifactNotFound { .. }
                | CoreError::InvalidModuleSchema { .. }
                | CoreError::ProvisionError { .. }
                | CoreError::ExecutionFault { .. }
                | CoreError::ProtectedModule(_)
                | CoreError::CommandConflict { .. }
                | CoreError::Timeout(_)
        )
    }

    /// 是否需要向运维告警（目录与注册表可能不同步）
    pub fn requires_alert(&self) -> bool {
        matches!(self, CoreError::Registry(_))
    }

    /// 快捷构造：描述符无效
    pub fn invalid_schema(module: impl Into<String>, reason: impl Into<String>) -> Self {
        CoreError::InvalidModuleSchema {
            module: module.into(),
            reason: reason.into(),
        }
    }

    /// 快捷构造：模块执行故障
    pub fn execution_fault(
        module: impl Into<String>,
        message: impl Into<String>,
        detail: Option<String>,
    ) -> Self {
        CoreError::ExecutionFault {
            module: module.into(),
            message: message.into(),
            detail,
        }
    }
}
