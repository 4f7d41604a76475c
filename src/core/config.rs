//! 宿主配置
//!
//! 定义模块宿主的配置结构和加载逻辑。配置文件按扩展名选择 JSON 或 YAML。

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::utils::{CoreError, Result};

/// 目录配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// 系统模块目录
    #[serde(default = "default_system_modules")]
    pub system_modules: PathBuf,

    /// 用户模块目录（远程制品也落地到这里）
    #[serde(default = "default_user_modules")]
    pub user_modules: PathBuf,

    /// 数据目录（注册表与错误日志）
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_system_modules() -> PathBuf {
    PathBuf::from("modules/system")
}

fn default_user_modules() -> PathBuf {
    PathBuf::from("modules/user")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            system_modules: default_system_modules(),
            user_modules: default_user_modules(),
            data_dir: default_data_dir(),
        }
    }
}

impl PathsConfig {
    /// 注册表文件路径
    pub fn registry_file(&self) -> PathBuf {
        self.data_dir.join("modules.json")
    }

    /// 错误日志文件路径
    pub fn error_log_file(&self) -> PathBuf {
        self.data_dir.join("error_logs.ndjson")
    }

    /// 运行时添加的管理员列表
    pub fn admins_file(&self) -> PathBuf {
        self.data_dir.join("admins.json")
    }
}

/// 依赖安装配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningConfig {
    /// 安装器命令行（程序 + 前置参数），依赖声明追加在末尾
    #[serde(default = "default_installer")]
    pub installer: Vec<String>,

    /// 单个依赖的安装超时（秒）
    #[serde(default = "default_provision_timeout")]
    pub timeout_secs: u64,

    /// 是否在整个宿主范围内串行安装
    #[serde(default)]
    pub serialize: bool,
}

fn default_installer() -> Vec<String> {
    vec!["pip".to_string(), "install".to_string()]
}

fn default_provision_timeout() -> u64 {
    300
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            installer: default_installer(),
            timeout_secs: default_provision_timeout(),
            serialize: false,
        }
    }
}

/// 执行上下文配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// 注册入口超时（毫秒）
    #[serde(default = "default_register_timeout_ms")]
    pub register_timeout_ms: u64,

    /// 关闭子进程前的宽限期（毫秒）
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

fn default_register_timeout_ms() -> u64 {
    30000
}

fn default_shutdown_grace_ms() -> u64 {
    2000
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            register_timeout_ms: default_register_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

/// 远程制品获取配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// 下载超时（秒）
    #[serde(default = "default_fetch_timeout")]
    pub timeout_secs: u64,
}

fn default_fetch_timeout() -> u64 {
    60
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_fetch_timeout(),
        }
    }
}

/// 本地化配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocalizationConfig {
    /// 字符串表文件（YAML 或 JSON）
    #[serde(default)]
    pub file: Option<PathBuf>,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 日志级别
    #[serde(default = "default_log_level")]
    pub level: String,

    /// 是否输出 JSON 格式
    #[serde(default)]
    pub json_format: bool,

    /// 日志文件目录（为空时不写文件）
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// 日志轮转策略
    #[serde(default = "default_rotation")]
    pub rotation: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_rotation() -> String {
    "daily".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
            log_dir: None,
            rotation: default_rotation(),
        }
    }
}

/// 宿主配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// 配置文件路径
    #[serde(skip)]
    pub config_path: Option<PathBuf>,

    /// 宿主所有者
    #[serde(default)]
    pub principal: String,

    /// 额外的管理员
    #[serde(default)]
    pub admins: Vec<String>,

    /// 用户模块的命令是否对所有人开放
    #[serde(default = "default_true")]
    pub public_user_modules: bool,

    /// 目录配置
    #[serde(default)]
    pub paths: PathsConfig,

    /// 依赖安装配置
    #[serde(default)]
    pub provisioning: ProvisioningConfig,

    /// 执行上下文配置
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// 远程获取配置
    #[serde(default)]
    pub fetch: FetchConfig,

    /// 本地化配置
    #[serde(default)]
    pub localization: LocalizationConfig,

    /// 日志配置
    #[serde(default)]
    pub logging: LogConfig,

    /// 按模块名划分的自由配置
    #[serde(default)]
    pub modules: HashMap<String, serde_json::Value>,
}

fn default_true() -> bool {
    true
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            config_path: None,
            principal: String::new(),
            admins: Vec::new(),
            public_user_modules: true,
            paths: PathsConfig::default(),
            provisioning: ProvisioningConfig::default(),
            runtime: RuntimeConfig::default(),
            fetch: FetchConfig::default(),
            localization: LocalizationConfig::default(),
            logging: LogConfig::default(),
            modules: HashMap::new(),
        }
    }
}

impl HostConfig {
    /// 创建配置构建器
    pub fn builder() -> HostConfigBuilder {
        HostConfigBuilder::new()
    }

    /// 从文件加载配置
    pub async fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| CoreError::ConfigLoadFailed(format!("{}: {}", path.display(), e)))?;

        let mut config = Self::parse(&path, &content)?;
        config.config_path = Some(path);
        Ok(config)
    }

    fn parse(path: &Path, content: &str) -> Result<Self> {
        let config: HostConfig = if path.extension().map(|e| e == "json").unwrap_or(false) {
            serde_json::from_str(content)?
        } else {
            serde_yaml::from_str(content)?
        };
        Ok(config)
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.principal.trim().is_empty() {
            return Err(CoreError::InvalidConfigValue {
                key: "principal".to_string(),
                reason: "必须配置宿主所有者".to_string(),
            });
        }
        if self.provisioning.installer.is_empty() {
            return Err(CoreError::InvalidConfigValue {
                key: "provisioning.installer".to_string(),
                reason: "安装器命令不能为空".to_string(),
            });
        }
        if self.provisioning.timeout_secs == 0 {
            return Err(CoreError::InvalidConfigValue {
                key: "provisioning.timeout_secs".to_string(),
                reason: "必须大于 0".to_string(),
            });
        }
        if self.runtime.register_timeout_ms == 0 {
            return Err(CoreError::InvalidConfigValue {
                key: "runtime.register_timeout_ms".to_string(),
                reason: "必须大于 0".to_string(),
            });
        }
        if self.paths.system_modules == self.paths.user_modules {
            return Err(CoreError::InvalidConfigValue {
                key: "paths.user_modules".to_string(),
                reason: "系统模块目录与用户模块目录不能相同".to_string(),
            });
        }
        Ok(())
    }

    /// 某模块的配置段
    pub fn module_settings(&self, name: &str) -> serde_json::Value {
        self.modules
            .get(name)
            .cloned()
            .unwrap_or(serde_json::Value::Null)
    }
}

/// 配置构建器
#[derive(Debug, Default)]
pub struct HostConfigBuilder {
    config: HostConfig,
}

impl HostConfigBuilder {
    /// 创建新的构建器
    pub fn new() -> Self {
        Self {
            config: HostConfig::default(),
        }
    }

    /// 设置宿主所有者
    pub fn principal(mut self, actor: impl Into<String>) -> Self {
        self.config.principal = actor.into();
        self
    }

    /// 添加管理员
    pub fn admin(mut self, actor: impl Into<String>) -> Self {
        self.config.admins.push(actor.into());
        self
    }

    /// 设置用户模块是否公开
    pub fn public_user_modules(mut self, public: bool) -> Self {
        self.config.public_user_modules = public;
        self
    }

    /// 设置系统模块目录
    pub fn system_modules(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.paths.system_modules = dir.into();
        self
    }

    /// 设置用户模块目录
    pub fn user_modules(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.paths.user_modules = dir.into();
        self
    }

    /// 设置数据目录
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.paths.data_dir = dir.into();
        self
    }

    /// 设置安装器命令行
    pub fn installer<I, S>(mut self, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.provisioning.installer = argv.into_iter().map(Into::into).collect();
        self
    }

    /// 设置单个依赖的安装超时
    pub fn provision_timeout_secs(mut self, secs: u64) -> Self {
        self.config.provisioning.timeout_secs = secs;
        self
    }

    /// 串行安装依赖
    pub fn serialize_provisioning(mut self) -> Self {
        self.config.provisioning.serialize = true;
        self
    }

    /// 设置注册入口超时
    pub fn register_timeout_ms(mut self, ms: u64) -> Self {
        self.config.runtime.register_timeout_ms = ms;
        self
    }

    /// 设置日志级别
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    /// 设置某模块的配置段
    pub fn module_settings(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.config.modules.insert(name.into(), value);
        self
    }

    /// 构建配置
    pub fn build(self) -> HostConfig {
        self.config
    }
}
