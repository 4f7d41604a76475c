//! 模块元数据定义
//!
//! 定义注册表记录、模块描述符、错误日志条目等数据结构。

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::utils::{CoreError, Result};

/// 依赖声明：可由外部安装器安装的包标识，顺序即安装顺序
pub type DependencySpec = String;

/// 模块来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// 系统模块：受保护，不可删除
    System,
    /// 用户模块
    #[default]
    User,
}

impl Origin {
    pub fn is_system(self) -> bool {
        matches!(self, Origin::System)
    }
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Origin::System => f.pad("system"),
            Origin::User => f.pad("user"),
        }
    }
}

/// 注册表中以 `is_system` 布尔列保存来源
mod origin_flag {
    use super::Origin;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(origin: &Origin, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bool(origin.is_system())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Origin, D::Error> {
        Ok(if bool::deserialize(d)? {
            Origin::System
        } else {
            Origin::User
        })
    }
}

/// 注册表记录（持久化）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleRecord {
    /// 模块名称（唯一键）
    pub name: String,
    /// 制品位置（路径或 URI）
    #[serde(rename = "file_path")]
    pub source_location: String,
    /// 模块来源
    #[serde(rename = "is_system", with = "origin_flag")]
    pub origin: Origin,
    /// 是否激活
    pub is_active: bool,
    /// 首次加载时间
    #[serde(rename = "added_at")]
    pub created_at: DateTime<Utc>,
    /// 最后更新时间
    pub updated_at: DateTime<Utc>,
}

/// 注册表查询过滤条件
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordFilter {
    /// 只返回该来源的记录
    pub origin: Option<Origin>,
    /// 只返回已激活的记录
    pub active_only: bool,
}

impl RecordFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn origin(origin: Origin) -> Self {
        Self {
            origin: Some(origin),
            active_only: false,
        }
    }

    pub fn active(mut self) -> Self {
        self.active_only = true;
        self
    }

    pub fn matches(&self, record: &ModuleRecord) -> bool {
        self.origin.map_or(true, |o| o == record.origin) && (!self.active_only || record.is_active)
    }
}

/// 模块描述符
///
/// 由模块注册入口返回，宿主在其上标注来源后放入目录。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    /// 模块名称
    pub name: String,
    /// 模块说明
    #[serde(default)]
    pub description: String,
    /// 命令名称 -> 说明
    #[serde(default)]
    pub commands: BTreeMap<String, String>,
    /// 模块来源（由宿主标注，模块自报的值会被覆盖）
    #[serde(default)]
    pub origin: Origin,
    /// 需要安装的外部依赖（有序）
    #[serde(default)]
    pub dependencies: Vec<DependencySpec>,
}

fn command_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z0-9_]{1,32}$").expect("命令名正则无效"))
}

impl ModuleDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            commands: BTreeMap::new(),
            origin: Origin::User,
            dependencies: Vec::new(),
        }
    }

    /// 设置说明
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// 添加命令说明
    pub fn with_command(mut self, name: impl Into<String>, help: impl Into<String>) -> Self {
        self.commands.insert(name.into(), help.into());
        self
    }

    /// 添加依赖
    pub fn with_dependency(mut self, spec: impl Into<String>) -> Self {
        self.dependencies.push(spec.into());
        self
    }

    /// 校验描述符是否满足宿主约定
    ///
    /// 收集全部问题后一次性返回 `InvalidModuleSchema`。
    pub fn validate(&self, expected_name: &str) -> Result<()> {
        let mut errors = Vec::new();

        if self.name != expected_name {
            errors.push(format!(
                "描述符名称 '{}' 与模块名 '{}' 不一致",
                self.name, expected_name
            ));
        }

        for command in self.commands.keys() {
            if !command_name_pattern().is_match(command) {
                errors.push(format!("命令名 '{}' 无效", command));
            }
        }

        if self.dependencies.iter().any(|d| d.trim().is_empty()) {
            errors.push("依赖声明不能为空".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(CoreError::invalid_schema(expected_name, errors.join("; ")))
        }
    }
}

/// 加载失败记录（写入错误日志）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadFailure {
    /// 模块名称（名称未知时为空）
    pub module_name: Option<String>,
    /// 错误分类
    pub error_type: String,
    /// 错误消息
    pub error_message: String,
    /// 诊断详情
    pub traceback: Option<String>,
    /// 发生时间
    pub created_at: DateTime<Utc>,
}

impl LoadFailure {
    /// 从宿主错误构造
    pub fn from_error(module_name: Option<&str>, error: &CoreError) -> Self {
        Self {
            module_name: module_name.map(str::to_string),
            error_type: error.kind().to_string(),
            error_message: error.to_string(),
            traceback: error.diagnostic(),
            created_at: Utc::now(),
        }
    }
}
