//! 宿主服务
//!
//! 模块注册时宿主只传入一个 [`ModuleHost`]：命令登记器、配置访问器与本地化表。
//! 模块不从任何全局状态查找宿主对象。

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use super::dispatch::{CommandRegistrar, CommandTable};
use super::localization::Localization;
use crate::core::config::HostConfig;

/// 只读的模块配置视图
#[derive(Debug, Clone)]
pub struct ConfigAccessor {
    settings: Value,
    public_user_modules: bool,
}

impl ConfigAccessor {
    pub fn new(settings: Value, public_user_modules: bool) -> Self {
        Self {
            settings,
            public_user_modules,
        }
    }

    /// 读取配置项，不存在或类型不符时返回 None
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.settings
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// 模块的完整配置段
    pub fn settings(&self) -> &Value {
        &self.settings
    }

    /// 用户模块命令是否对所有人开放
    pub fn public_user_modules(&self) -> bool {
        self.public_user_modules
    }
}

/// 传给单个模块注册入口的宿主服务
#[derive(Clone)]
pub struct ModuleHost {
    name: String,
    registrar: CommandRegistrar,
    config: ConfigAccessor,
    localization: Arc<Localization>,
}

impl ModuleHost {
    /// 模块名
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 命令登记器
    pub fn commands(&self) -> &CommandRegistrar {
        &self.registrar
    }

    /// 配置访问器
    pub fn config(&self) -> &ConfigAccessor {
        &self.config
    }

    /// 本地化表
    pub fn localization(&self) -> &Localization {
        &self.localization
    }
}

/// 宿主服务
pub struct HostServices {
    commands: Arc<CommandTable>,
    config: Arc<HostConfig>,
    localization: Arc<Localization>,
}

impl HostServices {
    pub fn new(config: Arc<HostConfig>, localization: Localization) -> Self {
        Self {
            commands: Arc::new(CommandTable::new()),
            config,
            localization: Arc::new(localization),
        }
    }

    /// 分发表
    pub fn commands(&self) -> &Arc<CommandTable> {
        &self.commands
    }

    /// 宿主配置
    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// 本地化表
    pub fn localization(&self) -> &Localization {
        &self.localization
    }

    /// 为一次加载创建模块视图，登记器是全新的暂存区
    pub fn scoped(&self, name: &str) -> ModuleHost {
        ModuleHost {
            name: name.to_string(),
            registrar: CommandRegistrar::new(),
            config: ConfigAccessor::new(
                self.config.module_settings(name),
                self.config.public_user_modules,
            ),
            localization: self.localization.clone(),
        }
    }
}
