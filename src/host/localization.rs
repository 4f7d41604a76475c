//! 本地化字符串
//!
//! 键到模板的映射，模板中的 `{name}` 占位符按参数替换。键不存在时返回键本身。

use std::collections::HashMap;
use std::path::Path;

use crate::utils::{CoreError, Result};

/// 本地化字符串表
#[derive(Debug, Clone, Default)]
pub struct Localization {
    strings: HashMap<String, String>,
}

impl Localization {
    pub fn new(strings: HashMap<String, String>) -> Self {
        Self { strings }
    }

    /// 从 YAML 或 JSON 文件加载
    pub async fn from_file(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            CoreError::ConfigLoadFailed(format!("本地化文件 {}: {}", path.display(), e))
        })?;
        let strings = if path.extension().map(|e| e == "json").unwrap_or(false) {
            serde_json::from_str(&content)?
        } else {
            serde_yaml::from_str(&content)?
        };
        Ok(Self { strings })
    }

    /// 原始模板
    pub fn text<'a>(&'a self, key: &'a str) -> &'a str {
        self.strings.get(key).map(String::as_str).unwrap_or(key)
    }

    /// 渲染模板
    pub fn format(&self, key: &str, params: &[(&str, &str)]) -> String {
        params
            .iter()
            .fold(self.text(key).to_string(), |acc, (name, value)| {
                acc.replace(&format!("{{{}}}", name), value)
            })
    }

    /// 完整字符串表（传给子进程模块）
    pub fn strings(&self) -> &HashMap<String, String> {
        &self.strings
    }
}
