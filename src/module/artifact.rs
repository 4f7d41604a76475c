//! 模块制品
//!
//! 制品是一个 YAML 清单文件 `<name>.yaml`，模块名取自文件名（不含扩展名）：
//!
//! ```yaml
//! runtime: process          # native | process
//! entry: ./weather.sh       # native: 入口标识; process: 程序路径（相对清单所在目录）
//! args: []
//! env: {}
//! ```
//!
//! 制品可以来自本地路径，也可以来自 http(s) 地址。远程制品下载后落地到
//! 用户模块目录，注册表中记录的是落地后的本地路径。

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::utils::{CoreError, Result};

/// 清单文件扩展名
pub const MANIFEST_EXTENSION: &str = "yaml";

/// 制品位置
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactSource {
    /// 本地文件
    Local(PathBuf),
    /// 远程地址（http/https）
    Remote(String),
}

impl ArtifactSource {
    /// 解析制品位置，`http://` 与 `https://` 开头视为远程
    pub fn parse(location: &str) -> Self {
        let trimmed = location.trim();
        let lower = trimmed.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            ArtifactSource::Remote(trimmed.to_string())
        } else {
            ArtifactSource::Local(PathBuf::from(trimmed))
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, ArtifactSource::Remote(_))
    }

    /// 位置字符串，写入注册表
    pub fn location(&self) -> String {
        match self {
            ArtifactSource::Local(path) => path.to_string_lossy().into_owned(),
            ArtifactSource::Remote(url) => url.clone(),
        }
    }

    /// 从文件名推导模块名
    ///
    /// 名称只能包含 ASCII 字母、数字、下划线和连字符。
    pub fn module_name(&self) -> Result<String> {
        let file_name = match self {
            ArtifactSource::Local(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            ArtifactSource::Remote(url) => {
                let without_query = url.split(['?', '#']).next().unwrap_or_default();
                without_query
                    .rsplit('/')
                    .next()
                    .unwrap_or_default()
                    .to_string()
            }
        };

        let stem = Path::new(&file_name)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        if is_valid_module_name(&stem) {
            Ok(stem)
        } else {
            Err(CoreError::invalid_schema(
                stem,
                format!("无法从制品位置 '{}' 推导出有效的模块名", self.location()),
            ))
        }
    }
}

impl fmt::Display for ArtifactSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.location())
    }
}

/// 检查模块名是否合法
pub fn is_valid_module_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// 执行上下文类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    /// 宿主进程内编译进来的入口
    Native,
    /// 独立子进程，经标准输入输出通信
    Process,
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeKind::Native => write!(f, "native"),
            RuntimeKind::Process => write!(f, "process"),
        }
    }
}

/// 制品清单
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArtifactManifest {
    /// 执行上下文类型
    pub runtime: RuntimeKind,
    /// 入口
    pub entry: String,
    /// 子进程参数
    #[serde(default)]
    pub args: Vec<String>,
    /// 子进程环境变量
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl ArtifactManifest {
    /// 解析清单内容
    ///
    /// # Errors
    ///
    /// 内容不是合法清单或入口为空时返回 `InvalidModuleSchema`
    pub fn parse(module: &str, content: &[u8]) -> Result<Self> {
        let manifest: ArtifactManifest = serde_yaml::from_slice(content)
            .map_err(|e| CoreError::invalid_schema(module, format!("清单格式错误: {}", e)))?;
        if manifest.entry.trim().is_empty() {
            return Err(CoreError::invalid_schema(module, "清单缺少入口 entry"));
        }
        Ok(manifest)
    }
}

/// 制品获取接口
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    /// 读取制品内容
    ///
    /// 制品不存在或无法获取时返回 `ArtifactNotFound`。
    async fn fetch(&self, source: &ArtifactSource) -> Result<Vec<u8>>;
}

/// 默认制品获取器：本地文件用 tokio::fs，远程地址用 reqwest
pub struct DefaultFetcher {
    client: reqwest::Client,
}

impl DefaultFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CoreError::InitFailed(format!("HTTP 客户端创建失败: {}", e)))?;
        Ok(Self { client })
    }

    async fn fetch_remote(&self, url: &str) -> Result<Vec<u8>> {
        let not_found = |reason: String| CoreError::ArtifactNotFound {
            source_location: url.to_string(),
            reason,
        };

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| not_found(e.to_string()))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(not_found(format!("HTTP {}", status.as_u16())));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| not_found(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl ArtifactFetcher for DefaultFetcher {
    async fn fetch(&self, source: &ArtifactSource) -> Result<Vec<u8>> {
        debug!(source = %source, "获取制品");
        match source {
            ArtifactSource::Local(path) => {
                tokio::fs::read(path)
                    .await
                    .map_err(|e| CoreError::ArtifactNotFound {
                        source_location: path.to_string_lossy().into_owned(),
                        reason: e.to_string(),
                    })
            }
            ArtifactSource::Remote(url) => self.fetch_remote(url).await,
        }
    }
}

/// 清单文件路径 `<dir>/<name>.yaml`
pub fn manifest_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.{}", name, MANIFEST_EXTENSION))
}

/// 把远程制品落地到本地目录，返回落地路径
pub async fn materialize(dir: &Path, name: &str, content: &[u8]) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let target = manifest_path(dir, name);
    let tmp = target.with_extension("yaml.part");
    tokio::fs::write(&tmp, content).await?;
    tokio::fs::rename(&tmp, &target).await?;
    info!(module = %name, path = %target.display(), "远程制品已落地");
    Ok(target)
}

/// 扫描目录中的清单文件（跳过 `_` 开头的文件），按文件名排序
pub async fn scan_manifests(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(dir = %dir.display(), "模块目录不存在，跳过");
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };

    let mut manifests = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_manifest = path
            .extension()
            .map(|ext| ext == MANIFEST_EXTENSION)
            .unwrap_or(false);
        let hidden = path
            .file_name()
            .map(|n| n.to_string_lossy().starts_with('_'))
            .unwrap_or(true);
        if is_manifest && !hidden && path.is_file() {
            manifests.push(path);
        }
    }
    manifests.sort();
    Ok(manifests)
}
