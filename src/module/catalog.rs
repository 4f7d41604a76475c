//! 模块目录
//!
//! 当前已激活模块的内存索引，是"哪些模块正在运行"的唯一依据。
//! 命令分发时频繁读取，写入只发生在加载与卸载的短临界区内。

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::artifact::RuntimeKind;
use super::metadata::{ModuleDescriptor, Origin};
use super::runtime::ExecutionContext;

/// 已加载模块
pub struct LoadedModule {
    descriptor: ModuleDescriptor,
    source_location: String,
    context: Box<dyn ExecutionContext>,
    loaded_at: DateTime<Utc>,
}

impl LoadedModule {
    pub fn new(
        descriptor: ModuleDescriptor,
        source_location: String,
        context: Box<dyn ExecutionContext>,
    ) -> Self {
        Self {
            descriptor,
            source_location,
            context,
            loaded_at: Utc::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    pub fn origin(&self) -> Origin {
        self.descriptor.origin
    }

    /// 加载时使用的制品位置
    pub fn source_location(&self) -> &str {
        &self.source_location
    }

    pub fn runtime(&self) -> RuntimeKind {
        self.context.runtime()
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    /// 释放执行上下文
    pub async fn shutdown(&self) {
        self.context.shutdown().await;
    }
}

impl std::fmt::Debug for LoadedModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModule")
            .field("name", &self.descriptor.name)
            .field("origin", &self.descriptor.origin)
            .field("source_location", &self.source_location)
            .field("runtime", &self.runtime())
            .finish()
    }
}

/// 模块目录
#[derive(Default)]
pub struct ModuleCatalog {
    modules: RwLock<HashMap<String, Arc<LoadedModule>>>,
}

impl ModuleCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// 插入或替换条目，返回被替换的旧条目
    pub async fn insert(&self, module: LoadedModule) -> Option<Arc<LoadedModule>> {
        let name = module.name().to_string();
        self.modules.write().await.insert(name, Arc::new(module))
    }

    /// 移除条目
    pub async fn remove(&self, name: &str) -> Option<Arc<LoadedModule>> {
        self.modules.write().await.remove(name)
    }

    pub async fn get(&self, name: &str) -> Option<Arc<LoadedModule>> {
        self.modules.read().await.get(name).cloned()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.modules.read().await.contains_key(name)
    }

    /// 模块描述符
    pub async fn descriptor(&self, name: &str) -> Option<ModuleDescriptor> {
        self.modules
            .read()
            .await
            .get(name)
            .map(|m| m.descriptor().clone())
    }

    /// 按来源列出描述符（按名称排序）
    pub async fn descriptors(&self, origin: Option<Origin>) -> Vec<ModuleDescriptor> {
        let mut descriptors: Vec<ModuleDescriptor> = self
            .modules
            .read()
            .await
            .values()
            .filter(|m| origin.map_or(true, |o| m.origin() == o))
            .map(|m| m.descriptor().clone())
            .collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    /// 已加载模块名（排序）
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.modules.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn len(&self) -> usize {
        self.modules.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.modules.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::services::ModuleHost;
    use crate::utils::Result;
    use async_trait::async_trait;

    struct NoopContext;

    #[async_trait]
    impl ExecutionContext for NoopContext {
        async fn register(&self, host: ModuleHost) -> Result<ModuleDescriptor> {
            Ok(ModuleDescriptor::new(host.name()))
        }

        async fn shutdown(&self) {}

        fn runtime(&self) -> RuntimeKind {
            RuntimeKind::Native
        }
    }

    fn loaded(name: &str, origin: Origin) -> LoadedModule {
        let mut descriptor = ModuleDescriptor::new(name);
        descriptor.origin = origin;
        LoadedModule::new(descriptor, format!("{}.yaml", name), Box::new(NoopContext))
    }

    #[tokio::test]
    async fn test_insert_replace_remove() {
        let catalog = ModuleCatalog::new();
        assert!(catalog.insert(loaded("echo", Origin::User)).await.is_none());
        assert!(catalog.insert(loaded("echo", Origin::User)).await.is_some());
        assert_eq!(catalog.len().await, 1);

        let removed = catalog.remove("echo").await.unwrap();
        assert_eq!(removed.source_location(), "echo.yaml");
        assert!(catalog.remove("echo").await.is_none());
        assert!(catalog.is_empty().await);
    }

    #[tokio::test]
    async fn test_descriptors_by_origin() {
        let catalog = ModuleCatalog::new();
        catalog.insert(loaded("b", Origin::User)).await;
        catalog.insert(loaded("a", Origin::User)).await;
        catalog.insert(loaded("core", Origin::System)).await;

        let user: Vec<_> = catalog
            .descriptors(Some(Origin::User))
            .await
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(user, vec!["a", "b"]);
        assert_eq!(catalog.descriptors(None).await.len(), 3);
        assert_eq!(catalog.names().await, vec!["a", "b", "core"]);
    }
}
