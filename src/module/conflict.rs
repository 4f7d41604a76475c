//! 同名冲突处理
//!
//! 覆盖一个正在运行的模块是破坏性操作，因此同名加载先生成提案，由操作者确认或取消。
//! 提案本身不修改目录和注册表；令牌只能使用一次，没有自动过期。

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tracing::info;

use super::artifact::ArtifactSource;
use super::metadata::Origin;
use crate::utils::generate_token;

/// 待确认的覆盖提案
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    /// 令牌
    pub token: String,
    /// 目标模块名
    pub name: String,
    /// 新制品位置
    pub source: ArtifactSource,
    /// 新制品的来源
    pub origin: Origin,
    /// 创建时间
    pub created_at: DateTime<Utc>,
}

/// 冲突提案表
#[derive(Debug, Default)]
pub struct ConflictResolver {
    proposals: Mutex<HashMap<String, Proposal>>,
}

impl ConflictResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// 创建提案，返回令牌
    pub fn propose(&self, name: &str, source: ArtifactSource, origin: Origin) -> String {
        let mut proposals = self.proposals.lock().unwrap_or_else(PoisonError::into_inner);
        let mut token = generate_token();
        while proposals.contains_key(&token) {
            token = generate_token();
        }

        info!(module = %name, token = %token, source = %source, "同名模块已存在，等待确认覆盖");
        proposals.insert(
            token.clone(),
            Proposal {
                token: token.clone(),
                name: name.to_string(),
                source,
                origin,
                created_at: Utc::now(),
            },
        );
        token
    }

    /// 查看提案但不消费
    pub fn peek(&self, token: &str) -> Option<Proposal> {
        self.proposals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(token)
            .cloned()
    }

    /// 消费提案
    pub fn take(&self, token: &str) -> Option<Proposal> {
        self.proposals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(token)
    }

    /// 取消提案，令牌不存在时返回 false
    pub fn cancel(&self, token: &str) -> bool {
        let removed = self.take(token);
        if let Some(ref proposal) = removed {
            info!(module = %proposal.name, token = %token, "覆盖提案已取消");
        }
        removed.is_some()
    }

    /// 全部待确认提案（按创建时间排序）
    pub fn pending(&self) -> Vec<Proposal> {
        let mut pending: Vec<Proposal> = self
            .proposals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        pending.sort_by_key(|p| p.created_at);
        pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::is_valid_token;

    #[test]
    fn test_propose_and_take_once() {
        let resolver = ConflictResolver::new();
        let token = resolver.propose("foo", ArtifactSource::parse("b/foo.yaml"), Origin::User);
        assert!(is_valid_token(&token));

        let proposal = resolver.peek(&token).unwrap();
        assert_eq!(proposal.name, "foo");

        assert!(resolver.take(&token).is_some());
        assert!(resolver.take(&token).is_none());
        assert!(resolver.peek(&token).is_none());
    }

    #[test]
    fn test_cancel() {
        let resolver = ConflictResolver::new();
        let token = resolver.propose("foo", ArtifactSource::parse("foo.yaml"), Origin::User);
        assert_eq!(resolver.pending().len(), 1);

        assert!(resolver.cancel(&token));
        assert!(!resolver.cancel(&token));
        assert!(resolver.pending().is_empty());
    }

    #[test]
    fn test_multiple_proposals_for_same_name() {
        let resolver = ConflictResolver::new();
        let a = resolver.propose("foo", ArtifactSource::parse("a/foo.yaml"), Origin::User);
        let b = resolver.propose("foo", ArtifactSource::parse("b/foo.yaml"), Origin::User);
        assert_ne!(a, b);
        assert_eq!(resolver.pending().len(), 2);
    }
}
