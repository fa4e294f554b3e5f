//! 能力注册表
//!
//! 所有能力实现 Ability trait（name / description / invoke），由 AbilityRegistry 按名注册与查找；
//! 重名在注册时拒绝。执行器只区分瞬时 / 永久失败，不关心能力内部做了什么。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::metrics::MetricsRecord;
use crate::core::task::{AgentRole, TaskId};

/// 调用能力时的输入
#[derive(Debug, Clone, Default)]
pub struct AbilityRequest {
    pub task_id: TaskId,
    /// 任务描述（指令文本）
    pub instruction: String,
    pub role: Option<AgentRole>,
    /// 会话目标，供需要上下文的能力使用
    pub objective: String,
    /// 直接依赖任务的 (ID, 结果)
    pub upstream: Vec<(TaskId, String)>,
}

impl AbilityRequest {
    pub fn new(task_id: TaskId, instruction: impl Into<String>) -> Self {
        Self {
            task_id,
            instruction: instruction.into(),
            ..Self::default()
        }
    }
}

/// 能力输出：结果文本 + 可选用量（非 LLM 能力为 None）
#[derive(Debug, Clone)]
pub struct AbilityOutput {
    pub content: String,
    pub usage: Option<MetricsRecord>,
}

impl AbilityOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            usage: None,
        }
    }

    pub fn with_usage(content: impl Into<String>, usage: MetricsRecord) -> Self {
        Self {
            content: content.into(),
            usage: Some(usage),
        }
    }
}

/// 能力失败：瞬时失败会被重试，永久失败不会
#[derive(Error, Debug, Clone)]
pub enum AbilityError {
    #[error("{message}")]
    Transient {
        message: String,
        retry_after: Option<Duration>,
        /// 已到达服务端的调用仍需上报用量
        usage: Option<MetricsRecord>,
    },

    #[error("{0}")]
    Permanent(String),
}

impl AbilityError {
    pub fn transient(message: impl Into<String>) -> Self {
        AbilityError::Transient {
            message: message.into(),
            retry_after: None,
            usage: None,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        AbilityError::Permanent(message.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, AbilityError::Transient { .. })
    }

    pub fn usage(&self) -> Option<&MetricsRecord> {
        match self {
            AbilityError::Transient { usage, .. } => usage.as_ref(),
            AbilityError::Permanent(_) => None,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AbilityError::Transient { retry_after, .. } => *retry_after,
            AbilityError::Permanent(_) => None,
        }
    }
}

/// 能力 trait：名称（任务列表中的 "ability" 字段）、描述、异步调用
#[async_trait]
pub trait Ability: Send + Sync {
    fn name(&self) -> &str;

    /// 供 Planner 提示词列出可用能力
    fn description(&self) -> &str;

    /// 用量记录中的 provider 名（非 LLM 能力默认为自身名称）
    fn provider(&self) -> &str {
        self.name()
    }

    async fn invoke(&self, request: AbilityRequest) -> Result<AbilityOutput, AbilityError>;
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    #[error("Ability already registered: {0}")]
    DuplicateAbility(String),

    #[error("Ability name must not be empty")]
    EmptyName,
}

/// 能力注册表：按名称存储 Arc<dyn Ability>（BTreeMap 使列举顺序稳定）
#[derive(Default, Clone)]
pub struct AbilityRegistry {
    abilities: BTreeMap<String, Arc<dyn Ability>>,
}

impl AbilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, ability: impl Ability + 'static) -> Result<(), RegistryError> {
        self.register_arc(Arc::new(ability))
    }

    pub fn register_arc(&mut self, ability: Arc<dyn Ability>) -> Result<(), RegistryError> {
        let name = ability.name().trim().to_string();
        if name.is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if self.abilities.contains_key(&name) {
            return Err(RegistryError::DuplicateAbility(name));
        }
        tracing::debug!(ability = %name, "registering ability");
        self.abilities.insert(name, ability);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Ability>> {
        self.abilities.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.abilities.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.abilities.is_empty()
    }

    pub fn len(&self) -> usize {
        self.abilities.len()
    }

    pub fn names(&self) -> Vec<String> {
        self.abilities.keys().cloned().collect()
    }

    /// 返回 (name, description) 列表，用于生成 Planner 提示词中的可用能力段落
    pub fn descriptions(&self) -> Vec<(String, String)> {
        self.abilities
            .iter()
            .map(|(name, ability)| (name.clone(), ability.description().to_string()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abilities::EchoAbility;

    #[test]
    fn test_register_and_lookup() {
        let mut registry = AbilityRegistry::new();
        registry.register(EchoAbility).unwrap();
        assert!(registry.contains("echo"));
        assert!(registry.get("echo").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.names(), vec!["echo".to_string()]);
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut registry = AbilityRegistry::new();
        registry.register(EchoAbility).unwrap();
        let err = registry.register(EchoAbility).unwrap_err();
        assert_eq!(err, RegistryError::DuplicateAbility("echo".into()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_error_classification() {
        let err = AbilityError::transient("timeout");
        assert!(err.is_transient());
        assert!(!AbilityError::permanent("bad args").is_transient());
    }
}
