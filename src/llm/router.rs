//! 按角色路由模型与计价
//!
//! ModelRouter 根据任务角色（planner / executor / reviewer / orchestrator）选择模型，
//! 未配置的角色回落到默认模型；PricingTable 按每百万 token 单价估算成本。

use std::collections::HashMap;

use crate::config::{LlmSection, ModelPricing};
use crate::core::task::AgentRole;

/// 角色 -> 模型
#[derive(Debug, Clone, Default)]
pub struct ModelRouter {
    default_model: Option<String>,
    role_models: HashMap<AgentRole, String>,
}

impl ModelRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(cfg: &LlmSection) -> Self {
        let mut router = Self {
            default_model: Some(cfg.model.clone()),
            role_models: HashMap::new(),
        };
        let roles = [
            (AgentRole::Planner, &cfg.roles.planner),
            (AgentRole::Executor, &cfg.roles.executor),
            (AgentRole::Reviewer, &cfg.roles.reviewer),
            (AgentRole::Orchestrator, &cfg.roles.orchestrator),
        ];
        for (role, model) in roles {
            if let Some(model) = model {
                router.role_models.insert(role, model.clone());
            }
        }
        router
    }

    pub fn with_route(mut self, role: AgentRole, model: impl Into<String>) -> Self {
        self.role_models.insert(role, model.into());
        self
    }

    /// 角色专用模型，否则默认模型；都未配置时为 None（交给客户端默认值）
    pub fn model_for(&self, role: Option<AgentRole>) -> Option<String> {
        role.and_then(|r| self.role_models.get(&r).cloned())
            .or_else(|| self.default_model.clone())
    }
}

/// 模型 -> 单价
#[derive(Debug, Clone, Default)]
pub struct PricingTable {
    prices: HashMap<String, ModelPricing>,
}

impl PricingTable {
    pub fn new(prices: HashMap<String, ModelPricing>) -> Self {
        Self { prices }
    }

    /// 未知模型按 0 计价
    pub fn cost_usd(&self, model: &str, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        let price = self
            .prices
            .get(model)
            .or_else(|| self.prices.get("default"))
            .copied()
            .unwrap_or_default();
        (prompt_tokens as f64 / 1_000_000.0) * price.prompt_per_million
            + (completion_tokens as f64 / 1_000_000.0) * price.completion_per_million
    }
}
