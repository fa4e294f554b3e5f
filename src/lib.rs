//! ReasonLoop - 多能力 LLM 任务编排
//!
//! 模块划分：
//! - **abilities**: Ability trait、注册表与内置能力（text-completion / web-scrape / echo）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 任务图、调度、执行与重试、指标、Planner、编排主循环与会话报告
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）、按角色路由与计价
//! - **observability**: 日志初始化

pub mod abilities;
pub mod config;
pub mod core;
pub mod llm;
pub mod observability;

pub use abilities::{default_registry, Ability, AbilityRegistry};
pub use crate::core::{Orchestrator, SessionPhase, SessionReport};
