//! LLM 层：客户端抽象与实现（OpenAI 兼容 / Mock）、按角色路由与计价

pub mod mock;
pub mod openai;
pub mod router;
pub mod traits;

use std::sync::Arc;

use crate::config::AppConfig;

pub use mock::MockLlmClient;
pub use openai::OpenAiClient;
pub use router::{ModelRouter, PricingTable};
pub use traits::{Completion, CompletionRequest, LlmClient, LlmError, Message, MessageRole};

/// 根据配置与环境变量选择 LLM 后端（OpenAI 兼容 / Mock）
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    if provider == "mock" {
        tracing::info!("Using Mock LLM (configured)");
        return Arc::new(MockLlmClient::new());
    }

    // 优先 <PROVIDER>_API_KEY（如 XAI_API_KEY），其次 OPENAI_API_KEY
    let key_var = format!("{}_API_KEY", provider.to_uppercase());
    let api_key = std::env::var(&key_var)
        .ok()
        .or_else(|| std::env::var("OPENAI_API_KEY").ok());

    match api_key {
        Some(key) => {
            tracing::info!(provider = %provider, model = %cfg.llm.model, "Using OpenAI-compatible LLM");
            Arc::new(OpenAiClient::from_config(&cfg.llm, Some(&key)))
        }
        None => {
            tracing::warn!("No API key set ({} / OPENAI_API_KEY), using Mock LLM", key_var);
            Arc::new(MockLlmClient::new())
        }
    }
}
