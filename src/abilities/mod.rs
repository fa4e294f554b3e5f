//! 能力层：Ability trait、注册表与内置能力（text-completion / web-scrape / web-search / echo）

pub mod echo;
pub mod registry;
pub mod text_completion;
pub mod web_scrape;
pub mod web_search;

use std::sync::Arc;

pub use echo::EchoAbility;
pub use registry::{Ability, AbilityError, AbilityOutput, AbilityRequest, AbilityRegistry, RegistryError};
pub use text_completion::{build_task_prompt, TextCompletionAbility};
pub use web_scrape::WebScrapeAbility;
pub use web_search::WebSearchAbility;

use crate::config::AppConfig;
use crate::llm::{LlmClient, ModelRouter, PricingTable};

/// 注册全部内置能力；[abilities.web_search].enabled = false 时不注册 web-search
pub fn default_registry(cfg: &AppConfig, llm: Arc<dyn LlmClient>) -> Result<AbilityRegistry, RegistryError> {
    let mut registry = AbilityRegistry::new();
    registry.register(TextCompletionAbility::new(
        llm,
        ModelRouter::from_config(&cfg.llm),
        PricingTable::new(cfg.llm.pricing.clone()),
    ))?;
    registry.register(WebScrapeAbility::from_config(&cfg.abilities.web_scrape))?;
    if cfg.abilities.web_search.enabled {
        registry.register(WebSearchAbility::from_config(&cfg.abilities.web_search))?;
    }
    registry.register(EchoAbility)?;
    Ok(registry)
}
