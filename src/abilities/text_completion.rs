//! 文本补全能力：把任务交给 LLM
//!
//! 提示词由任务描述、会话目标与上游任务输出拼成（每个上游输出截取前 500 字符）；
//! 模型按任务角色路由，成本按配置的单价计算。

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::abilities::{Ability, AbilityError, AbilityOutput, AbilityRequest};
use crate::core::metrics::MetricsRecord;
use crate::llm::{CompletionRequest, LlmClient, LlmError, Message, ModelRouter, PricingTable};

/// 上游输出注入提示词时的截断长度（字符）
const UPSTREAM_PREVIEW_CHARS: usize = 500;

pub struct TextCompletionAbility {
    llm: Arc<dyn LlmClient>,
    router: ModelRouter,
    pricing: PricingTable,
}

impl TextCompletionAbility {
    pub fn new(llm: Arc<dyn LlmClient>, router: ModelRouter, pricing: PricingTable) -> Self {
        Self {
            llm,
            router,
            pricing,
        }
    }

    fn usage_record(&self, model: &str, prompt: u64, completion: u64, elapsed_ms: u64) -> MetricsRecord {
        let cost = self.pricing.cost_usd(model, prompt, completion);
        MetricsRecord {
            execution_time_ms: elapsed_ms,
            ..MetricsRecord::from_usage(self.llm.provider(), model, prompt, completion, cost)
        }
    }
}

/// 拼接任务提示词
pub fn build_task_prompt(request: &AbilityRequest) -> String {
    let mut prompt = format!("Complete this task: {}", request.instruction);
    if !request.objective.is_empty() {
        prompt.push_str(&format!("\nObjective: {}", request.objective));
    }
    if !request.upstream.is_empty() {
        prompt.push_str("\n\nPrevious outputs:");
        for (id, output) in &request.upstream {
            let preview: String = output.chars().take(UPSTREAM_PREVIEW_CHARS).collect();
            let ellipsis = if output.chars().count() > UPSTREAM_PREVIEW_CHARS { "..." } else { "" };
            prompt.push_str(&format!("\n\nOutput from task #{id}:\n{preview}{ellipsis}"));
        }
    }
    prompt
}

impl From<LlmError> for AbilityError {
    fn from(err: LlmError) -> Self {
        if err.is_transient() {
            AbilityError::Transient {
                retry_after: err.retry_after(),
                message: err.to_string(),
                usage: None,
            }
        } else {
            AbilityError::Permanent(err.to_string())
        }
    }
}

#[async_trait]
impl Ability for TextCompletionAbility {
    fn name(&self) -> &str {
        "text-completion"
    }

    fn description(&self) -> &str {
        "Ask the language model to complete the task in writing, using the outputs of dependency tasks as context."
    }

    fn provider(&self) -> &str {
        self.llm.provider()
    }

    async fn invoke(&self, request: AbilityRequest) -> Result<AbilityOutput, AbilityError> {
        let role = request.role;
        let mut completion_request = CompletionRequest::new(vec![Message::user(build_task_prompt(&request))]);
        completion_request.model = self.router.model_for(role);

        let start = Instant::now();
        let completion = self.llm.complete(&completion_request).await?;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let usage = self.usage_record(
            &completion.model,
            completion.prompt_tokens,
            completion.completion_tokens,
            elapsed_ms,
        );
        if completion.content.trim().is_empty() {
            return Err(AbilityError::Transient {
                message: "LLM returned an empty completion".to_string(),
                retry_after: None,
                usage: Some(usage),
            });
        }

        tracing::debug!(
            task_id = request.task_id,
            role = role.map(|r| r.as_str()).unwrap_or("-"),
            model = %completion.model,
            "text completion finished"
        );
        Ok(AbilityOutput::with_usage(completion.content, usage))
    }
}
