//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；支持 OpenAI、xAI、DeepSeek、自建代理等。

use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::config::LlmSection;
use crate::llm::{Completion, CompletionRequest, LlmClient, LlmError, Message, MessageRole};

/// OpenAI 兼容客户端：持有 Client、provider 名与默认模型
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    provider: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    timeout: Duration,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new().with_api_base(url).with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            provider: "openai".to_string(),
            model: model.to_string(),
            temperature: 0.7,
            max_tokens: 4096,
            timeout: Duration::from_secs(60),
        }
    }

    /// 按 [llm] 段创建客户端
    pub fn from_config(cfg: &LlmSection, api_key: Option<&str>) -> Self {
        let mut client = Self::new(cfg.base_url.as_deref(), &cfg.model, api_key);
        client.provider = cfg.provider.to_lowercase();
        client.temperature = cfg.temperature;
        client.max_tokens = cfg.max_tokens;
        client.timeout = Duration::from_secs(cfg.request_timeout_secs.max(1));
        client
    }

    fn to_openai_messages(
        &self,
        messages: &[Message],
    ) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
        messages
            .iter()
            .map(|m| {
                let built = match m.role {
                    MessageRole::System => ChatCompletionRequestSystemMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map(ChatCompletionRequestMessage::System),
                    MessageRole::User => ChatCompletionRequestUserMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map(ChatCompletionRequestMessage::User),
                    MessageRole::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map(ChatCompletionRequestMessage::Assistant),
                };
                built.map_err(|e| LlmError::InvalidRequest(e.to_string()))
            })
            .collect()
    }
}

/// 将 async_openai 错误映射为可区分瞬时 / 永久的 LlmError
fn classify_error(err: OpenAIError) -> LlmError {
    match err {
        OpenAIError::Reqwest(e) => {
            if e.is_timeout() {
                LlmError::Timeout
            } else {
                LlmError::Network(e.to_string())
            }
        }
        OpenAIError::ApiError(api) => {
            let message = api.message.to_lowercase();
            if message.contains("rate limit") || message.contains("too many requests") {
                LlmError::RateLimited { retry_after_ms: 0 }
            } else if message.contains("overloaded")
                || message.contains("server error")
                || message.contains("temporarily")
            {
                LlmError::ServiceUnavailable(api.message)
            } else {
                LlmError::ApiError(api.message)
            }
        }
        OpenAIError::InvalidArgument(msg) => LlmError::InvalidRequest(msg),
        other => LlmError::ApiError(other.to_string()),
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    #[allow(deprecated)]
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
        let model = request.model.clone().unwrap_or_else(|| self.model.clone());
        let api_request = CreateChatCompletionRequestArgs::default()
            .model(&model)
            .messages(self.to_openai_messages(&request.messages)?)
            .temperature(request.temperature.unwrap_or(self.temperature))
            .max_tokens(request.max_tokens.unwrap_or(self.max_tokens))
            .build()
            .map_err(|e| LlmError::InvalidRequest(e.to_string()))?;

        let response = tokio::time::timeout(self.timeout, self.client.chat().create(api_request))
            .await
            .map_err(|_| LlmError::Timeout)?
            .map_err(classify_error)?;

        let (prompt_tokens, completion_tokens) = response
            .usage
            .as_ref()
            .map(|u| (u.prompt_tokens as u64, u.completion_tokens as u64))
            .unwrap_or((0, 0));

        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        tracing::debug!(
            provider = %self.provider,
            model = %model,
            prompt_tokens,
            completion_tokens,
            "llm completion"
        );

        Ok(Completion {
            content,
            model,
            prompt_tokens,
            completion_tokens,
        })
    }
}
