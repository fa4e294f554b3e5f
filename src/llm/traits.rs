//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 LlmClient：给定消息与模型，返回文本与用量。
//! LlmError 区分瞬时（超时、网络、限流）与永久错误，供能力层映射为 AbilityError。

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 消息角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// 对话消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// 一次补全请求；model 为 None 时使用客户端默认模型
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// 补全结果与本次调用的用量
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub content: String,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("LLM request timed out")]
    Timeout,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limited (retry after {retry_after_ms}ms)")]
    RateLimited { retry_after_ms: u64 },

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl LlmError {
    /// 超时、网络、限流、服务暂不可用可以重试
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmError::Timeout
                | LlmError::Network(_)
                | LlmError::RateLimited { .. }
                | LlmError::ServiceUnavailable(_)
        )
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            LlmError::RateLimited { retry_after_ms } => Some(Duration::from_millis(*retry_after_ms)),
            _ => None,
        }
    }
}

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 用量记录中的 provider 名
    fn provider(&self) -> &str;

    fn default_model(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(LlmError::Timeout.is_transient());
        assert!(LlmError::RateLimited { retry_after_ms: 10 }.is_transient());
        assert!(!LlmError::InvalidRequest("bad".into()).is_transient());
        assert!(!LlmError::ApiError("401".into()).is_transient());
        assert_eq!(
            LlmError::RateLimited { retry_after_ms: 1500 }.retry_after(),
            Some(Duration::from_millis(1500))
        );
    }
}
