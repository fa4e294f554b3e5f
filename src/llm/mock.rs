//! Mock LLM 客户端（用于测试与无 API Key 的演练）
//!
//! 按顺序返回预置的脚本结果；脚本用完后回显最后一条 User 消息。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{Completion, CompletionRequest, LlmClient, LlmError, MessageRole};

/// Mock 客户端：脚本化响应 + 请求记录
#[derive(Debug, Default)]
pub struct MockLlmClient {
    script: Mutex<VecDeque<Result<Completion, LlmError>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一条成功响应（用量按 4 字符 ≈ 1 token 估算）
    pub fn push_response(&self, content: impl Into<String>) -> &Self {
        let content = content.into();
        let completion = Completion {
            completion_tokens: estimate_tokens(&content),
            prompt_tokens: 10,
            model: "mock-model".to_string(),
            content,
        };
        self.push_result(Ok(completion))
    }

    pub fn push_error(&self, err: LlmError) -> &Self {
        self.push_result(Err(err))
    }

    pub fn push_result(&self, result: Result<Completion, LlmError>) -> &Self {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(result);
        }
        self
    }

    /// 迄今收到的请求
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

fn estimate_tokens(text: &str) -> u64 {
    (text.len() / 4) as u64
}

#[async_trait]
impl LlmClient for MockLlmClient {
    fn provider(&self) -> &str {
        "mock"
    }

    fn default_model(&self) -> &str {
        "mock-model"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        let scripted = self.script.lock().ok().and_then(|mut s| s.pop_front());
        if let Some(result) = scripted {
            return result.map(|mut c| {
                if let Some(model) = &request.model {
                    c.model = model.clone();
                }
                c
            });
        }

        let last_user = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        Ok(Completion {
            content: format!("Echo from Mock: {last_user}"),
            model: request
                .model
                .clone()
                .unwrap_or_else(|| self.default_model().to_string()),
            prompt_tokens: estimate_tokens(last_user),
            completion_tokens: 4,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Message;

    #[tokio::test]
    async fn test_script_then_echo() {
        let mock = MockLlmClient::new();
        mock.push_error(LlmError::Timeout).push_response("scripted");

        let req = CompletionRequest::new(vec![Message::user("hello")]);
        assert_eq!(mock.complete(&req).await, Err(LlmError::Timeout));
        assert_eq!(mock.complete(&req).await.unwrap().content, "scripted");
        assert_eq!(mock.complete(&req).await.unwrap().content, "Echo from Mock: hello");
        assert_eq!(mock.requests().len(), 3);
    }
}
