//! Planner：目标 -> 任务列表
//!
//! LlmTaskPlanner 让 planner 角色的模型输出 JSON 任务列表，extract_task_list 宽松地从回复中提取；
//! StaticPlanner 直接读取 JSON 文件。descriptors_to_tasks 校验形状与能力名，依赖引用由任务图整批校验。

use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use crate::abilities::AbilityRegistry;
use crate::core::error::GraphError;
use crate::core::metrics::MetricsRecord;
use crate::core::task::{AgentRole, Task, TaskDescriptor};
use crate::llm::{CompletionRequest, LlmClient, LlmError, Message, ModelRouter, PricingTable};

#[derive(Error, Debug)]
pub enum PlannerError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("No task list found in planner output")]
    NoTaskList,

    #[error("Failed to read task file {path}: {message}")]
    Io { path: String, message: String },

    #[error("Invalid task file: {0}")]
    Parse(String),
}

/// 规划结果；usage 是规划调用本身的用量（不走 LLM 的 Planner 为 None）
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub tasks: Vec<TaskDescriptor>,
    pub usage: Option<MetricsRecord>,
}

/// 任务规划器：给定目标与可用能力，产出任务描述符列表
#[async_trait]
pub trait TaskPlanner: Send + Sync {
    async fn plan(&self, objective: &str, abilities: &[(String, String)]) -> Result<Plan, PlannerError>;
}

/// 规划提示词：目标、可用能力与输出格式
pub fn build_planning_prompt(objective: &str, abilities: &[(String, String)]) -> String {
    let ability_lines: Vec<String> = abilities
        .iter()
        .map(|(name, desc)| format!("- {name}: {desc}"))
        .collect();
    format!(
        "You are a task planner. Break the objective below into a short list of concrete tasks.\n\n\
         Objective: {objective}\n\n\
         Available abilities:\n{}\n\n\
         Respond with a JSON array only. Each item must have:\n\
         \"id\" (integer, sequential from 1), \"task\" (description), \"ability\" (one of the names above),\n\
         \"dependent_task_ids\" (ids of earlier tasks this one needs), \"status\": \"incomplete\".",
        ability_lines.join("\n")
    )
}

pub struct LlmTaskPlanner {
    llm: Arc<dyn LlmClient>,
    router: ModelRouter,
    pricing: PricingTable,
}

impl LlmTaskPlanner {
    pub fn new(llm: Arc<dyn LlmClient>, router: ModelRouter) -> Self {
        Self {
            llm,
            router,
            pricing: PricingTable::default(),
        }
    }

    pub fn with_pricing(mut self, pricing: PricingTable) -> Self {
        self.pricing = pricing;
        self
    }
}

#[async_trait]
impl TaskPlanner for LlmTaskPlanner {
    async fn plan(&self, objective: &str, abilities: &[(String, String)]) -> Result<Plan, PlannerError> {
        let mut request = CompletionRequest::new(vec![Message::user(build_planning_prompt(objective, abilities))]);
        request.model = self.router.model_for(Some(AgentRole::Planner));

        let start = Instant::now();
        let completion = self.llm.complete(&request).await?;
        let cost = self
            .pricing
            .cost_usd(&completion.model, completion.prompt_tokens, completion.completion_tokens);
        let usage = MetricsRecord {
            execution_time_ms: start.elapsed().as_millis() as u64,
            ..MetricsRecord::from_usage(
                self.llm.provider(),
                completion.model.as_str(),
                completion.prompt_tokens,
                completion.completion_tokens,
                cost,
            )
        };
        tracing::info!(
            model = %completion.model,
            prompt_tokens = completion.prompt_tokens,
            completion_tokens = completion.completion_tokens,
            cost_usd = cost,
            "planner responded"
        );
        let tasks = extract_task_list(&completion.content).ok_or_else(|| {
            tracing::warn!(response = %completion.content, "could not extract task list");
            PlannerError::NoTaskList
        })?;
        tracing::info!(count = tasks.len(), "initial task list created");
        Ok(Plan {
            tasks,
            usage: Some(usage),
        })
    }
}

/// 固定任务列表（来自文件或代码）
#[derive(Debug, Clone, Default)]
pub struct StaticPlanner {
    descriptors: Vec<TaskDescriptor>,
}

impl StaticPlanner {
    pub fn from_descriptors(descriptors: Vec<TaskDescriptor>) -> Self {
        Self { descriptors }
    }

    /// 读取 JSON 数组（或 {"tasks": [...]}）
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, PlannerError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| PlannerError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let value: Value = serde_json::from_str(&text).map_err(|e| PlannerError::Parse(e.to_string()))?;
        let descriptors = descriptors_from_value(value).ok_or_else(|| {
            PlannerError::Parse("expected a JSON array of task objects".to_string())
        })?;
        Ok(Self { descriptors })
    }
}

#[async_trait]
impl TaskPlanner for StaticPlanner {
    async fn plan(&self, _objective: &str, _abilities: &[(String, String)]) -> Result<Plan, PlannerError> {
        Ok(Plan {
            tasks: self.descriptors.clone(),
            usage: None,
        })
    }
}

fn descriptors_from_value(value: Value) -> Option<Vec<TaskDescriptor>> {
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("tasks") {
            Some(Value::Array(items)) => items,
            _ => return None,
        },
        _ => return None,
    };
    items
        .into_iter()
        .map(serde_json::from_value::<TaskDescriptor>)
        .collect::<Result<Vec<_>, _>>()
        .ok()
}

fn parse_descriptors(text: &str) -> Option<Vec<TaskDescriptor>> {
    serde_json::from_str::<Value>(text.trim())
        .ok()
        .and_then(descriptors_from_value)
}

fn loose_object_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{[^{}]*\}").ok()).as_ref()
}

fn bare_key_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"([{,])\s*([A-Za-z_][A-Za-z0-9_]*)\s*:").ok())
        .as_ref()
}

/// 宽松提取任务列表，依次尝试：整段 JSON、```json 代码块、首个 [ 到末个 ]、拼接零散的 {...}（单引号、未加引号的键）
pub fn extract_task_list(text: &str) -> Option<Vec<TaskDescriptor>> {
    let trimmed = text.trim();
    if let Some(list) = parse_descriptors(trimmed) {
        return Some(list);
    }

    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        let block = rest.find("```").map(|end| &rest[..end]).unwrap_or(rest);
        if let Some(list) = parse_descriptors(block) {
            return Some(list);
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('['), trimmed.rfind(']')) {
        if start < end {
            let slice = &trimmed[start..=end];
            if let Some(list) = parse_descriptors(slice).or_else(|| parse_descriptors(&slice.replace('\'', "\""))) {
                return Some(list);
            }
        }
    }

    let objects: Vec<&str> = loose_object_pattern()?
        .find_iter(trimmed)
        .map(|m| m.as_str())
        .collect();
    if objects.is_empty() {
        return None;
    }
    let combined = format!("[{}]", objects.join(",")).replace('\'', "\"");
    let combined = bare_key_pattern()?.replace_all(&combined, "$1\"$2\":");
    parse_descriptors(&combined)
}

/// 校验描述符形状与能力名并转为任务；依赖引用交给 TaskGraph::add_batch 整批校验
pub fn descriptors_to_tasks(
    descriptors: &[TaskDescriptor],
    registry: &AbilityRegistry,
) -> Result<Vec<Task>, GraphError> {
    if descriptors.is_empty() {
        return Err(GraphError::MalformedTaskList("task list is empty".to_string()));
    }
    descriptors
        .iter()
        .enumerate()
        .map(|(index, d)| {
            let id = d
                .id
                .ok_or_else(|| GraphError::MalformedTaskList(format!("item {index}: missing id")))?;
            let description = d
                .task
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| GraphError::MalformedTaskList(format!("task #{id}: missing description")))?;
            let ability = d
                .ability
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| GraphError::MalformedTaskList(format!("task #{id}: missing ability")))?;
            if !registry.contains(ability) {
                return Err(GraphError::MalformedTaskList(format!(
                    "task #{id}: unknown ability '{ability}'"
                )));
            }
            if let Some(status) = d.status.as_deref() {
                if !matches!(status.trim().to_lowercase().as_str(), "" | "incomplete" | "pending") {
                    return Err(GraphError::MalformedTaskList(format!(
                        "task #{id}: unexpected initial status '{status}'"
                    )));
                }
            }

            let mut task = Task::new(id, description, ability)
                .with_dependencies(d.dependent_task_ids.clone().unwrap_or_default());
            match d.role.as_deref().map(|r| (r, AgentRole::parse(r))) {
                Some((_, Some(role))) => task = task.with_role(role),
                Some((raw, None)) => tracing::warn!(task_id = id, role = %raw, "ignoring unknown role"),
                None => {}
            }
            Ok(task)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abilities::EchoAbility;
    use crate::llm::MockLlmClient;

    fn registry() -> AbilityRegistry {
        let mut registry = AbilityRegistry::new();
        registry.register(EchoAbility).unwrap();
        registry
    }

    #[test]
    fn test_extract_plain_json() {
        let list = extract_task_list(
            r#"[{"id": 1, "task": "Research", "ability": "echo", "dependent_task_ids": [], "status": "incomplete"}]"#,
        )
        .unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].task.as_deref(), Some("Research"));
    }

    #[test]
    fn test_extract_fenced_block_with_description_alias() {
        let text = "Here is the plan:\n```json\n[{\"id\": 1, \"description\": \"Outline\", \"ability\": \"echo\"}]\n```\nGood luck";
        let list = extract_task_list(text).unwrap();
        assert_eq!(list[0].task.as_deref(), Some("Outline"));
    }

    #[test]
    fn test_extract_single_quoted_array() {
        let text = "Plan: [{'id': 1, 'task': 'Draft', 'ability': 'echo', 'dependent_task_ids': []}] done";
        let list = extract_task_list(text).unwrap();
        assert_eq!(list[0].ability.as_deref(), Some("echo"));
    }

    #[test]
    fn test_extract_loose_objects_with_bare_keys() {
        let text = "Task one {id: 1, task: 'A', ability: 'echo'} then {id: 2, task: 'B', ability: 'echo'}";
        let list = extract_task_list(text).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].id, Some(2));
    }

    #[test]
    fn test_extract_nothing() {
        assert!(extract_task_list("I cannot help with that.").is_none());
    }

    #[test]
    fn test_descriptors_to_tasks_checks_shape_and_ability() {
        let registry = registry();
        let ok = descriptors_to_tasks(
            &[
                TaskDescriptor::new(1, "Plan the outline", "echo"),
                TaskDescriptor::new(2, "Write it", "echo").depends_on([1]),
            ],
            &registry,
        )
        .unwrap();
        assert_eq!(ok[1].dependent_task_ids.iter().copied().collect::<Vec<_>>(), vec![1]);

        let mut missing = TaskDescriptor::new(1, "x", "echo");
        missing.ability = None;
        assert!(matches!(
            descriptors_to_tasks(&[missing], &registry),
            Err(GraphError::MalformedTaskList(_))
        ));
        assert!(matches!(
            descriptors_to_tasks(&[TaskDescriptor::new(1, "x", "nope")], &registry),
            Err(GraphError::MalformedTaskList(_))
        ));
        assert!(matches!(
            descriptors_to_tasks(&[], &registry),
            Err(GraphError::MalformedTaskList(_))
        ));
    }

    #[test]
    fn test_role_hint_is_applied() {
        let mut d = TaskDescriptor::new(1, "Anything", "echo");
        d.role = Some("reviewer".into());
        let tasks = descriptors_to_tasks(&[d], &registry()).unwrap();
        assert_eq!(tasks[0].role, Some(AgentRole::Reviewer));
    }

    #[tokio::test]
    async fn test_llm_planner_uses_planner_model() {
        let mock = Arc::new(MockLlmClient::new());
        mock.push_response(r#"[{"id": 1, "task": "Go", "ability": "echo"}]"#);
        let router = ModelRouter::new().with_route(AgentRole::Planner, "planner-model");
        let mut prices = std::collections::HashMap::new();
        prices.insert(
            "planner-model".to_string(),
            crate::config::ModelPricing {
                prompt_per_million: 1_000_000.0,
                completion_per_million: 0.0,
            },
        );
        let planner = LlmTaskPlanner::new(mock.clone(), router).with_pricing(PricingTable::new(prices));

        let abilities = vec![("echo".to_string(), "repeat".to_string())];
        let plan = planner.plan("Ship it", &abilities).await.unwrap();
        assert_eq!(plan.tasks.len(), 1);
        let usage = plan.usage.unwrap();
        assert_eq!(usage.model, "planner-model");
        assert_eq!(usage.prompt_tokens, 10);
        assert!(usage.total_tokens > 10);
        assert!((usage.cost_usd - 10.0).abs() < 1e-9);
        let request = &mock.requests()[0];
        assert_eq!(request.model.as_deref(), Some("planner-model"));
        assert!(request.messages[0].content.contains("- echo: repeat"));
    }

    #[tokio::test]
    async fn test_llm_planner_without_json_fails() {
        let mock = Arc::new(MockLlmClient::new());
        mock.push_response("no plan today");
        let planner = LlmTaskPlanner::new(mock, ModelRouter::new());
        assert!(matches!(planner.plan("x", &[]).await, Err(PlannerError::NoTaskList)));
    }

    #[test]
    fn test_static_planner_from_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        std::io::Write::write_all(
            &mut file,
            br#"{"tasks": [{"id": 1, "task": "Echo me", "ability": "echo", "dependent_task_ids": []}]}"#,
        )
        .unwrap();
        let planner = StaticPlanner::from_file(file.path()).unwrap();
        assert_eq!(planner.descriptors.len(), 1);
        assert!(StaticPlanner::from_file("/nonexistent/tasks.json").is_err());
    }
}
