//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `REASONLOOP__*` 覆盖（双下划线表示嵌套，如 `REASONLOOP__EXECUTOR__MAX_RETRIES=3`）。
//! 配置加载一次后显式传给 Orchestrator / Executor，不存在进程级可变全局设置。

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub executor: ExecutorSection,
    pub abilities: AbilitiesSection,
    pub report: ReportSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 未通过命令行给出目标时使用
    pub default_objective: Option<String>,
}

/// [llm] 段：后端、模型、按角色的模型覆盖、定价
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// [llm.roles]：planner / executor / reviewer / orchestrator 各自的模型
    #[serde(default)]
    pub roles: RoleModelsSection,
    /// [llm.pricing.<model>]：每百万 token 的美元价格
    #[serde(default)]
    pub pricing: HashMap<String, ModelPricing>,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            request_timeout_secs: default_request_timeout(),
            roles: RoleModelsSection::default(),
            pricing: HashMap::new(),
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_request_timeout() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RoleModelsSection {
    pub planner: Option<String>,
    pub executor: Option<String>,
    pub reviewer: Option<String>,
    pub orchestrator: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq)]
pub struct ModelPricing {
    #[serde(default)]
    pub prompt_per_million: f64,
    #[serde(default)]
    pub completion_per_million: f64,
}

/// [executor] 段：重试、超时、并发
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorSection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 首次重试前的等待（秒），之后每次翻倍
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: f64,
    #[serde(default = "default_max_retry_delay")]
    pub max_retry_delay_secs: f64,
    /// 单次能力调用超时（秒）
    #[serde(default = "default_ability_timeout")]
    pub ability_timeout_secs: u64,
    /// 并发执行的任务数上限（1 = 串行）
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// 无 Ready 任务时的重新轮询间隔（毫秒）
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay(),
            max_retry_delay_secs: default_max_retry_delay(),
            ability_timeout_secs: default_ability_timeout(),
            max_workers: default_max_workers(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_delay() -> f64 {
    2.0
}

fn default_max_retry_delay() -> f64 {
    30.0
}

fn default_ability_timeout() -> u64 {
    120
}

fn default_max_workers() -> usize {
    1
}

fn default_poll_interval() -> u64 {
    500
}

/// [abilities] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AbilitiesSection {
    #[serde(default)]
    pub web_scrape: WebScrapeSection,
    #[serde(default)]
    pub web_search: WebSearchSection,
}

/// [abilities.web_scrape] 段：超时、最大字符数、域名白名单（为空表示不限制）
#[derive(Debug, Clone, Deserialize)]
pub struct WebScrapeSection {
    #[serde(default = "default_scrape_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_result_chars")]
    pub max_result_chars: usize,
    #[serde(default)]
    pub allowed_domains: Vec<String>,
}

impl Default for WebScrapeSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_scrape_timeout(),
            max_result_chars: default_max_result_chars(),
            allowed_domains: Vec::new(),
        }
    }
}

fn default_scrape_timeout() -> u64 {
    10
}

fn default_max_result_chars() -> usize {
    8000
}

/// [abilities.web_search] 段：是否注册、结果条数、超时、搜索端点
#[derive(Debug, Clone, Deserialize)]
pub struct WebSearchSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_results_count")]
    pub results_count: usize,
    #[serde(default = "default_scrape_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_search_endpoint")]
    pub endpoint: String,
}

impl Default for WebSearchSection {
    fn default() -> Self {
        Self {
            enabled: true,
            results_count: default_results_count(),
            timeout_secs: default_scrape_timeout(),
            endpoint: default_search_endpoint(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_results_count() -> usize {
    5
}

fn default_search_endpoint() -> String {
    "https://html.duckduckgo.com/html/".to_string()
}

/// [report] 段：会话报告输出目录（未设置则不落盘）
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ReportSection {
    pub output_dir: Option<PathBuf>,
}

/// 从 config 目录加载配置，环境变量 REASONLOOP__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 REASONLOOP__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!(path = %path.display(), "config file not found, skipping");
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("REASONLOOP")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
