//! ReasonLoop 命令行入口
//!
//! 加载配置、注册能力、选择 Planner（LLM 或 --tasks 指定的 JSON 文件），运行一个会话并把 JSON 报告打印到 stdout。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use reasonloop::abilities::default_registry;
use reasonloop::config::load_config;
use reasonloop::core::{LlmTaskPlanner, Orchestrator, ShutdownManager, StaticPlanner, TaskPlanner};
use reasonloop::llm::{create_llm_from_config, ModelRouter, PricingTable};
use reasonloop::observability;

#[derive(Parser, Debug)]
#[command(name = "reasonloop", version, about = "Plan an objective into tasks and run them with pluggable abilities")]
struct Args {
    /// 会话目标（缺省时使用 [app].default_objective）
    #[arg(short, long)]
    objective: Option<String>,

    /// 额外的 TOML 配置文件
    #[arg(long)]
    config: Option<PathBuf>,

    /// 从 JSON 文件读取任务列表，不调用 LLM Planner
    #[arg(long)]
    tasks: Option<PathBuf>,

    /// 列出已注册的能力后退出
    #[arg(short = 'l', long)]
    list_abilities: bool,

    #[arg(short, long)]
    verbose: bool,

    /// 覆盖 [executor].max_workers
    #[arg(long)]
    workers: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    observability::init(args.verbose);

    let mut cfg = load_config(args.config.clone()).context("Failed to load config")?;
    if let Some(workers) = args.workers {
        cfg.executor.max_workers = workers;
    }

    let llm = create_llm_from_config(&cfg);
    let registry = default_registry(&cfg, llm.clone()).context("Failed to register abilities")?;

    if args.list_abilities {
        for (name, description) in registry.descriptions() {
            println!("{name:<18} {description}");
        }
        return Ok(());
    }

    let objective = args
        .objective
        .or_else(|| cfg.app.default_objective.clone())
        .context("No objective given (use --objective or set [app].default_objective)")?;

    let planner: Arc<dyn TaskPlanner> = match &args.tasks {
        Some(path) => Arc::new(
            StaticPlanner::from_file(path)
                .with_context(|| format!("Failed to load task list from {}", path.display()))?,
        ),
        None => Arc::new(
            LlmTaskPlanner::new(llm, ModelRouter::from_config(&cfg.llm))
                .with_pricing(PricingTable::new(cfg.llm.pricing.clone())),
        ),
    };

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    let mut orchestrator = Orchestrator::new(&cfg, registry, planner).with_cancellation(shutdown.token());
    tracing::info!(session_id = %orchestrator.session_id(), "starting session");

    let report = orchestrator.run(&objective).await.context("Session failed")?;
    println!("{}", report.to_json_pretty().context("Failed to render report")?);
    Ok(())
}
