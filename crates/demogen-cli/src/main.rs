//! demogen CLI
//!
//! Regenerates the demo environment and inspects what a run left behind:
//! - `run`: the full pipeline, ending in READY or FAILED
//! - `entities` / `plan`: the deterministic universe and prompt plan, without side effects
//! - `validate`: re-run the readiness canaries against an existing warehouse
//! - `search` / `query-view`: the surfaces a conversational agent consumes

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use demogen_core::PipelineConfig;
use demogen_index::{
    AnalyticService, LocalAnalyticService, LocalSearchService, SearchService, ViewQuery,
};
use demogen_llm::{CompletionService, OfflineCompletionService};
use demogen_pipeline::validate::guaranteed_names_from;
use demogen_pipeline::{generate_universe, render_prompts, Pipeline, ReadinessValidator};
use demogen_storage::Warehouse;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod output;

#[derive(Parser)]
#[command(name = "demogen")]
#[command(author, version, about = "Deterministic synthetic data and document generation for demo environments")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GlobalArgs {
    /// TOML configuration file (defaults apply when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override `warehouse_dir`
    #[arg(long, global = true)]
    warehouse: Option<PathBuf>,

    /// Print JSON instead of the human summary
    #[arg(long, global = true)]
    json: bool,

    /// Log filter, e.g. `debug` or `demogen_llm=trace` (default: RUST_LOG or `info`)
    #[arg(long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline
    Run {
        /// Use the deterministic offline completion service
        #[arg(long)]
        offline: bool,
    },

    /// Print the generated entity universe
    Entities,

    /// Render prompts and print the plan
    Plan {
        /// Print every rendered prompt
        #[arg(long)]
        show_prompts: bool,

        /// Only this source type
        #[arg(long)]
        source: Option<String>,
    },

    /// Re-run the readiness canaries against the current warehouse
    Validate,

    /// Query-preview a search index
    Search {
        /// Index name, e.g. `broker_research_search`
        index: String,

        query: String,

        #[arg(short, long, default_value_t = 5)]
        limit: usize,
    },

    /// Query an analytic view
    QueryView {
        /// View name, e.g. `company_financials`
        view: String,

        /// Dimension names or synonyms to group by
        #[arg(short, long = "dimension")]
        dimensions: Vec<String>,

        /// Metric names or synonyms
        #[arg(short, long = "metric", required = true)]
        metrics: Vec<String>,

        /// `dimension=value` filters
        #[arg(short, long = "filter")]
        filters: Vec<String>,

        #[arg(short, long)]
        limit: Option<usize>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.global.log_level.as_deref());

    match dispatch(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("{} {e:#}", "error:".red().bold());
            ExitCode::from(2)
        }
    }
}

fn init_logging(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_config(global: &GlobalArgs) -> Result<PipelineConfig> {
    let mut config = PipelineConfig::load(global.config.as_deref())
        .with_context(|| "failed to load configuration")?;
    if let Some(dir) = &global.warehouse {
        config.warehouse_dir = dir.clone();
    }
    tracing::debug!(
        seed = config.seed,
        warehouse = %config.warehouse_dir.display(),
        sources = config.sources.len(),
        "configuration loaded"
    );
    Ok(config)
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| anyhow!("failed to initialize tokio runtime: {e}"))
}

/// Returns whether the command succeeded (drives the exit code).
fn dispatch(cli: Cli) -> Result<bool> {
    let global = cli.global;
    match cli.command {
        Commands::Run { offline } => cmd_run(&global, offline),
        Commands::Entities => cmd_entities(&global),
        Commands::Plan {
            show_prompts,
            source,
        } => cmd_plan(&global, show_prompts, source.as_deref()),
        Commands::Validate => cmd_validate(&global),
        Commands::Search {
            index,
            query,
            limit,
        } => cmd_search(&global, &index, &query, limit),
        Commands::QueryView {
            view,
            dimensions,
            metrics,
            filters,
            limit,
        } => {
            let filters = filters
                .iter()
                .map(|f| {
                    f.split_once('=')
                        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                        .ok_or_else(|| anyhow!("filter `{f}` must look like `dimension=value`"))
                })
                .collect::<Result<Vec<_>>>()?;
            let query = ViewQuery {
                dimensions,
                metrics,
                filters,
                limit,
            };
            cmd_query_view(&global, &view, &query)
        }
    }
}

fn cmd_run(global: &GlobalArgs, offline: bool) -> Result<bool> {
    let config = load_config(global)?;
    let service: Arc<dyn CompletionService> = if offline {
        Arc::new(OfflineCompletionService::new())
    } else {
        let service = demogen_llm::providers::from_env().context(
            "no completion provider configured (set OPENAI_API_KEY, ANTHROPIC_API_KEY or LOCAL_LLM_URL, or pass --offline)",
        )?;
        Arc::from(service)
    };

    let pipeline = Pipeline::new(config, service)?;
    let summary = runtime()?.block_on(pipeline.run());

    if global.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        output::print_summary(&summary);
    }
    Ok(summary.is_ready())
}

fn cmd_entities(global: &GlobalArgs) -> Result<bool> {
    let config = load_config(global)?;
    let universe = generate_universe(&config)?;

    if global.json {
        println!("{}", serde_json::to_string_pretty(universe.entities())?);
        return Ok(true);
    }
    println!(
        "{} {} entities (seed {})",
        "Universe:".green().bold(),
        universe.len(),
        config.seed
    );
    for entity in universe.entities() {
        let latest = entity
            .latest()
            .map(|m| format!("{} revenue {:.1}m", m.quarter, m.revenue))
            .unwrap_or_default();
        let name = if entity.pinned {
            entity.name.yellow().bold()
        } else {
            entity.name.normal()
        };
        println!(
            "  {:<16} {:<28} {:<6} {:<10} {:<14} {}",
            entity.id.dimmed(),
            name,
            entity.ticker,
            entity.category,
            entity.sector,
            latest
        );
    }
    Ok(true)
}

fn cmd_plan(global: &GlobalArgs, show_prompts: bool, source: Option<&str>) -> Result<bool> {
    let config = load_config(global)?;
    if let Some(name) = source {
        if config.source(name).is_none() {
            bail!("unknown source `{name}`");
        }
    }
    let universe = generate_universe(&config)?;
    let prompts: Vec<_> = render_prompts(&config, &universe)?
        .into_iter()
        .filter(|p| source.map_or(true, |s| p.source_type == s))
        .collect();

    if global.json {
        println!("{}", serde_json::to_string_pretty(&prompts)?);
        return Ok(true);
    }

    let mut counts: BTreeMap<(&str, &str), usize> = BTreeMap::new();
    for p in &prompts {
        *counts.entry((p.source_type.as_str(), p.model.as_str())).or_default() += 1;
    }
    println!("{} {} prompts", "Plan:".green().bold(), prompts.len());
    for ((source, model), n) in &counts {
        println!("  {:<20} {:<16} {}", source.cyan(), model, n);
    }

    if show_prompts {
        for p in &prompts {
            println!();
            println!("{} {} [{}]", "──".dimmed(), p.id.yellow(), p.title);
            println!("{}", p.text);
        }
    }
    Ok(true)
}

fn cmd_validate(global: &GlobalArgs) -> Result<bool> {
    let config = load_config(global)?;
    let warehouse = Arc::new(Warehouse::open(&config.warehouse_dir)?);
    let search = LocalSearchService::new(Arc::clone(&warehouse));
    let analytic = LocalAnalyticService::new(Arc::clone(&warehouse));
    let guaranteed = guaranteed_names_from(&warehouse)?;

    let validator = ReadinessValidator::new(&config, &search, &analytic);
    let results = runtime()?.block_on(validator.run(&guaranteed));

    if global.json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        output::print_validation(&results);
    }
    Ok(results.iter().all(|r| r.passed))
}

fn cmd_search(global: &GlobalArgs, index: &str, query: &str, limit: usize) -> Result<bool> {
    let config = load_config(global)?;
    let warehouse = Arc::new(Warehouse::open(&config.warehouse_dir)?);
    let search = LocalSearchService::new(warehouse);
    let hits = runtime()?.block_on(search.preview(index, query, limit))?;

    if global.json {
        println!("{}", serde_json::to_string_pretty(&hits)?);
    } else {
        output::print_hits(index, query, &hits);
    }
    Ok(true)
}

fn cmd_query_view(global: &GlobalArgs, view: &str, query: &ViewQuery) -> Result<bool> {
    let config = load_config(global)?;
    let warehouse = Arc::new(Warehouse::open(&config.warehouse_dir)?);
    let analytic = LocalAnalyticService::new(warehouse);
    let result = runtime()?.block_on(analytic.query_view(view, query))?;

    if global.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        output::print_view_result(&result);
    }
    Ok(true)
}
