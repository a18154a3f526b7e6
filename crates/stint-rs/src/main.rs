//! Command-line front end for stint-rs.
//!
//! # Examples
//!
//! ```sh
//! # Print the configuration JSON schema
//! stint schema
//!
//! # Check a config file
//! stint validate --config stint.json
//!
//! # Run an in-memory episode and eviction walkthrough, printing a JSON report
//! stint simulate --config stint.json --max-tokens 4000
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::json;
use stint_rs::audit::RecordingAuditEmitter;
use stint_rs::budget::LoggingObserver;
use stint_rs::ids::generate_id;
use stint_rs::memory::ClientDefaults;
use stint_rs::prelude::*;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const DEMO_TENANT: &str = "demo-tenant";

/// Budget-metered agent episodes and tiered memory eviction.
#[derive(Parser)]
#[command(name = "stint", version)]
struct Cli {
    /// Log filter used when `RUST_LOG` is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the JSON schema for the configuration file.
    Schema,
    /// Load and validate a configuration file.
    Validate {
        #[arg(long)]
        config: PathBuf,
    },
    /// Drive an episode tree and a memory sweep in process memory.
    Simulate {
        #[arg(long)]
        config: Option<PathBuf>,

        /// Token ceiling for the root episode when the config sets none.
        #[arg(long, default_value_t = 4000)]
        max_tokens: u64,

        /// Memory token ceiling when the config sets none.
        #[arg(long, default_value_t = 600)]
        memory_tokens: u64,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let outcome = match cli.command {
        Command::Schema => print_json(&json_schema_for::<StintConfig>()),
        Command::Validate { config } => StintConfig::load(&config).map(|_| {
            println!("{}: ok", config.display());
        }),
        Command::Simulate {
            config,
            max_tokens,
            memory_tokens,
        } => match load_or_default(config.as_ref()) {
            Ok(config) => simulate(config, max_tokens, memory_tokens).await,
            Err(e) => Err(e),
        },
    };

    if let Err(e) = outcome {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn load_or_default(path: Option<&PathBuf>) -> Result<StintConfig> {
    match path {
        Some(path) => StintConfig::load(path),
        None => Ok(StintConfig::default()),
    }
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn simulate(mut config: StintConfig, max_tokens: u64, memory_tokens: u64) -> Result<()> {
    if config.default_budget.max_tokens.is_none() {
        config.default_budget.max_tokens = Some(max_tokens);
    }
    if config.default_budget.max_subcalls.is_none() {
        config.default_budget.max_subcalls = Some(2);
    }
    if config.eviction.max_total_tokens.is_none() {
        config.eviction.max_total_tokens = Some(memory_tokens);
    }

    let audit = Arc::new(RecordingAuditEmitter::new());
    let sessions = Arc::new(
        config
            .build_session_manager()
            .with_observer(Arc::new(LoggingObserver)),
    );
    let service = config.build_episode_service(
        Arc::new(InMemoryEpisodeStore::new()),
        sessions,
        audit.clone(),
    );

    // ── Episode tree ───────────────────────────────────────────────

    let root = service
        .create_episode(
            NewEpisode::new("planner", "research", DEMO_TENANT)
                .with_input(json!({ "question": "What changed in the last release?" })),
        )
        .await?;
    service.start(&root.id).await?;

    let guard = service.guard(&root.id).await?;
    let plan: String = guard
        .guard_model_call("planner-model", "Plan the research steps.", 400, || async {
            Ok::<_, StintError>(
                ModelOutcome::new("search, read, summarize".to_string()).with_usage(ModelUsage {
                    input_tokens: 120,
                    output_tokens: 180,
                }),
            )
        })
        .await?;
    let hits: u64 = guard
        .guard_tool_call("search", || async { Ok::<_, StintError>(3) })
        .await?;
    info!("plan: {plan}; {hits} search hits");

    let child = service
        .spawn_subcall(
            &root.id,
            SubcallRequest::new("summarize", json!({ "hits": hits })).with_agent("summarizer"),
        )
        .await?;
    service.start(&child.id).await?;
    let child_guard = service.guard(&child.id).await?;
    let summary: String = child_guard
        .guard_model_call("summarizer-model", "Summarize the hits.", 200, || async {
            Ok::<_, StintError>(ModelOutcome::new("three notable changes".to_string()))
        })
        .await?;
    let child = service
        .complete(&child.id, json!({ "summary": summary }))
        .await?;

    service.suspend(&root.id, Some(json!({ "step": "review" }))).await?;
    service.resume(&root.id).await?;
    let root = service
        .complete(&root.id, json!({ "answer": child.output }))
        .await?;

    // ── Memory ─────────────────────────────────────────────────────

    let memory: Arc<dyn MemoryStore> = Arc::new(InMemoryMemoryStore::new());
    let pinned = config.build_pinned_manager(memory.clone());
    pinned
        .initialize_client(
            DEMO_TENANT,
            &ClientDefaults {
                brand_voice: Some("Plain, direct, and friendly.".to_string()),
                compliance_rules: Some("Never quote customer data verbatim.".to_string()),
            },
        )
        .await?;

    let now = Utc::now();
    let tiers = [
        (MemoryPriority::Ephemeral, 150),
        (MemoryPriority::Ephemeral, 150),
        (MemoryPriority::Sliding, 200),
        (MemoryPriority::Session, 250),
    ];
    for (priority, size) in tiers {
        let entry = MemoryEntry::new(generate_id("mem"), DEMO_TENANT, priority, size, now);
        memory.insert(entry).await?;
    }

    let engine = config.build_eviction_engine(memory.clone(), audit.clone());
    let pressure = engine.needs_eviction().await?;
    let eviction = engine.auto_evict(true).await?;

    let report = json!({
        "root": root,
        "child": child,
        "pressure": pressure,
        "eviction": eviction,
        "pinned_usage": pinned.usage(DEMO_TENANT).await?,
        "injection_context": pinned.get_injection_context(DEMO_TENANT, None).await?,
        "audit": audit.kinds(),
    });
    print_json(&report)
}
