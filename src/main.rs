use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use llm_caching::agent::{DefaultMessageConverter, HistoryEntry, MessageConverter, ModelSettings};
use llm_caching::cache::key::{build_key, ExtraOptions, KeyMaterial};
use llm_caching::cache::redis::redact;
use llm_caching::cache::CacheKey;
use llm_caching::config::Config;
use llm_caching::costs::{self, TokenCounts};
use llm_caching::CachingRunner;

#[derive(Parser)]
#[command(name = "llm-caching")]
#[command(about = "Inspect and manage the LLM result cache", long_about = None)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,
    /// Store URL (overrides LLM_CACHE_REDIS_URL and the config file)
    #[arg(long, global = true)]
    redis_url: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective cost table
    Costs,
    /// Compute the cost of a call
    Estimate {
        #[arg(long)]
        model: String,
        /// Prompt tokens, cached ones included
        #[arg(long)]
        input: u64,
        #[arg(long)]
        output: u64,
        #[arg(long, default_value_t = 0)]
        cached_input: u64,
        #[arg(long, default_value_t = 0)]
        cache_write: u64,
    },
    /// Print the cache key for a request
    Key {
        #[arg(long)]
        model: String,
        #[arg(long)]
        prompt: String,
        #[arg(long)]
        task: String,
        /// Agent configuration fingerprint
        #[arg(long, default_value = "")]
        identity: String,
        /// JSON file with the conversation history
        #[arg(long)]
        history: Option<PathBuf>,
    },
    /// Show metadata of a stored result
    Inspect { key: String },
    /// Delete a stored result
    Evict { key: String },
    /// Reset the expiry of a stored result
    Extend {
        key: String,
        #[arg(long)]
        ttl_secs: u64,
    },
    /// Show the configuration
    Config {
        /// Show current configuration
        #[arg(short, long)]
        show: bool,
        /// Print the config file location
        #[arg(long)]
        path: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    match cli.command {
        Commands::Costs => print_costs()?,
        Commands::Estimate {
            model,
            input,
            output,
            cached_input,
            cache_write,
        } => {
            let tokens = TokenCounts {
                input_tokens: input,
                output_tokens: output,
                cached_input_tokens: cached_input.min(input),
                cached_output_tokens: 0,
                cache_write_tokens: cache_write,
            };
            let config = Config::load()?;
            let cost = costs::compute_cost(&model, &tokens, Some(&config.costs))?;
            println!("{cost:.6}");
        }
        Commands::Key {
            model,
            prompt,
            task,
            identity,
            history,
        } => print_key(&model, &prompt, &task, &identity, history)?,
        Commands::Inspect { key } => inspect(cli.redis_url.as_deref(), &key).await?,
        Commands::Evict { key } => {
            let runner = connect(cli.redis_url.as_deref())?;
            let removed = runner.result_store().evict(&CacheKey::parse(&key)?).await?;
            println!("{}", if removed { "Evicted" } else { "Not found" });
        }
        Commands::Extend { key, ttl_secs } => {
            if ttl_secs == 0 {
                anyhow::bail!("--ttl-secs must be greater than zero");
            }
            let runner = connect(cli.redis_url.as_deref())?;
            let updated = runner
                .result_store()
                .extend(&CacheKey::parse(&key)?, Duration::from_secs(ttl_secs))
                .await?;
            println!("{}", if updated { "Extended" } else { "Not found" });
        }
        Commands::Config { show, path } => handle_config(show, path)?,
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "llm_caching=info".into());

    // Logs go to stderr so command output stays pipeable
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn connect(redis_url: Option<&str>) -> Result<CachingRunner> {
    let config = Config::load()?;
    CachingRunner::connect(&config, redis_url).context("Failed to set up result store")
}

fn print_costs() -> Result<()> {
    let config = Config::load()?;
    println!(
        "{:<32} {:>10} {:>10} {:>12} {:>11}",
        "model", "input", "output", "cache write", "cache read"
    );
    for (model, costs) in costs::effective_table(Some(&config.costs)) {
        println!(
            "{:<32} {:>10.4} {:>10.4} {:>12.4} {:>11.4}",
            model,
            costs.cost_per_million_input_tokens,
            costs.cost_per_million_output_tokens,
            costs.cost_per_million_cache_write_tokens,
            costs.cost_per_million_cache_read_tokens
        );
    }
    Ok(())
}

fn print_key(
    model: &str,
    prompt: &str,
    task: &str,
    identity: &str,
    history: Option<PathBuf>,
) -> Result<()> {
    let entries: Vec<HistoryEntry> = match history {
        Some(path) => {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read history file {}", path.display()))?;
            serde_json::from_str(&content).context("History file must be a JSON array")?
        }
        None => Vec::new(),
    };
    let messages = DefaultMessageConverter.convert(&entries)?;

    let key = build_key(&KeyMaterial {
        model_name: model,
        agent_identity: identity,
        prompt,
        history: &messages,
        task_name: task,
        settings: &ModelSettings::default(),
        extra_options: &ExtraOptions::new(),
    })?;
    println!("{key}");
    Ok(())
}

async fn inspect(redis_url: Option<&str>, key: &str) -> Result<()> {
    let key = CacheKey::parse(key)?;
    let runner = connect(redis_url)?;

    match runner.result_store().inspect(&key).await? {
        Some((summary, ttl)) => {
            println!("{}", serde_json::to_string_pretty(&summary)?);
            match ttl {
                Some(ttl) => println!("expires in {}s", ttl.as_secs()),
                None => println!("no expiry"),
            }
        }
        None => println!("Not found"),
    }
    Ok(())
}

fn handle_config(show: bool, path: bool) -> Result<()> {
    if path {
        println!("{}", Config::config_path()?.display());
        return Ok(());
    }

    let config = Config::load()?;
    if show {
        let mut shown = config.clone();
        shown.store.url = shown.store.url.as_deref().map(redact);
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(&shown)?);
        return Ok(());
    }

    match config.validate() {
        Ok(()) => println!("Configuration is valid. Use --show to view it."),
        Err(e) => anyhow::bail!("Invalid configuration: {e}"),
    }
    Ok(())
}
