//! medallion CLI - incremental multi-hop dataflow over durable local tables.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use medallion::{Config, MultiHopPipeline, PipelineRun};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "medallion")]
#[command(version)]
#[command(about = "Incremental raw → cleansed → aggregated pipeline with per-stage checkpoints")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline until the current backlog is drained
    Run {
        /// Run identifier; reusing one resumes from its checkpoints
        #[arg(long)]
        run_id: Option<String>,

        /// Keep streaming new arrivals until Ctrl-C instead of stopping
        /// once quiescent
        #[arg(long)]
        watch: bool,

        /// Remove the run directory after a successful drain
        #[arg(long, conflicts_with = "watch")]
        cleanup: bool,
    },

    /// Validate configuration file
    Validate,

    /// Show example configuration
    Example,
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set subscriber");
}

fn print_example_config() {
    let example = r#"# medallion configuration file

[source]
# Directory of arriving JSONL files (supports ${ENV_VAR})
dir = "/data/arrivals"
pattern = "*.json"
max_retries = 3
retry_backoff_ms = 100

[pipeline]
# Per-run checkpoints and stage tables live under here
data_dir = "/data/medallion"
trigger_interval_ms = 250
quiesce_timeout_secs = 30

[cleanse]
# Records must carry this field as a positive number to survive
required_field = "postcode"

[aggregate]
group_by = "state"
# count_field = "customer_id"
"#;
    println!("{example}");
}

fn print_summary(pipeline: &MultiHopPipeline) {
    println!("\n=== Pipeline Summary ===");
    for (stage, snapshot) in pipeline.metrics() {
        println!("{stage:<8} {snapshot}");
    }
    println!("gold summary:");
    for (key, count) in pipeline.gold_summary() {
        println!("  {key:<20} {count}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Example => {
            print_example_config();
            return Ok(());
        }

        Commands::Validate => {
            let config = Config::from_file(&cli.config)
                .with_context(|| format!("Failed to load config from {:?}", cli.config))?;

            info!("Configuration is valid");
            info!("  Source:    {} ({})", config.source.dir.display(), config.source.pattern);
            info!("  Data dir:  {}", config.pipeline.data_dir.display());
            info!("  Cleanse:   {} > 0", config.cleanse.required_field);
            info!("  Aggregate: count by {}", config.aggregate.group_by);
            return Ok(());
        }

        Commands::Run {
            run_id,
            watch,
            cleanup,
        } => {
            let config = Config::from_file(&cli.config)
                .with_context(|| format!("Failed to load config from {:?}", cli.config))?;

            let run_id = run_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let run = PipelineRun::setup(&config.pipeline.data_dir, run_id)
                .context("Failed to set up run directory")?;

            let quiesce_timeout = Duration::from_secs(config.pipeline.quiesce_timeout_secs);
            let mut pipeline = MultiHopPipeline::new(config, &run)
                .context("Failed to open pipeline tables")?;

            pipeline.start().context("Failed to start pipeline")?;
            pipeline
                .wait_until_quiescent(quiesce_timeout)
                .await
                .context("Pipeline did not drain its backlog")?;

            if watch {
                info!("Backlog drained; streaming new arrivals (Ctrl-C to stop)");
                tokio::signal::ctrl_c()
                    .await
                    .context("Failed to listen for Ctrl-C")?;
            }

            pipeline.stop().await.context("Pipeline stage failed")?;
            print_summary(&pipeline);
            println!("Run:     {}", run.run_id());
            println!("Output:  {}", run.root().display());

            if cleanup {
                run.cleanup().context("Failed to remove run directory")?;
            }
        }
    }

    Ok(())
}
