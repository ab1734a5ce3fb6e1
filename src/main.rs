use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crawlmesh::config::Config;
use crawlmesh::queue::{Job, PriorityJobQueue};
use crawlmesh::runtime::{Backends, ClusterStatus, NodeRuntime};

#[derive(Parser)]
#[command(
    name = "crawlmesh",
    version,
    about = "Coordination and scheduling node for a scraping cluster",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML configuration file; CRAWLMESH_* variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json); defaults to the configured format
    #[arg(long, global = true)]
    log_format: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a cluster node until interrupted
    Run {
        /// Override the node id
        #[arg(long)]
        node_id: Option<String>,

        /// Dump prometheus metrics on exit
        #[arg(long, default_value = "false")]
        metrics: bool,
    },

    /// Submit a job into its priority tier
    Submit {
        /// Job type
        #[arg(short = 't', long = "type")]
        job_type: String,

        /// Priority (0-10)
        #[arg(short, long, default_value = "5")]
        priority: u8,

        /// Required capabilities
        #[arg(short, long, value_delimiter = ',')]
        requirements: Vec<String>,

        /// JSON payload
        #[arg(long, default_value = "null")]
        payload: String,
    },

    /// Print nodes, leader, queue depths and assignments
    Status {
        /// Print as JSON
        #[arg(long, default_value = "false")]
        json: bool,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let mut config = match path {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    config.apply_env()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_ref())?;

    // Initialize tracing/logging
    let format = cli
        .log_format
        .clone()
        .unwrap_or_else(|| config.logging.format.clone());
    setup_tracing(&format, &config.logging.level, cli.verbose)?;

    match cli.command {
        Commands::Run { node_id, metrics } => {
            if let Some(node_id) = node_id {
                config.node.id = node_id;
            }
            config.validate()?;
            tracing::info!(
                node_id = %config.node.id,
                backend = ?config.coordination.backend,
                "Starting run command"
            );
            run(config, metrics).await?;
        }

        Commands::Submit {
            job_type,
            priority,
            requirements,
            payload,
        } => {
            config.validate()?;
            config.require_shared_backend("submit")?;
            tracing::info!(
                job_type = %job_type,
                priority = %priority,
                requirements = ?requirements,
                "Starting submit command"
            );
            submit(config, job_type, priority, requirements, payload).await?;
        }

        Commands::Status { json } => {
            config.validate()?;
            config.require_shared_backend("status")?;
            status(config, json).await?;
        }
    }

    Ok(())
}

fn setup_tracing(format: &str, level: &str, verbose: bool) -> Result<()> {
    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("crawlmesh=debug,info")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new(format!("crawlmesh={level},warn"))
        })
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
    }

    Ok(())
}

async fn run(config: Config, dump_metrics: bool) -> Result<()> {
    if let Err(e) = crawlmesh::metrics::init_metrics() {
        tracing::warn!(error = %e, "Metrics disabled");
    }

    let backends = Backends::connect(&config).await?;
    let runtime = NodeRuntime::start_with_backends(config, backends).await?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!(node_id = %runtime.node_id(), "Shutdown requested, leaving cluster");

    runtime.leave().await?;

    if dump_metrics {
        match crawlmesh::metrics::encode_metrics() {
            Ok(text) => println!("{text}"),
            Err(e) => tracing::warn!(error = %e, "Failed to encode metrics"),
        }
    }
    Ok(())
}

async fn submit(
    config: Config,
    job_type: String,
    priority: u8,
    requirements: Vec<String>,
    payload: String,
) -> Result<()> {
    let payload: serde_json::Value =
        serde_json::from_str(&payload).context("Payload must be valid JSON")?;

    let backends = Backends::connect(&config).await?;
    let queue = PriorityJobQueue::new(backends.broker, config.queue.clone());

    let job: Job = queue
        .new_job(job_type, priority)
        .with_requirements(requirements)
        .with_payload(payload);
    let job_id = job.id.clone();
    queue.enqueue(job).await?;

    println!("Submitted job {job_id} at priority {priority}");
    Ok(())
}

async fn status(config: Config, json: bool) -> Result<()> {
    let backends = Backends::connect(&config).await?;
    let status = ClusterStatus::collect(&config, &backends).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("Leader: {}", status.leader.as_deref().unwrap_or("(none)"));
    println!("Nodes ({}):", status.nodes.len());
    for node in &status.nodes {
        println!(
            "  {:<20} {:<9} {:<21} cpu {:.2} mem {:.2} jobs {}",
            node.id,
            node.status.as_str(),
            node.endpoint(),
            node.load.cpu,
            node.load.memory,
            node.load.active_jobs
        );
    }

    println!("Queue:");
    for (tier, depth) in status.depths.iter().rev().filter(|(_, depth)| *depth > 0) {
        println!("  p{tier:<3} {depth}");
    }
    println!("  dead letters: {}", status.dead_letters);
    println!("Assignments: {}", status.assignments.len());
    Ok(())
}
