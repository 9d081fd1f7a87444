//! DKG node CLI
//!
//! `run` serves the node until Ctrl-C. The operation subcommands start the
//! node, submit one operation, wait for it to finish and print the final
//! record as JSON.

use std::{path::PathBuf, process, time::Duration};

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use dkg_node::{AssertionRequest, BlockchainId, Node, NodeConfig, OperationId, TransportKind};
use env_logger::Env;

/// Command-line arguments for a DKG node
#[derive(Parser, Debug)]
#[command(
    name = "dkg-node",
    about = "Knowledge-graph replication node",
    version = env!("CARGO_PKG_VERSION")
)]
struct Args {
    /// Path to node configuration file
    #[arg(
        long,
        value_name = "PATH",
        help = "JSON file containing the node configuration"
    )]
    config: PathBuf,

    /// Logging level
    #[arg(
        long,
        value_name = "LEVEL",
        default_value = "info",
        help = "Set logging level (error, warn, info, debug, trace)"
    )]
    log_level: String,

    /// Enable verbose output
    #[arg(
        short,
        long,
        help = "Enable verbose logging (equivalent to --log-level=debug)"
    )]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve protocol requests until interrupted
    Run,

    /// Publish an assertion read from an n-quads file
    Publish(AssertionOpts),

    /// Replace an assertion with a new version read from an n-quads file
    Update(AssertionOpts),

    /// Fetch an assertion by its dataset root
    Get {
        #[arg(long)]
        key: String,
        #[arg(long)]
        blockchain: String,
        #[clap(flatten)]
        wait: WaitOpts,
    },

    /// Search assertions by keyword
    Search {
        #[arg(long)]
        keyword: String,
        #[arg(long)]
        blockchain: String,
        #[arg(long)]
        limit: Option<usize>,
        #[clap(flatten)]
        wait: WaitOpts,
    },
}

#[derive(ClapArgs, Debug)]
struct AssertionOpts {
    /// n-quads file, one triple per line
    #[arg(long, value_name = "PATH")]
    file: PathBuf,
    #[arg(long)]
    blockchain: String,
    /// Override the configured replication floor
    #[arg(long)]
    min_acks: Option<usize>,
    #[clap(flatten)]
    wait: WaitOpts,
}

#[derive(ClapArgs, Debug)]
struct WaitOpts {
    /// Seconds to wait for the operation to finish
    #[arg(long, default_value_t = 120)]
    timeout_secs: u64,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging first so we can log errors properly
    let log_level = if args.verbose {
        "debug"
    } else {
        &args.log_level
    };

    if let Err(e) =
        env_logger::Builder::from_env(Env::default().default_filter_or(log_level)).try_init()
    {
        eprintln!("Failed to initialize logger: {e}");
        process::exit(1);
    }

    if let Err(e) = run(args).await {
        log::error!("DKG node failed: {e}");
        // Log the error chain for better debugging
        let mut source = e.source();
        while let Some(err) = source {
            log::error!("Caused by: {err}");
            source = err.source();
        }
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let config = NodeConfig::load_from_file(&args.config)
        .with_context(|| format!("Failed to load configuration from '{}'", args.config.display()))?;
    log::info!(
        "Loaded configuration for {} with {} bootstrap peers",
        config.peer_id,
        config.peers.len()
    );

    let peer_id = config.peer_id.clone();
    let node = Node::new(config, TransportKind::Udp)
        .await
        .with_context(|| format!("Failed to create node {peer_id}"))?;
    node.start().await.context("Failed to start node")?;

    let submitted = match args.command {
        Command::Run => return serve(&node).await,
        Command::Publish(opts) => {
            let (request, wait) = assertion_request(opts).await?;
            (node.publish(request).await?, wait)
        }
        Command::Update(opts) => {
            let (request, wait) = assertion_request(opts).await?;
            (node.update(request).await?, wait)
        }
        Command::Get {
            key,
            blockchain,
            wait,
        } => (node.get(BlockchainId::new(blockchain), key).await?, wait),
        Command::Search {
            keyword,
            blockchain,
            limit,
            wait,
        } => (
            node.search(BlockchainId::new(blockchain), keyword, limit)
                .await?,
            wait,
        ),
    };
    let (id, wait): (OperationId, WaitOpts) = submitted;

    let record = node
        .wait_for(id, Duration::from_secs(wait.timeout_secs))
        .await
        .with_context(|| format!("Operation {id} did not finish"))?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    node.shutdown().await;
    Ok(())
}

async fn serve(node: &Node) -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to install CTRL+C signal handler")?;
    log::info!("Received shutdown signal, stopping node...");
    node.shutdown().await;
    Ok(())
}

async fn assertion_request(opts: AssertionOpts) -> Result<(AssertionRequest, WaitOpts)> {
    let content = tokio::fs::read_to_string(&opts.file)
        .await
        .with_context(|| format!("Failed to read assertion file: {}", opts.file.display()))?;
    let assertion: Vec<String> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_owned)
        .collect();
    if assertion.is_empty() {
        anyhow::bail!("Assertion file {} contains no triples", opts.file.display());
    }
    Ok((
        AssertionRequest {
            blockchain: BlockchainId::new(opts.blockchain),
            assertion,
            min_ack_responses: opts.min_acks,
        },
        opts.wait,
    ))
}
