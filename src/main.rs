use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use http::{HeaderValue, Response};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gatekeeper::config::GatekeeperConfig;
use gatekeeper::error::GatekeeperError;
use gatekeeper::ratelimit::subject::FORWARDED_FOR;
use gatekeeper::ratelimit::{
    CounterStore, MemoryStore, RateLimiter, RedisStore, RequestInfo, RouteTable,
};

/// Inspect and exercise Gatekeeper rate limits.
#[derive(Debug, Parser)]
#[command(name = "gatekeeper", version, about)]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run requests through both checkpoints and print each decision
    Check(CheckArgs),
    /// Verify that the counter store is reachable
    Ping,
}

#[derive(Debug, Args)]
struct CheckArgs {
    /// Method of the resolved route
    #[arg(long, default_value = "GET")]
    method: String,

    /// Path template of the resolved route
    #[arg(long)]
    path: String,

    /// Transport-level client address
    #[arg(long)]
    remote_addr: Option<IpAddr>,

    /// Value of the X-Forwarded-For header
    #[arg(long)]
    forwarded_for: Option<String>,

    /// Authenticated identity as a JSON document
    #[arg(long)]
    identity: Option<String>,

    /// Number of requests to send
    #[arg(short = 'n', long, default_value_t = 1)]
    requests: u32,

    /// Count in process memory instead of the configured store
    #[arg(long)]
    memory: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    let config = GatekeeperConfig::load(cli.config.as_deref())?;
    info!(namespace = %config.namespace, "Configuration loaded");

    match cli.command {
        Command::Ping => {
            let store = RedisStore::connect(&config.store).await?;
            store.ping().await?;
            println!("counter store at {} is reachable", config.store.host);
        }
        Command::Check(args) => check(config, args).await?,
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn check(config: GatekeeperConfig, args: CheckArgs) -> anyhow::Result<()> {
    let routes = match config.routes_path {
        Some(ref path) => RouteTable::from_file(path)?,
        None => RouteTable::new(),
    };

    let store: Arc<dyn CounterStore> = if args.memory {
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(RedisStore::connect(&config.store).await?)
    };

    let identity = match args.identity {
        Some(ref raw) => serde_json::from_str(raw).context("--identity is not valid JSON")?,
        None => serde_json::Value::Null,
    };

    let limiter = RateLimiter::new(config, routes, store);

    for n in 1..=args.requests {
        let mut ctx = RequestInfo::new(args.method.as_str(), args.path.as_str())
            .with_identity(identity.clone());
        ctx.remote_addr = args.remote_addr;
        if let Some(ref forwarded) = args.forwarded_for {
            ctx.headers
                .insert(FORWARDED_FOR, HeaderValue::from_str(forwarded)?);
        }

        match limiter.run_checkpoints(&mut ctx).await {
            Ok(()) => {
                let mut response = Response::new(());
                limiter.on_post_handler(&ctx, &mut response);
                println!("#{n} {} {:?}", response.status(), response.headers());
            }
            Err(err @ GatekeeperError::LimitExceeded(_)) => {
                let response = err.into_response();
                println!("#{n} {} {:?} {}", response.status(), response.headers(), response.body());
            }
            Err(err) => {
                warn!(error = %err, request = n, "Checkpoint failed");
                return Err(err.into());
            }
        }
    }

    Ok(())
}
