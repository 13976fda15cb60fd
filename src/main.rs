use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use rand::Rng;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tollgate::config::TollgateConfig;
use tollgate::ratelimit::TokenBucketLimiter;

/// Demonstrate the token bucket limiter with a burst of requests.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Burst size, overriding the configuration
    #[arg(long)]
    limit: Option<u64>,

    /// Refill interval in milliseconds, overriding the configuration
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Number of requests in the initial burst
    #[arg(long, default_value_t = 10)]
    requests: u32,

    /// Pause after the burst in milliseconds (defaults to the refill interval)
    #[arg(long)]
    wait_ms: Option<u64>,

    /// Number of distinct clients to spread the burst across
    #[arg(long, default_value_t = 1)]
    clients: u32,

    /// Print a JSON summary instead of one line per request
    #[arg(long)]
    json: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[derive(Debug, Serialize)]
struct Outcome {
    request: u32,
    client: String,
    allowed: bool,
}

#[derive(Debug, Serialize)]
struct Summary {
    limit: u64,
    interval_ms: u64,
    burst: Vec<Outcome>,
    waited_ms: u64,
    after_wait: Outcome,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = TollgateConfig::load(args.config.as_deref())?;
    if let Some(limit) = args.limit {
        config.limiter.limit = limit;
    }
    if let Some(interval_ms) = args.interval_ms {
        config.limiter.interval = Duration::from_millis(interval_ms);
    }
    let interval_ms = u64::try_from(config.limiter.interval.as_millis()).unwrap_or(u64::MAX);
    info!(
        limit = config.limiter.limit,
        interval_ms = interval_ms,
        "Configuration loaded"
    );

    let limiter = TokenBucketLimiter::with_config(&config.limiter)?;

    if !args.json {
        println!(
            "Simulating burst of {} requests (limit is {} per {}ms)...",
            args.requests, config.limiter.limit, interval_ms
        );
    }

    let mut rng = rand::thread_rng();
    let mut burst = Vec::with_capacity(args.requests as usize);
    for request in 1..=args.requests {
        let client = if args.clients > 1 {
            format!("user{}", rng.gen_range(0..args.clients))
        } else {
            "user123".to_string()
        };
        let outcome = Outcome {
            request,
            allowed: limiter.allow(&client),
            client,
        };
        if !args.json {
            println!(
                "Request {} ({}): {}",
                outcome.request,
                outcome.client,
                status(outcome.allowed)
            );
        }
        burst.push(outcome);
    }

    let waited_ms = args.wait_ms.unwrap_or(interval_ms);
    if !args.json {
        println!("\nWaiting for {}ms...", waited_ms);
    }
    tokio::time::sleep(Duration::from_millis(waited_ms)).await;

    let client = burst
        .first()
        .map(|outcome| outcome.client.clone())
        .unwrap_or_else(|| "user123".to_string());
    let after_wait = Outcome {
        request: args.requests + 1,
        allowed: limiter.allow(&client),
        client,
    };
    if !args.json {
        println!("Simulating 1 more request...");
        println!("Request {}", status(after_wait.allowed));
    }

    limiter.stop().await;

    if args.json {
        let summary = Summary {
            limit: config.limiter.limit,
            interval_ms,
            burst,
            waited_ms,
            after_wait,
        };
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }

    Ok(())
}

fn status(allowed: bool) -> &'static str {
    if allowed {
        "Allowed"
    } else {
        "Rejected"
    }
}

/// Initialize tracing, honoring `RUST_LOG` and defaulting to `info`.
fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .with_writer(std::io::stderr)
            .init();
    }
}
