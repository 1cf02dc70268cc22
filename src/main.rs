use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use futures::future::join_all;
use http::Method;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ratecord::config::ClientConfig;
use ratecord::ratelimit::RateLimiter;
use ratecord::rest::{ReqwestTransport, RestClient};

/// Call a Discord API route and watch the rate limiter pace the calls.
#[derive(Debug, Parser)]
#[command(name = "ratecord", version, about)]
struct Args {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long)]
    config: Option<String>,

    /// Bot token
    #[arg(long, env = "DISCORD_TOKEN", hide_env_values = true)]
    token: String,

    /// API path to GET, relative to the configured base URL
    #[arg(short, long, default_value = "users/@me")]
    route: String,

    /// Rate limit bucket key; defaults to the route
    #[arg(short, long)]
    bucket: Option<String>,

    /// Number of concurrent requests to issue
    #[arg(short = 'n', long, default_value_t = 5)]
    count: usize,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);
    if args.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("Starting ratecord");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = ClientConfig::load(args.config.as_deref())?;
    info!(api_base = %config.rest.api_base, "Configuration loaded");

    let limiter = Arc::new(RateLimiter::from_config(&config.rate_limiting)?);
    info!(rules = limiter.rules().len(), "Rate limiter initialized");

    let transport = Arc::new(ReqwestTransport::new(&args.token, &config.rest)?);
    let client = RestClient::new(transport, limiter, config.rest.clone());

    let bucket = args.bucket.unwrap_or_else(|| args.route.clone());
    let started = Instant::now();

    let calls = (0..args.count).map(|i| {
        let client = &client;
        let route = &args.route;
        let bucket = &bucket;
        async move {
            let result = client.request(Method::GET, route, bucket, None, None).await;
            (i, started.elapsed(), result)
        }
    });

    let mut failures = 0;
    for (i, elapsed, result) in join_all(calls).await {
        match result {
            Ok(response) => info!(
                call = i,
                status = %response.status,
                elapsed_ms = elapsed.as_millis() as u64,
                "Request completed"
            ),
            Err(e) => {
                failures += 1;
                warn!(call = i, error = %e, "Request failed");
            }
        }
    }

    let bucket = client.limiter().get_bucket(&bucket);
    if let Some(state) = bucket.try_snapshot() {
        info!(
            bucket = %bucket.key(),
            remaining = state.remaining,
            phase = ?state.phase(tokio::time::Instant::now()),
            "Final bucket state"
        );
    }

    info!(
        requests = args.count,
        failures,
        total_ms = started.elapsed().as_millis() as u64,
        "Run finished"
    );
    Ok(())
}
