#[cfg(any(target_os = "linux", target_os = "macos"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

mod actions;
mod audit;
mod config;
mod db;
mod events;
mod ingest;
mod jobs;
mod metrics;
mod normalize;
mod stats;
mod store;
mod worker;

use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    // Load environment file.
    // - Default: .env discovered from current working directory and parents.
    // - Override: EVALFLOW_ENV_FILE=/absolute/path/to/envfile
    if let Ok(path) = std::env::var("EVALFLOW_ENV_FILE") {
        if !path.trim().is_empty() {
            if let Err(e) = dotenvy::from_path(&path) {
                eprintln!("Warning: failed to load EVALFLOW_ENV_FILE '{}': {}", path, e);
            }
        } else {
            let _ = dotenvy::dotenv();
        }
    } else {
        let _ = dotenvy::dotenv();
    }

    // Tracing. LOG_LEVEL is honored when RUST_LOG is unset.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
            EnvFilter::new(level)
        }))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or("serve");

    match command {
        "--version" | "-V" => {
            println!("evalflow {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        "--help" | "-h" => {
            println!("evalflow {}", env!("CARGO_PKG_VERSION"));
            println!("{}\n", env!("CARGO_PKG_DESCRIPTION"));
            println!("Usage: evalflow [COMMAND]\n");
            println!("Commands:");
            println!("  serve             Run the HTTP ingest + query server (default)");
            println!("  work              Run the raw-event materialization worker");
            println!("  job:rollup        Refresh hourly metric rollups");
            println!("  job:anomalies     Scan recent evaluations for outliers");
            println!("  job:significance  Test version-over-version performance shifts");
            println!("  job:auto-eval     Detect metric drift and propose mitigations");
            println!("  job:slo           Evaluate rollups against SLO thresholds");
            println!("  job:backtest      Join signals with outcomes and score them");
            println!("\nOptions:");
            println!("  -h, --help       Print help");
            println!("  -V, --version    Print version");
            return Ok(());
        }
        _ => {}
    }

    let config = config::Config::from_env()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(command, config))
}

async fn run(command: &str, config: config::Config) -> anyhow::Result<()> {
    let pool = db::connect(&config).await?;
    db::migrations::migrate_all(&pool).await?;

    match command {
        "serve" => ingest::serve(pool, config).await,
        "work" => worker::run(pool, config).await,
        "job:rollup" => jobs::rollup::run(&pool, &config).await,
        "job:anomalies" => jobs::anomaly::run(&pool, &config).await,
        "job:significance" => jobs::significance::run(&pool, &config).await,
        "job:auto-eval" => jobs::drift::run(&pool, &config).await,
        "job:slo" => jobs::slo::run(&pool, &config).await,
        "job:backtest" => jobs::backtest::run(&pool, &config).await,
        other => {
            anyhow::bail!("unknown command '{}' (see --help)", other);
        }
    }
}
