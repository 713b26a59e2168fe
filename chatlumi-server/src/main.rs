use clap::Parser;
use chatlumi_core::{ChatLumiConfig, GraphClient};
use chatlumi_server::http::HttpState;
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "chatlumi.toml")]
    config: String,

    /// Check database connectivity and exit
    #[arg(long)]
    health: bool,

    /// Apply migrations and exit
    #[arg(long)]
    migrate_only: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (dev convenience — production uses real env vars)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Load config
    let config = match ChatLumiConfig::load(&args.config) {
        Ok(c) => c,
        Err(file_err) => match ChatLumiConfig::from_env() {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Failed to load config from {}: {}", args.config, file_err);
                eprintln!("Environment fallback failed: {}", e);
                std::process::exit(1);
            }
        },
    };

    // Init logging; RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.service.log_level));
    fmt().with_env_filter(filter).init();

    // Connect to DB
    let pool = match chatlumi_core::db::create_pool(&config.database).await {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Failed to connect to database: {}", e);
            std::process::exit(1);
        }
    };

    if args.health {
        match chatlumi_core::db::health_check(&pool).await {
            Ok(v) => println!("✅ PostgreSQL connected: {}", v),
            Err(e) => {
                println!("❌ PostgreSQL connection failed: {}", e);
                std::process::exit(1);
            }
        }
        println!("✅ ChatLumi DB health check passed");
        return Ok(());
    }

    chatlumi_core::db::run_migrations(&pool).await?;
    tracing::info!("Database migrations applied");

    if args.migrate_only {
        return Ok(());
    }

    let graph = GraphClient::new(&config.facebook)?;
    if config.facebook.app_id.is_empty() || config.facebook.app_secret.is_empty() {
        tracing::warn!("Facebook app credentials not configured; page connection will fail");
    }

    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    // Expired session cleanup
    let purge_pool = pool.clone();
    let purge_config = config.auth.clone();
    let purge_shutdown = tx.subscribe();
    tokio::spawn(async move {
        chatlumi_server::auth::run_session_purge_loop(purge_pool, purge_config, purge_shutdown)
            .await;
    });

    let state = HttpState {
        pool,
        config,
        graph,
    };
    chatlumi_server::http::start_http_server(state, tx.subscribe()).await?;

    Ok(())
}
