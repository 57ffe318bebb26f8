use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use beacon::api::{self, middleware::SecurityConfig, AppState};
use beacon::db::Database;
use beacon::registry::ClientRegistry;

#[derive(Parser)]
#[command(name = "beacond")]
#[command(about = "Configuration distribution server with inheritance, publish and rollback")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the Beacon server
    Serve {
        /// Port for HTTP API
        #[arg(short, long, default_value = "3000")]
        port: u16,

        /// Database file (defaults to the platform data directory)
        #[arg(long)]
        db: Option<PathBuf>,
    },
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "beacon=debug,tower_http=debug".into()),
    );

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Cadence of the stale-session sweep. Staleness reporting works without the
/// sweep, so this only bounds memory held by long-dead connections.
const SWEEP_INTERVAL_SECS: u64 = 300;
const SWEEP_MAX_AGE_MINS: i64 = 15;

async fn serve(port: u16, db_path: Option<PathBuf>) -> anyhow::Result<()> {
    let db = match db_path {
        Some(path) => Database::open(path)?,
        None => Database::open_default()?,
    };
    db.migrate()?;

    let registry = ClientRegistry::new();
    let sweeper = registry.clone();
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(SWEEP_INTERVAL_SECS));
        loop {
            ticker.tick().await;
            sweeper.evict_stale(chrono::Duration::minutes(SWEEP_MAX_AGE_MINS));
        }
    });

    let state = AppState {
        db,
        registry,
        security: SecurityConfig::from_env(),
    };
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!("Beacon server listening on http://127.0.0.1:{}", port);

    axum::serve(listener, app).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Some(Commands::Serve { port, db }) => {
            tracing::info!("Starting Beacon server on port {}", port);
            serve(port, db).await?;
        }
        None => {
            // Default: start server on the default port
            tracing::info!("Starting Beacon server on port 3000");
            serve(3000, None).await?;
        }
    }

    Ok(())
}
