use anyhow::Context;
use clap::{Parser, ValueEnum};
use dealdesk_service::{bootstrap, build_router, ServiceConfig};
use dealdesk_store::StorageConfig;
use std::net::SocketAddr;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StorageKind {
    /// Pick postgres when a database URL is configured, memory otherwise.
    Auto,
    Memory,
    Postgres,
}

#[derive(Debug, Parser)]
#[command(name = "dealdeskd", about = "Trade-compliance and funding-readiness back office")]
struct Cli {
    /// Address to listen on.
    #[arg(long, env = "DEALDESK_LISTEN", default_value = "127.0.0.1:8091")]
    listen: SocketAddr,

    /// Storage backend.
    #[arg(long, env = "DEALDESK_STORAGE", value_enum, default_value_t = StorageKind::Auto)]
    storage: StorageKind,

    /// Postgres connection string.
    #[arg(long, env = "DEALDESK_DATABASE_URL")]
    database_url: Option<String>,

    /// Postgres pool size.
    #[arg(long, env = "DEALDESK_PG_MAX_CONNECTIONS", default_value_t = 5)]
    pg_max_connections: u32,
}

fn resolve_storage(cli: &Cli) -> anyhow::Result<StorageConfig> {
    let database_url = cli
        .database_url
        .clone()
        .or_else(|| std::env::var("DATABASE_URL").ok());
    match cli.storage {
        StorageKind::Memory => Ok(StorageConfig::Memory),
        StorageKind::Postgres => {
            let database_url = database_url
                .context("--storage postgres requires --database-url or DATABASE_URL")?;
            Ok(StorageConfig::Postgres {
                database_url,
                max_connections: cli.pg_max_connections,
            })
        }
        StorageKind::Auto => Ok(match database_url {
            Some(database_url) => StorageConfig::Postgres {
                database_url,
                max_connections: cli.pg_max_connections,
            },
            None => StorageConfig::Memory,
        }),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dealdesk_service=info,dealdesk_store=info,info".into()),
        )
        .init();

    let cli = Cli::parse();
    let storage = resolve_storage(&cli)?;
    info!(backend = storage.backend_name(), listen = %cli.listen, "starting dealdeskd");

    let state = bootstrap(ServiceConfig { storage }).await?;
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(cli.listen)
        .await
        .with_context(|| format!("failed to bind {}", cli.listen))?;
    axum::serve(listener, router)
        .await
        .context("server terminated")?;
    Ok(())
}
