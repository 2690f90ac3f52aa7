use clap::{Parser, Subcommand};
use conversa_gateway::GatewayServer;
use conversa_session::{
    CacheStore, MaintenanceScheduler, MemoryCacheStore, RedisCacheStore, SessionCoordinator,
    SqliteDurableStore,
};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "conversa", about = "Conversa — conversational session-state service")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "conversa.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the session gateway
    Serve {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Print durable-store counters
    Stats,
}

#[derive(Deserialize)]
struct ConversaConfig {
    #[serde(default = "default_data_dir")]
    data_dir: PathBuf,
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    cache: CacheConfig,
    #[serde(default)]
    maintenance: MaintenanceConfig,
}

impl Default for ConversaConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            server: ServerConfig::default(),
            cache: CacheConfig::default(),
            maintenance: MaintenanceConfig::default(),
        }
    }
}

#[derive(Deserialize)]
struct ServerConfig {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Deserialize)]
struct CacheConfig {
    #[serde(default = "default_cache_url")]
    url: String,
    #[serde(default = "default_ttl_secs")]
    ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            url: default_cache_url(),
            ttl_secs: default_ttl_secs(),
        }
    }
}

#[derive(Deserialize)]
struct MaintenanceConfig {
    #[serde(default = "default_interval_secs")]
    interval_secs: u64,
    #[serde(default = "default_startup_delay_secs")]
    startup_delay_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            startup_delay_secs: default_startup_delay_secs(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    3000
}
fn default_cache_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}
fn default_ttl_secs() -> u64 {
    24 * 60 * 60
}
fn default_interval_secs() -> u64 {
    4 * 60 * 60
}
fn default_startup_delay_secs() -> u64 {
    30
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();

    // Load config; every field has a default, so a missing file just means
    // running with the defaults.
    let config: ConversaConfig = match tokio::fs::read_to_string(&cli.config).await {
        Ok(raw) => toml::from_str(&raw).map_err(|e| {
            anyhow::anyhow!("Failed to parse config file '{}': {}", cli.config.display(), e)
        })?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %cli.config.display(), "no config file, using defaults");
            ConversaConfig::default()
        }
        Err(e) => {
            return Err(anyhow::anyhow!(
                "Failed to read config file '{}': {}",
                cli.config.display(),
                e
            ))
        }
    };

    tokio::fs::create_dir_all(&config.data_dir).await?;
    let db_path = config.data_dir.join("conversa.db");

    match cli.command {
        Commands::Serve { host, port } => {
            let host = host.unwrap_or(config.server.host);
            let port = port.unwrap_or(config.server.port);
            let ttl = Duration::from_secs(config.cache.ttl_secs);

            // Cache tier: networked when reachable, in-process fallback
            // otherwise. The service stays available either way.
            let cache: Arc<dyn CacheStore> =
                match RedisCacheStore::connect(&config.cache.url, ttl).await {
                    Ok(store) => {
                        info!(url = %config.cache.url, "cache tier connected");
                        Arc::new(store)
                    }
                    Err(e) => {
                        warn!(
                            url = %config.cache.url,
                            error = %e,
                            "cache tier unreachable, degrading to in-process fallback"
                        );
                        Arc::new(MemoryCacheStore::with_ttl(ttl))
                    }
                };

            let durable = Arc::new(SqliteDurableStore::open(&db_path)?);
            let coordinator = Arc::new(SessionCoordinator::new(cache, durable));

            let scheduler = Arc::new(MaintenanceScheduler::with_timing(
                coordinator.clone(),
                Duration::from_secs(config.maintenance.interval_secs),
                Duration::from_secs(config.maintenance.startup_delay_secs),
            ));
            scheduler.clone().spawn();

            let app = GatewayServer::build(coordinator, scheduler);

            let addr = format!("{host}:{port}");
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            info!("Conversa gateway listening on {}", addr);
            axum::serve(listener, app).await?;
        }
        Commands::Stats => {
            let durable = SqliteDurableStore::open(&db_path)?;
            let stats = durable.stats().await?;
            println!("turns:       {}", stats.total_turns);
            println!("transcripts: {}", stats.total_transcripts);
        }
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: ConversaConfig = toml::from_str("").unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.cache.ttl_secs, 24 * 60 * 60);
        assert_eq!(config.maintenance.interval_secs, 4 * 60 * 60);
        assert_eq!(config.maintenance.startup_delay_secs, 30);
        assert_eq!(config.data_dir, PathBuf::from("./data"));
    }

    #[test]
    fn test_partial_config_overrides_one_section() {
        let config: ConversaConfig = toml::from_str(
            r#"
            data_dir = "/var/lib/conversa"

            [server]
            port = 8080

            [cache]
            url = "redis://cache.internal:6379"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.cache.url, "redis://cache.internal:6379");
        assert_eq!(config.cache.ttl_secs, 24 * 60 * 60);
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/conversa"));
    }
}
