use clap::Parser;
use hotspot_aaa::store::{MemoryStore, Stores};
use hotspot_aaa::{Config, IpamAllocator, RadiusServer, ServerConfig};
use std::process;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Hotspot AAA - RADIUS authorization, accounting and FUP enforcement
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(name = "hotspot-aaa")]
struct Cli {
    /// Path to configuration file
    #[arg(value_name = "CONFIG", default_value = "config.json")]
    config_path: String,

    /// Validate configuration and exit (doesn't start server)
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Load or create configuration (without logging first)
    let config = match Config::from_file(&cli.config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing_subscriber::registry()
                .with(EnvFilter::new("info"))
                .with(tracing_subscriber::fmt::layer())
                .init();

            if cli.validate {
                eprintln!("Configuration validation failed!");
                eprintln!("   Error: {}", e);
                process::exit(1);
            }

            if std::path::Path::new(&cli.config_path).exists() {
                error!("Could not load config file {}: {}", cli.config_path, e);
                process::exit(1);
            }

            warn!("Config file not found: {}", cli.config_path);
            info!("Creating example configuration at: {}", cli.config_path);

            if let Err(e) = Config::example().to_file(&cli.config_path) {
                error!("Error creating example config: {}", e);
                process::exit(1);
            }

            info!("Please edit {} and restart the server", cli.config_path);
            process::exit(0);
        }
    };

    if cli.validate {
        print_summary(&config);
        process::exit(0);
    }

    let log_level = config.log_level.as_deref().unwrap_or("info");
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Hotspot AAA v{}", env!("CARGO_PKG_VERSION"));
    info!("Loaded configuration from: {}", cli.config_path);

    if config.clients.is_empty() {
        warn!("No authorized clients configured, accepting requests from any address");
    } else {
        for client in config.clients.iter().filter(|c| c.enabled) {
            info!(
                address = %client.address,
                name = client.name.as_deref().unwrap_or("(unnamed)"),
                "Authorized client"
            );
        }
    }

    let stores = match build_stores(&config).await {
        Ok(stores) => stores,
        Err(e) => {
            error!("Failed to initialise storage: {}", e);
            process::exit(1);
        }
    };

    if let Some(ref path) = config.audit_log_path {
        info!("Audit logging enabled: {}", path);
    }

    let server_config = match ServerConfig::from_config(config, stores) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            process::exit(1);
        }
    };

    let server = match RadiusServer::new(server_config).await {
        Ok(srv) => srv,
        Err(e) => {
            error!("Failed to create server: {}", e);
            process::exit(1);
        }
    };

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received, draining"),
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
        shutdown.cancel();
    });

    info!("Server started, press Ctrl+C to stop");

    if let Err(e) = server.run().await {
        error!("Server error: {}", e);
        process::exit(1);
    }
}

fn print_summary(config: &Config) {
    println!("Configuration validated successfully!");
    println!();
    println!("Configuration summary:");
    println!("  Listen: {}:{}", config.listen_address, config.listen_port);
    println!("  Clients: {}", config.clients.len());
    println!("  Log level: {}", config.log_level.as_deref().unwrap_or("info"));
    println!("  Default pool: {}", config.default_pool_id);
    println!("  Lease duration: {}s", config.lease_duration_secs);
    println!(
        "  CoA: {} workers, queue {}, timeout {}ms",
        config.coa.workers, config.coa.queue_capacity, config.coa.timeout_ms
    );
    match config.postgres {
        Some(_) => println!("  Storage: postgres"),
        None => println!(
            "  Storage: memory ({} subscribers, {} vouchers, {} pools)",
            config.seed.subscribers.len(),
            config.seed.vouchers.len(),
            config.seed.pools.len()
        ),
    }
    if let Some(ref path) = config.audit_log_path {
        println!("  Audit log: {}", path);
    }
}

async fn build_stores(config: &Config) -> Result<Stores, Box<dyn std::error::Error>> {
    if let Some(ref settings) = config.postgres {
        return postgres_stores(config, settings).await;
    }

    let store = Arc::new(MemoryStore::new());
    for subscriber in &config.seed.subscribers {
        store.upsert_subscriber(subscriber.clone()).await;
    }
    for voucher in &config.seed.vouchers {
        store.upsert_voucher(voucher.clone()).await;
    }
    for fup in &config.seed.fup_configs {
        store.upsert_fup_config(fup.clone()).await;
    }

    let ipam = IpamAllocator::new(store.clone(), config.lease_duration_secs);
    for pool in &config.seed.pools {
        let pool = ipam.create_pool(pool.clone()).await?;
        info!(pool_id = pool.id, name = %pool.name, subnet = %pool.subnet, "Created IP pool");
    }

    info!(
        subscribers = config.seed.subscribers.len(),
        vouchers = config.seed.vouchers.len(),
        "Using in-memory store"
    );
    Ok(Stores::memory(store))
}

#[cfg(feature = "postgres")]
async fn postgres_stores(
    config: &Config,
    settings: &hotspot_aaa::PostgresSettings,
) -> Result<Stores, Box<dyn std::error::Error>> {
    use hotspot_aaa::store::PostgresStore;

    let store = PostgresStore::connect(settings).await?;
    store.migrate().await?;
    if !config.seed.subscribers.is_empty() || !config.seed.pools.is_empty() {
        warn!("Seed data is ignored with the postgres store");
    }
    Ok(Stores::postgres(Arc::new(store)))
}

#[cfg(not(feature = "postgres"))]
async fn postgres_stores(
    _config: &Config,
    _settings: &hotspot_aaa::PostgresSettings,
) -> Result<Stores, Box<dyn std::error::Error>> {
    Err("postgres configured but this build lacks the `postgres` feature".into())
}
