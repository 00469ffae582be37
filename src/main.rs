use anyhow::{Context, Result};
use clap::Parser;
use ldap_client_core::{Config, LdapConnectionPool};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "ldap-pool-check")]
#[command(about = "Build an LDAP connection pool from a config file, run health-check sweeps and report pool statistics")]
struct Args {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Number of health-check sweeps to run
    #[arg(long, default_value_t = 1)]
    sweeps: u32,

    /// Seconds between sweeps
    #[arg(long, value_name = "SECONDS", default_value_t = 5)]
    interval_sec: u64,

    /// Print statistics in Prometheus text format
    #[arg(long)]
    prometheus: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("ldap_client_core={},ldap_pool_check={},info", log_level, log_level))
        .init();

    info!("Loading configuration from {:?}", args.config);
    let config = Config::from_file(&args.config)?;
    let server_set = config.server_set(None).context("Build server set")?;
    let options = config.pool_options();

    info!("Configuration loaded:");
    info!("  Servers: {}", config.servers.len());
    if let Some(ref srv) = config.srv {
        info!("  Service records: {} ({} records)", srv.name, srv.records.len());
    }
    info!("  Bind method: {:?}", config.bind.method);
    info!("  Pool: initial={} max={} max_wait={:?}", options.initial_connections, options.max_connections, options.max_wait);
    info!("  Health check: {:?}", config.pool.health_check);

    let pool = LdapConnectionPool::new(server_set, config.health_check(), options)
        .await
        .context("Create connection pool")?;

    match pool.checkout().await {
        Ok(mut conn) => {
            let identity = match conn.connection_mut() {
                Ok(c) => c.who_am_i().await,
                Err(e) => Err(e),
            };
            match &identity {
                Ok(id) if id.is_empty() => info!("Connected to {} as anonymous", conn.address()),
                Ok(id) => info!("Connected to {} as {}", conn.address(), id),
                Err(e) => error!("Who am I on {} failed: {}", conn.address(), e),
            }
            conn.release(identity.is_ok()).await;
        }
        Err(e) => error!("Checkout failed: {}", e),
    }

    for n in 1..=args.sweeps {
        if n > 1 {
            tokio::time::sleep(Duration::from_secs(args.interval_sec)).await;
        }
        let result = pool.run_health_check().await;
        println!(
            "sweep {}: examined={} expired={} defunct={} available={} size={}",
            n,
            result.num_examined,
            result.num_expired,
            result.num_defunct,
            pool.available_count(),
            pool.current_size()
        );
    }

    for (server, up) in pool.server_set().candidate_states() {
        println!("server {}: {}", server, if up { "up" } else { "down" });
    }
    println!("statistics: {}", pool.statistics());
    if args.prometheus {
        print!("{}", pool.render_prometheus());
    }

    pool.close().await;
    Ok(())
}
