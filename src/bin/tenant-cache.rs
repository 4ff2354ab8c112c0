//! CLI entry point: run the cache server or administer a running one.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use multi_tenant_cache::{AdminClient, CacheConfig, CacheSystem};

/// Multi-tenant page and object cache.
#[derive(Parser, Debug)]
#[command(name = "tenant-cache", version, about)]
struct Cli {
    /// Address of a running server (admin commands).
    #[arg(long, env = "TENANT_CACHE_ADDR", default_value = "127.0.0.1:7379")]
    addr: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the cache server.
    Serve {
        /// TOML or JSON config file; defaults apply when omitted.
        #[arg(long, env = "TENANT_CACHE_CONFIG")]
        config: Option<String>,
    },

    /// Print hit ratio, evictions, stampede and invalidation counters.
    Stats {
        /// Print the raw JSON document.
        #[arg(long)]
        json: bool,
    },

    /// Purge one tag within one tenant.
    Purge {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        tag: String,
    },

    /// Drop every entry of a tenant from both tiers.
    Flush {
        #[arg(long)]
        tenant: String,
    },
}

fn install_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let Cli { addr, cmd } = Cli::parse();
    install_tracing();

    match cmd {
        Command::Serve { config } => {
            let config = match config {
                Some(path) => CacheConfig::load(path)?,
                None => CacheConfig::default(),
            };
            CacheSystem::from_config(config).await?.serve().await
        }
        Command::Stats { json } => {
            let mut client = AdminClient::connect(&addr).await?;
            let stats = client.stats().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                print!("{}", stats.summary());
            }
            client.quit().await
        }
        Command::Purge { tenant, tag } => {
            let mut client = AdminClient::connect(&addr).await?;
            let purged = client.purge(&tenant, &tag).await?;
            println!("purged {purged} entries tagged `{tag}` for tenant `{tenant}`");
            client.quit().await
        }
        Command::Flush { tenant } => {
            let mut client = AdminClient::connect(&addr).await?;
            let purged = client.flush(&tenant).await?;
            println!("flushed {purged} entries for tenant `{tenant}`");
            client.quit().await
        }
    }
}
