//! Administrative surface
//!
//! [`CacheStats`] aggregates every component's counters. [`AdminClient`]
//! speaks the line protocol to a running server and backs the
//! `tenant-cache stats|purge|flush` subcommands.

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::debug;

use crate::invalidation::InvalidationStats;
use crate::protocol::{Command, Reply};
use crate::replica::RouterStats;
use crate::stampede::StampedeStats;
use crate::stores::StoreStats;

/// Everything `cache stats` reports
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub page: StoreStats,
    pub object: StoreStats,
    pub stampede: StampedeStats,
    pub invalidation: InvalidationStats,
    pub replicas: RouterStats,
    pub tenants: usize,
    pub table_version: u64,
}

impl CacheStats {
    /// Human-readable summary for the CLI
    #[must_use]
    pub fn summary(&self) -> String {
        let mut out = String::new();
        for store in [&self.page, &self.object] {
            out.push_str(&format!(
                "{:<6} hit_ratio={:.3} hits={} stale={} misses={} evictions={} entries={} bytes={}/{}\n",
                store.tier,
                store.hit_ratio,
                store.hits,
                store.stale_hits,
                store.misses,
                store.evictions,
                store.entries,
                store.bytes,
                store.capacity_bytes,
            ));
        }
        out.push_str(&format!(
            "stampede leases={} waits={} stale_served={} origin_fetches={}\n",
            self.stampede.leases_granted,
            self.stampede.waits,
            self.stampede.stale_served,
            self.stampede.origin_fetches,
        ));
        out.push_str(&format!(
            "invalidation applied={} duplicates={} retries={} failures={}\n",
            self.invalidation.applied,
            self.invalidation.duplicates,
            self.invalidation.purge_retries,
            self.invalidation.purge_failures,
        ));
        out.push_str(&format!(
            "replicas primary={} replica={} fallbacks={} healthy={}\n",
            self.replicas.primary_reads,
            self.replicas.replica_reads,
            self.replicas.fallbacks,
            self.replicas.healthy_replicas,
        ));
        out
    }
}

/// Protocol client for a running cache server
pub struct AdminClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl AdminClient {
    /// # Errors
    ///
    /// Returns an error if the server cannot be reached.
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("Failed to connect to cache server at {addr}"))?;
        let (read, writer) = stream.into_split();
        Ok(Self {
            lines: BufReader::new(read).lines(),
            writer,
        })
    }

    /// Send one command and read its reply
    ///
    /// # Errors
    ///
    /// Returns an error on IO failure, a closed connection or a malformed
    /// reply. `-ERR` replies are returned as [`Reply::Error`].
    pub async fn send(&mut self, command: &Command) -> Result<Reply> {
        let line = command.render();
        debug!(command = %line, "Sending admin command");
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        self.read_reply().await
    }

    /// Read the next reply line (also used while subscribed)
    ///
    /// # Errors
    ///
    /// Returns an error if the connection closes or the line is malformed.
    pub async fn read_reply(&mut self) -> Result<Reply> {
        let line = self
            .lines
            .next_line()
            .await?
            .ok_or_else(|| anyhow!("Connection closed by server"))?;
        Ok(Reply::parse(&line)?)
    }

    async fn call(&mut self, command: Command) -> Result<Reply> {
        match self.send(&command).await? {
            Reply::Error(msg) => bail!("{} failed: {msg}", command.render()),
            reply => Ok(reply),
        }
    }

    async fn call_integer(&mut self, command: Command) -> Result<u64> {
        match self.call(command).await? {
            Reply::Integer(n) => Ok(n),
            other => bail!("Unexpected reply: {}", other.render()),
        }
    }

    /// # Errors
    ///
    /// Returns an error if the server does not answer `+PONG`.
    pub async fn ping(&mut self) -> Result<()> {
        match self.call(Command::Ping).await? {
            Reply::Pong => Ok(()),
            other => bail!("Unexpected reply: {}", other.render()),
        }
    }

    /// # Errors
    ///
    /// Returns an error if the tenant is unknown or inactive.
    pub async fn select_tenant(&mut self, tenant: &str) -> Result<()> {
        self.call(Command::Tenant(tenant.to_string())).await?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the stats document cannot be fetched or decoded.
    pub async fn stats(&mut self) -> Result<CacheStats> {
        match self.call(Command::Stats).await? {
            Reply::Json(doc) => serde_json::from_str(&doc).context("Failed to decode stats"),
            other => bail!("Unexpected reply: {}", other.render()),
        }
    }

    /// Purge one tag of one tenant; returns the number of entries removed
    ///
    /// # Errors
    ///
    /// Returns an error if the server rejects the purge.
    pub async fn purge(&mut self, tenant: &str, tag: &str) -> Result<u64> {
        self.select_tenant(tenant).await?;
        self.call_integer(Command::PurgeTag(tag.to_string())).await
    }

    /// Flush a tenant from both tiers; returns the number of entries removed
    ///
    /// # Errors
    ///
    /// Returns an error if the server rejects the flush.
    pub async fn flush(&mut self, tenant: &str) -> Result<u64> {
        self.select_tenant(tenant).await?;
        self.call_integer(Command::Flush).await
    }

    /// # Errors
    ///
    /// Returns an error on IO failure.
    pub async fn quit(mut self) -> Result<()> {
        let _ = self.send(&Command::Quit).await?;
        self.writer.shutdown().await?;
        Ok(())
    }
}
