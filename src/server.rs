//! TCP front end speaking the [`crate::protocol`] line protocol
//!
//! One task per connection. Each session selects a tenant with `TENANT`
//! and every key it touches must live in that tenant's namespace. Input
//! lines are capped at [`MAX_LINE_LEN`]; a longer line closes the
//! connection.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, info, warn};

use crate::entry::{Lookup, Ttl};
use crate::error::{CacheError, OriginError};
use crate::invalidation::EventOutcome;
use crate::keys::CacheKey;
use crate::protocol::{Command, MAX_LINE_LEN, Reply};
use crate::service::CacheService;
use crate::tenant::TenantContext;
use crate::traits::PutOutcome;

pub struct CacheServer {
    service: Arc<CacheService>,
    request_timeout: Duration,
}

impl CacheServer {
    #[must_use]
    pub fn new(service: Arc<CacheService>) -> Self {
        let request_timeout = service.request_timeout;
        Self {
            service,
            request_timeout,
        }
    }

    /// Bind `addr` and serve until Ctrl+C
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn run(self, addr: &str) -> Result<(), CacheError> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener, shutdown_signal()).await
    }

    /// Serve connections from `listener` until `shutdown` completes
    ///
    /// # Errors
    ///
    /// Returns an error if the listener fails.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send,
    ) -> Result<(), CacheError> {
        let local = listener.local_addr()?;
        info!(addr = %local, "Cache server listening");
        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };
                    let session = Session {
                        service: Arc::clone(&self.service),
                        request_timeout: self.request_timeout,
                        tenant: None,
                        peer,
                    };
                    tokio::spawn(session.run(stream, stop_rx.clone()));
                }
                () = &mut shutdown => {
                    info!("Shutdown signal received, closing sessions");
                    break;
                }
            }
        }

        let _ = stop_tx.send(true);
        Ok(())
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

type Lines = FramedRead<OwnedReadHalf, LinesCodec>;

/// One read from the client
enum Inbound {
    Line(String),
    TooLong,
    Closed,
}

async fn next_inbound(lines: &mut Lines, peer: SocketAddr) -> Inbound {
    match lines.next().await {
        Some(Ok(line)) => Inbound::Line(line),
        Some(Err(LinesCodecError::MaxLineLengthExceeded)) => Inbound::TooLong,
        Some(Err(LinesCodecError::Io(e))) => {
            debug!(peer = %peer, error = %e, "Read failed");
            Inbound::Closed
        }
        None => Inbound::Closed,
    }
}

async fn reject_long_line(writer: &mut OwnedWriteHalf, peer: SocketAddr) {
    warn!(peer = %peer, limit = MAX_LINE_LEN, "Line too long, closing connection");
    let reply = Reply::error(&CacheError::Protocol(format!(
        "line exceeds {MAX_LINE_LEN} bytes"
    )));
    let _ = write_reply(writer, &reply).await;
}

/// What the dispatcher wants the connection loop to do next
enum Next {
    Reply(Reply),
    Subscribe,
    Close,
}

struct Session {
    service: Arc<CacheService>,
    request_timeout: Duration,
    tenant: Option<TenantContext>,
    peer: SocketAddr,
}

impl Session {
    async fn run(mut self, stream: TcpStream, mut stop: watch::Receiver<bool>) {
        debug!(peer = %self.peer, "Connection opened");
        let (read, mut writer) = stream.into_split();
        let mut lines = FramedRead::new(read, LinesCodec::new_with_max_length(MAX_LINE_LEN));

        loop {
            let inbound = tokio::select! {
                inbound = next_inbound(&mut lines, self.peer) => inbound,
                _ = stop.changed() => break,
            };
            let line = match inbound {
                Inbound::Line(line) => line,
                Inbound::TooLong => {
                    reject_long_line(&mut writer, self.peer).await;
                    break;
                }
                Inbound::Closed => break,
            };
            if line.trim().is_empty() {
                continue;
            }

            let next = match Command::parse(&line) {
                Ok(command) => self.dispatch(command).await,
                Err(e) => Next::Reply(Reply::error(&e)),
            };
            let keep_open = match next {
                Next::Reply(reply) => write_reply(&mut writer, &reply).await.is_ok(),
                Next::Close => {
                    let _ = write_reply(&mut writer, &Reply::Bye).await;
                    false
                }
                Next::Subscribe => {
                    let events = self.service.bus.subscribe();
                    self.stream_events(&mut writer, &mut lines, events, &mut stop)
                        .await
                }
            };
            if !keep_open {
                break;
            }
        }
        debug!(peer = %self.peer, "Connection closed");
    }

    async fn dispatch(&mut self, command: Command) -> Next {
        match command {
            Command::Ping => Next::Reply(Reply::Pong),
            Command::Quit => Next::Close,
            Command::Subscribe => Next::Subscribe,
            Command::Tenant(id) => Next::Reply(self.select_tenant(&id)),
            command => {
                let reply = match timeout(self.request_timeout, self.execute(command)).await {
                    Ok(Ok(reply)) => reply,
                    Ok(Err(e)) => Reply::error(&e),
                    Err(_) => Reply::error(&OriginError::Timeout(self.request_timeout).into()),
                };
                Next::Reply(reply)
            }
        }
    }

    fn select_tenant(&mut self, id: &str) -> Reply {
        match self.service.registry.get(id) {
            Some(tenant) if tenant.is_active() => {
                debug!(peer = %self.peer, tenant = %id, "Session tenant selected");
                self.tenant = Some(tenant);
                Reply::Ok
            }
            _ => Reply::error(&CacheError::TenantUnresolved(id.to_string())),
        }
    }

    fn tenant(&self) -> Result<&TenantContext, CacheError> {
        self.tenant
            .as_ref()
            .ok_or_else(|| CacheError::Protocol("no tenant selected, send TENANT <id> first".into()))
    }

    async fn execute(&self, command: Command) -> Result<Reply, CacheError> {
        if let Command::Stats = command {
            let stats = self.service.stats().await;
            let doc = serde_json::to_string(&stats)
                .map_err(|e| CacheError::Protocol(format!("failed to encode stats: {e}")))?;
            return Ok(Reply::Json(doc));
        }

        let tenant = self.tenant()?;
        let reply = match command {
            Command::Get(key) => match self.service.get_raw(tenant, &parse_key(&key)?).await? {
                Lookup::Hit(entry) => text_value(false, &entry.payload),
                Lookup::Stale(entry) => text_value(true, &entry.payload),
                Lookup::Miss => Reply::Nil,
            },
            Command::Set {
                key,
                value,
                ttl_secs,
                tags,
            } => {
                let outcome = self
                    .service
                    .set_raw(
                        tenant,
                        &parse_key(&key)?,
                        Bytes::from(value),
                        Ttl::from_secs(ttl_secs),
                        tags.into_iter().collect(),
                    )
                    .await?;
                match outcome {
                    PutOutcome::Stored { .. } => Reply::Ok,
                    PutOutcome::Refused => Reply::Error("entry refused: too large for store".into()),
                }
            }
            Command::Del(key) => {
                let removed = self.service.delete_raw(tenant, &parse_key(&key)?).await?;
                Reply::Integer(u64::from(removed))
            }
            Command::PurgeTag(tag) => match self.service.purge_tag(tenant.id(), &tag).await? {
                EventOutcome::Applied { purged } => Reply::Integer(purged as u64),
                EventOutcome::Duplicate => Reply::Integer(0),
                EventOutcome::PartiallyApplied { purged, failures } => Reply::Error(format!(
                    "purge incomplete: {purged} removed, {failures} purges failed"
                )),
                EventOutcome::Rejected { reason } => Reply::Error(reason),
            },
            Command::Flush => Reply::Integer(self.service.flush_tenant(tenant.id()).await? as u64),
            Command::Tenant(_)
            | Command::Stats
            | Command::Subscribe
            | Command::Ping
            | Command::Quit => Reply::Error("command not valid here".into()),
        };
        Ok(reply)
    }

    /// Forward applied events until the client quits or disconnects.
    /// Returns whether the connection should stay open.
    /// Sessions without a tenant only see global events.
    async fn stream_events(
        &self,
        writer: &mut OwnedWriteHalf,
        lines: &mut Lines,
        mut events: broadcast::Receiver<crate::invalidation::AppliedEvent>,
        stop: &mut watch::Receiver<bool>,
    ) -> bool {
        if write_reply(writer, &Reply::Subscribed).await.is_err() {
            return false;
        }
        let tenant_id = self.tenant.as_ref().map(|t| t.id().to_string());
        info!(peer = %self.peer, tenant = ?tenant_id, "Client subscribed to invalidations");

        loop {
            tokio::select! {
                received = events.recv() => match received {
                    Ok(applied) => {
                        let event = &applied.event;
                        let visible = match &tenant_id {
                            Some(id) => event.is_global() || &event.tenant_id == id,
                            None => event.is_global(),
                        };
                        if !visible {
                            continue;
                        }
                        let Ok(doc) = event.to_json() else { continue };
                        if write_reply(writer, &Reply::Event(doc)).await.is_err() {
                            return false;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(peer = %self.peer, skipped, "Subscriber lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return false,
                },
                inbound = next_inbound(lines, self.peer) => match inbound {
                    Inbound::Line(line) if matches!(Command::parse(&line), Ok(Command::Quit)) => {
                        let _ = write_reply(writer, &Reply::Bye).await;
                        return false;
                    }
                    Inbound::Line(_) => {
                        let reply = Reply::Error("only QUIT is accepted while subscribed".into());
                        if write_reply(writer, &reply).await.is_err() {
                            return false;
                        }
                    }
                    Inbound::TooLong => {
                        reject_long_line(writer, self.peer).await;
                        return false;
                    }
                    Inbound::Closed => return false,
                },
                _ = stop.changed() => return false,
            }
        }
    }
}

/// Payloads travel as JSON strings; binary ones are refused rather than
/// altered
fn text_value(stale: bool, payload: &Bytes) -> Reply {
    match std::str::from_utf8(payload) {
        Ok(text) => Reply::Value {
            stale,
            payload: text.to_string(),
        },
        Err(_) => Reply::Error(format!(
            "value is {} bytes of binary data, not representable as text",
            payload.len()
        )),
    }
}

fn parse_key(raw: &str) -> Result<CacheKey, CacheError> {
    CacheKey::parse(raw).ok_or_else(|| CacheError::Protocol(format!("malformed key `{raw}`")))
}

async fn write_reply(writer: &mut OwnedWriteHalf, reply: &Reply) -> std::io::Result<()> {
    let mut line = reply.render();
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}
