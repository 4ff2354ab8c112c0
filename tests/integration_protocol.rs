//! Integration tests for the TCP line protocol
//!
//! Runs a real server on an ephemeral port and drives it with the admin
//! client

mod common;

use common::*;
use bytes::Bytes;
use multi_tenant_cache::protocol::{Command, MAX_LINE_LEN, Reply};
use multi_tenant_cache::{
    AdminClient, CacheKey, CacheServer, CacheSystem, InvalidationEvent, TenantContext, Ttl,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

async fn start_server(system: &CacheSystem) -> (String, oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap_or_else(|e| panic!("Failed to bind: {e}"));
    let addr = listener
        .local_addr()
        .unwrap_or_else(|e| panic!("No local addr: {e}"))
        .to_string();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = CacheServer::new(Arc::clone(system.service()));
    tokio::spawn(async move {
        let _ = server
            .serve(listener, async {
                let _ = stop_rx.await;
            })
            .await;
    });
    (addr, stop_tx)
}

async fn connect(addr: &str) -> AdminClient {
    AdminClient::connect(addr)
        .await
        .unwrap_or_else(|e| panic!("Failed to connect: {e}"))
}

async fn send(client: &mut AdminClient, command: Command) -> Reply {
    client
        .send(&command)
        .await
        .unwrap_or_else(|e| panic!("Command failed: {e}"))
}

#[tokio::test]
async fn test_get_set_del_within_tenant() {
    let (system, _platform, _source) = setup_default().await;
    let (addr, _stop) = start_server(&system).await;
    let mut client = connect(&addr).await;

    client.ping().await.unwrap_or_else(|e| panic!("Ping failed: {e}"));
    assert!(matches!(
        send(&mut client, Command::Get("acme:obj:nav".into())).await,
        Reply::Error(_)
    ));

    client
        .select_tenant("acme")
        .await
        .unwrap_or_else(|e| panic!("TENANT failed: {e}"));
    let set = Command::Set {
        key: "acme:obj:nav".into(),
        value: "<ul>home</ul>".into(),
        ttl_secs: 60,
        tags: vec!["nav".into()],
    };
    assert_eq!(send(&mut client, set).await, Reply::Ok);
    assert_eq!(
        send(&mut client, Command::Get("acme:obj:nav".into())).await,
        Reply::Value {
            stale: false,
            payload: "<ul>home</ul>".into()
        }
    );
    assert_eq!(
        send(&mut client, Command::Del("acme:obj:nav".into())).await,
        Reply::Integer(1)
    );
    assert_eq!(
        send(&mut client, Command::Get("acme:obj:nav".into())).await,
        Reply::Nil
    );
    assert!(matches!(
        send(&mut client, Command::Get("not-a-key".into())).await,
        Reply::Error(_)
    ));
    client.quit().await.unwrap_or_else(|e| panic!("Quit failed: {e}"));
}

#[tokio::test]
async fn test_session_cannot_touch_other_namespace() {
    let (system, _platform, _source) = setup_default().await;
    let (addr, _stop) = start_server(&system).await;
    let mut client = connect(&addr).await;

    client
        .select_tenant("acme")
        .await
        .unwrap_or_else(|e| panic!("TENANT failed: {e}"));
    let set = Command::Set {
        key: "globex:obj:nav".into(),
        value: "x".into(),
        ttl_secs: 0,
        tags: Vec::new(),
    };
    assert!(matches!(send(&mut client, set).await, Reply::Error(_)));
    assert!(client.select_tenant("initech").await.is_err());
}

#[tokio::test]
async fn test_admin_purge_flush_and_stats() {
    let (system, _platform, _source) = setup_default().await;
    let (addr, _stop) = start_server(&system).await;
    let mut client = connect(&addr).await;

    client
        .select_tenant("globex")
        .await
        .unwrap_or_else(|e| panic!("TENANT failed: {e}"));
    for (key, tag) in [("globex:obj:a", "sale"), ("globex:obj:b", "sale"), ("globex:obj:c", "new")] {
        let set = Command::Set {
            key: key.into(),
            value: "v".into(),
            ttl_secs: 60,
            tags: vec![tag.into()],
        };
        assert_eq!(send(&mut client, set).await, Reply::Ok);
    }

    let purged = client
        .purge("globex", "sale")
        .await
        .unwrap_or_else(|e| panic!("Purge failed: {e}"));
    assert_eq!(purged, 2);
    let flushed = client
        .flush("globex")
        .await
        .unwrap_or_else(|e| panic!("Flush failed: {e}"));
    assert_eq!(flushed, 1);

    let stats = client.stats().await.unwrap_or_else(|e| panic!("Stats failed: {e}"));
    assert_eq!(stats.object.sets, 3);
    assert_eq!(stats.invalidation.applied, 1);
    assert_eq!(stats.tenants, 2);
    assert!(stats.summary().contains("obj"));
}

/// Subscribers only see events for their tenant (or global ones)
#[tokio::test]
async fn test_subscribe_streams_tenant_events() {
    let (system, _platform, _source) = setup_default().await;
    let (addr, _stop) = start_server(&system).await;

    let mut subscriber = connect(&addr).await;
    subscriber
        .select_tenant("acme")
        .await
        .unwrap_or_else(|e| panic!("TENANT failed: {e}"));
    assert_eq!(send(&mut subscriber, Command::Subscribe).await, Reply::Subscribed);

    let mut admin = connect(&addr).await;
    admin
        .purge("globex", "hidden")
        .await
        .unwrap_or_else(|e| panic!("globex purge failed: {e}"));
    admin
        .purge("acme", "visible")
        .await
        .unwrap_or_else(|e| panic!("acme purge failed: {e}"));

    let reply = tokio::time::timeout(Duration::from_secs(1), subscriber.read_reply())
        .await
        .unwrap_or_else(|_| panic!("No event delivered"))
        .unwrap_or_else(|e| panic!("Read failed: {e}"));
    let Reply::Event(doc) = reply else {
        panic!("Expected EVENT, got {reply:?}");
    };
    let event = InvalidationEvent::from_json(&doc).unwrap_or_else(|e| panic!("Bad event: {e}"));
    assert_eq!(event.tenant_id, "acme");
    assert_eq!(event.tags, vec!["visible".to_string()]);

    assert_eq!(send(&mut subscriber, Command::Quit).await, Reply::Bye);
}

/// Without a tenant selected, only global events are streamed
#[tokio::test]
async fn test_subscribe_without_tenant_sees_global_events_only() {
    let (system, _platform, _source) = setup_default().await;
    let (addr, _stop) = start_server(&system).await;

    let mut subscriber = connect(&addr).await;
    assert_eq!(send(&mut subscriber, Command::Subscribe).await, Reply::Subscribed);

    let service = system.service();
    service
        .notify_mutation("acme", ["private"])
        .await
        .unwrap_or_else(|e| panic!("acme mutation failed: {e}"));
    service
        .notify_mutation("*", ["nav"])
        .await
        .unwrap_or_else(|e| panic!("Global mutation failed: {e}"));

    let reply = tokio::time::timeout(Duration::from_secs(1), subscriber.read_reply())
        .await
        .unwrap_or_else(|_| panic!("No event delivered"))
        .unwrap_or_else(|e| panic!("Read failed: {e}"));
    let Reply::Event(doc) = reply else {
        panic!("Expected EVENT, got {reply:?}");
    };
    let event = InvalidationEvent::from_json(&doc).unwrap_or_else(|e| panic!("Bad event: {e}"));
    assert!(event.is_global());
    assert_eq!(event.tags, vec!["nav".to_string()]);
}

/// Binary payloads are refused on the text protocol instead of being mangled
#[tokio::test]
async fn test_binary_value_is_not_altered() {
    let (system, _platform, _source) = setup_default().await;
    let acme = TenantContext::for_tenant("acme").unwrap_or_else(|e| panic!("{e}"));
    let key = CacheKey::parse("acme:obj:logo").unwrap_or_else(|| panic!("Invalid key"));
    system
        .service()
        .set_raw(&acme, &key, Bytes::from_static(&[0x89, 0x50, 0xff, 0x00]), Ttl::Never, BTreeSet::new())
        .await
        .unwrap_or_else(|e| panic!("set_raw failed: {e}"));

    let (addr, _stop) = start_server(&system).await;
    let mut client = connect(&addr).await;
    client
        .select_tenant("acme")
        .await
        .unwrap_or_else(|e| panic!("TENANT failed: {e}"));
    let reply = send(&mut client, Command::Get("acme:obj:logo".into())).await;
    assert!(matches!(reply, Reply::Error(ref msg) if msg.contains("binary")), "got {reply:?}");
    client.ping().await.unwrap_or_else(|e| panic!("Ping after binary GET failed: {e}"));
}

/// A line longer than the limit is rejected and the connection closed
#[tokio::test]
async fn test_oversized_line_closes_connection() {
    let (system, _platform, _source) = setup_default().await;
    let (addr, _stop) = start_server(&system).await;

    let stream = TcpStream::connect(&addr)
        .await
        .unwrap_or_else(|e| panic!("Failed to connect: {e}"));
    let (read, mut write) = stream.into_split();
    write
        .write_all(&vec![b'A'; MAX_LINE_LEN + 1])
        .await
        .unwrap_or_else(|e| panic!("Write failed: {e}"));

    let mut lines = BufReader::new(read).lines();
    let first = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
        .await
        .unwrap_or_else(|_| panic!("No reply to oversized line"))
        .unwrap_or_else(|e| panic!("Read failed: {e}"))
        .unwrap_or_else(|| panic!("Connection closed without a reply"));
    assert!(matches!(Reply::parse(&first), Ok(Reply::Error(_))), "got {first}");

    let after = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
        .await
        .unwrap_or_else(|_| panic!("Connection left open"));
    assert!(matches!(after, Ok(None) | Err(_)));
}

#[tokio::test]
async fn test_unknown_command_keeps_connection_open() {
    let (system, _platform, _source) = setup_default().await;
    let (addr, stop) = start_server(&system).await;
    let mut client = connect(&addr).await;

    let reply = client
        .send(&Command::Ping)
        .await
        .unwrap_or_else(|e| panic!("Ping failed: {e}"));
    assert_eq!(reply, Reply::Pong);
    assert!(matches!(send(&mut client, Command::Tenant("".into())).await, Reply::Error(_)));
    client.ping().await.unwrap_or_else(|e| panic!("Ping after error failed: {e}"));

    let _ = stop.send(());
}
