use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use nostr::{Event, Filter};
use nostr_relay_client::{
    AbortController, Ack, AutoConnectTransport, ClientError, ConnectionState, PoolConfig,
    RelayConfig, RelayConnection, RelayPool, SubscriptionItem, Transport, before_eose, fetch_event,
};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{accept_async, tungstenite::Message};

const WAIT: Duration = Duration::from_secs(5);
const HANG_UP: &str = "hang up";

/// Minimal relay: acknowledges every EVENT, answers REQ with its stored
/// events and EOSE, and drops the connection on an event whose content is
/// [`HANG_UP`].
struct StubRelay {
    url: String,
    accepted: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl StubRelay {
    async fn start(stored: Vec<Event>) -> anyhow::Result<Self> {
        Self::start_on(TcpListener::bind("127.0.0.1:0").await?, stored)
    }

    fn start_on(listener: TcpListener, stored: Vec<Event>) -> anyhow::Result<Self> {
        let url = format!("ws://{}", listener.local_addr()?);
        let accepted = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&accepted);
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(stream, stored.clone()));
            }
        });
        Ok(Self {
            url,
            accepted,
            task,
        })
    }

    fn connections(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

impl Drop for StubRelay {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(stream: TcpStream, stored: Vec<Event>) {
    let Ok(socket) = accept_async(stream).await else {
        return;
    };
    let (mut write, mut read) = socket.split();

    while let Some(Ok(message)) = read.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let Ok(Value::Array(frame)) = serde_json::from_str::<Value>(text.as_str()) else {
            continue;
        };

        let mut replies = Vec::new();
        match frame.first().and_then(Value::as_str) {
            Some("EVENT") => {
                let event = frame.get(1).cloned().unwrap_or(Value::Null);
                if event["content"] == HANG_UP {
                    let _ = write.send(Message::Close(None)).await;
                    return;
                }
                replies.push(json!(["OK", event["id"], true, ""]));
            }
            Some("REQ") => {
                let subscription_id = frame.get(1).cloned().unwrap_or(Value::Null);
                for event in &stored {
                    replies.push(json!(["EVENT", subscription_id, event]));
                }
                replies.push(json!(["EOSE", subscription_id]));
            }
            _ => {}
        }

        for reply in replies {
            if write.send(Message::text(reply.to_string())).await.is_err() {
                return;
            }
        }
    }
}

fn note(id: &str, content: &str) -> Event {
    Event {
        id: id.to_string(),
        pubkey: "pk".to_string(),
        created_at: 1,
        kind: 1,
        tags: vec![],
        content: content.to_string(),
        sig: "sig".to_string(),
    }
}

async fn wait_for_state(relay: &RelayConnection, expected: ConnectionState) -> bool {
    for _ in 0..200 {
        if relay.state().await == expected {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn publish_and_fetch_over_websocket() -> anyhow::Result<()> {
    let stub = StubRelay::start(vec![note("abc", "stored")]).await?;
    let relay = RelayConnection::connect(&stub.url, None).await?;
    assert_eq!(relay.state().await, ConnectionState::Connected);

    let confirmation = timeout(WAIT, relay.event(&note("new", "hello"), true))
        .await??
        .ok_or_else(|| anyhow::anyhow!("no confirmation"))?;
    assert!(confirmation.accepted);
    assert_eq!(confirmation.event_id, "new");

    let found = timeout(WAIT, fetch_event(&relay, "abc")).await??;
    assert_eq!(found, Some(note("abc", "stored")));

    relay.close().await;
    assert_eq!(relay.state().await, ConnectionState::Disconnected);
    Ok(())
}

#[tokio::test]
async fn streams_complete_when_relay_hangs_up() -> anyhow::Result<()> {
    let stub = StubRelay::start(vec![]).await?;
    let relay = RelayConnection::connect(&stub.url, None).await?;
    let mut notices = relay.notices();
    let mut subscription = relay.req(None).await?;
    subscription.set_filters(&[Filter::new()]).await?;
    assert_eq!(
        timeout(WAIT, subscription.next()).await?,
        Some(SubscriptionItem::Eose)
    );

    relay.event(&note("bye", HANG_UP), Ack::Skip).await?;

    assert_eq!(timeout(WAIT, subscription.next()).await?, None);
    assert_eq!(timeout(WAIT, notices.next()).await?, None);
    assert!(wait_for_state(&relay, ConnectionState::Disconnected).await);
    Ok(())
}

#[tokio::test]
async fn unpolled_subscription_receives_a_large_backlog() -> anyhow::Result<()> {
    let stored: Vec<Event> = (0..1500)
        .map(|index| note(&format!("e{index}"), "stored"))
        .collect();
    let stub = StubRelay::start(stored.clone()).await?;
    let relay = RelayConnection::connect(&stub.url, None).await?;

    let mut subscription = relay.req(None).await?;
    subscription.set_filters(&[Filter::new()]).await?;
    // Let the whole backlog queue up before reading any of it.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let received = timeout(WAIT, before_eose(&mut subscription).collect::<Vec<Event>>()).await?;
    assert_eq!(received.len(), stored.len());
    assert_eq!(received, stored);
    Ok(())
}

#[tokio::test]
async fn connect_to_closed_port_fails() -> anyhow::Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let url = format!("ws://{}", listener.local_addr()?);
    drop(listener);

    let result = RelayConnection::connect(&url, None).await;
    assert!(matches!(
        result,
        Err(ClientError::WebSocket(_) | ClientError::Timeout(_))
    ));
    Ok(())
}

#[tokio::test]
async fn connect_with_fired_signal_is_aborted() -> anyhow::Result<()> {
    let stub = StubRelay::start(vec![]).await?;
    let controller = AbortController::new();
    controller.abort("not needed");

    let result = RelayConnection::connect(&stub.url, Some(&controller.signal())).await;
    assert!(matches!(result, Err(ClientError::Aborted(reason)) if reason == "not needed"));
    Ok(())
}

#[tokio::test]
async fn auto_connect_dials_on_send_and_redials_after_hang_up() -> anyhow::Result<()> {
    let stub = StubRelay::start(vec![]).await?;
    let relay = RelayConnection::auto_connect(&stub.url)?;
    assert_eq!(relay.state().await, ConnectionState::Disconnected);
    assert_eq!(stub.connections(), 0);

    let first = timeout(WAIT, relay.event(&note("one", "hello"), true)).await??;
    assert!(first.is_some_and(|confirmation| confirmation.accepted));
    assert_eq!(stub.connections(), 1);

    relay.event(&note("bye", HANG_UP), Ack::Skip).await?;
    assert!(wait_for_state(&relay, ConnectionState::Disconnected).await);

    let second = timeout(WAIT, relay.event(&note("two", "again"), true)).await??;
    assert!(second.is_some_and(|confirmation| confirmation.accepted));
    assert_eq!(stub.connections(), 2);
    Ok(())
}

#[tokio::test]
async fn failed_auto_connect_reports_the_error_and_redials_later() -> anyhow::Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    drop(listener);

    let transport = AutoConnectTransport::new(&format!("ws://{addr}"), RelayConfig::default())?;
    let mut frames = transport.frames();
    let req = json!(["REQ", "s", {}]);

    let result = transport.send(&req).await;
    assert!(matches!(
        result,
        Err(ClientError::WebSocket(_) | ClientError::Timeout(_))
    ));
    assert_eq!(transport.state().await, ConnectionState::Disconnected);

    let stub = StubRelay::start_on(TcpListener::bind(addr).await?, vec![])?;
    timeout(WAIT, transport.send(&req)).await??;
    assert_eq!(transport.state().await, ConnectionState::Connected);
    assert_eq!(
        timeout(WAIT, frames.next()).await?,
        Some(vec![json!("EOSE"), json!("s")])
    );
    assert_eq!(stub.connections(), 1);
    Ok(())
}

#[tokio::test]
async fn closing_auto_connect_cancels_a_dial_in_flight() -> anyhow::Result<()> {
    // Completes TCP connects but never answers the WebSocket handshake.
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let url = format!("ws://{}", listener.local_addr()?);
    let transport = Arc::new(AutoConnectTransport::new(&url, RelayConfig::default())?);

    let sender = Arc::clone(&transport);
    let send = tokio::spawn(async move { sender.send(&json!(["CLOSE", "s"])).await });

    let mut connecting = false;
    for _ in 0..200 {
        if transport.state().await == ConnectionState::Connecting {
            connecting = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(connecting);

    timeout(Duration::from_secs(1), transport.close()).await?;
    let result = timeout(Duration::from_secs(1), send).await??;
    assert!(matches!(result, Err(ClientError::Aborted(_))));
    assert_eq!(transport.state().await, ConnectionState::Disconnected);
    drop(listener);
    Ok(())
}

#[tokio::test]
async fn pool_merges_stored_events_from_every_relay() -> anyhow::Result<()> {
    let first = StubRelay::start(vec![note("abc", "stored")]).await?;
    let second = StubRelay::start(vec![note("abc", "stored")]).await?;
    let pool = RelayPool::new(PoolConfig::default());
    pool.add_relay(&first.url).await?;
    pool.add_relay(&second.url).await?;

    let mut subscription = pool.req(None).await?;
    subscription
        .set_filters(&[Filter::new().ids(["abc"])])
        .await?;

    let mut events = 0;
    let mut eoses = 0;
    while eoses < 2 {
        match timeout(WAIT, subscription.next()).await? {
            Some(SubscriptionItem::Event(event)) => {
                assert_eq!(event.id, "abc");
                events += 1;
            }
            Some(SubscriptionItem::Eose) => eoses += 1,
            None => anyhow::bail!("subscription ended early"),
        }
    }
    assert_eq!(events, 2);
    assert_eq!(pool.connection_count().await, 2);

    subscription.close().await?;
    pool.close().await;
    assert_eq!(pool.connection_count().await, 0);
    Ok(())
}

#[tokio::test]
async fn pool_publish_returns_first_confirmation() -> anyhow::Result<()> {
    let first = StubRelay::start(vec![]).await?;
    let second = StubRelay::start(vec![]).await?;
    let pool = RelayPool::new(PoolConfig::default());
    pool.add_relay(&first.url).await?;
    pool.add_relay(&second.url).await?;

    let confirmation = pool
        .event(&note("abc", "hello"), Duration::from_secs(5))
        .await?
        .ok_or_else(|| anyhow::anyhow!("no confirmation"))?;
    assert!(confirmation.accepted);
    let relay_url = confirmation.relay_url.trim_end_matches('/');
    assert!(relay_url == first.url || relay_url == second.url);
    Ok(())
}
