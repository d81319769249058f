use accordrelay::bus::EventBus;
use accordrelay::clock::SystemClock;
use accordrelay::gateway::events::{CommandType, EventType, GatewayCommand};
use accordrelay::gateway::metrics::TracingMetrics;
use accordrelay::gateway::socket::TungsteniteFactory;
use accordrelay::gateway::{ConnectionState, GatewayConnection, GatewayOptions};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::routing::get;
use axum::Router;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// What the fake upstream saw from the relay.
#[derive(Debug)]
enum Seen {
    Command(serde_json::Value),
    Close(Option<u16>),
}

type SeenTx = mpsc::UnboundedSender<Seen>;

/// Greets with one event, then acknowledges every command it receives.
async fn upstream_socket(mut socket: WebSocket, seen: SeenTx) {
    let greeting = json!({
        "type": "event",
        "data": { "event": "room.updated", "payload": { "room_id": "r1" } },
        "ts": 1_750_000_000_000u64,
    });
    if socket
        .send(Message::Text(greeting.to_string().into()))
        .await
        .is_err()
    {
        return;
    }

    while let Some(Ok(msg)) = socket.recv().await {
        match msg {
            Message::Text(text) => {
                let frame: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
                let ack = json!({
                    "type": "ack",
                    "data": { "echo": frame["data"]["type"] },
                    "requestId": frame["requestId"],
                    "ts": 2,
                });
                let _ = seen.send(Seen::Command(frame));
                if socket
                    .send(Message::Text(ack.to_string().into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Message::Close(frame) => {
                let _ = seen.send(Seen::Close(frame.map(|f| f.code)));
                break;
            }
            _ => {}
        }
    }
}

async fn upgrade(ws: WebSocketUpgrade, State(seen): State<SeenTx>) -> axum::response::Response {
    ws.on_upgrade(move |socket| upstream_socket(socket, seen))
}

async fn spawn_upstream() -> (String, mpsc::UnboundedReceiver<Seen>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let app = Router::new().route("/ws", get(upgrade)).with_state(tx);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("ws://127.0.0.1:{}/ws", addr.port()), rx)
}

fn connection(url: String, bus: EventBus) -> GatewayConnection {
    let mut options = GatewayOptions::new(url);
    options.link_token = Some("relay-link".to_string());
    GatewayConnection::new(
        options,
        bus,
        Arc::new(TungsteniteFactory),
        Arc::new(SystemClock),
        Arc::new(TracingMetrics),
    )
}

async fn next_seen(seen: &mut mpsc::UnboundedReceiver<Seen>) -> Seen {
    timeout(Duration::from_secs(5), seen.recv())
        .await
        .expect("upstream saw nothing")
        .expect("upstream gone")
}

#[tokio::test]
async fn test_relays_events_and_acks_over_websocket() {
    let (url, mut seen) = spawn_upstream().await;
    let bus = EventBus::new();
    let (_sub, mut events) = bus.subscribe_channel();
    let conn = connection(url, bus);

    conn.start();

    let event = timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.kind(), EventType::RoomUpdated);
    assert_eq!(event.data()["room_id"], "r1");

    match next_seen(&mut seen).await {
        Seen::Command(frame) => {
            assert_eq!(frame["data"]["type"], "identify");
            assert_eq!(frame["data"]["data"]["token"], "relay-link");
        }
        other => panic!("expected identify, got {other:?}"),
    }
    assert_eq!(conn.state(), ConnectionState::Connected);

    let command = GatewayCommand::new(
        CommandType::UpdatePresence,
        json!({ "status": "online" }),
        &SystemClock,
    );
    let enqueued = conn.enqueue(command).unwrap();
    let data = timeout(Duration::from_secs(5), enqueued.ack)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(data["echo"], "updatePresence");

    conn.stop().await;
    assert_eq!(conn.state(), ConnectionState::Disconnected);

    loop {
        match next_seen(&mut seen).await {
            Seen::Command(_) => continue,
            Seen::Close(code) => {
                assert_eq!(code, Some(1000));
                break;
            }
        }
    }
}

#[tokio::test]
async fn test_refused_upstream_gives_up_after_configured_attempts() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mut options = GatewayOptions::new(format!("ws://{addr}/ws"));
    options.max_reconnect_attempts = 2;
    options.backoff = accordrelay::gateway::backoff::Backoff::new(
        Duration::from_millis(10),
        Duration::from_millis(20),
    );
    let conn = GatewayConnection::new(
        options,
        EventBus::new(),
        Arc::new(TungsteniteFactory),
        Arc::new(SystemClock),
        Arc::new(TracingMetrics),
    );

    conn.start();
    timeout(Duration::from_secs(5), async {
        while !conn.is_retry_exhausted() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("retries were not exhausted");

    let status = conn.status();
    assert_eq!(status.state, ConnectionState::Disconnected);
    assert_eq!(status.attempt, 2);
}
