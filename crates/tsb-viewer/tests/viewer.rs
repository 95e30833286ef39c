//! End-to-end viewer channel tests using a real WebSocket client.

use std::{sync::Arc, time::Duration};

use chrono::{TimeZone, Utc};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::{net::TcpListener, sync::mpsc, time::timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tsb_core::{
    broadcast::{Broadcaster, ViewerId},
    domain::{
        Analysis, ComponentHealth, ConversationId, Event, HealthStatus, MessageId, RawMessage,
    },
    history::HistoryBuffer,
};
use tsb_viewer::{serve, ViewerState};

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

struct TestServer {
    url: String,
    broadcaster: Arc<Broadcaster>,
    rechecks: mpsc::Receiver<ViewerId>,
    cancel: CancellationToken,
}

async fn boot_server() -> TestServer {
    let (recheck_tx, rechecks) = mpsc::channel(8);
    let broadcaster = Arc::new(Broadcaster::new(HistoryBuffer::new(3), 32, recheck_tx));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cancel = CancellationToken::new();
    tokio::spawn(serve(
        listener,
        ViewerState::new(broadcaster.clone()),
        cancel.clone(),
    ));
    TestServer {
        url: format!("ws://{addr}/ws"),
        broadcaster,
        rechecks,
        cancel,
    }
}

fn event(id: i32, text: &str) -> Event {
    let raw = RawMessage {
        conversation: ConversationId(42),
        message_id: MessageId(id),
        text: Some(text.to_string()),
        date: Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 0).unwrap(),
    };
    Event::new(
        &raw,
        "EURUSD Signals".to_string(),
        text.to_string(),
        false,
        Analysis::negative("not a signal"),
    )
}

async fn next_json(ws: &mut WsStream) -> Value {
    loop {
        let frame = timeout(TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("ws error");
        match frame {
            Message::Text(t) => return serde_json::from_str(t.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame {other:?}"),
        }
    }
}

#[tokio::test]
async fn new_viewer_gets_history_then_live_events() {
    let server = boot_server().await;
    for id in 1..=4 {
        server.broadcaster.publish_event(event(id, &format!("m{id}")));
    }

    let (mut ws, _) = connect_async(server.url.as_str()).await.unwrap();
    for expected in 2..=4 {
        let msg = next_json(&mut ws).await;
        assert_eq!(msg["event"], "new_event");
        assert_eq!(msg["data"]["messageId"], expected);
        assert_eq!(msg["data"]["title"], "EURUSD Signals");
    }

    server.broadcaster.publish_event(event(5, "live"));
    let msg = next_json(&mut ws).await;
    assert_eq!(msg["data"]["messageId"], 5);
    assert_eq!(msg["data"]["isSync"], false);

    server.broadcaster.publish_health(HealthStatus {
        gateway: ComponentHealth::offline("not connected"),
        classifier: ComponentHealth::online(),
        timestamp: Utc::now().to_rfc3339(),
        is_manual: false,
    });
    let msg = next_json(&mut ws).await;
    assert_eq!(msg["event"], "system_status");
    assert_eq!(msg["data"]["gateway"]["status"], "OFFLINE");
    assert_eq!(msg["data"]["gateway"]["error"], "not connected");

    server.cancel.cancel();
}

#[tokio::test]
async fn manual_recheck_reaches_the_health_monitor() {
    let mut server = boot_server().await;
    server.broadcaster.publish_event(event(1, "hello"));

    let (mut ws, _) = connect_async(server.url.as_str()).await.unwrap();
    // The replay proves the session is attached.
    next_json(&mut ws).await;

    ws.send(Message::Text(r#"{"event":"manual_recheck"}"#.into()))
        .await
        .unwrap();
    ws.send(Message::Text("manual_recheck".into())).await.unwrap();
    ws.send(Message::Text("not json".into())).await.unwrap();

    for _ in 0..2 {
        let requested = timeout(TIMEOUT, server.rechecks.recv()).await.unwrap();
        assert!(requested.is_some());
    }
    server.cancel.cancel();
}

#[tokio::test]
async fn closing_the_socket_detaches_the_viewer() {
    let server = boot_server().await;
    server.broadcaster.publish_event(event(1, "hello"));

    let (mut ws, _) = connect_async(server.url.as_str()).await.unwrap();
    next_json(&mut ws).await;
    assert_eq!(server.broadcaster.viewer_count(), 1);

    ws.close(None).await.unwrap();
    for _ in 0..100 {
        if server.broadcaster.viewer_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(server.broadcaster.viewer_count(), 0);
    server.cancel.cancel();
}
