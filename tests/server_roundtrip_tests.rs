// End-to-end tests against a local warp server speaking the chat server's protocol
// Exercises the real reqwest and tokio-tungstenite paths

mod common;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Buf;
use futures::{SinkExt, StreamExt, TryStreamExt};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc::UnboundedReceiver};
use warp::http::StatusCode;
use warp::multipart::FormData;
use warp::ws::{Message as WsFrame, WebSocket};
use warp::Filter;

use autosync::models::{ConnectionState, Origin};
use autosync::sync::download::download;
use autosync::sync::{
    parse_server_url, stream_url, ChatApi, ConnectionManager, Dispatcher, HttpApi, IdentityResolver, LocalIdentity,
    MessageLog, Reconciler, SyncUpdate, WsConnector,
};
use common::setup_logging;
use tempfile::tempdir;

#[derive(Clone)]
struct TestServer {
    messages: Arc<Mutex<Vec<Value>>>,
    files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    events: broadcast::Sender<String>,
    counter: Arc<AtomicU64>,
    connections: Arc<AtomicU64>,
    drop_first_connection: bool,
}

impl TestServer {
    fn new(drop_first_connection: bool) -> Self {
        let (events, _) = broadcast::channel(64);
        TestServer {
            messages: Arc::new(Mutex::new(Vec::new())),
            files: Arc::new(Mutex::new(HashMap::new())),
            events,
            counter: Arc::new(AtomicU64::new(0)),
            connections: Arc::new(AtomicU64::new(0)),
            drop_first_connection,
        }
    }

    fn store(&self, mut message: Value) -> (String, Value) {
        let id = format!("{}_{:06}", 1714000000, self.counter.fetch_add(1, Ordering::SeqCst));
        message["id"] = json!(id);
        message["timestamp"] = json!("2024-05-01 10:00:00.000");
        self.messages.lock().unwrap().push(message.clone());
        (id, message)
    }

    fn publish(&self, message: Value) -> String {
        let (id, message) = self.store(message);
        let _ = self
            .events
            .send(json!({"type": "new_message", "message": message}).to_string());
        id
    }

    fn snapshot(&self) -> String {
        json!({"type": "initial_state", "messages": *self.messages.lock().unwrap()}).to_string()
    }

    async fn serve_socket(self, socket: WebSocket) {
        let connection = self.connections.fetch_add(1, Ordering::SeqCst);
        let mut events = self.events.subscribe();
        let (mut tx, mut rx) = socket.split();

        if tx.send(WsFrame::text(self.snapshot())).await.is_err() {
            return;
        }
        if self.drop_first_connection && connection == 0 {
            self.store(json!({"type": "text", "content": "while you were away", "sender_ip": "10.0.0.5:51000"}));
            let _ = tx.close().await;
            return;
        }

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(text) => {
                        if tx.send(WsFrame::text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                },
                incoming = rx.next() => match incoming {
                    Some(Ok(_)) => {}
                    _ => break,
                },
            }
        }
    }
}

fn endpoint(remote: Option<SocketAddr>) -> String {
    remote.map(|a| a.to_string()).unwrap_or_default()
}

async fn handle_upload(
    form: FormData,
    remote: Option<SocketAddr>,
    server: TestServer,
) -> Result<warp::reply::WithStatus<warp::reply::Json>, warp::Rejection> {
    let parts: Vec<warp::multipart::Part> = form.try_collect().await.map_err(|_| warp::reject())?;
    for part in parts {
        if part.name() != "file" {
            continue;
        }
        let name = part.filename().unwrap_or("upload").to_string();
        let data = part
            .stream()
            .try_fold(Vec::new(), |mut acc, buf| async move {
                acc.extend_from_slice(buf.chunk());
                Ok::<_, warp::Error>(acc)
            })
            .await
            .map_err(|_| warp::reject())?;

        if name == "rejected.bin" {
            return Ok(warp::reply::with_status(
                warp::reply::json(&json!({"success": false})),
                StatusCode::PAYLOAD_TOO_LARGE,
            ));
        }

        let token = format!("{}_{}", server.counter.load(Ordering::SeqCst), name);
        let size = data.len();
        server.files.lock().unwrap().insert(token.clone(), data);
        let id = server.publish(json!({
            "type": "file",
            "content": name,
            "sender_ip": endpoint(remote),
            "filename": token,
            "filesize": size,
        }));
        return Ok(warp::reply::with_status(
            warp::reply::json(&json!({"success": true, "filename": token, "message_id": id})),
            StatusCode::OK,
        ));
    }
    Err(warp::reject())
}

async fn start_server(server: TestServer) -> SocketAddr {
    let state = warp::any().map(move || server.clone());

    let ws = warp::path!("ws")
        .and(warp::ws())
        .and(state.clone())
        .map(|ws: warp::ws::Ws, server: TestServer| ws.on_upgrade(move |socket| server.serve_socket(socket)));

    let my_ip = warp::path!("api" / "my_ip").and(warp::get()).and(warp::addr::remote()).map(
        |remote: Option<SocketAddr>| {
            warp::reply::json(&json!({"ip": remote.map(|a| a.ip().to_string()).unwrap_or_default()}))
        },
    );

    let send_text = warp::path!("api" / "send_text")
        .and(warp::post())
        .and(warp::body::json())
        .and(warp::addr::remote())
        .and(state.clone())
        .map(|body: Value, remote: Option<SocketAddr>, server: TestServer| {
            let text = body["text"].as_str().unwrap_or_default().trim().to_string();
            if text.is_empty() {
                return warp::reply::with_status(warp::reply::json(&json!({"success": false})), StatusCode::BAD_REQUEST);
            }
            let id = server.publish(json!({"type": "text", "content": text, "sender_ip": endpoint(remote)}));
            warp::reply::with_status(warp::reply::json(&json!({"success": true, "message_id": id})), StatusCode::OK)
        });

    let upload = warp::path!("api" / "upload")
        .and(warp::post())
        .and(warp::multipart::form().max_length(10 * 1024 * 1024))
        .and(warp::addr::remote())
        .and(state.clone())
        .and_then(handle_upload);

    let download_route = warp::path!("api" / "download" / String)
        .and(warp::get())
        .and(state.clone())
        .map(|token: String, server: TestServer| {
            let data = server.files.lock().unwrap().get(&token).cloned();
            match data {
                Some(data) => warp::reply::with_status(data, StatusCode::OK),
                None => warp::reply::with_status(Vec::new(), StatusCode::NOT_FOUND),
            }
        });

    let status = warp::path!("api" / "status").and(state).map(|server: TestServer| {
        let total = server.messages.lock().unwrap().len();
        warp::reply::json(&json!({"status": "running", "message": "test server", "total_messages": total}))
    });

    let routes = ws.or(my_ip).or(send_text).or(upload).or(download_route).or(status);
    let (addr, serve) = warp::serve(routes).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(serve);
    addr
}

struct Client {
    api: Arc<HttpApi>,
    updates: UnboundedReceiver<SyncUpdate>,
    reconciler: Reconciler,
    log: MessageLog,
    states: Vec<ConnectionState>,
}

impl Client {
    async fn connect(addr: SocketAddr, interval: Duration) -> Self {
        let base = parse_server_url(&format!("http://{}", addr)).unwrap();
        let api = Arc::new(HttpApi::new(base.clone()).unwrap());
        let identity = IdentityResolver::resolve(&*api).await;
        assert_eq!(identity, LocalIdentity::Known("127.0.0.1".to_string()));

        let (manager, updates) = ConnectionManager::new(stream_url(&base).unwrap().as_str(), WsConnector, interval);
        tokio::spawn(manager.run());

        Client {
            api,
            updates,
            reconciler: Reconciler::new(identity),
            log: MessageLog::new(),
            states: Vec::new(),
        }
    }

    async fn pump_until<F>(&mut self, mut done: F)
    where
        F: FnMut(&MessageLog, &[ConnectionState]) -> bool,
    {
        let result = tokio::time::timeout(Duration::from_secs(10), async {
            while !done(&self.log, &self.states) {
                match self.updates.recv().await {
                    Some(SyncUpdate::State(state)) => self.states.push(state),
                    Some(SyncUpdate::Stream(event)) => {
                        self.reconciler.apply(&mut self.log, event);
                    }
                    Some(SyncUpdate::Fault(_)) => {}
                    None => panic!("connection manager stopped"),
                }
            }
        })
        .await;
        assert!(result.is_ok(), "timed out; log {:?}, states {:?}", self.log.contents(), self.states);
    }
}

#[tokio::test]
async fn test_snapshot_send_upload_download_roundtrip() {
    setup_logging();
    let server = TestServer::new(false);
    server.store(json!({"type": "text", "content": "welcome", "sender_ip": "10.0.0.5:51000"}));
    let addr = start_server(server.clone()).await;

    let mut client = Client::connect(addr, Duration::from_millis(200)).await;
    client
        .pump_until(|log, states| states.contains(&ConnectionState::Open) && log.contents() == vec!["welcome"])
        .await;
    assert_eq!(client.log.entries()[0].origin, Origin::Received);

    // Sent messages only appear once the server echoes them
    let dispatcher = Dispatcher::new(client.api.clone());
    dispatcher.send_text("  hello from the test  ").await.unwrap();
    client.pump_until(|log, _| log.len() == 2).await;
    let echoed = client.log.by_position(2).unwrap();
    assert_eq!(echoed.message.content, "hello from the test");
    assert_eq!(echoed.origin, Origin::Sent);

    // Upload a batch with one rejected file
    let dir = tempdir().unwrap();
    let good = dir.path().join("notes.txt");
    let rejected = dir.path().join("rejected.bin");
    std::fs::write(&good, b"line one\nline two\n").unwrap();
    std::fs::write(&rejected, b"nope").unwrap();

    let results = dispatcher.upload_files(vec![rejected, good]).await;
    assert!(results[0].1.as_ref().unwrap_err().to_string().contains("rejected.bin"));
    let receipt = results[1].1.as_ref().unwrap();
    let token = receipt.stored_as.clone().unwrap();

    client.pump_until(|log, _| log.len() == 3).await;
    let file_entry = client.log.by_position(3).unwrap();
    let reference = file_entry.message.file_reference().unwrap();
    assert_eq!(reference.token, token);
    assert_eq!(reference.size, 18);
    assert_eq!(file_entry.message.content, "notes.txt");

    // Fetch it back under the display name
    let dest = tempdir().unwrap();
    let mut saw_total = None;
    let path = download(&*client.api, &reference.token, &file_entry.message.content, dest.path(), |p| {
        saw_total = p.total
    })
    .await
    .unwrap();
    assert_eq!(path, dest.path().join("notes.txt"));
    assert_eq!(std::fs::read(&path).unwrap(), b"line one\nline two\n".to_vec());
    assert_eq!(saw_total, Some(18));

    let missing = download(&*client.api, "no_such_token", "x.txt", dest.path(), |_| {}).await;
    assert!(missing.is_err());

    let status = client.api.status().await.unwrap();
    assert_eq!(status.status, "running");
    assert_eq!(status.total_messages, Some(3));
}

#[tokio::test]
async fn test_reconnect_replaces_log_with_fresh_snapshot() {
    setup_logging();
    let server = TestServer::new(true);
    server.store(json!({"type": "text", "content": "welcome", "sender_ip": "10.0.0.5:51000"}));
    let addr = start_server(server.clone()).await;

    let mut client = Client::connect(addr, Duration::from_millis(100)).await;
    client
        .pump_until(|log, _| log.contents() == vec!["welcome", "while you were away"])
        .await;

    let closed = client.states.iter().position(|s| *s == ConnectionState::Closed);
    let reopened = client.states.iter().rposition(|s| *s == ConnectionState::Open);
    assert!(closed.is_some());
    assert!(reopened > closed);
    assert_eq!(server.connections.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_client_keeps_retrying_until_server_appears() {
    setup_logging();
    // Reserve a port, then free it so the first attempts are refused
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let url = format!("ws://{}/ws", addr);
    let (manager, mut updates) = ConnectionManager::new(url, WsConnector, Duration::from_millis(100));
    tokio::spawn(manager.run());

    // Wait for at least one failed attempt
    let first_close = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(update) = updates.recv().await {
            if matches!(update, SyncUpdate::State(ConnectionState::Closed)) {
                return true;
            }
        }
        false
    })
    .await;
    assert_eq!(first_close.ok(), Some(true));

    // Now bring the server up on that port
    let server = TestServer::new(false);
    let state = warp::any().map(move || server.clone());
    let ws = warp::path!("ws")
        .and(warp::ws())
        .and(state)
        .map(|ws: warp::ws::Ws, server: TestServer| ws.on_upgrade(move |socket| server.serve_socket(socket)));
    let (_, serve) = warp::serve(ws).bind_ephemeral(addr);
    tokio::spawn(serve);

    let opened = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(update) = updates.recv().await {
            if matches!(update, SyncUpdate::State(ConnectionState::Open)) {
                return true;
            }
        }
        false
    })
    .await;
    assert_eq!(opened.ok(), Some(true));
}
