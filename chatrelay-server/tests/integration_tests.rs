//! End-to-end tests driving a live relay over a real WebSocket.

use std::{process::Command, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures_util::{SinkExt, Stream, StreamExt, stream};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde_json::{Value, json};
use server::{
    app_state::AppState,
    server::create_app_router,
    services::{history_store::MemoryHistoryStore, identity::EmailIdentityVerifier},
    session::machine::MachineSettings,
};
use shared::{
    config::server::{Config, Profile},
    llms::{CompletionRequest, CompletionResult, CompletionSource, FragmentStream},
};
use tokio::net::TcpListener;
use tokio_tungstenite::{connect_async, tungstenite::Message};

#[derive(Debug)]
struct EchoCompletion;

#[async_trait]
impl CompletionSource for EchoCompletion {
    async fn stream_completion(
        &self,
        request: CompletionRequest,
    ) -> CompletionResult<FragmentStream> {
        let last = request
            .messages
            .last()
            .map(|message| message.content.clone())
            .unwrap_or_default();
        let fragments = vec![Ok("echo: ".to_string()), Ok(last)];
        Ok(Box::pin(stream::iter(fragments)))
    }

    fn model_name(&self) -> &str {
        "echo"
    }
}

async fn spawn_relay() -> String {
    let config = Config::default_for_profile(Profile::Test);
    let settings = MachineSettings::from_config(&config, "You are a test relay.".into());
    let state = Arc::new(AppState::new(
        Arc::new(MemoryHistoryStore::new()),
        Arc::new(EmailIdentityVerifier::new().unwrap()),
        Arc::new(EchoCompletion),
        settings,
        config.relay.outbound_buffer,
    ));
    let handle = PrometheusBuilder::new().build_recorder().handle();
    let app = create_app_router(state, &config, handle);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("ws://{addr}/ws")
}

async fn next_event<S>(socket: &mut S) -> Value
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for an event")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = message {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

#[tokio::test]
async fn relays_a_full_turn_over_websocket() {
    let url = spawn_relay().await;
    let (mut socket, _) = connect_async(url).await.unwrap();

    socket
        .send(Message::text(
            json!({ "type": "message", "content": "too early" }).to_string(),
        ))
        .await
        .unwrap();
    assert_eq!(
        next_event(&mut socket).await,
        json!({ "role": "error", "content": "User not authenticated" })
    );

    socket
        .send(Message::text(
            json!({ "type": "auth", "email": "Ada@Example.com" }).to_string(),
        ))
        .await
        .unwrap();
    assert_eq!(
        next_event(&mut socket).await,
        json!({ "role": "auth_success", "user": { "email": "ada@example.com" } })
    );

    socket.send(Message::text("hello relay")).await.unwrap();

    let created = next_event(&mut socket).await;
    assert_eq!(created["role"], "chat_created");
    assert_eq!(created["title"], "hello relay");
    assert_eq!(next_event(&mut socket).await, json!({ "role": "ai_start" }));

    let mut last_content = String::new();
    loop {
        let event = next_event(&mut socket).await;
        match event["role"].as_str() {
            Some("ai") => last_content = event["content"].as_str().unwrap().to_string(),
            Some("ai_complete") => {
                assert_eq!(event["success"], true);
                break;
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert_eq!(last_content, "echo: hello relay");

    socket.close(None).await.unwrap();
}

#[tokio::test]
async fn malformed_frames_are_reported_without_closing() {
    let url = spawn_relay().await;
    let (mut socket, _) = connect_async(url).await.unwrap();

    socket
        .send(Message::text(r#"{"content":"no type"}"#))
        .await
        .unwrap();
    assert_eq!(
        next_event(&mut socket).await,
        json!({ "role": "error", "content": "Malformed message" })
    );

    socket
        .send(Message::text(json!({ "type": "auth", "isGuest": true }).to_string()))
        .await
        .unwrap();
    let event = next_event(&mut socket).await;
    assert_eq!(event["role"], "auth_success");
    assert_eq!(event["user"]["isGuest"], true);
}

#[test]
fn binary_prints_help() {
    let output = Command::new(env!("CARGO_BIN_EXE_chatrelay"))
        .arg("--help")
        .output()
        .unwrap();

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success());
    assert!(stdout.contains("serve"));
    assert!(stdout.contains("config"));
}

#[test]
fn binary_rejects_unknown_commands() {
    let output = Command::new(env!("CARGO_BIN_EXE_chatrelay"))
        .arg("invalid-command")
        .output()
        .unwrap();
    assert!(!output.status.success());
}
