//! Tests for the read-only HTTP API.

use duet_core::{MemoryStore, MessageDelivery, MessageStore};
use duet_protocol::{ConversationSummary, Message};
use duet_server::config::Config;
use duet_server::handlers;
use reqwest::StatusCode;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

async fn start_server(store: Arc<dyn MessageStore>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(handlers::serve(listener, Config::default(), store));
    addr
}

/// A store holding one four-message conversation between "1" and "2".
async fn seeded_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    let delivery = MessageDelivery::new(store.clone());
    for i in 0..4 {
        let (from, to) = if i % 2 == 0 { ("1", "2") } else { ("2", "1") };
        delivery.submit(from, to, format!("m{}", i)).await.unwrap();
    }
    store
}

#[tokio::test]
async fn test_history_in_seq_order() {
    let addr = start_server(seeded_store().await).await;

    let response = reqwest::get(format!("http://{}/api/conversations/2/1/messages", addr))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let messages: Vec<Message> = response.json().await.unwrap();
    let contents: Vec<_> = messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["m0", "m1", "m2", "m3"]);
    let seqs: Vec<_> = messages.iter().map(|m| m.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn test_history_without_conversation_is_empty() {
    let addr = start_server(seeded_store().await).await;

    let response = reqwest::get(format!("http://{}/api/conversations/1/3/messages", addr))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let messages: Vec<Message> = response.json().await.unwrap();
    assert!(messages.is_empty());
}

#[tokio::test]
async fn test_history_with_self_is_bad_request() {
    let addr = start_server(Arc::new(MemoryStore::new())).await;

    let response = reqwest::get(format!("http://{}/api/conversations/1/1/messages", addr))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["message"], "Cannot open a conversation with yourself");
}

#[tokio::test]
async fn test_last_messages() {
    let addr = start_server(seeded_store().await).await;

    let summaries: Vec<ConversationSummary> =
        reqwest::get(format!("http://{}/api/last-messages/1", addr))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].peer, "2");
    assert_eq!(summaries[0].last_message.as_ref().unwrap().content, "m3");

    let none: Vec<ConversationSummary> =
        reqwest::get(format!("http://{}/api/last-messages/9", addr))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn test_health() {
    let addr = start_server(Arc::new(MemoryStore::new())).await;

    let response = reqwest::get(format!("http://{}/health", addr)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(body["online"], 0);
    assert_eq!(body["connections"], 0);
}
