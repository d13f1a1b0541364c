//! End-to-end delivery through the outbox with a real `LarkChannel` pointed
//! at a mock open-apis server and a hand-driven session.

use async_trait::async_trait;
use lark_courier::channels::LarkChannel;
use lark_courier::config::{DeliveryConfig, DocumentConfig};
use lark_courier::delivery::{LarkSession, LarkTransport, Outbox, PublishOutcome, SendStatus};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Session whose liveness the test flips by hand. `open` reports live at once.
struct ScriptedSession {
    live: watch::Sender<bool>,
}

impl ScriptedSession {
    fn new() -> Self {
        let (live, _) = watch::channel(false);
        Self { live }
    }

    fn set_live(&self, up: bool) {
        self.live.send_replace(up);
    }
}

#[async_trait]
impl LarkSession for ScriptedSession {
    async fn open(&self) -> anyhow::Result<watch::Receiver<bool>> {
        self.live.send_replace(true);
        Ok(self.live.subscribe())
    }
}

fn delivery_config() -> DeliveryConfig {
    DeliveryConfig {
        document_threshold: 100,
        chunk_max_length: 80,
        chunk_delay_ms: 0,
        max_attempts: 2,
        dead_letter_capacity: 10,
    }
}

fn ok(data: serde_json::Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({ "code": 0, "msg": "success", "data": data }))
}

async fn lark_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/v3/tenant_access_token/internal"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 0,
            "tenant_access_token": "t-1",
            "expire": 7200
        })))
        .mount(&server)
        .await;
    server
}

async fn mount_messages(server: &MockServer, response: ResponseTemplate) {
    Mock::given(method("POST"))
        .and(path("/im/v1/messages"))
        .respond_with(response)
        .mount(server)
        .await;
}

fn outbox_for(server: &MockServer, documents: &DocumentConfig) -> Outbox {
    let channel = LarkChannel::new("cli_app", "secret", vec!["*".into()], false)
        .with_api_base(&server.uri())
        .with_web_base("https://acme.larksuite.com");
    let transport: Arc<dyn LarkTransport> = Arc::new(channel);
    Outbox::new(transport, &delivery_config(), documents)
}

/// Texts of every message the server received, in arrival order.
async fn sent_texts(server: &MockServer) -> Vec<String> {
    server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path() == "/im/v1/messages")
        .map(|r| {
            let body: serde_json::Value = serde_json::from_slice(&r.body).unwrap();
            let content: serde_json::Value =
                serde_json::from_str(body["content"].as_str().unwrap()).unwrap();
            content["text"].as_str().unwrap().to_string()
        })
        .collect()
}

fn long_report() -> String {
    let mut report = String::from("# Roadmap\n\n");
    for i in 0..8 {
        report.push_str(&format!("Milestone {i}: ship the next slice of work.\n"));
    }
    report
}

#[tokio::test]
async fn queued_messages_drain_in_order_once_session_is_live() {
    let server = lark_server().await;
    mount_messages(&server, ok(json!({}))).await;
    let outbox = outbox_for(&server, &DocumentConfig::default());

    assert_eq!(outbox.send("oc_team123456", "first").await, SendStatus::Queued);
    assert_eq!(outbox.send("oc_team123456", "second").await, SendStatus::Queued);
    assert!(sent_texts(&server).await.is_empty());

    let session = ScriptedSession::new();
    outbox.connect(&session).await.unwrap();

    assert_eq!(outbox.queue_len(), 0);
    assert_eq!(sent_texts(&server).await, vec!["first", "second"]);
}

#[tokio::test]
async fn long_message_is_published_into_chat_folder() {
    let server = lark_server().await;
    Mock::given(method("GET"))
        .and(path("/im/v1/chats/oc_team123456"))
        .respond_with(ok(json!({ "name": "Core Team" })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/drive/v1/files"))
        .and(query_param("folder_token", "fld_root"))
        .respond_with(ok(json!({
            "files": [{ "name": "Plans", "type": "folder", "token": "fld_plans" }],
            "has_more": false
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/drive/v1/files"))
        .and(query_param("folder_token", "fld_plans"))
        .respond_with(ok(json!({ "files": [], "has_more": false })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/drive/v1/files"))
        .respond_with(ok(json!({
            "files": [{ "name": "scratch.md", "type": "file", "token": "box_x", "parent_token": "fld_root" }]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/drive/v1/files/create_folder"))
        .and(body_partial_json(json!({ "name": "Core Team_123456", "folder_token": "fld_plans" })))
        .respond_with(ok(json!({ "token": "fld_chat" })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/drive/v1/files/upload_all"))
        .respond_with(ok(json!({ "file_token": "box_doc" })))
        .expect(1)
        .mount(&server)
        .await;
    mount_messages(&server, ok(json!({}))).await;

    let outbox = outbox_for(&server, &DocumentConfig::default());
    outbox.connect(&ScriptedSession::new()).await.unwrap();

    let status = outbox.send("oc_team123456", &long_report()).await;
    let SendStatus::Published(PublishOutcome::Document(doc)) = status else {
        panic!("expected a published document, got {status:?}");
    };
    assert!(doc.file_name.starts_with("Roadmap_"));
    assert!(doc.file_name.ends_with(".md"));
    assert_eq!(doc.folder.as_deref(), Some("fld_chat"));
    assert_eq!(doc.link, "https://acme.larksuite.com/file/box_doc");

    let texts = sent_texts(&server).await;
    assert_eq!(texts.len(), 1);
    assert!(texts[0].contains(&doc.link));
    assert!(texts[0].contains(&doc.file_name));
}

#[tokio::test]
async fn failed_upload_falls_back_to_labeled_chunks() {
    let server = lark_server().await;
    Mock::given(method("GET"))
        .and(path("/im/v1/chats/oc_team123456"))
        .respond_with(ok(json!({ "name": "Core Team" })))
        .mount(&server)
        .await;
    // No Drive root can be found, so the upload targets the default location.
    Mock::given(method("GET"))
        .and(path("/drive/v1/files"))
        .respond_with(ok(json!({ "files": [] })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/drive/explorer/v2/root_folder/meta"))
        .respond_with(ok(json!({ "token": "fld_root" })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/drive/v1/files/upload_all"))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream unavailable"))
        .mount(&server)
        .await;
    mount_messages(&server, ok(json!({}))).await;

    let outbox = outbox_for(&server, &DocumentConfig::default());
    outbox.connect(&ScriptedSession::new()).await.unwrap();

    let report = long_report();
    let status = outbox.send("oc_team123456", &report).await;
    let SendStatus::Published(PublishOutcome::Chunked { chunks, reason }) = status else {
        panic!("expected chunked fallback, got {status:?}");
    };
    assert!(reason.contains("upload"), "{reason}");

    let texts = sent_texts(&server).await;
    assert_eq!(texts.len(), chunks);
    assert!(chunks > 1);
    for (i, text) in texts.iter().enumerate() {
        assert!(text.starts_with(&format!("[{}/{chunks}] ", i + 1)), "{text}");
    }
    assert!(texts[0].contains("# Roadmap"));
}

#[tokio::test]
async fn persistent_send_failures_end_in_dead_letters() {
    let server = lark_server().await;
    mount_messages(
        &server,
        ResponseTemplate::new(200).set_body_json(json!({ "code": 230_002, "msg": "bot not in chat" })),
    )
    .await;
    let outbox = outbox_for(&server, &DocumentConfig::default());
    outbox.connect(&ScriptedSession::new()).await.unwrap();

    assert_eq!(
        outbox.send("oc_team123456", "hello").await,
        SendStatus::Requeued { attempts: 1 }
    );
    assert_eq!(outbox.flush().await, vec![SendStatus::DeadLettered]);
    assert_eq!(outbox.queue_len(), 0);

    let dead = outbox.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].delivery.text, "hello");
    assert!(dead[0].reason.contains("230002"), "{}", dead[0].reason);
}

#[tokio::test]
async fn following_the_session_pauses_and_resumes_delivery() {
    let server = lark_server().await;
    mount_messages(&server, ok(json!({}))).await;
    let outbox = Arc::new(outbox_for(&server, &DocumentConfig::default()));
    let session = ScriptedSession::new();

    let live = outbox.connect(&session).await.unwrap();
    let follower = Arc::clone(&outbox).follow_session(live);

    session.set_live(false);
    tokio::time::timeout(Duration::from_secs(5), async {
        while outbox.is_connected() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("outbox should notice the dropped session");

    assert_eq!(outbox.send("oc_team123456", "while away").await, SendStatus::Queued);

    session.set_live(true);
    tokio::time::timeout(Duration::from_secs(5), async {
        while outbox.queue_len() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("queued message should drain after reconnect");

    assert_eq!(sent_texts(&server).await, vec!["while away"]);
    drop(session);
    follower.await.unwrap();
    assert!(!outbox.is_connected());
}
