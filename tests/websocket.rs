use std::sync::Arc;

use async_trait::async_trait;
use room_coordinator::error::ForwardError;
use room_coordinator::messages::ChatRecord;
use room_coordinator::upload::{FileReference, FileUpload, SaveService};
use room_coordinator::{routes, Config, Hub};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use warp::test::WsClient;

struct StaticService;

#[async_trait]
impl SaveService for StaticService {
    async fn save_message(&self, _record: &ChatRecord) -> Result<(), ForwardError> {
        Ok(())
    }

    async fn upload_file(
        &self,
        upload: FileUpload,
        _progress: Option<mpsc::UnboundedSender<u8>>,
    ) -> Result<FileReference, ForwardError> {
        Ok(FileReference {
            path: format!("/uploads/{}", upload.file_name),
            timestamp: json!(0),
        })
    }

    async fn transaction_status(&self, _reference: &str) -> Result<String, ForwardError> {
        Ok("completed".to_string())
    }
}

async fn setup() -> (tempfile::TempDir, Arc<Hub>, Config) {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        scratch_dir: dir.path().join("chunks"),
        static_dir: dir.path().to_path_buf(),
        ..Config::default()
    };
    let hub = Hub::new(&config, Arc::new(StaticService)).await.unwrap();
    (dir, hub, config)
}

async fn connect(hub: &Arc<Hub>, config: &Config) -> WsClient {
    warp::test::ws()
        .path("/ws")
        .handshake(routes(Arc::clone(hub), config.static_dir.clone()))
        .await
        .expect("handshake")
}

async fn send(client: &mut WsClient, value: Value) {
    client.send_text(value.to_string()).await;
}

async fn recv(client: &mut WsClient) -> Value {
    let msg = client.recv().await.expect("message");
    serde_json::from_str(msg.to_str().expect("text frame")).expect("json")
}

fn join_queue(userid: &str) -> Value {
    json!({"type": "joinQueueRoom", "room": "R1", "userid": userid, "name": userid, "role": "user"})
}

#[tokio::test]
async fn queue_room_over_websocket() {
    let (_dir, hub, config) = setup().await;
    let mut a = connect(&hub, &config).await;
    let mut b = connect(&hub, &config).await;
    let mut c = connect(&hub, &config).await;

    send(&mut a, join_queue("A")).await;
    let data = recv(&mut a).await;
    assert_eq!(data["type"], "roomData");
    assert_eq!(data["timer"], 600);

    send(&mut b, join_queue("B")).await;
    let data = recv(&mut b).await;
    assert_eq!(data["users"], json!([
        {"userid": "A", "name": "A", "role": "user"},
        {"userid": "B", "name": "B", "role": "user"}
    ]));
    assert_eq!(recv(&mut a).await["users"].as_array().unwrap().len(), 2);

    send(&mut c, join_queue("C")).await;
    assert_eq!(recv(&mut c).await, json!({"type": "roomFull"}));

    send(&mut a, json!({
        "type": "chatMessage",
        "room": "R1",
        "message": "hi",
        "sender": {"userid": "A", "name": "A", "role": "user"}
    }))
    .await;
    let message = recv(&mut b).await;
    assert_eq!(message["type"], "message");
    assert_eq!(message["message"], "hi");
}

#[tokio::test]
async fn unreadable_frames_get_an_error_reply() {
    let (_dir, hub, config) = setup().await;
    let mut a = connect(&hub, &config).await;

    a.send_text("{\"type\": \"danceParty\"}").await;
    let reply = recv(&mut a).await;
    assert_eq!(reply["type"], "error");
}

#[tokio::test]
async fn closing_the_socket_leaves_the_room() {
    let (_dir, hub, config) = setup().await;
    let mut a = connect(&hub, &config).await;
    let mut b = connect(&hub, &config).await;

    send(&mut a, join_queue("A")).await;
    recv(&mut a).await;
    send(&mut b, join_queue("B")).await;
    recv(&mut b).await;

    drop(a);
    let data = recv(&mut b).await;
    assert_eq!(data["type"], "roomData");
    assert_eq!(data["users"], json!([{"userid": "B", "name": "B", "role": "user"}]));
}

#[tokio::test]
async fn export_reports_success() {
    let (_dir, hub, config) = setup().await;
    let response = warp::test::request()
        .method("GET")
        .path("/export")
        .reply(&routes(hub, config.static_dir.clone()))
        .await;

    assert_eq!(response.status(), 200);
    let body: Value = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(body["status"], "success");
    assert!(body["date"].is_string());
}
