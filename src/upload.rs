//! Forwarding of messages and files to the external storage service.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::error::ForwardError;
use crate::messages::{ChatRecord, SenderMeta, ServerMessage};

const PROGRESS_SLICE: usize = 64 * 1024;

/// A complete file ready to be stored.
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub bytes: Vec<u8>,
    pub file_name: String,
    pub sender: SenderMeta,
    pub room: String,
}

/// Where the storage service put a file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FileReference {
    pub path: String,
    #[serde(default)]
    pub timestamp: Value,
}

#[derive(Deserialize)]
struct UploadResponse {
    file: FileReference,
}

#[derive(Deserialize)]
struct TransactionResponse {
    status: String,
}

/// The external HTTP collaborators: chat save, file upload and
/// transaction-status lookup.
#[async_trait]
pub trait SaveService: Send + Sync {
    async fn save_message(&self, record: &ChatRecord) -> Result<(), ForwardError>;

    /// Stores a file. When `progress` is given, whole percentages are sent
    /// on it as the body is streamed.
    async fn upload_file(
        &self,
        upload: FileUpload,
        progress: Option<mpsc::UnboundedSender<u8>>,
    ) -> Result<FileReference, ForwardError>;

    async fn transaction_status(&self, reference: &str) -> Result<String, ForwardError>;
}

pub struct HttpSaveService {
    client: reqwest::Client,
    save_url: String,
    upload_url: String,
    transaction_url: String,
}

impl HttpSaveService {
    pub fn new(config: &Config) -> Result<Self, ForwardError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;

        Ok(HttpSaveService {
            client,
            save_url: config.endpoint(&config.save_path),
            upload_url: config.endpoint(&config.upload_path),
            transaction_url: config.endpoint(&config.transaction_path),
        })
    }
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ForwardError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ForwardError::Status { status, body })
}

fn percent(sent: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    u8::try_from(sent.saturating_mul(100) / total).unwrap_or(100)
}

fn progress_body(bytes: Vec<u8>, progress: Option<mpsc::UnboundedSender<u8>>) -> reqwest::Body {
    let total = bytes.len();
    let slices: Vec<Vec<u8>> = bytes.chunks(PROGRESS_SLICE).map(<[u8]>::to_vec).collect();
    let mut sent = 0usize;
    let mut last = None;

    let stream = futures_util::stream::iter(slices).map(move |slice| {
        sent += slice.len();
        let pct = percent(sent, total);
        if last != Some(pct) {
            last = Some(pct);
            if let Some(tx) = &progress {
                let _ = tx.send(pct);
            }
        }
        Ok::<_, std::io::Error>(slice)
    });
    reqwest::Body::wrap_stream(stream)
}

fn upload_form(upload: FileUpload, progress: Option<mpsc::UnboundedSender<u8>>) -> Result<Form, ForwardError> {
    let FileUpload {
        bytes,
        file_name,
        sender,
        room,
    } = upload;
    let length = bytes.len() as u64;
    let file_name = if file_name.is_empty() {
        "uploadedFile".to_string()
    } else {
        file_name
    };

    let part = Part::stream_with_length(progress_body(bytes, progress), length)
        .file_name(file_name)
        .mime_str("application/octet-stream")?;

    let mut form = Form::new()
        .part("file", part)
        .text("mid", sender.mid.unwrap_or_default())
        .text("uid", sender.userid)
        .text("role", sender.role.as_str())
        .text("name", sender.name)
        .text("type", sender.kind.unwrap_or_default())
        .text("room", room);

    if let Some(replyto) = sender.replyto {
        form = form.text("replyto", replyto);
    }
    if let Some(replyto_id) = sender.replyto_id {
        form = form.text("replytoId", replyto_id);
    }
    if let Some(replytousertype) = sender.replytousertype {
        form = form.text("replytousertype", replytousertype);
    }
    Ok(form)
}

#[async_trait]
impl SaveService for HttpSaveService {
    async fn save_message(&self, record: &ChatRecord) -> Result<(), ForwardError> {
        let response = self.client.post(&self.save_url).json(record).send().await?;
        ensure_success(response).await?;
        Ok(())
    }

    async fn upload_file(
        &self,
        upload: FileUpload,
        progress: Option<mpsc::UnboundedSender<u8>>,
    ) -> Result<FileReference, ForwardError> {
        let form = upload_form(upload, progress)?;
        let response = self
            .client
            .post(&self.upload_url)
            .multipart(form)
            .send()
            .await?;
        let body = ensure_success(response).await?.text().await?;
        let parsed: UploadResponse =
            serde_json::from_str(&body).map_err(|e| ForwardError::Decode(e.to_string()))?;
        Ok(parsed.file)
    }

    async fn transaction_status(&self, reference: &str) -> Result<String, ForwardError> {
        let mut url = reqwest::Url::parse(&self.transaction_url)
            .map_err(|e| ForwardError::Decode(format!("invalid transaction url: {e}")))?;
        url.path_segments_mut()
            .map_err(|()| ForwardError::Decode("transaction url cannot take a path".into()))?
            .push(reference);

        let response = self.client.get(url).send().await?;
        let body = ensure_success(response).await?.text().await?;
        let parsed: TransactionResponse =
            serde_json::from_str(&body).map_err(|e| ForwardError::Decode(e.to_string()))?;
        Ok(parsed.status)
    }
}

/// Applies the file-name policy and hands finished files to the storage
/// service. Never retries.
pub struct UploadForwarder {
    service: Arc<dyn SaveService>,
    denied_extensions: Vec<String>,
}

impl UploadForwarder {
    pub fn new(service: Arc<dyn SaveService>, denied_extensions: &[String]) -> Self {
        UploadForwarder {
            service,
            denied_extensions: denied_extensions.iter().map(|e| e.to_lowercase()).collect(),
        }
    }

    pub fn check_file_name(&self, file_name: &str) -> Result<(), ForwardError> {
        let lower = file_name.to_lowercase();
        if self.denied_extensions.iter().any(|ext| lower.ends_with(ext.as_str())) {
            return Err(ForwardError::DeniedExtension(file_name.to_string()));
        }
        Ok(())
    }

    pub async fn forward(
        &self,
        upload: FileUpload,
        progress: Option<mpsc::UnboundedSender<u8>>,
    ) -> Result<FileReference, ForwardError> {
        self.check_file_name(&upload.file_name)?;
        log::info!(
            "Forwarding {} ({} bytes) for room {}",
            upload.file_name,
            upload.bytes.len(),
            upload.room
        );
        self.service.upload_file(upload, progress).await
    }

    /// The `fileMessage` broadcast announcing a stored file.
    pub fn file_message(sender: SenderMeta, file_name: String, reference: FileReference) -> ServerMessage {
        ServerMessage::FileMessage {
            replyto: sender.replyto.clone(),
            replyto_id: sender.replyto_id.clone(),
            replytousertype: sender.replytousertype.clone(),
            sender,
            file_name,
            file_url: reference.path,
            timestamp: reference.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn service_for(server: &MockServer) -> Arc<HttpSaveService> {
        let config = Config {
            api_base_url: format!("{}/api", server.uri()),
            ..Config::default()
        };
        Arc::new(HttpSaveService::new(&config).unwrap())
    }

    fn sender() -> SenderMeta {
        SenderMeta {
            mid: Some("m1".into()),
            userid: "u1".into(),
            name: "Ada".into(),
            replyto: Some("earlier".into()),
            ..SenderMeta::default()
        }
    }

    fn upload(name: &str, bytes: Vec<u8>) -> FileUpload {
        FileUpload {
            bytes,
            file_name: name.to_string(),
            sender: sender(),
            room: "R1".to_string(),
        }
    }

    #[tokio::test]
    async fn upload_returns_file_reference() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat/upload"))
            .and(body_string_contains("filename=\"notes.txt\""))
            .and(body_string_contains("replyto"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "file": {"path": "https://cdn.example/notes.txt", "timestamp": "2024-01-01T00:00:00Z"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let forwarder = UploadForwarder::new(service_for(&server), &[".exe".to_string()]);
        let reference = forwarder
            .forward(upload("notes.txt", b"hello".to_vec()), None)
            .await
            .unwrap();
        assert_eq!(reference.path, "https://cdn.example/notes.txt");
        assert_eq!(reference.timestamp, json!("2024-01-01T00:00:00Z"));
    }

    #[tokio::test]
    async fn upload_reports_progress_up_to_100() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat/upload"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"file": {"path": "p", "timestamp": 1}})),
            )
            .mount(&server)
            .await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let service = service_for(&server);
        service
            .upload_file(upload("big.bin", vec![7u8; 4 * PROGRESS_SLICE]), Some(tx))
            .await
            .unwrap();

        let mut seen = Vec::new();
        while let Ok(pct) = rx.try_recv() {
            seen.push(pct);
        }
        assert_eq!(seen, vec![25, 50, 75, 100]);
    }

    #[tokio::test]
    async fn upload_failure_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat/upload"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let err = service_for(&server)
            .upload_file(upload("a.txt", b"x".to_vec()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ForwardError::Status { ref body, .. } if body == "boom"));
    }

    #[tokio::test]
    async fn denied_extension_never_reaches_the_network() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let forwarder = UploadForwarder::new(service_for(&server), &[".EXE".to_string()]);
        let err = forwarder
            .forward(upload("setup.Exe", b"MZ".to_vec()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ForwardError::DeniedExtension(_)));
        assert!(forwarder.check_file_name("setup.exe.txt").is_ok());
    }

    #[tokio::test]
    async fn save_message_posts_chat_record() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat/save"))
            .and(body_json(json!({
                "mid": "m1",
                "uid": "u1",
                "role": "user",
                "name": "Ada",
                "room": "R1",
                "message": "hello",
                "replyto": "earlier"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        service_for(&server)
            .save_message(&ChatRecord::new(&sender(), "R1", "hello"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn transaction_status_reads_status_field() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/users/gettranstat/TX1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "pending"})))
            .mount(&server)
            .await;

        let status = service_for(&server).transaction_status("TX1").await.unwrap();
        assert_eq!(status, "pending");
    }

    #[test]
    fn file_message_carries_reply_context() {
        let msg = UploadForwarder::file_message(
            sender(),
            "a.png".into(),
            FileReference {
                path: "/files/a.png".into(),
                timestamp: json!(1_700_000_000),
            },
        );
        let value = serde_json::to_value(msg).unwrap();
        assert_eq!(value["type"], "fileMessage");
        assert_eq!(value["fileUrl"], "/files/a.png");
        assert_eq!(value["replyto"], "earlier");
        assert_eq!(value["replytoId"], Value::Null);
    }
}
