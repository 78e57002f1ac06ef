use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;
use warp::ws::{Message, WebSocket};
use warp::Filter;

use crate::config::Config;
use crate::files::ChunkAssembler;
use crate::messages::{ClientMessage, ServerMessage};
use crate::room::{ConnectionId, RoomMode, RoomRegistry, TickEvent};
use crate::session::Session;
use crate::upload::{SaveService, UploadForwarder};

const MAX_WS_MESSAGE: usize = 100 * 1024 * 1024;

type Connections = RwLock<HashMap<ConnectionId, mpsc::UnboundedSender<ServerMessage>>>;

/// Process-wide state shared by every connection and the scheduler.
pub struct Hub {
    pub(crate) rooms: Mutex<RoomRegistry>,
    pub(crate) assembler: ChunkAssembler,
    pub(crate) forwarder: UploadForwarder,
    pub(crate) service: Arc<dyn SaveService>,
    connections: Connections,
    upload_idle_timeout: Duration,
    upload_sweep_interval: Duration,
}

impl Hub {
    pub async fn new(config: &Config, service: Arc<dyn SaveService>) -> std::io::Result<Arc<Self>> {
        let assembler = ChunkAssembler::new(&config.scratch_dir).await?;
        let forwarder = UploadForwarder::new(Arc::clone(&service), &config.denied_extensions);

        Ok(Arc::new(Hub {
            rooms: Mutex::new(RoomRegistry::new(
                config.default_timer_secs,
                config.capacity(RoomMode::Standard),
                config.capacity(RoomMode::Queue),
            )),
            assembler,
            forwarder,
            service,
            connections: RwLock::new(HashMap::new()),
            upload_idle_timeout: config.upload_idle_timeout(),
            upload_sweep_interval: config.upload_sweep_interval(),
        }))
    }

    /// Allocates a connection id and the queue its outbound messages go to.
    pub async fn register(&self) -> (ConnectionId, mpsc::UnboundedReceiver<ServerMessage>) {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections.write().await.insert(id.clone(), tx);
        (id, rx)
    }

    pub async fn unregister(&self, connection: &str) {
        self.connections.write().await.remove(connection);
    }

    pub async fn send_to(&self, connection: &str, message: ServerMessage) {
        let connections = self.connections.read().await;
        if let Some(sender) = connections.get(connection) {
            let _ = sender.send(message);
        }
    }

    async fn send_many(&self, targets: &[ConnectionId], message: &ServerMessage) {
        let connections = self.connections.read().await;
        for target in targets {
            if let Some(sender) = connections.get(target) {
                let _ = sender.send(message.clone());
            }
        }
    }

    /// Sends `message` to whoever is in `room` right now.
    pub async fn broadcast(&self, room: &str, message: ServerMessage) {
        let targets = self.rooms.lock().await.connections_in(room);
        if targets.is_empty() {
            log::debug!("Room {room} has no members, dropping broadcast");
            return;
        }
        self.send_many(&targets, &message).await;
    }

    pub async fn room_exists(&self, room: &str) -> bool {
        self.rooms.lock().await.contains(room)
    }

    /// One scheduler second: advance timers and deliver the results.
    pub async fn tick(&self) {
        let deliveries: Vec<(Vec<ConnectionId>, ServerMessage)> = {
            let mut rooms = self.rooms.lock().await;
            rooms
                .tick()
                .into_iter()
                .map(|event| match event {
                    TickEvent::TimerUpdate { room, timer } => {
                        (rooms.connections_in(&room), ServerMessage::TimerUpdate { timer })
                    }
                    TickEvent::Closed { room, evicted } => (evicted, ServerMessage::RoomClosed { room }),
                })
                .collect()
        };

        for (targets, message) in deliveries {
            self.send_many(&targets, &message).await;
        }
    }

    pub async fn sweep_uploads(&self) -> Vec<String> {
        self.assembler.expire_idle(self.upload_idle_timeout).await
    }

    /// Starts the one-second room timer and the idle-upload sweeper.
    pub fn spawn_scheduler(self: &Arc<Self>) {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            interval.tick().await;
            loop {
                interval.tick().await;
                hub.tick().await;
            }
        });

        let hub = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(hub.upload_sweep_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                hub.sweep_uploads().await;
            }
        });
    }

    pub async fn handle_connection(self: Arc<Self>, ws: WebSocket) {
        let (connection, mut rx) = self.register().await;
        let (mut ws_tx, mut ws_rx) = ws.split();
        log::info!("New user connected: {connection}");

        let writer_id = connection.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        log::error!("Failed to encode message for {writer_id}: {e}");
                        continue;
                    }
                };
                if let Err(e) = ws_tx.send(Message::text(text)).await {
                    log::warn!("Failed to send WebSocket message to {writer_id}: {e}");
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        let session = Session::new(Arc::clone(&self), connection.clone());
        while let Some(result) = ws_rx.next().await {
            let msg = match result {
                Ok(msg) => msg,
                Err(e) => {
                    log::error!("WebSocket error on {connection}: {e}");
                    break;
                }
            };
            if msg.is_close() {
                break;
            }
            let Ok(text) = msg.to_str() else {
                continue;
            };
            match serde_json::from_str::<ClientMessage>(text) {
                Ok(client_msg) => session.handle(client_msg).await,
                Err(e) => {
                    log::warn!("Unreadable message from {connection}: {e}");
                    self.send_to(&connection, ServerMessage::error(format!("Invalid message: {e}")))
                        .await;
                }
            }
        }

        log::info!("User disconnected: {connection}");
        session.disconnect().await;
    }
}

/// All HTTP and websocket routes of the service.
pub fn routes(
    hub: Arc<Hub>,
    static_dir: PathBuf,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    let ws_route = warp::path("ws")
        .and(warp::path::end())
        .and(warp::ws())
        .map(move |ws: warp::ws::Ws| {
            let hub = Arc::clone(&hub);
            ws.max_message_size(MAX_WS_MESSAGE)
                .max_frame_size(MAX_WS_MESSAGE)
                .on_upgrade(move |socket| hub.handle_connection(socket))
        });

    let export = warp::path("export")
        .and(warp::path::end())
        .and(warp::get())
        .map(|| {
            log::info!("Export endpoint accessed");
            warp::reply::json(&json!({
                "message": "Export functionality activated!",
                "status": "success",
                "date": chrono::Utc::now().to_rfc3339(),
            }))
        });

    let static_files = warp::fs::dir(static_dir);

    ws_route.or(export).or(static_files).with(
        warp::cors()
            .allow_any_origin()
            .allow_methods(vec!["GET", "POST"])
            .allow_headers(vec!["Content-Type", "Authorization"]),
    )
}
