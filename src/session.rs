//! Per-connection event dispatch.
//!
//! A [`Session`] binds one connection to the shared [`Hub`]. Each inbound
//! event is validated and applied to room or upload state before anything
//! is awaited on an external service; the external calls themselves run in
//! spawned tasks so a slow upload never stalls the connection's later
//! events. Anything looked up before such a call is looked up again when
//! its result is broadcast.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::{AssemblyError, RoomError};
use crate::files::{Chunk, ChunkOutcome};
use crate::messages::{ChatRecord, ClientMessage, FileData, SenderMeta, ServerMessage};
use crate::room::{ConnectionId, Member, RoomMode};
use crate::server::Hub;
use crate::upload::{FileUpload, UploadForwarder};

const TRANSACTION_COMPLETED: &str = "completed";

#[derive(Clone)]
pub struct Session {
    hub: Arc<Hub>,
    connection: ConnectionId,
}

impl Session {
    pub fn new(hub: Arc<Hub>, connection: ConnectionId) -> Self {
        Session { hub, connection }
    }

    pub async fn handle(&self, message: ClientMessage) {
        match message {
            ClientMessage::JoinRoom {
                room,
                userid,
                name,
                role,
            } => self.join(room, Member { userid, name, role }, RoomMode::Standard).await,
            ClientMessage::JoinQueueRoom {
                room,
                userid,
                name,
                role,
            } => self.join(room, Member { userid, name, role }, RoomMode::Queue).await,
            ClientMessage::LeaveRoom => self.leave().await,
            ClientMessage::ChatMessage {
                room,
                message,
                sender,
            } => self.chat(room, message, sender).await,
            ClientMessage::SendFile {
                room,
                file_name,
                file_data,
                sender,
            } => {
                let file_name = file_name
                    .filter(|n| !n.is_empty())
                    .unwrap_or_else(|| "uploadedFile".to_string());
                self.send_file(room, file_name, file_data, sender).await;
            }
            ClientMessage::SendFileChunk {
                upload_id,
                file_name,
                chunk_index,
                total_chunks,
                file_data,
                sender,
                room,
            } => {
                let Some(bytes) = self.decode(&room, file_data).await else {
                    return;
                };
                self.send_chunk(Chunk {
                    upload_id,
                    index: chunk_index,
                    total: total_chunks,
                    file_name,
                    bytes,
                    sender,
                    room,
                })
                .await;
            }
            ClientMessage::Typing { room, sender } => self.typing(&room, sender, true).await,
            ClientMessage::Stopped { room, sender } => self.typing(&room, sender, false).await,
            ClientMessage::TriggerRefresh { room } => {
                self.notify_existing_room(
                    &room,
                    ServerMessage::Refresh {
                        message: "Refresh the room data or UI".to_string(),
                    },
                )
                .await;
            }
            ClientMessage::TriggerPing { room } => {
                self.notify_existing_room(
                    &room,
                    ServerMessage::RoomPing {
                        message: "Stay In Room".to_string(),
                    },
                )
                .await;
            }
            ClientMessage::AddTime {
                room,
                minutes,
                reference,
            } => self.add_time(room, minutes, reference).await,
        }
    }

    async fn reply(&self, message: ServerMessage) {
        self.hub.send_to(&self.connection, message).await;
    }

    async fn join(&self, room: String, member: Member, mode: RoomMode) {
        let name = member.name.clone();
        let role = member.role;
        let result = self.hub.rooms.lock().await.join(&self.connection, &room, member, mode);
        match result {
            Ok(snapshot) => {
                log::info!("{name} joined room {room} as {}", role.as_str());
                self.hub.broadcast(&room, snapshot.into()).await;
            }
            Err(RoomError::RoomFull) => {
                log::info!("{name} turned away from full room {room}");
                self.reply(ServerMessage::RoomFull).await;
            }
            Err(e) => {
                log::warn!("Join of {room} by {} rejected: {e}", self.connection);
                self.reply(ServerMessage::error(e.to_string())).await;
            }
        }
    }

    async fn leave(&self) {
        let snapshot = self.hub.rooms.lock().await.leave(&self.connection);
        if let Some(snapshot) = snapshot {
            let room = snapshot.room.clone();
            self.hub.broadcast(&room, snapshot.into()).await;
        }
    }

    /// Leaves any room and drops the outbound queue.
    pub async fn disconnect(&self) {
        self.leave().await;
        self.hub.unregister(&self.connection).await;
    }

    /// Live delivery first, then a best-effort save that nobody waits for.
    async fn chat(&self, room: String, message: String, sender: SenderMeta) {
        let record = ChatRecord::new(&sender, &room, &message);
        self.hub
            .broadcast(&room, ServerMessage::Message { sender, message })
            .await;

        let service = Arc::clone(&self.hub.service);
        tokio::spawn(async move {
            match service.save_message(&record).await {
                Ok(()) => log::debug!("Message saved for room {}", record.room),
                Err(e) => log::error!("Error saving message for room {}: {e}", record.room),
            }
        });
    }

    async fn decode(&self, room: &str, data: FileData) -> Option<Vec<u8>> {
        match data.decode() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                log::warn!("Undecodable file data from {}: {e}", self.connection);
                self.hub.broadcast(room, ServerMessage::error(e.to_string())).await;
                None
            }
        }
    }

    async fn send_file(&self, room: String, file_name: String, data: FileData, sender: SenderMeta) {
        if let Err(e) = self.hub.forwarder.check_file_name(&file_name) {
            log::warn!("Rejected file {file_name} from {}", self.connection);
            self.reply(ServerMessage::error(e.to_string())).await;
            return;
        }
        let Some(bytes) = self.decode(&room, data).await else {
            return;
        };

        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        tokio::spawn(relay_progress(
            Arc::clone(&self.hub),
            room.clone(),
            sender.clone(),
            file_name.clone(),
            progress_rx,
        ));

        let hub = Arc::clone(&self.hub);
        tokio::spawn(async move {
            let upload = FileUpload {
                bytes,
                file_name,
                sender,
                room,
            };
            forward_and_announce(&hub, upload, Some(progress_tx)).await;
        });
    }

    async fn send_chunk(&self, chunk: Chunk) {
        if let Err(e) = self.hub.forwarder.check_file_name(&chunk.file_name) {
            log::warn!("Rejected chunk for {} from {}", chunk.file_name, self.connection);
            self.reply(ServerMessage::error(e.to_string())).await;
            return;
        }

        let sender = chunk.sender.clone();
        let file_name = chunk.file_name.clone();
        match self.hub.assembler.accept_chunk(chunk).await {
            Ok(ChunkOutcome::Pending { received, total }) => {
                let progress = u8::try_from(u64::from(received) * 100 / u64::from(total)).unwrap_or(100);
                self.reply(ServerMessage::UploadProgress {
                    sender,
                    file_name,
                    progress,
                })
                .await;
            }
            Ok(ChunkOutcome::Complete(done)) => {
                let hub = Arc::clone(&self.hub);
                let upload = FileUpload {
                    bytes: done.bytes,
                    file_name: done.file_name,
                    sender: done.sender,
                    room: done.room,
                };
                tokio::spawn(async move { forward_and_announce(&hub, upload, None).await });
            }
            Err(e @ AssemblyError::AlreadyCompleted { .. }) => {
                log::debug!("Ignoring late chunk from {}: {e}", self.connection);
            }
            Err(e @ (AssemblyError::MissingChunk { .. } | AssemblyError::Io(_))) => {
                log::error!("Upload of {file_name} abandoned: {e}");
            }
            Err(e) => {
                log::warn!("Rejected chunk from {}: {e}", self.connection);
                self.reply(ServerMessage::error(e.to_string())).await;
            }
        }
    }

    async fn typing(&self, room: &str, sender: Option<SenderMeta>, typing: bool) {
        let SenderMeta { userid, name, .. } = sender.unwrap_or_default();
        let message = if typing {
            ServerMessage::IsTyping {
                user_id: userid,
                message: format!("{name} is typing..."),
            }
        } else {
            ServerMessage::StopTyping {
                user_id: userid,
                message: format!("{name} stopped typing"),
            }
        };
        self.notify_existing_room(room, message).await;
    }

    async fn notify_existing_room(&self, room: &str, message: ServerMessage) {
        if self.hub.room_exists(room).await {
            log::debug!("Emitting {message:?} to room {room}");
            self.hub.broadcast(room, message).await;
        } else {
            self.reply(ServerMessage::error(RoomError::RoomNotFound(room.to_string()).to_string()))
                .await;
        }
    }

    /// Extends the room timer once the payment behind `reference` is
    /// confirmed as completed.
    async fn add_time(&self, room: String, minutes: u32, reference: String) {
        if !self.hub.room_exists(&room).await {
            log::info!("Room {room} does not exist.");
            self.reply(ServerMessage::error(RoomError::RoomNotFound(room).to_string()))
                .await;
            return;
        }

        let hub = Arc::clone(&self.hub);
        tokio::spawn(async move {
            let status = match hub.service.transaction_status(&reference).await {
                Ok(status) => status,
                Err(e) => {
                    log::error!("Error checking transaction status for {reference}: {e}");
                    hub.broadcast(&room, ServerMessage::error("Failed to check transaction status"))
                        .await;
                    return;
                }
            };

            if status != TRANSACTION_COMPLETED {
                log::info!(
                    "Transaction status for reference {reference} is {status}. Time extension denied."
                );
                hub.broadcast(
                    &room,
                    ServerMessage::error("Transaction not completed. Cannot extend time."),
                )
                .await;
                return;
            }

            let extended = hub
                .rooms
                .lock()
                .await
                .extend_timer(&room, u64::from(minutes) * 60);
            match extended {
                Ok(timer) => {
                    log::info!("Timer extended by {minutes} minutes for room {room}.");
                    hub.broadcast(&room, ServerMessage::TimerUpdate { timer }).await;
                }
                Err(e) => log::warn!("Paid extension for {reference} not applied: {e}"),
            }
        });
    }
}

async fn forward_and_announce(
    hub: &Hub,
    upload: FileUpload,
    progress: Option<mpsc::UnboundedSender<u8>>,
) {
    let room = upload.room.clone();
    let sender = upload.sender.clone();
    let file_name = upload.file_name.clone();

    match hub.forwarder.forward(upload, progress).await {
        Ok(reference) => {
            let message = UploadForwarder::file_message(sender, file_name, reference);
            hub.broadcast(&room, message).await;
        }
        Err(e) => {
            log::error!("Error uploading file {file_name}: {e}");
            hub.broadcast(&room, ServerMessage::error("Failed to upload file"))
                .await;
        }
    }
}

async fn relay_progress(
    hub: Arc<Hub>,
    room: String,
    sender: SenderMeta,
    file_name: String,
    mut progress: mpsc::UnboundedReceiver<u8>,
) {
    while let Some(pct) = progress.recv().await {
        log::debug!("Upload progress for {file_name}: {pct}%");
        hub.broadcast(
            &room,
            ServerMessage::UploadProgress {
                sender: sender.clone(),
                file_name: file_name.clone(),
                progress: pct,
            },
        )
        .await;
    }
}
