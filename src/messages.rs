use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PayloadError;
use crate::room::{Member, RoomSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    User,
    Consultant,
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Consultant => "consultant",
            Role::Admin => "admin",
        }
    }
}

/// Who sent a chat message or file, plus the optional reply context that is
/// passed through to the room and the storage service untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SenderMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    #[serde(default, alias = "userId")]
    pub userid: String,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replyto: Option<String>,
    #[serde(rename = "replytoId", default, skip_serializing_if = "Option::is_none")]
    pub replyto_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replytousertype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendations: Option<Value>,
}

/// File bytes as carried on the wire. The encoding is explicit; a base64
/// string may still arrive as a data URL (`data:<mime>;base64,<payload>`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "encoding", content = "data", rename_all = "lowercase")]
pub enum FileData {
    Base64(String),
    Binary(Vec<u8>),
}

impl FileData {
    pub fn decode(self) -> Result<Vec<u8>, PayloadError> {
        match self {
            FileData::Binary(bytes) => Ok(bytes),
            FileData::Base64(text) => {
                let payload = match text.split_once(',') {
                    Some((prefix, rest)) if prefix.starts_with("data:") => rest,
                    _ => text.as_str(),
                };
                Ok(BASE64.decode(payload.trim())?)
            }
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "joinRoom")]
    JoinRoom {
        room: String,
        userid: String,
        name: String,
        role: Role,
    },
    #[serde(rename = "joinQueueRoom")]
    JoinQueueRoom {
        room: String,
        userid: String,
        name: String,
        role: Role,
    },
    #[serde(rename = "leaveRoom")]
    LeaveRoom,
    #[serde(rename = "chatMessage")]
    ChatMessage {
        room: String,
        message: String,
        sender: SenderMeta,
    },
    #[serde(rename = "sendFile")]
    SendFile {
        room: String,
        #[serde(rename = "fileName", default)]
        file_name: Option<String>,
        #[serde(rename = "fileData")]
        file_data: FileData,
        sender: SenderMeta,
    },
    #[serde(rename = "sendFileChunk")]
    SendFileChunk {
        #[serde(rename = "uploadId")]
        upload_id: String,
        #[serde(rename = "fileName")]
        file_name: String,
        #[serde(rename = "chunkIndex")]
        chunk_index: u32,
        #[serde(rename = "totalChunks")]
        total_chunks: u32,
        #[serde(rename = "fileData")]
        file_data: FileData,
        sender: SenderMeta,
        room: String,
    },
    #[serde(rename = "typing")]
    Typing {
        room: String,
        #[serde(default)]
        sender: Option<SenderMeta>,
    },
    #[serde(rename = "stopped")]
    Stopped {
        room: String,
        #[serde(default)]
        sender: Option<SenderMeta>,
    },
    #[serde(rename = "triggerRefresh")]
    TriggerRefresh { room: String },
    #[serde(rename = "triggerPing")]
    TriggerPing { room: String },
    #[serde(rename = "addTime")]
    AddTime {
        room: String,
        minutes: u32,
        reference: String,
    },
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "roomData")]
    RoomData {
        room: String,
        users: Vec<Member>,
        timer: u64,
    },
    #[serde(rename = "roomFull")]
    RoomFull,
    #[serde(rename = "message")]
    Message { sender: SenderMeta, message: String },
    #[serde(rename = "fileMessage")]
    FileMessage {
        sender: SenderMeta,
        #[serde(rename = "fileName")]
        file_name: String,
        #[serde(rename = "fileUrl")]
        file_url: String,
        replyto: Option<String>,
        #[serde(rename = "replytoId")]
        replyto_id: Option<String>,
        replytousertype: Option<String>,
        timestamp: Value,
    },
    #[serde(rename = "uploadProgress")]
    UploadProgress {
        sender: SenderMeta,
        #[serde(rename = "fileName")]
        file_name: String,
        progress: u8,
    },
    #[serde(rename = "istyping")]
    IsTyping {
        #[serde(rename = "userId")]
        user_id: String,
        message: String,
    },
    #[serde(rename = "stoptyping")]
    StopTyping {
        #[serde(rename = "userId")]
        user_id: String,
        message: String,
    },
    #[serde(rename = "refresh")]
    Refresh { message: String },
    #[serde(rename = "roomPing")]
    RoomPing { message: String },
    #[serde(rename = "timerUpdate")]
    TimerUpdate { timer: u64 },
    #[serde(rename = "roomClosed")]
    RoomClosed { room: String },
    #[serde(rename = "error")]
    Error { message: String },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }
}

impl From<RoomSnapshot> for ServerMessage {
    fn from(snapshot: RoomSnapshot) -> Self {
        ServerMessage::RoomData {
            room: snapshot.room,
            users: snapshot.members,
            timer: snapshot.timer,
        }
    }
}

/// Body posted to the chat save endpoint.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ChatRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    pub uid: String,
    pub role: Role,
    pub name: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub room: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replyto: Option<String>,
    #[serde(rename = "replytoId", skip_serializing_if = "Option::is_none")]
    pub replyto_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replytousertype: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendations: Option<Value>,
}

impl ChatRecord {
    pub fn new(sender: &SenderMeta, room: &str, message: &str) -> Self {
        ChatRecord {
            mid: sender.mid.clone(),
            uid: sender.userid.clone(),
            role: sender.role,
            name: sender.name.clone(),
            kind: sender.kind.clone(),
            room: room.to_string(),
            message: message.to_string(),
            replyto: sender.replyto.clone(),
            replyto_id: sender.replyto_id.clone(),
            replytousertype: sender.replytousertype.clone(),
            recommendations: sender.recommendations.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_join_queue_room() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "joinQueueRoom",
            "room": "R1",
            "userid": "u1",
            "name": "Ada",
            "role": "consultant"
        }))
        .unwrap();
        match msg {
            ClientMessage::JoinQueueRoom { room, role, .. } => {
                assert_eq!(room, "R1");
                assert_eq!(role, Role::Consultant);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn parses_chunk_with_tagged_binary_payload() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "sendFileChunk",
            "uploadId": "U1",
            "fileName": "a.txt",
            "chunkIndex": 1,
            "totalChunks": 3,
            "fileData": {"encoding": "binary", "data": [1, 2, 3]},
            "sender": {"userid": "u1", "name": "Ada", "role": "user"},
            "room": "R1"
        }))
        .unwrap();
        match msg {
            ClientMessage::SendFileChunk {
                chunk_index,
                file_data,
                ..
            } => {
                assert_eq!(chunk_index, 1);
                assert_eq!(file_data.decode().unwrap(), vec![1, 2, 3]);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn decodes_data_url_and_plain_base64() {
        let url = FileData::Base64("data:text/plain;base64,aGVsbG8=".to_string());
        assert_eq!(url.decode().unwrap(), b"hello");
        let plain = FileData::Base64("aGVsbG8=".to_string());
        assert_eq!(plain.decode().unwrap(), b"hello");
    }

    #[test]
    fn rejects_undecodable_base64() {
        let bad = FileData::Base64("data:image/png;base64,***".to_string());
        assert!(bad.decode().is_err());
    }

    #[test]
    fn typing_sender_accepts_camel_case_user_id() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "typing",
            "room": "R1",
            "sender": {"userId": "u9", "name": "Bo"}
        }))
        .unwrap();
        match msg {
            ClientMessage::Typing { sender, .. } => {
                assert_eq!(sender.unwrap().userid, "u9");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn chat_record_omits_absent_reply_fields() {
        let sender = SenderMeta {
            mid: Some("m1".into()),
            userid: "u1".into(),
            name: "Ada".into(),
            replyto: Some("hi".into()),
            ..SenderMeta::default()
        };
        let value = serde_json::to_value(ChatRecord::new(&sender, "R1", "hello")).unwrap();
        assert_eq!(value["uid"], "u1");
        assert_eq!(value["replyto"], "hi");
        assert!(value.get("replytoId").is_none());
        assert!(value.get("recommendations").is_none());
    }

    #[test]
    fn server_messages_use_event_names() {
        let value = serde_json::to_value(ServerMessage::TimerUpdate { timer: 42 }).unwrap();
        assert_eq!(value, json!({"type": "timerUpdate", "timer": 42}));
        let value = serde_json::to_value(ServerMessage::RoomFull).unwrap();
        assert_eq!(value, json!({"type": "roomFull"}));
    }
}
