use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoomError {
    #[error("Room is full")]
    RoomFull,
    #[error("Room {0} does not exist")]
    RoomNotFound(String),
    #[error("Connection is already in room {0}")]
    AlreadyJoined(String),
}

#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("File data format is incorrect")]
    Base64(#[from] base64::DecodeError),
}

#[derive(Error, Debug)]
pub enum AssemblyError {
    #[error("upload {upload_id} declares zero chunks")]
    InvalidTotal { upload_id: String },
    #[error("chunk {index} is outside 0..{total} for upload {upload_id}")]
    IndexOutOfRange {
        upload_id: String,
        index: u32,
        total: u32,
    },
    #[error("chunk for upload {upload_id} disagrees with the session on {field}")]
    Inconsistent {
        upload_id: String,
        field: &'static str,
    },
    #[error("upload {upload_id} has already completed")]
    AlreadyCompleted { upload_id: String },
    #[error("chunk {index} of upload {upload_id} is missing at merge time")]
    MissingChunk { upload_id: String, index: u32 },
    #[error("scratch storage failure: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("File type not allowed: {0}")]
    DeniedExtension(String),
    #[error("request to storage service failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("storage service returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("unexpected storage service response: {0}")]
    Decode(String),
}
