use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::sync::Mutex;

use crate::error::AssemblyError;
use crate::messages::SenderMeta;

/// One received chunk of a client-side chunked upload.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub upload_id: String,
    pub index: u32,
    pub total: u32,
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub sender: SenderMeta,
    pub room: String,
}

#[derive(Debug)]
pub struct CompletedUpload {
    pub upload_id: String,
    pub file_name: String,
    pub sender: SenderMeta,
    pub room: String,
    pub bytes: Vec<u8>,
    pub sha256: String,
}

#[derive(Debug)]
pub enum ChunkOutcome {
    Pending { received: u32, total: u32 },
    Complete(CompletedUpload),
}

#[derive(Debug)]
struct UploadSession {
    file_name: String,
    total: u32,
    received: HashSet<u32>,
    sender: SenderMeta,
    room: String,
    last_activity: Instant,
}

#[derive(Default)]
struct Uploads {
    active: HashMap<String, UploadSession>,
    /// Finished upload ids and when they finished. Chunks arriving for
    /// these are refused until the entry ages out in `expire_idle`.
    completed: HashMap<String, Instant>,
}

/// Reassembles chunked uploads. Each chunk is written to scratch storage
/// before it counts as received, so a session only completes once every
/// index `0..total` is on disk.
pub struct ChunkAssembler {
    uploads: Mutex<Uploads>,
    scratch_dir: PathBuf,
}

impl ChunkAssembler {
    pub async fn new(scratch_dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let scratch_dir = scratch_dir.into();
        fs::create_dir_all(&scratch_dir).await?;

        Ok(ChunkAssembler {
            uploads: Mutex::new(Uploads::default()),
            scratch_dir,
        })
    }

    /// Upload ids come from clients, so the on-disk directory is a digest of
    /// the id rather than the id itself.
    fn upload_dir(&self, upload_id: &str) -> PathBuf {
        let digest = Sha256::digest(upload_id.as_bytes());
        self.scratch_dir.join(format!("{digest:x}"))
    }

    fn chunk_path(dir: &Path, index: u32) -> PathBuf {
        dir.join(format!("{index}.part"))
    }

    pub async fn accept_chunk(&self, chunk: Chunk) -> Result<ChunkOutcome, AssemblyError> {
        if chunk.total == 0 {
            return Err(AssemblyError::InvalidTotal {
                upload_id: chunk.upload_id,
            });
        }
        if chunk.index >= chunk.total {
            return Err(AssemblyError::IndexOutOfRange {
                upload_id: chunk.upload_id,
                index: chunk.index,
                total: chunk.total,
            });
        }

        {
            let mut uploads = self.uploads.lock().await;
            let uploads = &mut *uploads;
            if uploads.completed.contains_key(&chunk.upload_id) {
                return Err(AssemblyError::AlreadyCompleted {
                    upload_id: chunk.upload_id,
                });
            }
            match uploads.active.get_mut(&chunk.upload_id) {
                Some(session) => {
                    let mismatch = if session.total != chunk.total {
                        Some("totalChunks")
                    } else if session.file_name != chunk.file_name {
                        Some("fileName")
                    } else if session.room != chunk.room {
                        Some("room")
                    } else {
                        None
                    };
                    if let Some(field) = mismatch {
                        return Err(AssemblyError::Inconsistent {
                            upload_id: chunk.upload_id,
                            field,
                        });
                    }
                    session.last_activity = Instant::now();
                }
                None => {
                    log::info!(
                        "Starting upload {} of {} ({} chunks) for room {}",
                        chunk.upload_id,
                        chunk.file_name,
                        chunk.total,
                        chunk.room
                    );
                    uploads.active.insert(
                        chunk.upload_id.clone(),
                        UploadSession {
                            file_name: chunk.file_name.clone(),
                            total: chunk.total,
                            received: HashSet::new(),
                            sender: chunk.sender.clone(),
                            room: chunk.room.clone(),
                            last_activity: Instant::now(),
                        },
                    );
                }
            }
        }

        let dir = self.upload_dir(&chunk.upload_id);
        fs::create_dir_all(&dir).await?;
        fs::write(Self::chunk_path(&dir, chunk.index), &chunk.bytes).await?;
        log::debug!(
            "Stored chunk {}/{} of upload {}",
            chunk.index + 1,
            chunk.total,
            chunk.upload_id
        );

        let finished = {
            let mut uploads = self.uploads.lock().await;
            let uploads = &mut *uploads;
            if uploads.completed.contains_key(&chunk.upload_id) {
                // A concurrent duplicate finished the upload first; its merge
                // owns the scratch directory.
                return Err(AssemblyError::AlreadyCompleted {
                    upload_id: chunk.upload_id,
                });
            }
            match uploads.active.get_mut(&chunk.upload_id) {
                Some(session) => {
                    session.received.insert(chunk.index);
                    let received = u32::try_from(session.received.len()).unwrap_or(u32::MAX);
                    if received < session.total {
                        return Ok(ChunkOutcome::Pending {
                            received,
                            total: session.total,
                        });
                    }
                    uploads
                        .completed
                        .insert(chunk.upload_id.clone(), Instant::now());
                    uploads.active.remove(&chunk.upload_id)
                }
                None => None,
            }
        };

        match finished {
            Some(session) => self.merge(chunk.upload_id, session, &dir).await,
            None => {
                // Expired while the chunk was being written.
                remove_dir(&dir).await;
                Err(AssemblyError::Inconsistent {
                    upload_id: chunk.upload_id,
                    field: "session",
                })
            }
        }
    }

    async fn merge(
        &self,
        upload_id: String,
        session: UploadSession,
        dir: &Path,
    ) -> Result<ChunkOutcome, AssemblyError> {
        let mut bytes = Vec::new();
        for index in 0..session.total {
            match fs::read(Self::chunk_path(dir, index)).await {
                Ok(part) => bytes.extend_from_slice(&part),
                Err(e) => {
                    remove_dir(dir).await;
                    if e.kind() == ErrorKind::NotFound {
                        return Err(AssemblyError::MissingChunk { upload_id, index });
                    }
                    return Err(AssemblyError::Io(e));
                }
            }
        }
        remove_dir(dir).await;

        let sha256 = format!("{:x}", Sha256::digest(&bytes));
        log::info!(
            "Upload {upload_id} complete: {} ({} bytes, sha256 {sha256})",
            session.file_name,
            bytes.len()
        );

        Ok(ChunkOutcome::Complete(CompletedUpload {
            upload_id,
            file_name: session.file_name,
            sender: session.sender,
            room: session.room,
            bytes,
            sha256,
        }))
    }

    /// Drops sessions with no chunk activity for `idle` and deletes their
    /// scratch data. Completed ids older than `idle` are forgotten too.
    /// Returns the expired upload ids.
    pub async fn expire_idle(&self, idle: Duration) -> Vec<String> {
        let expired: Vec<String> = {
            let mut uploads = self.uploads.lock().await;
            uploads.completed.retain(|_, at| at.elapsed() < idle);
            let ids: Vec<String> = uploads
                .active
                .iter()
                .filter(|(_, s)| s.last_activity.elapsed() >= idle)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &ids {
                uploads.active.remove(id);
            }
            ids
        };

        for id in &expired {
            log::warn!("Upload {id} expired after {}s idle", idle.as_secs());
            remove_dir(&self.upload_dir(id)).await;
        }
        expired
    }

    #[cfg(test)]
    async fn pending_uploads(&self) -> usize {
        self.uploads.lock().await.active.len()
    }
}

async fn remove_dir(dir: &Path) {
    if let Err(e) = fs::remove_dir_all(dir).await {
        if e.kind() != ErrorKind::NotFound {
            log::warn!("Failed to remove scratch directory {}: {}", dir.display(), e);
        }
    }
}
