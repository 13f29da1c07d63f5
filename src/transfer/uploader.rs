use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Duration;
use uuid::Uuid;

use crate::core::{Config, Message, Payload};
use crate::network::Transport;
use crate::network::dht::Contact;
use crate::storage::{Chunk, FileStore, split};
use crate::utils::{P2PError, Result};

/// How a served transfer ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Completed { chunks: u64, bytes: u64 },
    NotFound,
    Aborted(String),
}

/// Responder side of the file protocol. Streams a shared file over the
/// connection the FILE_REQUEST arrived on.
pub struct Uploader {
    local: Contact,
    store: FileStore,
    chunk_size: usize,
    window: usize,
    idle_timeout: Duration,
    max_frame_size: usize,
}

impl Uploader {
    pub fn new(local: Contact, store: FileStore, config: &Config) -> Self {
        Self {
            local,
            store,
            chunk_size: config.chunk_size,
            window: config.chunk_window.max(1),
            idle_timeout: config.chunk_idle_timeout,
            max_frame_size: config.max_frame_size,
        }
    }

    fn chunk_frame(&self, transfer_id: Uuid, chunk: &Chunk, total_size: u64) -> Message {
        Message::new(
            self.local.clone(),
            Payload::FileChunk {
                transfer_id,
                seq: chunk.seq,
                total_size,
                data: chunk.data.clone(),
                checksum: chunk.checksum.clone(),
            },
        )
    }

    /// Serve one FILE_REQUEST. Keeps at most `window` chunks unacknowledged,
    /// resends on FILE_RETRY and finishes with FILE_END once everything is acked.
    pub async fn serve<S>(&self, stream: &mut S, transfer_id: Uuid, path: &str) -> Result<UploadOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let content = match self.store.load(path).await {
            Ok(content) => content,
            Err(P2PError::FileNotFound(_)) => {
                info!("FILE_REQUEST for missing {}", path);
                let reply = Message::new(
                    self.local.clone(),
                    Payload::FileNotFound {
                        transfer_id,
                        path: path.to_string(),
                    },
                );
                Transport::send_message_within(stream, &reply, self.idle_timeout).await?;
                return Ok(UploadOutcome::NotFound);
            }
            Err(e) => return Err(e),
        };

        let total_size = content.len() as u64;
        let chunks = split(&content, self.chunk_size);
        let count = chunks.len() as u64;
        info!("Serving {} ({} bytes, {} chunks) as {}", path, total_size, count, transfer_id);

        let mut next_to_send: u64 = 0;
        // Every seq below `acked` is acknowledged
        let mut acked: u64 = 0;

        loop {
            while next_to_send < count && next_to_send - acked < self.window as u64 {
                let frame = self.chunk_frame(transfer_id, &chunks[next_to_send as usize], total_size);
                Transport::send_message_within(stream, &frame, self.idle_timeout).await?;
                next_to_send += 1;
            }

            if acked == count {
                let end = Message::new(
                    self.local.clone(),
                    Payload::FileEnd {
                        transfer_id,
                        chunks: count,
                        total_size,
                    },
                );
                Transport::send_message_within(stream, &end, self.idle_timeout).await?;
                info!("Finished serving {} ({} chunks)", path, count);
                return Ok(UploadOutcome::Completed {
                    chunks: count,
                    bytes: total_size,
                });
            }

            let message =
                Transport::receive_message_within(stream, self.max_frame_size, self.idle_timeout).await?;
            match message.payload {
                Payload::FileAck { transfer_id: id, seq } if id == transfer_id => {
                    if seq < next_to_send {
                        acked = acked.max(seq + 1);
                    } else {
                        warn!("ACK for unsent chunk {} of {}", seq, path);
                    }
                }
                Payload::FileRetry { transfer_id: id, seq } if id == transfer_id => {
                    if seq < next_to_send && seq >= acked {
                        debug!("Resending chunk {} of {}", seq, path);
                        let frame = self.chunk_frame(transfer_id, &chunks[seq as usize], total_size);
                        Transport::send_message_within(stream, &frame, self.idle_timeout).await?;
                    } else {
                        warn!("Ignoring RETRY for chunk {} of {}", seq, path);
                    }
                }
                Payload::FileAbort { transfer_id: id, reason } if id == transfer_id => {
                    warn!("Transfer of {} aborted by {}: {}", path, message.sender, reason);
                    return Ok(UploadOutcome::Aborted(reason));
                }
                other => {
                    warn!("Unexpected {} during transfer of {}", other.kind(), path);
                    let reply = Message::error(
                        self.local.clone(),
                        format!("unexpected {} during file transfer", other.kind()),
                    );
                    Transport::send_message_within(stream, &reply, self.idle_timeout).await?;
                }
            }
        }
    }
}
