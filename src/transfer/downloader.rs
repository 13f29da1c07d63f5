use log::{debug, info, warn};
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Duration;
use uuid::Uuid;

use crate::core::{Config, Message, Payload};
use crate::network::Transport;
use crate::network::dht::{Contact, NodeId};
use crate::storage::{Chunk, FileStore};
use crate::transfer::{ChunkVerdict, FileTransferSession};
use crate::utils::{P2PError, Result};

/// A completed download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub path: String,
    pub source: NodeId,
    pub bytes: u64,
    pub chunks: u64,
    pub saved_to: PathBuf,
}

/// Requester side of the file protocol.
pub struct Downloader {
    local: Contact,
    store: FileStore,
    idle_timeout: Duration,
    max_frame_size: usize,
}

impl Downloader {
    pub fn new(local: Contact, store: FileStore, config: &Config) -> Self {
        Self {
            local,
            store,
            idle_timeout: config.chunk_idle_timeout,
            max_frame_size: config.max_frame_size,
        }
    }

    async fn reply<S>(&self, stream: &mut S, payload: Payload) -> Result<()>
    where
        S: AsyncWrite + Unpin,
    {
        let message = Message::new(self.local.clone(), payload);
        Transport::send_message_within(stream, &message, self.idle_timeout).await
    }

    /// Request `path` from `source` over `stream` and save it under the download dir.
    pub async fn fetch<S>(&self, stream: &mut S, source: &Contact, path: &str) -> Result<TransferReport>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let transfer_id = Uuid::new_v4();
        let mut session = FileTransferSession::new(transfer_id, path, source.node_id);
        info!("Requesting {} from {} as {}", path, source, transfer_id);

        let request = Message::file_request(self.local.clone(), transfer_id, path.to_string());
        Transport::send_message_within(stream, &request, self.idle_timeout).await?;

        loop {
            let message =
                match Transport::receive_message_within(stream, self.max_frame_size, self.idle_timeout).await {
                    Ok(message) => message,
                    Err(e @ P2PError::Timeout(_)) => {
                        let reason = format!("no chunk within {:?}", self.idle_timeout);
                        let _ = self
                            .reply(stream, Payload::FileAbort { transfer_id, reason })
                            .await;
                        let received = session.received_bytes();
                        return Err(session.abort(P2PError::Timeout(format!(
                            "transfer of {} from {} idle after {} bytes: {}",
                            path, source, received, e
                        ))));
                    }
                    Err(e) => return Err(session.abort(e)),
                };

            if message.sender.node_id != source.node_id {
                warn!("File frame from {} on session with {}", message.sender, source);
            }

            match message.payload {
                Payload::FileChunk {
                    transfer_id: id,
                    seq,
                    total_size,
                    data,
                    checksum,
                } if id == transfer_id => {
                    let chunk = Chunk {
                        seq,
                        data,
                        checksum,
                    };
                    match session.on_chunk(chunk, total_size) {
                        ChunkVerdict::Accepted { through } => {
                            self.reply(stream, Payload::FileAck { transfer_id, seq: through })
                                .await?;
                        }
                        ChunkVerdict::Buffered | ChunkVerdict::Duplicate => {}
                        ChunkVerdict::Retry(seq) => {
                            self.reply(stream, Payload::FileRetry { transfer_id, seq }).await?;
                        }
                        ChunkVerdict::Abort(error) => {
                            let reason = error.to_string();
                            if let Err(e) = self.reply(stream, Payload::FileAbort { transfer_id, reason }).await {
                                debug!("Could not deliver FILE_ABORT: {}", e);
                            }
                            return Err(error);
                        }
                    }
                }
                Payload::FileNotFound { transfer_id: id, .. } if id == transfer_id => {
                    return Err(session.on_not_found());
                }
                Payload::FileEnd {
                    transfer_id: id,
                    chunks,
                    total_size,
                } if id == transfer_id => {
                    let content = session.on_end(chunks, total_size)?;
                    let saved_to = self.store.save(path, &content).await?;
                    info!(
                        "Downloaded {} from {}: {} bytes in {} chunks ({} retried)",
                        path,
                        source,
                        total_size,
                        chunks,
                        session.retries()
                    );
                    return Ok(TransferReport {
                        path: path.to_string(),
                        source: source.node_id,
                        bytes: total_size,
                        chunks,
                        saved_to,
                    });
                }
                Payload::Error { message } => {
                    return Err(session.abort(P2PError::InvalidResponse(message)));
                }
                other => {
                    warn!("Ignoring {} during transfer {}", other.kind(), transfer_id);
                }
            }
        }
    }
}
