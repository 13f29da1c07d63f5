use log::{debug, info};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{Duration, timeout};

use crate::core::Message;
use crate::utils::{P2PError, Result};

/// Point-to-point framing: a big-endian u32 length followed by a JSON frame.
pub struct Transport;

impl Transport {
    pub async fn connect(addr: SocketAddr, connect_timeout: Duration) -> Result<TcpStream> {
        let stream = timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| P2PError::ConnectionFailed(format!("Connection to {} timed out", addr)))?
            .map_err(|e| P2PError::ConnectionFailed(format!("Failed to connect to {}: {}", addr, e)))?;

        stream
            .set_nodelay(true)
            .map_err(|e| P2PError::NetworkError(format!("Failed to set TCP_NODELAY: {}", e)))?;

        debug!("Connected to {}", addr);
        Ok(stream)
    }

    pub async fn listen(addr: SocketAddr) -> Result<TcpListener> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| P2PError::NetworkError(format!("Failed to bind to {}: {}", addr, e)))?;

        info!("Listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    pub async fn send_data<W>(stream: &mut W, data: &[u8]) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let len = u32::try_from(data.len()).map_err(|_| P2PError::MessageTooLarge(data.len()))?;
        stream.write_u32(len).await?;
        stream.write_all(data).await?;
        stream.flush().await?;
        Ok(())
    }

    pub async fn receive_data<R>(stream: &mut R, max_size: usize) -> Result<Vec<u8>>
    where
        R: AsyncRead + Unpin,
    {
        let len = stream.read_u32().await? as usize;

        if len > max_size {
            return Err(P2PError::MessageTooLarge(len));
        }

        let mut buffer = vec![0u8; len];
        stream.read_exact(&mut buffer).await?;

        Ok(buffer)
    }

    pub async fn send_message<W>(stream: &mut W, message: &Message) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let serialized = serde_json::to_vec(message)?;
        Self::send_data(stream, &serialized).await?;
        debug!("Sent {} ({} bytes)", message.kind(), serialized.len());
        Ok(())
    }

    /// Read one frame. Bytes that do not decode to a `Message` yield `MalformedFrame`.
    pub async fn receive_message<R>(stream: &mut R, max_size: usize) -> Result<Message>
    where
        R: AsyncRead + Unpin,
    {
        let buffer = Self::receive_data(stream, max_size).await?;
        let message: Message = serde_json::from_slice(&buffer)
            .map_err(|e| P2PError::MalformedFrame(e.to_string()))?;
        debug!("Received {} from {}", message.kind(), message.sender);
        Ok(message)
    }

    /// `send_message` bounded by a deadline.
    pub async fn send_message_within<W>(
        stream: &mut W,
        message: &Message,
        limit: Duration,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        timeout(limit, Self::send_message(stream, message))
            .await
            .map_err(|_| P2PError::Timeout(format!("sending {}", message.kind())))?
    }

    /// `receive_message` bounded by a deadline.
    pub async fn receive_message_within<R>(
        stream: &mut R,
        max_size: usize,
        limit: Duration,
    ) -> Result<Message>
    where
        R: AsyncRead + Unpin,
    {
        timeout(limit, Self::receive_message(stream, max_size))
            .await
            .map_err(|_| P2PError::Timeout(format!("no frame within {:?}", limit)))?
    }
}
