//! Transport seam
//!
//! A [`Transport`] opens [`Connection`]s to endpoints. A connection moves
//! whole [`Frame`]s; framing on the byte stream is the connection's business.
//! The driver owns at most one connection at a time. Dropping a connection
//! releases it; [`Connection::close`] is the graceful variant.

use std::io;

use async_trait::async_trait;
use imwire_core::{Endpoint, Frame, FrameBuffer, TransportError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

const READ_CHUNK_SIZE: usize = 8 * 1024;

// ----------------------------------------------------------------------------
// Traits
// ----------------------------------------------------------------------------

/// Factory of connections
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Connection>, TransportError>;
}

/// One established frame stream
#[async_trait]
pub trait Connection: Send {
    fn endpoint(&self) -> &Endpoint;

    async fn write_frame(&mut self, frame: &Frame) -> io::Result<()>;

    /// Wait for the next complete frame
    ///
    /// Must be cancel-safe: dropping the future before completion loses no
    /// bytes, so it can race against other work in `select!`.
    async fn read_frame(&mut self) -> io::Result<Frame>;

    async fn close(&mut self);
}

// ----------------------------------------------------------------------------
// TCP Transport
// ----------------------------------------------------------------------------

/// Plain TCP with length-prefixed frames
#[derive(Debug, Clone)]
pub struct TcpTransport {
    max_frame_size: usize,
}

impl TcpTransport {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Connection>, TransportError> {
        let stream = TcpStream::connect((endpoint.host(), endpoint.port()))
            .await
            .map_err(|source| TransportError::Connect {
                endpoint: endpoint.clone(),
                source,
            })?;
        if let Err(error) = stream.set_nodelay(true) {
            debug!(%endpoint, %error, "could not disable Nagle");
        }

        Ok(Box::new(TcpConnection {
            endpoint: endpoint.clone(),
            stream,
            buffer: FrameBuffer::new(self.max_frame_size),
            max_frame_size: self.max_frame_size,
        }))
    }
}

pub struct TcpConnection {
    endpoint: Endpoint,
    stream: TcpStream,
    buffer: FrameBuffer,
    max_frame_size: usize,
}

#[async_trait]
impl Connection for TcpConnection {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn write_frame(&mut self, frame: &Frame) -> io::Result<()> {
        let bytes = frame.to_length_prefixed();
        if bytes.len() > self.max_frame_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "frame of {} bytes exceeds limit of {}",
                    bytes.len(),
                    self.max_frame_size
                ),
            ));
        }
        trace!(endpoint = %self.endpoint, len = bytes.len(), "writing frame");
        self.stream.write_all(&bytes).await
    }

    async fn read_frame(&mut self) -> io::Result<Frame> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            let next = self
                .buffer
                .try_next()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            if let Some(frame) = next {
                return Ok(frame);
            }

            let read = self.stream.read(&mut chunk).await?;
            if read == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "server closed the connection",
                ));
            }
            self.buffer.extend(&chunk[..read]);
        }
    }

    async fn close(&mut self) {
        if let Err(error) = self.stream.shutdown().await {
            debug!(endpoint = %self.endpoint, %error, "error during shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_frames_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut prefix = [0u8; 4];
            socket.read_exact(&mut prefix).await.unwrap();
            let total = u32::from_be_bytes(prefix) as usize;
            let mut payload = vec![0u8; total - 4];
            socket.read_exact(&mut payload).await.unwrap();

            // echo back split across two writes, with a keep-alive in front
            let mut reply = Frame::default().to_length_prefixed();
            reply.extend(Frame::new(payload).to_length_prefixed());
            let (head, tail) = reply.split_at(6);
            socket.write_all(head).await.unwrap();
            socket.write_all(tail).await.unwrap();
        });

        let transport = TcpTransport::new(1024);
        let mut connection = transport
            .connect(&Endpoint::new("127.0.0.1", port))
            .await
            .unwrap();
        connection
            .write_frame(&Frame::new(b"ping".to_vec()))
            .await
            .unwrap();

        assert!(connection.read_frame().await.unwrap().is_empty());
        assert_eq!(
            connection.read_frame().await.unwrap(),
            Frame::new(b"ping".to_vec())
        );

        server.await.unwrap();
        let eof = connection.read_frame().await.unwrap_err();
        assert_eq!(eof.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_refused_connect_names_endpoint() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let error = match TcpTransport::new(1024)
            .connect(&Endpoint::new("127.0.0.1", port))
            .await
        {
            Ok(_) => panic!("connect should fail"),
            Err(error) => error,
        };
        assert!(error.to_string().contains(&format!("127.0.0.1:{}", port)));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move { listener.accept().await.map(|(s, _)| s) });

        let mut connection = TcpTransport::new(8)
            .connect(&Endpoint::new("127.0.0.1", port))
            .await
            .unwrap();
        let error = connection
            .write_frame(&Frame::new(vec![0; 16]))
            .await
            .unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::InvalidInput);
        let _socket = accept.await.unwrap().unwrap();
    }
}
