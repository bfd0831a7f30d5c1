//! Login step run while the connection is `LOADING`

use std::sync::atomic::{AtomicI32, Ordering};

use async_trait::async_trait;
use imwire_core::{
    ConnectionState, Endpoint, ImwireError, ImwireResult, PacketDecoder, PacketEncoder, SsoPacket,
    TransportError,
};
use tracing::{debug, info};

use crate::transport::Connection;

// ----------------------------------------------------------------------------
// Packet Channel
// ----------------------------------------------------------------------------

/// Packet-level access to a connection that is not yet published
///
/// Only the authenticator talks over it; unrelated packets that arrive while
/// waiting for a response are discarded.
pub struct PacketChannel<'a> {
    connection: &'a mut dyn Connection,
    encoder: &'a PacketEncoder,
    decoder: &'a PacketDecoder,
    sequence: &'a AtomicI32,
}

impl<'a> PacketChannel<'a> {
    pub fn new(
        connection: &'a mut dyn Connection,
        encoder: &'a PacketEncoder,
        decoder: &'a PacketDecoder,
        sequence: &'a AtomicI32,
    ) -> Self {
        Self {
            connection,
            encoder,
            decoder,
            sequence,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.connection.endpoint()
    }

    fn io_error(&self, source: std::io::Error) -> ImwireError {
        TransportError::Io {
            endpoint: self.endpoint().clone(),
            state: ConnectionState::Loading,
            source,
        }
        .into()
    }

    /// Write one packet under a fresh sequence id, returning the id
    pub async fn send(&mut self, command: &str, body: Vec<u8>) -> ImwireResult<i32> {
        let sequence_id = self.sequence.fetch_add(1, Ordering::Relaxed);
        let frame = self
            .encoder
            .encode(&SsoPacket::new(sequence_id, command, body))?;
        let written = self.connection.write_frame(&frame).await;
        if let Err(source) = written {
            return Err(self.io_error(source));
        }
        Ok(sequence_id)
    }

    /// Wait for the next packet, skipping keep-alives
    pub async fn receive(&mut self) -> ImwireResult<SsoPacket> {
        loop {
            let read = self.connection.read_frame().await;
            let frame = match read {
                Ok(frame) => frame,
                Err(source) => return Err(self.io_error(source)),
            };
            if let Some(packet) = self.decoder.decode(&frame)?.into_iter().next() {
                return Ok(packet);
            }
        }
    }

    /// Send a request and wait for the packet answering it
    pub async fn exchange(&mut self, command: &str, body: Vec<u8>) -> ImwireResult<SsoPacket> {
        let sequence_id = self.send(command, body).await?;
        loop {
            let packet = self.receive().await?;
            if packet.sequence_id == sequence_id {
                return Ok(packet);
            }
            debug!(
                command = %packet.command,
                sequence_id = packet.sequence_id,
                "discarding packet received during login"
            );
        }
    }
}

// ----------------------------------------------------------------------------
// Authenticators
// ----------------------------------------------------------------------------

/// Handshake that turns an established transport into a usable session
#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    async fn login(&self, channel: &mut PacketChannel<'_>) -> ImwireResult<()>;
}

/// Accepts every connection without exchanging anything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAuthenticator;

#[async_trait]
impl Authenticator for NoopAuthenticator {
    async fn login(&self, _channel: &mut PacketChannel<'_>) -> ImwireResult<()> {
        Ok(())
    }
}

/// Presents a pre-issued session token; the server answers with a result byte
#[derive(Debug, Clone)]
pub struct TokenAuthenticator {
    command: String,
    token: Vec<u8>,
}

impl TokenAuthenticator {
    pub fn new<C: Into<String>>(command: C, token: Vec<u8>) -> Self {
        Self {
            command: command.into(),
            token,
        }
    }
}

#[async_trait]
impl Authenticator for TokenAuthenticator {
    async fn login(&self, channel: &mut PacketChannel<'_>) -> ImwireResult<()> {
        let response = channel.exchange(&self.command, self.token.clone()).await?;
        match response.body.first() {
            Some(0) => {
                info!(endpoint = %channel.endpoint(), "login accepted");
                Ok(())
            }
            Some(code) => Err(ImwireError::auth_failed(
                channel.endpoint().clone(),
                format!("login rejected with code {}", code),
            )),
            None => Err(ImwireError::auth_failed(
                channel.endpoint().clone(),
                "empty login response",
            )),
        }
    }
}
