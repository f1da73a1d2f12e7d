//! MQTT Connection Handler
//!
//! Handles individual client connections, packet processing,
//! and protocol state machine.
//!
//! Inbound packets are read and decoded here. Everything the broker sends to
//! the client, including responses to this client's own packets, goes through
//! the connection's [`SharedWriter`] so that it is ordered with deliveries
//! written by the publish engine.

mod connect;
mod disconnect;
mod publish;
mod qos;
mod subscribe;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::broker::{BrokerContext, SharedWriter};
use crate::codec::{Decoder, Encoder};
use crate::protocol::{DecodeError, Packet, ProtocolError, Will};
use crate::session::{ClientConnection, SendError};

/// Connection error types
#[derive(Debug)]
pub enum ConnectionError {
    Io(std::io::Error),
    Protocol(ProtocolError),
    Decode(DecodeError),
    /// Writing to this connection's own buffer failed
    Send(SendError),
    Timeout,
    Shutdown,
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "IO error: {}", e),
            ConnectionError::Protocol(e) => write!(f, "Protocol error: {}", e),
            ConnectionError::Decode(e) => write!(f, "Decode error: {}", e),
            ConnectionError::Send(e) => write!(f, "Send error: {}", e),
            ConnectionError::Timeout => write!(f, "Connection timeout"),
            ConnectionError::Shutdown => write!(f, "Shutdown"),
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectionError::Io(e) => Some(e),
            ConnectionError::Protocol(e) => Some(e),
            ConnectionError::Decode(e) => Some(e),
            ConnectionError::Send(e) => Some(e),
            ConnectionError::Timeout | ConnectionError::Shutdown => None,
        }
    }
}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

impl From<DecodeError> for ConnectionError {
    fn from(e: DecodeError) -> Self {
        ConnectionError::Decode(e)
    }
}

impl From<ProtocolError> for ConnectionError {
    fn from(e: ProtocolError) -> Self {
        ConnectionError::Protocol(e)
    }
}

impl From<SendError> for ConnectionError {
    fn from(e: SendError) -> Self {
        ConnectionError::Send(e)
    }
}

/// State of an accepted CONNECT
pub(crate) struct ClientSession {
    pub(crate) client_id: Arc<str>,
    /// Identifies this connection in the session store across takeovers
    pub(crate) connection_id: u64,
    pub(crate) writer: Arc<SharedWriter>,
    pub(crate) clean_session: bool,
    /// Effective keep alive in seconds (0 = disabled)
    pub(crate) keep_alive: u16,
    pub(crate) will: Option<Will>,
}

/// Connection state
pub(crate) enum State {
    /// Waiting for CONNECT packet
    Connecting,
    /// Connected and running
    Connected(ClientSession),
    /// Cleanup done
    Closed,
}

/// Connection handler - generic over the stream type
pub struct Connection<S> {
    pub(crate) stream: S,
    pub(crate) addr: SocketAddr,
    pub(crate) state: State,
    pub(crate) decoder: Decoder,
    pub(crate) encoder: Encoder,
    pub(crate) read_buf: BytesMut,
    pub(crate) write_buf: BytesMut,
    pub(crate) ctx: Arc<BrokerContext>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, addr: SocketAddr, ctx: Arc<BrokerContext>) -> Self {
        Self {
            stream,
            addr,
            state: State::Connecting,
            decoder: Decoder::new().with_max_packet_size(ctx.config.limits.max_packet_size),
            encoder: Encoder::new(),
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(256),
            ctx,
        }
    }

    /// Run the connection handler
    pub async fn run(&mut self) -> Result<(), ConnectionError> {
        // Wait for CONNECT packet with timeout
        let connect_timeout = self.ctx.config.server.connect_timeout;
        match timeout(connect_timeout, self.read_connect()).await {
            Ok(result) => result?,
            Err(_) => {
                debug!("Connect timeout from {}", self.addr);
                return Err(ConnectionError::Timeout);
            }
        }

        // Main loop
        self.run_connected().await
    }

    /// Run the main connection loop
    async fn run_connected(&mut self) -> Result<(), ConnectionError> {
        let (client_id, writer, keep_alive_secs) = match &self.state {
            State::Connected(session) => (
                session.client_id.clone(),
                session.writer.clone(),
                session.keep_alive,
            ),
            _ => {
                return Err(ConnectionError::Protocol(
                    ProtocolError::Violation("not connected"),
                ))
            }
        };

        // 1.5x keep_alive, 0 disables the check
        let keep_alive = (keep_alive_secs > 0)
            .then(|| Duration::from_millis(u64::from(keep_alive_secs) * 1500));
        debug!(
            "Keep alive for {}: {}s -> timeout {:?}",
            client_id, keep_alive_secs, keep_alive
        );

        // Track keep-alive deadline (reset when packets received)
        let mut keep_alive_deadline = keep_alive.map(|d| Instant::now() + d);

        loop {
            tokio::select! {
                // Read from socket
                result = self.stream.read_buf(&mut self.read_buf) => {
                    match result {
                        Ok(0) => {
                            debug!("Connection closed from {} without DISCONNECT", self.addr);
                            self.handle_disconnect(true);
                            return Ok(());
                        }
                        Ok(_) => {
                            if let Some(keep_alive) = keep_alive {
                                keep_alive_deadline = Some(Instant::now() + keep_alive);
                            }

                            match self.process_packets() {
                                Ok(true) => {}
                                Ok(false) => {
                                    // DISCONNECT; flush what is already queued
                                    let data = writer.take_buffer();
                                    if !data.is_empty() {
                                        if let Err(e) = self.stream.write_all(&data).await {
                                            debug!("Write error to {} on DISCONNECT: {}", client_id, e);
                                        }
                                    }
                                    self.handle_disconnect(false);
                                    return Ok(());
                                }
                                Err(e) => {
                                    warn!("Closing {}: {}", client_id, e);
                                    self.handle_disconnect(true);
                                    return Err(e);
                                }
                            }
                        }
                        Err(e) => {
                            debug!("Read error from {}: {}", client_id, e);
                            self.handle_disconnect(true);
                            return Err(e.into());
                        }
                    }
                }

                // Flush outgoing packets from the SharedWriter buffer
                _ = writer.notified() => {
                    let data = writer.take_buffer();
                    if !data.is_empty() {
                        if let Err(e) = self.stream.write_all(&data).await {
                            debug!("Write error to {}: {}", client_id, e);
                            self.handle_disconnect(true);
                            return Err(e.into());
                        }
                    }
                    if !writer.is_alive() {
                        debug!("SharedWriter closed, disconnecting {}", client_id);
                        self.handle_disconnect(false);
                        return Err(ConnectionError::Shutdown);
                    }
                }

                // Keep alive timeout
                _ = keep_alive_expired(keep_alive_deadline) => {
                    info!("Keep alive timeout for {} - disconnecting", client_id);
                    self.handle_disconnect(true);
                    return Err(ConnectionError::Timeout);
                }
            }
        }
    }

    /// Handle every complete packet in the read buffer.
    ///
    /// Returns `Ok(false)` once the client sent DISCONNECT.
    fn process_packets(&mut self) -> Result<bool, ConnectionError> {
        while let Some((packet, consumed)) = self.decoder.decode(&self.read_buf)? {
            self.read_buf.advance(consumed);
            if !self.handle_packet(packet)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Handle an incoming packet
    fn handle_packet(&self, packet: Packet) -> Result<bool, ConnectionError> {
        let State::Connected(session) = &self.state else {
            return Err(ConnectionError::Protocol(
                ProtocolError::Violation("not connected"),
            ));
        };

        match packet {
            Packet::Connect(_) => {
                return Err(ConnectionError::Protocol(
                    ProtocolError::Violation("duplicate CONNECT"),
                ));
            }
            Packet::Publish(publish) => self.handle_publish(session, publish)?,
            Packet::PubAck(puback) => self.handle_puback(session, puback),
            Packet::PubRec(pubrec) => self.handle_pubrec(session, pubrec)?,
            Packet::PubRel(pubrel) => self.handle_pubrel(session, pubrel)?,
            Packet::PubComp(pubcomp) => self.handle_pubcomp(session, pubcomp),
            Packet::Subscribe(subscribe) => self.handle_subscribe(session, subscribe)?,
            Packet::Unsubscribe(unsubscribe) => self.handle_unsubscribe(session, unsubscribe)?,
            Packet::PingReq => session.writer.write(Packet::PingResp)?,
            Packet::Disconnect => {
                debug!("DISCONNECT from {}", session.client_id);
                return Ok(false);
            }
            Packet::ConnAck(_) | Packet::SubAck(_) | Packet::UnsubAck(_) | Packet::PingResp => {
                return Err(ConnectionError::Protocol(
                    ProtocolError::Violation("server-to-client packet from client"),
                ));
            }
        }
        Ok(true)
    }
}

async fn keep_alive_expired(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Generate a random ID
pub(crate) fn rand_id() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let hasher = RandomState::new().build_hasher();
    hasher.finish()
}
