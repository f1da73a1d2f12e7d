//! CONNECT packet handling

use std::sync::Arc;

use bytes::Buf;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::{ClientSession, Connection, ConnectionError, State};
use crate::broker::SharedWriter;
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, Packet, ProtocolError, Publish,
};
use crate::session::{ClientConnection, SendError, SessionDirectory};
use crate::store::InflightRecord;

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Read and process CONNECT packet
    pub(crate) async fn read_connect(&mut self) -> Result<(), ConnectionError> {
        loop {
            // Try to decode a packet from the buffer
            match self.decoder.decode(&self.read_buf) {
                Ok(Some((packet, consumed))) => {
                    self.read_buf.advance(consumed);

                    match packet {
                        Packet::Connect(connect) => {
                            return self.handle_connect(*connect).await;
                        }
                        _ => {
                            // Protocol violation - first packet must be CONNECT
                            debug!("First packet from {} was not CONNECT", self.addr);
                            return Err(ConnectionError::Protocol(
                                ProtocolError::Violation("first packet must be CONNECT"),
                            ));
                        }
                    }
                }
                Ok(None) => {
                    // Need more data
                }
                Err(DecodeError::UnsupportedLevel(level)) => {
                    debug!(
                        "Unsupported protocol level {} from {}",
                        level, self.addr
                    );
                    return self
                        .refuse(ConnectReturnCode::UnacceptableProtocolVersion)
                        .await;
                }
                Err(e) => return Err(e.into()),
            }

            // Read more data
            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(ConnectionError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed",
                )));
            }
        }
    }

    /// Handle CONNECT packet
    async fn handle_connect(&mut self, connect: Connect) -> Result<(), ConnectionError> {
        // A zero-byte client id is only allowed with clean session
        if connect.client_id.is_empty() && !connect.clean_session {
            debug!(
                "Rejecting empty client ID with clean_session=false from {}",
                self.addr
            );
            return self.refuse(ConnectReturnCode::IdentifierRejected).await;
        }

        let client_id: Arc<str> = if connect.client_id.is_empty() {
            format!("relaymq-{:x}", super::rand_id()).into()
        } else {
            connect.client_id.as_str().into()
        };

        debug!("CONNECT from {} (client_id: {})", self.addr, client_id);

        if !self
            .ctx
            .auth
            .authenticate(connect.username.as_deref(), connect.password.as_deref())
        {
            debug!("Authentication failed for {}", client_id);
            return self.refuse(ConnectReturnCode::BadUserNameOrPassword).await;
        }

        // Only count as new connection if client_id is not already connected
        let max_connections = self.ctx.config.limits.max_connections;
        let is_takeover = self.ctx.sessions.get(&client_id).is_some();
        if max_connections > 0 && !is_takeover && self.ctx.sessions.len() >= max_connections {
            debug!(
                "Max connections ({}) reached, rejecting {}",
                max_connections, client_id
            );
            return self.refuse(ConnectReturnCode::ServerUnavailable).await;
        }

        let inflight = self.ctx.engine.fan_out().inflight().clone();
        let pending = if connect.clean_session {
            self.ctx.subscriptions.unsubscribe_all(&client_id);
            if let Err(e) = inflight.remove(&client_id) {
                warn!("Failed to clear in-flight record of {}: {}", client_id, e);
            }
            None
        } else {
            inflight.get(&client_id).unwrap_or_else(|e| {
                warn!("Failed to load in-flight record of {}: {}", client_id, e);
                None
            })
        };
        let session_present = !connect.clean_session
            && (pending.is_some() || self.ctx.subscriptions.has_subscriptions(&client_id));

        // CONNACK goes into the writer before registration so no delivery
        // can overtake it
        let writer = Arc::new(SharedWriter::new(
            client_id.clone(),
            self.ctx.config.limits.max_packet_size,
        ));
        writer.write(Packet::ConnAck(ConnAck {
            session_present,
            return_code: ConnectReturnCode::Accepted,
        }))?;

        let connection_id = self.ctx.next_connection_id();
        if let Some(previous) =
            self.ctx
                .sessions
                .register(client_id.clone(), connection_id, writer.clone())
        {
            info!("Client {} taken over by a new connection", client_id);
            previous.close();
        }

        if let Some(record) = pending {
            self.resend_inflight(&writer, record);
        }

        let keep_alive = self
            .ctx
            .config
            .session
            .effective_keep_alive(connect.keep_alive);

        info!(
            "Client {} connected from {} ({:?}, clean_session: {}, keep_alive: {}s)",
            client_id, self.addr, connect.protocol_version, connect.clean_session, keep_alive
        );

        self.state = State::Connected(ClientSession {
            client_id,
            connection_id,
            writer,
            clean_session: connect.clean_session,
            keep_alive,
            will: connect.will,
        });
        Ok(())
    }

    /// Resend the unacknowledged delivery with a fresh packet id
    fn resend_inflight(&self, writer: &Arc<SharedWriter>, record: InflightRecord) {
        let publish = Publish {
            dup: true,
            qos: record.qos,
            retain: false,
            topic: record.topic,
            packet_id: None,
            payload: record.payload,
        };

        match self
            .ctx
            .engine
            .fan_out()
            .deliver(writer.as_ref(), &record.client_id, publish)
        {
            Ok(delivery) => debug!(
                "Resent in-flight message to {} ({:?})",
                record.client_id, delivery
            ),
            Err(e) => warn!(
                "Failed to resend in-flight message to {}: {}",
                record.client_id, e
            ),
        }
    }

    /// Send a refusing CONNACK straight to the socket and fail the connection
    async fn refuse(&mut self, return_code: ConnectReturnCode) -> Result<(), ConnectionError> {
        let connack = ConnAck {
            session_present: false,
            return_code,
        };
        self.write_buf.clear();
        self.encoder
            .encode(&Packet::ConnAck(connack), &mut self.write_buf)
            .map_err(|e| ConnectionError::Send(SendError::Encode(e)))?;
        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;
        Err(ConnectionError::Protocol(ProtocolError::Refused(return_code)))
    }
}
