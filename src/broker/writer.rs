//! Direct write buffer shared between the engine and a connection task.
//!
//! The publish engine and other connections encode packets straight into a
//! per-connection buffer through [`ClientConnection::write`]. The connection
//! task waits on [`SharedWriter::notified`] and flushes the buffer to the
//! socket, so no channel sits between fan-out and the socket.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::codec::Encoder;
use crate::protocol::Packet;
use crate::session::{ClientConnection, SendError};

/// Shared write buffer for one client connection.
pub struct SharedWriter {
    client_id: Arc<str>,
    /// Encoded bytes waiting to be written
    buffer: Mutex<BytesMut>,
    /// Notification when buffer has new data
    notify: Notify,
    encoder: Encoder,
    /// Whether the connection is still alive
    alive: AtomicBool,
    max_packet_size: usize,
}

impl SharedWriter {
    pub fn new(client_id: Arc<str>, max_packet_size: usize) -> Self {
        Self {
            client_id,
            buffer: Mutex::new(BytesMut::with_capacity(2048)),
            notify: Notify::new(),
            encoder: Encoder::new(),
            alive: AtomicBool::new(true),
            max_packet_size,
        }
    }

    /// Get the notify handle for the connection loop
    pub fn notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.notify.notified()
    }

    /// Take all pending data from the buffer
    pub fn take_buffer(&self) -> BytesMut {
        self.buffer.lock().split()
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.lock().len()
    }
}

impl ClientConnection for SharedWriter {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn write(&self, packet: Packet) -> Result<(), SendError> {
        if !self.is_alive() {
            return Err(SendError::Closed);
        }

        let was_empty = {
            let mut buf = self.buffer.lock();
            let was_empty = buf.is_empty();
            let start = buf.len();
            if let Err(e) = self.encoder.encode(&packet, &mut buf) {
                buf.truncate(start);
                return Err(e.into());
            }
            let len = buf.len() - start;
            if len > self.max_packet_size {
                buf.truncate(start);
                return Err(SendError::PacketTooLarge(len));
            }
            was_empty
        };

        // A non-empty buffer already has a wakeup pending
        if was_empty {
            self.notify.notify_one();
        }
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.alive.store(false, Ordering::Release);
        self.notify.notify_one();
    }
}
