//! Disconnect handling

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use super::{Connection, State};
use crate::session::ClientConnection;

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Tear down the client session.
    ///
    /// `publish_will` is true for every close that did not follow a
    /// DISCONNECT packet or a takeover.
    pub(crate) fn handle_disconnect(&mut self, publish_will: bool) {
        let State::Connected(session) = std::mem::replace(&mut self.state, State::Closed) else {
            return;
        };

        session.writer.close();

        if publish_will {
            if let Some(will) = &session.will {
                self.ctx.engine.publish_will(&session.client_id, will);
            }
        } else if session.will.is_some() {
            debug!("Discarding will of {}", session.client_id);
        }

        // A newer connection owns the client id after a takeover
        if !self
            .ctx
            .sessions
            .unregister(&session.client_id, session.connection_id)
        {
            debug!("{} already taken over", session.client_id);
            return;
        }

        if session.clean_session {
            self.ctx.subscriptions.unsubscribe_all(&session.client_id);
            if let Err(e) = self
                .ctx
                .engine
                .fan_out()
                .inflight()
                .remove(&session.client_id)
            {
                warn!(
                    "Failed to clear in-flight record of {}: {}",
                    session.client_id, e
                );
            }
        }

        info!("Client {} disconnected", session.client_id);
    }
}
