//! Broadcast subscription client.

use std::time::Duration;

use pot_wire::Broadcast;

use crate::error::{ClientError, ClientResult};

/// Receives broadcasts from the broker's publish socket.
///
/// Filtering happens on the server side: only frames whose topic starts
/// with a subscribed prefix are delivered.
pub struct SubscribeClient {
    socket: zmq::Socket,
    _ctx: zmq::Context,
}

impl SubscribeClient {
    /// Connects to the broker's publish endpoint.
    pub fn connect(endpoint: &str) -> ClientResult<Self> {
        let ctx = zmq::Context::new();
        let socket = ctx.socket(zmq::SUB)?;
        socket.set_linger(0)?;
        socket.connect(endpoint)?;
        Ok(Self { socket, _ctx: ctx })
    }

    /// Subscribes to one topic prefix. An element name subscribes to its
    /// broadcasts; adding `;bulk` catches the continuations too.
    pub fn subscribe(&self, topic: &str) -> ClientResult<()> {
        self.socket.set_subscribe(topic.as_bytes())?;
        Ok(())
    }

    /// Subscribes to every broadcast.
    pub fn subscribe_all(&self) -> ClientResult<()> {
        self.socket.set_subscribe(b"")?;
        Ok(())
    }

    /// Waits for the next broadcast, classified by topic.
    pub fn recv(&self, timeout: Duration) -> ClientResult<Broadcast> {
        Ok(Broadcast::parse(&self.recv_raw(timeout)?)?)
    }

    /// Waits for the next broadcast and returns the raw frame.
    pub fn recv_raw(&self, timeout: Duration) -> ClientResult<Vec<u8>> {
        let ready = self
            .socket
            .poll(zmq::POLLIN, timeout.as_millis() as i64)?;
        if ready == 0 {
            return Err(ClientError::Timeout(timeout));
        }
        Ok(self.socket.recv_bytes(0)?)
    }
}

impl std::fmt::Debug for SubscribeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscribeClient").finish_non_exhaustive()
    }
}
