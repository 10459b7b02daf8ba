//! Request/reply client.

use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tracing::trace;

use pot_wire::{BulkFrame, ClientRequest, MessageKind, Response, TransactionId};

use crate::error::{ClientError, ClientResult};

/// Distinguishes the dealer identities of clients within one process.
static CLIENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Configuration for a [`RequestClient`].
#[derive(Debug, Clone)]
pub struct RequestClientConfig {
    /// How long to wait for the ACK. Its absence means no server is there.
    pub ack_timeout: Duration,
    /// How long to wait for the REP once the ACK arrived.
    pub reply_timeout: Duration,
}

impl Default for RequestClientConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_millis(100),
            reply_timeout: Duration::from_secs(120),
        }
    }
}

/// A terminal reply, with the bulk second frame when the server sent one.
#[derive(Debug, Clone)]
pub struct Reply {
    pub response: Response,
    pub bulk: Option<BulkFrame>,
}

/// Issues requests over a dealer socket and receives the responses.
///
/// Maintains a persistent connection to a single broker.
pub struct RequestClient {
    socket: zmq::Socket,
    config: RequestClientConfig,
    // Keeps the socket's context alive for the client's lifetime.
    _ctx: zmq::Context,
}

impl RequestClient {
    /// Connects to the broker's request endpoint.
    pub fn connect(endpoint: &str) -> ClientResult<Self> {
        Self::connect_with(endpoint, RequestClientConfig::default())
    }

    /// Connects with explicit timeouts.
    pub fn connect_with(endpoint: &str, config: RequestClientConfig) -> ClientResult<Self> {
        let ctx = zmq::Context::new();
        let socket = ctx.socket(zmq::DEALER)?;
        socket.set_linger(0)?;
        let identity = format!(
            "pot.client.{}.{}",
            process::id(),
            CLIENT_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        socket.set_identity(identity.as_bytes())?;
        socket.connect(endpoint)?;

        Ok(Self {
            socket,
            config,
            _ctx: ctx,
        })
    }

    /// Reads one element.
    pub fn read(&self, name: &str) -> ClientResult<Reply> {
        self.request(&ClientRequest::read(name))
    }

    /// Writes one element.
    pub fn write(&self, name: &str, data: Value) -> ClientResult<Reply> {
        self.request(&ClientRequest::write(name, data))
    }

    /// Lists the configuration identifiers of the broker's stores.
    pub fn identities(&self, store: Option<&str>) -> ClientResult<Reply> {
        let mut request = ClientRequest::new(pot_wire::RequestKind::Id);
        if let Some(store) = store {
            request = request.with_name(store);
        }
        self.request(&request)
    }

    /// Retrieves one store's configuration block.
    pub fn config(&self, store: &str) -> ClientResult<Reply> {
        self.request(&ClientRequest::new(pot_wire::RequestKind::Config).with_name(store))
    }

    /// Sends a request in the JSON form and waits out the handshake.
    pub fn request(&self, request: &ClientRequest) -> ClientResult<Reply> {
        self.send_raw(&request.to_bytes()?)
    }

    /// Sends a raw request frame and returns the terminal reply, consuming
    /// the leading ACK when the server sends one.
    pub fn send_raw(&self, frame: &[u8]) -> ClientResult<Reply> {
        self.socket.send(frame, 0)?;

        let first = Response::parse(&self.recv(self.config.ack_timeout)?)?;
        trace!(message = ?first.kind(), id = %first.id, "first response frame");

        let response = match first.kind() {
            MessageKind::Ack => Response::parse(&self.recv(self.config.reply_timeout)?)?,
            // A server may answer with the full REP straight away; the point
            // of the ACK (is anyone there?) is moot once the REP is in hand.
            MessageKind::Rep | MessageKind::RepBulk => first,
            other => {
                return Err(ClientError::UnexpectedMessage {
                    expected: "ACK or REP".to_string(),
                    actual: format!("{other:?}"),
                })
            }
        };

        let bulk = match response.kind() {
            MessageKind::RepBulk => {
                let frame = self.recv(self.config.reply_timeout)?;
                Some(BulkFrame::parse(&frame)?)
            }
            _ => None,
        };

        Ok(Reply { response, bulk })
    }

    fn recv(&self, timeout: Duration) -> ClientResult<Vec<u8>> {
        let ready = self
            .socket
            .poll(zmq::POLLIN, timeout.as_millis() as i64)?;
        if ready == 0 {
            return Err(ClientError::Timeout(timeout));
        }
        Ok(self.socket.recv_bytes(0)?)
    }
}

impl Reply {
    /// The reply's transaction id.
    pub fn id(&self) -> TransactionId {
        self.response.id
    }

    /// Fails when the reply carries an error object.
    pub fn into_result(self) -> ClientResult<Reply> {
        match &self.response.error {
            Some(error) => Err(ClientError::server(error)),
            None => Ok(self),
        }
    }
}

impl std::fmt::Debug for RequestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
