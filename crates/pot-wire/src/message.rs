//! Request and response message types.
//!
//! The wire carries string message kinds; everything past the parse boundary
//! works with the closed enums defined here.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{WireError, WireResult};
use crate::ids::{unix_time, TransactionId};

// ============================================================================
// Message kinds
// ============================================================================

/// Request kinds accepted on the external and worker sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestKind {
    /// Read one element.
    #[serde(rename = "READ")]
    Read,
    /// Write one element.
    #[serde(rename = "WRITE")]
    Write,
    /// List the configuration identifiers of the known stores.
    #[serde(rename = "ID")]
    Id,
    /// Retrieve one store's configuration block.
    #[serde(rename = "CONFIG")]
    Config,
    /// Undocumented synonym of `ID`; accepted for compatibility.
    #[serde(rename = "HASH")]
    Hash,
}

impl RequestKind {
    /// The wire word for this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            RequestKind::Read => "READ",
            RequestKind::Write => "WRITE",
            RequestKind::Id => "ID",
            RequestKind::Config => "CONFIG",
            RequestKind::Hash => "HASH",
        }
    }

    /// Parses a wire word into a kind.
    pub fn parse(word: &str) -> WireResult<Self> {
        match word {
            "READ" => Ok(RequestKind::Read),
            "WRITE" => Ok(RequestKind::Write),
            "ID" => Ok(RequestKind::Id),
            "CONFIG" => Ok(RequestKind::Config),
            "HASH" => Ok(RequestKind::Hash),
            other => Err(WireError::UnhandledKind(other.to_string())),
        }
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `message` word of a descriptor frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageWord {
    #[serde(rename = "ACK")]
    Ack,
    #[serde(rename = "REP")]
    Rep,
    #[serde(rename = "PUB")]
    Pub,
}

/// The five message kinds of the protocol. The `+B` variants are descriptors
/// immediately followed by a bulk frame carrying the same transaction id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Ack,
    Rep,
    RepBulk,
    Pub,
    PubBulk,
}

// ============================================================================
// Client requests
// ============================================================================

/// A request as issued by an external client.
///
/// Parsed from either the command-line form or the JSON form; see the crate
/// docs for the grammar.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientRequest {
    pub kind: RequestKind,
    /// Element name (READ/WRITE) or store name (ID/CONFIG/HASH).
    pub name: Option<String>,
    /// The client-chosen transaction id, when one was supplied.
    pub id: Option<TransactionId>,
    pub data: Option<Value>,
}

impl ClientRequest {
    /// Parses a raw request frame in either supported form.
    pub fn parse(frame: &[u8]) -> WireResult<Self> {
        let text = std::str::from_utf8(frame)
            .map_err(|_| WireError::BadFrame("request frame is not UTF-8".to_string()))?
            .trim();

        if text.is_empty() {
            return Err(WireError::BadFrame("empty request frame".to_string()));
        }
        if text.starts_with('{') {
            return Self::parse_json(text);
        }

        let (word, argument) = match text.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (text, ""),
        };
        let kind = RequestKind::parse(word)?;

        match kind {
            RequestKind::Read => {
                if argument.is_empty() {
                    return Err(WireError::MissingField("name"));
                }
                Ok(Self::new(kind).with_name(argument))
            }
            RequestKind::Write => Self::parse_write_argument(argument),
            RequestKind::Config => {
                if argument.is_empty() {
                    return Err(WireError::MissingField("name"));
                }
                Ok(Self::new(kind).with_name(argument))
            }
            RequestKind::Id | RequestKind::Hash => {
                let mut request = Self::new(kind);
                if !argument.is_empty() {
                    request = request.with_name(argument);
                }
                Ok(request)
            }
        }
    }

    /// `WRITE` takes a JSON object argument: `{"name": …, "data": …}` with
    /// an optional caller-chosen `"id"`.
    fn parse_write_argument(argument: &str) -> WireResult<Self> {
        if argument.is_empty() {
            return Err(WireError::MissingField("name"));
        }
        let value: Value = serde_json::from_str(argument)
            .map_err(|e| WireError::BadWriteArgument(e.to_string()))?;
        let Value::Object(body) = value else {
            return Err(WireError::BadWriteArgument(
                "expected a JSON object".to_string(),
            ));
        };

        let name = body
            .get("name")
            .and_then(Value::as_str)
            .ok_or(WireError::MissingField("name"))?
            .to_string();
        let id = parse_optional_id(body.get("id"))?;
        let data = body.get("data").cloned().filter(|v| !v.is_null());

        Ok(ClientRequest {
            kind: RequestKind::Write,
            name: Some(name),
            id,
            data,
        })
    }

    fn parse_json(text: &str) -> WireResult<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| WireError::BadFrame(format!("request body: {e}")))?;
        let Value::Object(body) = value else {
            return Err(WireError::BadFrame("request body is not an object".to_string()));
        };

        let word = body
            .get("request")
            .and_then(Value::as_str)
            .ok_or(WireError::MissingField("request"))?;
        let kind = RequestKind::parse(word)?;

        let name = body
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string);
        if name.is_none() {
            if let RequestKind::Read | RequestKind::Write | RequestKind::Config = kind {
                return Err(WireError::MissingField("name"));
            }
        }
        let id = parse_optional_id(body.get("id"))?;
        let data = body.get("data").cloned().filter(|v| !v.is_null());

        Ok(ClientRequest { kind, name, id, data })
    }

    /// Starts an empty request of the given kind.
    pub fn new(kind: RequestKind) -> Self {
        Self {
            kind,
            name: None,
            id: None,
            data: None,
        }
    }

    /// Convenience constructor for a READ.
    pub fn read(name: impl Into<String>) -> Self {
        Self::new(RequestKind::Read).with_name(name)
    }

    /// Convenience constructor for a WRITE.
    pub fn write(name: impl Into<String>, data: Value) -> Self {
        Self::new(RequestKind::Write).with_name(name).with_data(data)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_id(mut self, id: TransactionId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Encodes the JSON request form.
    pub fn to_bytes(&self) -> WireResult<Vec<u8>> {
        let mut body = Map::new();
        body.insert(
            "request".to_string(),
            Value::String(self.kind.as_str().to_string()),
        );
        if let Some(name) = &self.name {
            body.insert("name".to_string(), Value::String(name.clone()));
        }
        if let Some(id) = self.id {
            body.insert("id".to_string(), Value::String(id.to_string()));
        }
        if let Some(data) = &self.data {
            body.insert("data".to_string(), data.clone());
        }
        Ok(serde_json::to_vec(&Value::Object(body))?)
    }
}

fn parse_optional_id(value: Option<&Value>) -> WireResult<Option<TransactionId>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|e| WireError::BadFrame(format!("ill-formed id: {e}"))),
    }
}

// ============================================================================
// Worker requests
// ============================================================================

/// The JSON request body exchanged with a backend worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub request: RequestKind,
    pub id: TransactionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Unknown fields, preserved verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl WorkerRequest {
    /// A CONFIG request for the named store. The id is assigned by the relay
    /// just before the request goes out.
    pub fn config(store: &str) -> Self {
        Self {
            request: RequestKind::Config,
            id: TransactionId::default(),
            name: Some(store.to_string()),
            data: None,
            extra: Map::new(),
        }
    }

    /// Rebuilds a client request as a worker request under `id`.
    pub fn from_client(request: &ClientRequest, id: TransactionId) -> Self {
        Self {
            request: request.kind,
            id,
            name: request.name.clone(),
            data: request.data.clone(),
            extra: Map::new(),
        }
    }

    pub fn to_bytes(&self) -> WireResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

// ============================================================================
// Response descriptors
// ============================================================================

/// The error object carried by an error-bearing REP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Canonical error symbol, e.g. `KeyError`.
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
    /// Opaque diagnostic payload; forwarded untouched when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<Value>,
}

impl ErrorBody {
    pub fn new(kind: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            text: text.into(),
            debug: None,
        }
    }

    /// Builds the wire error object for a codec failure.
    pub fn from_wire(error: &WireError) -> Self {
        Self::new(error.symbol(), error.to_string())
    }
}

/// A response or broadcast descriptor frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub message: MessageWord,
    pub id: TransactionId,
    /// Epoch seconds at which the descriptor was built.
    pub time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    /// Present and true on a descriptor that is followed by a bulk frame.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bulk: Option<bool>,
    /// Unknown fields, preserved verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Response {
    fn bare(message: MessageWord, id: TransactionId) -> Self {
        Self {
            message,
            id,
            time: unix_time(),
            name: None,
            data: None,
            error: None,
            bulk: None,
            extra: Map::new(),
        }
    }

    /// An immediate acknowledgment for `id`.
    pub fn ack(id: TransactionId) -> Self {
        Self::bare(MessageWord::Ack, id)
    }

    /// A terminal reply for `id`.
    pub fn rep(id: TransactionId) -> Self {
        Self::bare(MessageWord::Rep, id)
    }

    /// A broadcast descriptor under `id`.
    pub fn publish(id: TransactionId) -> Self {
        Self::bare(MessageWord::Pub, id)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_error(mut self, error: ErrorBody) -> Self {
        self.error = Some(error);
        self
    }

    /// Marks this descriptor as the first frame of a two-frame message.
    pub fn with_bulk(mut self) -> Self {
        self.bulk = Some(true);
        self
    }

    /// Folds the `message` word and the `bulk` marker into the closed kind.
    pub fn kind(&self) -> MessageKind {
        let bulk = self.bulk == Some(true);
        match (self.message, bulk) {
            (MessageWord::Ack, _) => MessageKind::Ack,
            (MessageWord::Rep, false) => MessageKind::Rep,
            (MessageWord::Rep, true) => MessageKind::RepBulk,
            (MessageWord::Pub, false) => MessageKind::Pub,
            (MessageWord::Pub, true) => MessageKind::PubBulk,
        }
    }

    /// True when the descriptor carries a non-null error object.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn parse(frame: &[u8]) -> WireResult<Self> {
        serde_json::from_slice(frame)
            .map_err(|e| WireError::BadFrame(format!("response body: {e}")))
    }

    pub fn to_bytes(&self) -> WireResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[cfg(test)]
mod message_tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_read_command() {
        let request = ClientRequest::parse(b"READ kpfguide.DISP2MSG").unwrap();
        assert_eq!(request.kind, RequestKind::Read);
        assert_eq!(request.name.as_deref(), Some("kpfguide.DISP2MSG"));
        assert_eq!(request.id, None);
    }

    #[test]
    fn read_without_name_is_a_key_error() {
        let err = ClientRequest::parse(b"READ").unwrap_err();
        assert!(matches!(err, WireError::MissingField("name")));
        assert_eq!(err.symbol(), "KeyError");
    }

    #[test]
    fn parses_write_command_with_id() {
        let request = ClientRequest::parse(
            br#"WRITE {"name":"kpfguide.EXPTIME","data":4,"id":"0000000b"}"#,
        )
        .unwrap();
        assert_eq!(request.kind, RequestKind::Write);
        assert_eq!(request.name.as_deref(), Some("kpfguide.EXPTIME"));
        assert_eq!(request.id, Some(TransactionId::new(11)));
        assert_eq!(request.data, Some(json!(4)));
    }

    #[test]
    fn write_with_bad_json_is_a_type_error() {
        let err = ClientRequest::parse(b"WRITE {not json").unwrap_err();
        assert_eq!(err.symbol(), "TypeError");

        let err = ClientRequest::parse(b"WRITE [1, 2]").unwrap_err();
        assert_eq!(err.symbol(), "TypeError");
    }

    #[test]
    fn write_without_name_is_a_key_error() {
        let err = ClientRequest::parse(br#"WRITE {"data":4}"#).unwrap_err();
        assert!(matches!(err, WireError::MissingField("name")));
    }

    #[test]
    fn id_takes_an_optional_store() {
        let all = ClientRequest::parse(b"ID").unwrap();
        assert_eq!(all.kind, RequestKind::Id);
        assert_eq!(all.name, None);

        let one = ClientRequest::parse(b"ID kpfguide").unwrap();
        assert_eq!(one.name.as_deref(), Some("kpfguide"));
    }

    #[test]
    fn hash_is_accepted() {
        let request = ClientRequest::parse(b"HASH kpfguide").unwrap();
        assert_eq!(request.kind, RequestKind::Hash);
    }

    #[test]
    fn config_requires_a_store() {
        assert!(matches!(
            ClientRequest::parse(b"CONFIG").unwrap_err(),
            WireError::MissingField("name")
        ));
    }

    #[test]
    fn unknown_command_is_a_value_error() {
        let err = ClientRequest::parse(b"FROB widget").unwrap_err();
        assert!(matches!(err, WireError::UnhandledKind(_)));
        assert_eq!(err.symbol(), "ValueError");
        assert_eq!(err.to_string(), "unhandled request type: FROB");
    }

    #[test]
    fn parses_json_request_form() {
        let request = ClientRequest::parse(
            br#"{"request":"READ","name":"kpfguide.DISP2MSG","id":"0000000a"}"#,
        )
        .unwrap();
        assert_eq!(request.kind, RequestKind::Read);
        assert_eq!(request.id, Some(TransactionId::new(10)));
    }

    #[test]
    fn json_request_round_trips() {
        let request = ClientRequest::read("kpfguide.EL").with_id(TransactionId::new(7));
        let bytes = request.to_bytes().unwrap();
        assert_eq!(ClientRequest::parse(&bytes).unwrap(), request);
    }

    #[test]
    fn non_utf8_request_is_a_bad_frame() {
        let err = ClientRequest::parse(&[0x52, 0xff, 0xfe]).unwrap_err();
        assert!(matches!(err, WireError::BadFrame(_)));
    }

    #[test]
    fn response_preserves_unknown_fields() {
        let frame = br#"{"message":"REP","id":"00000001","time":1.5,"vendor":{"x":1}}"#;
        let response = Response::parse(frame).unwrap();
        assert_eq!(response.extra["vendor"], json!({"x": 1}));

        let bytes = response.to_bytes().unwrap();
        let round: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(round["vendor"], json!({"x": 1}));
    }

    #[test]
    fn error_debug_passes_through() {
        let frame = br#"{"message":"REP","id":"00000001","time":0.0,
            "error":{"type":"RuntimeError","text":"boom","debug":"trace..."}}"#;
        let response = Response::parse(frame).unwrap();
        let error = response.error.as_ref().unwrap();
        assert_eq!(error.kind, "RuntimeError");
        assert_eq!(error.debug, Some(json!("trace...")));

        let bytes = response.to_bytes().unwrap();
        let round: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(round["error"]["debug"], json!("trace..."));
    }

    #[test]
    fn kind_folds_the_bulk_marker() {
        assert_eq!(Response::ack(TransactionId::new(1)).kind(), MessageKind::Ack);
        assert_eq!(Response::rep(TransactionId::new(1)).kind(), MessageKind::Rep);
        assert_eq!(
            Response::rep(TransactionId::new(1)).with_bulk().kind(),
            MessageKind::RepBulk
        );
        assert_eq!(
            Response::publish(TransactionId::new(1)).with_bulk().kind(),
            MessageKind::PubBulk
        );
    }

    #[test]
    fn worker_request_round_trips() {
        let request = WorkerRequest::from_client(
            &ClientRequest::write("kpfguide.EXPTIME", json!(4)),
            TransactionId::new(3),
        );
        let bytes = request.to_bytes().unwrap();
        let parsed: WorkerRequest = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed.request, RequestKind::Write);
        assert_eq!(parsed.id, TransactionId::new(3));
        assert_eq!(parsed.data, Some(json!(4)));
    }
}
