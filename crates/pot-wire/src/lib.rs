//! # pot-wire: wire protocol for the POT telemetry broker
//!
//! This crate defines the message grammars spoken on the broker's external
//! request/reply and publish/subscribe sockets, and on the internal sockets
//! to the per-store backend workers.
//!
//! ## Request grammar (client → broker)
//!
//! ```text
//! READ <fullname>
//! WRITE <json-object>
//! ID [store]
//! CONFIG <store>
//! HASH [store]
//! ```
//!
//! The same request may instead arrive as a JSON object
//! `{"request": KIND, "name": …, "id": …, "data": …}`; this is also the
//! form forwarded to a worker.
//!
//! ## Response descriptor (broker → client)
//!
//! A JSON object `{message, id, time, [name], [data], [error]}` where
//! `message` is `ACK`, `REP`, or `PUB`, `id` is exactly eight lowercase hex
//! digits, and `time` is epoch seconds. A descriptor carrying `bulk: true`
//! is followed by a second, raw frame:
//!
//! ```text
//! <name>;bulk <8-hex-id> <raw bytes…>
//! ```
//!
//! The bulk payload may contain any octet, including spaces. A broadcast
//! whose topic ends in `;bundle` carries a JSON array of PUB descriptors
//! sharing a single transaction id.
//!
//! Unknown JSON fields are tolerated and preserved across re-serialization
//! so that newer producers keep working against this codec.

mod error;
mod frame;
mod ids;
mod message;

pub use error::{WireError, WireResult};
pub use frame::{is_bulk_topic, Broadcast, BulkFrame, BULK_SUFFIX, BUNDLE_SUFFIX};
pub use ids::{store_of, unix_time, TransactionId};
pub use message::{
    ClientRequest, ErrorBody, MessageKind, MessageWord, RequestKind, Response, WorkerRequest,
};
