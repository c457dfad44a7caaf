//! Wire messages exchanged between proxies and workers.
//!
//! Every message is a `postcard` encoding carried in one length-delimited
//! frame. A connection serves one call: the proxy sends a single [`Request`]
//! and the worker answers with zero or more [`Reply::Partial`] frames followed
//! by exactly one [`Reply::Completed`] or [`Reply::Failed`]. Unsubscribe
//! requests are answered with a single [`Reply::Ack`].

use crate::error::{ErrorKind, Result};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use uuid::Uuid;

/// Handle of the dataset a worker was started with.
pub const ROOT_HANDLE: i64 = 0;

/// Placeholder handle for operations whose payload names no dataset.
pub const NO_DATASET: i64 = -1;

/// Correlates all messages of one logical call, so it can be cancelled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationId(Uuid);

impl OperationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_parts(high: u64, low: u64) -> Self {
        Self(Uuid::from_u64_pair(high, low))
    }

    /// Most and least significant halves.
    pub fn parts(&self) -> (u64, u64) {
        self.0.as_u64_pair()
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One request against a dataset held by a worker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub dataset_handle: i64,
    pub operation_id_high: u64,
    pub operation_id_low: u64,
    /// Encoded [`Operation`].
    pub payload: Vec<u8>,
}

impl Command {
    pub fn new(dataset_handle: i64, operation: OperationId, payload: Vec<u8>) -> Self {
        let (operation_id_high, operation_id_low) = operation.parts();
        Self {
            dataset_handle,
            operation_id_high,
            operation_id_low,
            payload,
        }
    }

    pub fn operation_id(&self) -> OperationId {
        OperationId::from_parts(self.operation_id_high, self.operation_id_low)
    }
}

/// One streamed item of a call: an encoded [`ResponseBody`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialResponse {
    pub payload: Vec<u8>,
}

/// A partial result as it crosses the wire.
///
/// For dataset-producing calls the delta is the encoded handle of the new
/// dataset on the worker; for sketches it is the encoded sketch value; for
/// manage calls it is the encoded status list.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResponseBody {
    pub done: f64,
    pub delta: Option<Vec<u8>>,
}

/// Serialized user capability: its registered name and its encoding.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EncodedDescriptor {
    pub kind: String,
    pub body: Vec<u8>,
}

/// The remote methods.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    Map,
    FlatMap,
    Sketch,
    Prune,
    Zip,
    Manage,
}

impl Method {
    pub fn name(&self) -> &'static str {
        match self {
            Method::Map => "map",
            Method::FlatMap => "flat_map",
            Method::Sketch => "sketch",
            Method::Prune => "prune",
            Method::Zip => "zip",
            Method::Manage => "manage",
        }
    }

    /// Whether the call produces a dataset handle.
    pub fn produces_dataset(&self) -> bool {
        matches!(self, Method::Map | Method::FlatMap | Method::Zip | Method::Prune)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a [`Command`] payload asks for.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Map(EncodedDescriptor),
    FlatMap(EncodedDescriptor),
    Sketch(EncodedDescriptor),
    Prune(EncodedDescriptor),
    Zip {
        other_handle: i64,
        combiner: EncodedDescriptor,
    },
    Manage(EncodedDescriptor),
}

impl Operation {
    pub fn method(&self) -> Method {
        match self {
            Operation::Map(_) => Method::Map,
            Operation::FlatMap(_) => Method::FlatMap,
            Operation::Sketch(_) => Method::Sketch,
            Operation::Prune(_) => Method::Prune,
            Operation::Zip { .. } => Method::Zip,
            Operation::Manage(_) => Method::Manage,
        }
    }

    pub fn descriptor(&self) -> &EncodedDescriptor {
        match self {
            Operation::Map(d)
            | Operation::FlatMap(d)
            | Operation::Sketch(d)
            | Operation::Prune(d)
            | Operation::Manage(d) => d,
            Operation::Zip { combiner, .. } => combiner,
        }
    }
}

/// First frame sent on a connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    Call { method: Method, command: Command },
    /// Cancel the call carrying the same operation id.
    Unsubscribe(Command),
}

/// Frames sent back by the worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    Partial(PartialResponse),
    Completed,
    Failed { kind: ErrorKind, message: String },
    Ack,
}

/// A TCP connection carrying length-delimited frames.
pub type Connection = Framed<TcpStream, LengthDelimitedCodec>;

pub fn framed(stream: TcpStream, max_frame_length: usize) -> Connection {
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_length)
        .new_codec();
    Framed::new(stream, codec)
}

pub fn encode<M: Serialize>(message: &M) -> Result<Bytes> {
    Ok(Bytes::from(postcard::to_allocvec(message)?))
}

pub fn decode<M: DeserializeOwned>(bytes: &[u8]) -> Result<M> {
    Ok(postcard::from_bytes(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_id_survives_split() {
        let id = OperationId::new();
        let (hi, lo) = id.parts();
        assert_eq!(OperationId::from_parts(hi, lo), id);
        let cmd = Command::new(3, id, Vec::new());
        assert_eq!(cmd.operation_id(), id);
    }

    #[test]
    fn reply_frames_decode() -> anyhow::Result<()> {
        let body = ResponseBody {
            done: 0.5,
            delta: Some(encode(&7i64)?.to_vec()),
        };
        let reply = Reply::Partial(PartialResponse {
            payload: encode(&body)?.to_vec(),
        });
        let back: Reply = decode(&encode(&reply)?)?;
        let Reply::Partial(p) = back else {
            panic!("expected a partial reply");
        };
        let body: ResponseBody = decode(&p.payload)?;
        assert_eq!(body.done, 0.5);
        let handle: i64 = decode(body.delta.as_deref().unwrap_or_default())?;
        assert_eq!(handle, 7);
        Ok(())
    }

    #[test]
    fn truncated_payload_is_malformed() {
        let err = decode::<Operation>(&[0xff]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn zip_descriptor_is_the_combiner() {
        let op = Operation::Zip {
            other_handle: 4,
            combiner: EncodedDescriptor {
                kind: "pair".into(),
                body: vec![],
            },
        };
        assert_eq!(op.method(), Method::Zip);
        assert_eq!(op.descriptor().kind, "pair");
        assert!(Method::Zip.produces_dataset());
        assert!(!Method::Manage.produces_dataset());
    }
}
