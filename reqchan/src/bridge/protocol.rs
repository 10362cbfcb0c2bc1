//! Wire-level message types shared by client and server.
//!
//! Two kinds of channel carry these messages:
//! - **Control channel**: NewChannel handshakes, file-size queries, Quit
//! - **Private channels**: one per worker, Data and FileChunk requests

use serde::{Deserialize, Serialize};

/// Seconds between consecutive samples of one entity (15000 samples per minute).
pub const SAMPLE_INTERVAL: f64 = 60.0 / 15000.0;

/// Which end of a channel this process holds.
///
/// The responder creates the channel's OS objects and is the only side that
/// unlinks them. The initiator attaches to an existing name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Responder,
    Initiator,
}

impl Role {
    pub fn owns_resources(self) -> bool {
        matches!(self, Self::Responder)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Responder => f.write_str("responder"),
            Self::Initiator => f.write_str("initiator"),
        }
    }
}

/// One sample request: `entity_id` at `timestamp` on sub-stream `sub_stream`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DataRequest {
    pub entity_id: i32,
    pub timestamp: f64,
    pub sub_stream: i32,
}

impl DataRequest {
    pub fn new(entity_id: i32, timestamp: f64, sub_stream: i32) -> Self {
        Self {
            entity_id,
            timestamp,
            sub_stream,
        }
    }

    /// Request for the `index`-th sample of an entity.
    pub fn at_index(entity_id: i32, index: u32, sub_stream: i32) -> Self {
        Self::new(entity_id, f64::from(index) * SAMPLE_INTERVAL, sub_stream)
    }

    /// Sample index this request's timestamp falls on.
    pub fn sample_index(&self) -> u64 {
        (self.timestamp / SAMPLE_INTERVAL).round().max(0.0) as u64
    }
}

/// Request for `length` bytes of `filename` starting at `offset`.
///
/// `offset == 0 && length == 0` asks for the total file size instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunkRequest {
    pub offset: i64,
    pub length: i32,
    pub filename: String,
}

impl FileChunkRequest {
    pub fn chunk(filename: impl Into<String>, offset: i64, length: i32) -> Self {
        Self {
            offset,
            length,
            filename: filename.into(),
        }
    }

    pub fn size_query(filename: impl Into<String>) -> Self {
        Self::chunk(filename, 0, 0)
    }

    pub fn is_size_query(&self) -> bool {
        self.offset == 0 && self.length == 0
    }
}

/// Every message a client may send.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Data(DataRequest),
    FileChunk(FileChunkRequest),
    NewChannel,
    /// Terminal message; the peer sends no response.
    Quit,
}

impl Request {
    pub fn kind(&self) -> RequestKind {
        match self {
            Self::Data(_) => RequestKind::Data,
            Self::FileChunk(_) => RequestKind::FileChunk,
            Self::NewChannel => RequestKind::NewChannel,
            Self::Quit => RequestKind::Quit,
        }
    }

    pub fn expects_response(&self) -> bool {
        !matches!(self, Self::Quit)
    }
}

impl From<DataRequest> for Request {
    fn from(req: DataRequest) -> Self {
        Self::Data(req)
    }
}

impl From<FileChunkRequest> for Request {
    fn from(req: FileChunkRequest) -> Self {
        Self::FileChunk(req)
    }
}

/// Leading discriminant byte of every encoded request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RequestKind {
    Data = 1,
    FileChunk = 2,
    NewChannel = 3,
    Quit = 4,
}

impl RequestKind {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Data),
            2 => Some(Self::FileChunk),
            3 => Some(Self::NewChannel),
            4 => Some(Self::Quit),
            _ => None,
        }
    }

    pub fn tag(self) -> u8 {
        self as u8
    }
}
