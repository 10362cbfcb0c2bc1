//! Duplex message transports between two local processes.
//!
//! Implementations:
//! - **FifoTransport**: a pair of named pipes with length-prefixed frames
//! - **MessageQueueTransport**: a pair of POSIX message queues
//! - **SharedMemoryTransport**: a pair of single-slot shared-memory regions
//!   guarded by named counting semaphores
//!
//! Every transport creates its OS objects idempotently, so either end may
//! open first. Only the responder unlinks them on drop.

mod fifo;
mod mqueue;
mod shm;

use std::path::PathBuf;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub use fifo::FifoTransport;
pub use mqueue::MessageQueueTransport;
pub use shm::SharedMemoryTransport;

use super::protocol::Role;

/// Default maximum message size in bytes.
pub const DEFAULT_MAX_MESSAGE: usize = 256;

/// Upper bound accepted for `max_message_size` (Linux `msgsize_max` default).
pub const MAX_MESSAGE_LIMIT: usize = 8192;

/// Blocking whole-message link to one peer.
///
/// Dropping the transport closes it; a responder-side drop also unlinks the
/// OS objects backing it.
pub trait Transport: Send {
    /// Send one message. Fails before touching the OS if `payload` exceeds
    /// [`Transport::max_message_size`].
    fn send(&mut self, payload: &[u8]) -> Result<(), TransportError>;

    /// Block until one whole message has arrived.
    fn receive(&mut self) -> Result<Bytes, TransportError>;

    fn max_message_size(&self) -> usize;

    fn kind(&self) -> TransportKind;
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to create {resource}: {source}")]
    Create {
        resource: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to open {resource}: {source}")]
    Open {
        resource: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write to {resource}: {source}")]
    Send {
        resource: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read from {resource}: {source}")]
    Receive {
        resource: String,
        #[source]
        source: std::io::Error,
    },
    #[error("message of {size} bytes exceeds maximum of {max}")]
    Oversized { size: usize, max: usize },
    #[error("peer closed {resource}")]
    Closed { resource: String },
    #[error("invalid channel name {0:?}")]
    InvalidName(String),
}

impl TransportError {
    pub(crate) fn create(resource: impl Into<String>, source: impl Into<std::io::Error>) -> Self {
        Self::Create {
            resource: resource.into(),
            source: source.into(),
        }
    }

    pub(crate) fn open(resource: impl Into<String>, source: impl Into<std::io::Error>) -> Self {
        Self::Open {
            resource: resource.into(),
            source: source.into(),
        }
    }

    pub(crate) fn send(resource: impl Into<String>, source: impl Into<std::io::Error>) -> Self {
        Self::Send {
            resource: resource.into(),
            source: source.into(),
        }
    }

    pub(crate) fn receive(resource: impl Into<String>, source: impl Into<std::io::Error>) -> Self {
        Self::Receive {
            resource: resource.into(),
            source: source.into(),
        }
    }

    /// True when the peer went away rather than the OS failing.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed { .. })
    }
}

pub(crate) fn check_size(payload: &[u8], max: usize) -> Result<(), TransportError> {
    if payload.len() > max {
        return Err(TransportError::Oversized {
            size: payload.len(),
            max,
        });
    }
    Ok(())
}

/// Channel names end up in POSIX IPC names and file names.
pub(crate) fn validate_name(name: &str) -> Result<(), TransportError> {
    let valid = !name.is_empty()
        && name.len() <= 200
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b'.')
        && name != "."
        && name != "..";
    if valid {
        Ok(())
    } else {
        Err(TransportError::InvalidName(name.to_string()))
    }
}

/// Transport implementation, chosen once per session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    #[default]
    Fifo,
    #[serde(rename = "mq")]
    MessageQueue,
    #[serde(rename = "shm")]
    SharedMemory,
}

impl TransportKind {
    pub const ALL: [TransportKind; 3] = [Self::Fifo, Self::MessageQueue, Self::SharedMemory];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fifo => "fifo",
            Self::MessageQueue => "mq",
            Self::SharedMemory => "shm",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown transport {0:?} (expected fifo, mq or shm)")]
pub struct UnknownTransport(String);

impl FromStr for TransportKind {
    type Err = UnknownTransport;

    /// Accepts the full names and their first letter (`f`, `q`, `s`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fifo" | "f" | "pipe" => Ok(Self::Fifo),
            "mq" | "q" | "queue" => Ok(Self::MessageQueue),
            "shm" | "s" | "shared-memory" => Ok(Self::SharedMemory),
            _ => Err(UnknownTransport(s.to_string())),
        }
    }
}

/// Settings both peers must agree on out of band.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    pub kind: TransportKind,
    pub max_message_size: usize,
    /// Directory holding named pipes (FIFO transport only).
    pub fifo_dir: PathBuf,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new(TransportKind::default())
    }
}

impl TransportConfig {
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            max_message_size: DEFAULT_MAX_MESSAGE,
            fifo_dir: std::env::temp_dir(),
        }
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    pub fn with_fifo_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.fifo_dir = dir.into();
        self
    }

    /// Open (creating if needed) the transport for `name` as `role`.
    pub fn open(&self, name: &str, role: Role) -> Result<Box<dyn Transport>, TransportError> {
        validate_name(name)?;
        tracing::trace!(transport = %self.kind, name, %role, "Opening transport");
        let transport: Box<dyn Transport> = match self.kind {
            TransportKind::Fifo => Box::new(FifoTransport::open(
                &self.fifo_dir,
                name,
                role,
                self.max_message_size,
            )?),
            TransportKind::MessageQueue => Box::new(MessageQueueTransport::open(
                name,
                role,
                self.max_message_size,
            )?),
            TransportKind::SharedMemory => Box::new(SharedMemoryTransport::open(
                name,
                role,
                self.max_message_size,
            )?),
        };
        Ok(transport)
    }

    /// Remove every OS object backing `name` without opening it. Used when
    /// the responder that would normally do this is gone.
    pub fn unlink(&self, name: &str) {
        if validate_name(name).is_err() {
            return;
        }
        match self.kind {
            TransportKind::Fifo => FifoTransport::unlink(&self.fifo_dir, name),
            TransportKind::MessageQueue => MessageQueueTransport::unlink(name),
            TransportKind::SharedMemory => SharedMemoryTransport::unlink(name),
        }
    }

    /// True if any OS object backing `name` still exists.
    pub fn resources_exist(&self, name: &str) -> bool {
        match self.kind {
            TransportKind::Fifo => FifoTransport::exists(&self.fifo_dir, name),
            TransportKind::MessageQueue => MessageQueueTransport::exists(name),
            TransportKind::SharedMemory => SharedMemoryTransport::exists(name),
        }
    }
}

/// Suffix for the initiator→responder direction.
pub(crate) const UPSTREAM: &str = "c2s";
/// Suffix for the responder→initiator direction.
pub(crate) const DOWNSTREAM: &str = "s2c";

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::thread;

    pub(crate) fn unique_name(tag: &str) -> String {
        format!("rct{}_{}", &uuid::Uuid::new_v4().simple().to_string()[..12], tag)
    }

    /// Responder echoes every message back, reversed, until it sees `b"bye"`.
    pub(crate) fn exercise_echo(config: TransportConfig) {
        let name = unique_name("echo");
        let responder_config = config.clone();
        let responder_name = name.clone();
        let server = thread::spawn(move || {
            let mut t = responder_config
                .open(&responder_name, Role::Responder)
                .unwrap();
            loop {
                let msg = t.receive().unwrap();
                if &msg[..] == b"bye" {
                    break;
                }
                let mut reply = msg.to_vec();
                reply.reverse();
                t.send(&reply).unwrap();
            }
        });

        let mut client = config.open(&name, Role::Initiator).unwrap();
        assert_eq!(client.max_message_size(), config.max_message_size);
        for msg in [&b"hello"[..], b"x", &[7u8; 64][..]] {
            client.send(msg).unwrap();
            let reply = client.receive().unwrap();
            let mut expected = msg.to_vec();
            expected.reverse();
            assert_eq!(&reply[..], &expected[..]);
        }

        let oversized = vec![0u8; config.max_message_size + 1];
        assert!(matches!(
            client.send(&oversized),
            Err(TransportError::Oversized { .. })
        ));

        // A message of exactly the maximum size goes through.
        let exact = vec![1u8; config.max_message_size];
        client.send(&exact).unwrap();
        assert_eq!(client.receive().unwrap().len(), config.max_message_size);

        client.send(b"bye").unwrap();
        server.join().unwrap();
        drop(client);

        assert!(
            !config.resources_exist(&name),
            "{} resources for {name} survived teardown",
            config.kind
        );
    }

    #[test]
    fn parses_kind_shorthands() {
        assert_eq!("f".parse::<TransportKind>().unwrap(), TransportKind::Fifo);
        assert_eq!("Q".parse::<TransportKind>().unwrap(), TransportKind::MessageQueue);
        assert_eq!("shm".parse::<TransportKind>().unwrap(), TransportKind::SharedMemory);
        assert!("tcp".parse::<TransportKind>().is_err());
    }

    #[test]
    fn kind_serializes_short_names() {
        let json = serde_json::to_string(&TransportKind::ALL).unwrap();
        insta::assert_snapshot!(json, @r#"["fifo","mq","shm"]"#);
    }

    #[test]
    fn rejects_unsafe_names() {
        for bad in ["", "a/b", "..", "with space", "/lead"] {
            assert!(validate_name(bad).is_err(), "{bad:?} accepted");
        }
        assert!(validate_name("rc1234_control").is_ok());
    }

    #[test]
    fn initiator_may_create_before_responder() {
        let config = TransportConfig::new(TransportKind::MessageQueue);
        let name = unique_name("order");
        // Initiator creates the queues; responder attaches afterwards.
        let mut client = config.open(&name, Role::Initiator).unwrap();
        let mut server = config.open(&name, Role::Responder).unwrap();
        client.send(b"ping").unwrap();
        assert_eq!(&server.receive().unwrap()[..], b"ping");
        server.send(b"pong").unwrap();
        assert_eq!(&client.receive().unwrap()[..], b"pong");
        drop(server);
        drop(client);
        assert!(!config.resources_exist(&name));
    }

    #[test]
    fn unlink_removes_abandoned_objects() {
        let fifo_dir = tempfile::tempdir().unwrap();
        for kind in TransportKind::ALL {
            let config = TransportConfig::new(kind).with_fifo_dir(fifo_dir.path());
            let name = unique_name("orphan");
            if kind == TransportKind::Fifo {
                // Opening a pipe pair needs a peer; the files alone are the leak.
                for suffix in [UPSTREAM, DOWNSTREAM] {
                    nix::unistd::mkfifo(
                        fifo_dir.path().join(format!("{name}.{suffix}")).as_path(),
                        nix::sys::stat::Mode::S_IRWXU,
                    )
                    .unwrap();
                }
            } else {
                // An initiator creates the objects but never unlinks them.
                drop(config.open(&name, Role::Initiator).unwrap());
            }
            assert!(config.resources_exist(&name), "{kind}: nothing to clean up");
            config.unlink(&name);
            assert!(!config.resources_exist(&name), "{kind}: {name} survived unlink");
            // Idempotent.
            config.unlink(&name);
        }
    }
}
