//! Named request/response channel over one [`Transport`].
//!
//! A channel adds no buffering of its own. The initiator side tracks whether
//! a response is outstanding and refuses a second request until it has been
//! read, so responses can never be paired with the wrong request.

use bytes::{Bytes, BytesMut};
use tokio_util::codec::Encoder;

use super::codec::{CodecError, RequestCodec};
use super::protocol::{Request, Role};
use super::transport::{Transport, TransportConfig, TransportError, TransportKind};

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel {name}: {source}")]
    Transport {
        name: String,
        #[source]
        source: TransportError,
    },
    #[error("channel {name}: request sent while a response is still pending")]
    ResponsePending { name: String },
    #[error("channel {name}: {source}")]
    Codec {
        name: String,
        #[source]
        source: CodecError,
    },
}

impl ChannelError {
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Transport { source, .. } if source.is_closed())
    }
}

pub struct Channel {
    name: String,
    role: Role,
    transport: Box<dyn Transport>,
    awaiting_response: bool,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("role", &self.role)
            .field("transport", &self.transport.kind())
            .field("awaiting_response", &self.awaiting_response)
            .finish()
    }
}

impl Channel {
    /// Open `name` as `role`, creating the underlying OS objects if needed.
    pub fn open(name: &str, role: Role, config: &TransportConfig) -> Result<Self, ChannelError> {
        let transport = config
            .open(name, role)
            .map_err(|source| ChannelError::Transport {
                name: name.to_string(),
                source,
            })?;
        tracing::debug!(channel = name, %role, transport = %config.kind, "Channel open");
        Ok(Self::with_transport(name, role, transport))
    }

    pub fn with_transport(name: &str, role: Role, transport: Box<dyn Transport>) -> Self {
        Self {
            name: name.to_string(),
            role,
            transport,
            awaiting_response: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    /// Write one raw message. Returns the number of bytes written.
    ///
    /// On the initiator side this counts as a request and must be followed
    /// by [`Channel::read`] before the next write.
    pub fn write(&mut self, msg: &[u8]) -> Result<usize, ChannelError> {
        if self.role == Role::Initiator && self.awaiting_response {
            return Err(ChannelError::ResponsePending {
                name: self.name.clone(),
            });
        }
        self.transport.send(msg).map_err(|e| self.transport_error(e))?;
        if self.role == Role::Initiator {
            self.awaiting_response = true;
        }
        Ok(msg.len())
    }

    /// Block until the peer's next message arrives.
    pub fn read(&mut self) -> Result<Bytes, ChannelError> {
        let msg = self.transport.receive().map_err(|e| self.transport_error(e))?;
        self.awaiting_response = false;
        Ok(msg)
    }

    /// Encode and send `req`, then wait for its response.
    pub fn request(&mut self, req: &Request) -> Result<Bytes, ChannelError> {
        let msg = self.encode(req)?;
        self.write(&msg)?;
        self.read()
    }

    /// Send a request that has no response (Quit).
    pub fn notify(&mut self, req: &Request) -> Result<(), ChannelError> {
        debug_assert!(!req.expects_response());
        let msg = self.encode(req)?;
        self.write(&msg)?;
        self.awaiting_response = false;
        Ok(())
    }

    /// Close the channel. A responder also unlinks the OS objects.
    pub fn close(self) {
        tracing::debug!(channel = %self.name, role = %self.role, "Channel closed");
    }

    fn encode(&self, req: &Request) -> Result<Bytes, ChannelError> {
        let mut buf = BytesMut::new();
        RequestCodec
            .encode(req, &mut buf)
            .map_err(|source| ChannelError::Codec {
                name: self.name.clone(),
                source,
            })?;
        Ok(buf.freeze())
    }

    fn transport_error(&self, source: TransportError) -> ChannelError {
        ChannelError::Transport {
            name: self.name.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::codec::{decode_request, decode_sample, encode_sample};
    use crate::bridge::protocol::DataRequest;
    use crate::bridge::transport::tests::unique_name;

    fn pair(config: &TransportConfig) -> (Channel, Channel) {
        let name = unique_name("chan");
        let responder_config = config.clone();
        let responder_name = name.clone();
        let server = std::thread::spawn(move || {
            Channel::open(&responder_name, Role::Responder, &responder_config).unwrap()
        });
        let client = Channel::open(&name, Role::Initiator, config).unwrap();
        (client, server.join().unwrap())
    }

    #[test]
    fn second_write_before_read_is_rejected() {
        let config = TransportConfig::new(TransportKind::MessageQueue);
        let (mut client, mut server) = pair(&config);

        client.write(b"one").unwrap();
        let err = client.write(b"two").unwrap_err();
        assert!(matches!(err, ChannelError::ResponsePending { .. }));

        assert_eq!(&server.read().unwrap()[..], b"one");
        server.write(b"reply").unwrap();
        assert_eq!(&client.read().unwrap()[..], b"reply");

        // Alternation restored: the next request goes through.
        assert_eq!(client.write(b"three").unwrap(), 5);
    }

    #[test]
    fn typed_request_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let config = TransportConfig::new(TransportKind::Fifo).with_fifo_dir(dir.path());
        let (mut client, mut server) = pair(&config);

        let handle = std::thread::spawn(move || {
            let msg = server.read().unwrap();
            let Request::Data(req) = decode_request(&msg).unwrap() else {
                panic!("expected data request");
            };
            server
                .write(&encode_sample(f64::from(req.entity_id) * 2.0))
                .unwrap();
            server
        });

        let reply = client
            .request(&Request::Data(DataRequest::new(21, 0.0, 1)))
            .unwrap();
        assert_eq!(decode_sample(&reply).unwrap(), 42.0);

        let name = client.name().to_string();
        client.close();
        assert!(config.resources_exist(&name));
        handle.join().unwrap().close();
        assert!(!config.resources_exist(&name));
    }

    #[test]
    fn notify_leaves_channel_writable() {
        let config = TransportConfig::new(TransportKind::SharedMemory);
        let (mut client, mut server) = pair(&config);
        client.notify(&Request::Quit).unwrap();
        assert_eq!(decode_request(&server.read().unwrap()).unwrap(), Request::Quit);
        assert!(!client.awaiting_response);
    }
}
