//! Client half of the control-channel handshake.
//!
//! The control channel mints one private channel per worker
//! (NewChannel → name), answers file-size queries, and carries the terminal
//! Quit that tells the server to tear everything down.

use crate::bridge::channel::{Channel, ChannelError};
use crate::bridge::codec::{CodecError, decode_channel_name, decode_file_size};
use crate::bridge::protocol::{FileChunkRequest, Request, Role};
use crate::bridge::transport::TransportConfig;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("malformed control response: {0}")]
    Codec(#[from] CodecError),
    #[error("server refused to allocate a channel")]
    Refused,
    #[error("server has no file {0:?}")]
    NoSuchFile(String),
}

#[derive(Debug)]
pub struct Broker {
    control: Channel,
    config: TransportConfig,
}

impl Broker {
    /// Attach to the server's control channel.
    pub fn connect(control_name: &str, config: TransportConfig) -> Result<Self, BrokerError> {
        let control = Channel::open(control_name, Role::Initiator, &config)?;
        Ok(Self { control, config })
    }

    /// Ask the server for a fresh channel and open our end of it.
    pub fn new_channel(&mut self) -> Result<Channel, BrokerError> {
        let reply = self.control.request(&Request::NewChannel)?;
        if reply.is_empty() {
            return Err(BrokerError::Refused);
        }
        let name = decode_channel_name(reply)?;
        tracing::debug!(channel = %name, "Private channel allocated");
        Ok(Channel::open(&name, Role::Initiator, &self.config)?)
    }

    /// Mint `count` private channels.
    pub fn new_channels(&mut self, count: usize) -> Result<Vec<Channel>, BrokerError> {
        (0..count).map(|_| self.new_channel()).collect()
    }

    /// Total size of `filename` on the server, in bytes.
    pub fn file_size(&mut self, filename: &str) -> Result<u64, BrokerError> {
        let reply = self
            .control
            .request(&FileChunkRequest::size_query(filename).into())?;
        if reply.is_empty() {
            return Err(BrokerError::NoSuchFile(filename.to_string()));
        }
        let size = decode_file_size(&reply)?;
        u64::try_from(size).map_err(|_| BrokerError::NoSuchFile(filename.to_string()))
    }

    /// Send Quit and release our end of the control channel.
    pub fn quit(mut self) -> Result<(), BrokerError> {
        tracing::debug!(channel = %self.control.name(), "Sending quit on control channel");
        self.control.notify(&Request::Quit)?;
        self.control.close();
        Ok(())
    }
}
