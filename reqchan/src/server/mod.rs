//! Data server: the responder side of every channel.
//!
//! Flow:
//! 1. Open the control channel as responder
//! 2. NewChannel: mint `<control>_<n>`, serve it on its own thread, reply with the name
//! 3. Data / FileChunk on any channel: answer from the sample source or file store
//! 4. Quit on a private channel: that serving thread ends and unlinks the channel
//! 5. Quit on the control channel: join every serving thread, unlink control, return

mod source;

use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;

use bytes::Bytes;
use serde::Serialize;

pub use source::{CsvSampleSource, FileStore, FileStoreError, SampleSource, SourceError};

use crate::bridge::channel::{Channel, ChannelError};
use crate::bridge::codec::{CodecError, decode_request, encode_file_size, encode_sample};
use crate::bridge::protocol::{FileChunkRequest, Request, Role};
use crate::bridge::transport::TransportConfig;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("malformed request on {channel}: {source}")]
    Codec {
        channel: String,
        #[source]
        source: CodecError,
    },
    #[error("serving thread for {channel} panicked")]
    Panicked { channel: String },
}

/// Everything the server process needs, passed on its command line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerConfig {
    pub control: String,
    pub transport: TransportConfig,
    /// Directory of `<entity>.csv` sample files.
    pub data_dir: PathBuf,
    /// Directory file transfers are served from.
    pub file_root: PathBuf,
}

impl ServerConfig {
    pub fn new(control: impl Into<String>, transport: TransportConfig) -> Self {
        Self {
            control: control.into(),
            transport,
            data_dir: PathBuf::from("."),
            file_root: PathBuf::from("."),
        }
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    pub fn with_file_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.file_root = dir.into();
        self
    }

    /// Command-line arguments understood by the `reqchan-server` binary.
    pub fn to_args(&self) -> Vec<OsString> {
        vec![
            "--control".into(),
            self.control.clone().into(),
            "--transport".into(),
            self.transport.kind.as_str().into(),
            "--max-message".into(),
            self.transport.max_message_size.to_string().into(),
            "--fifo-dir".into(),
            self.transport.fifo_dir.clone().into(),
            "--data-dir".into(),
            self.data_dir.clone().into(),
            "--file-root".into(),
            self.file_root.clone().into(),
        ]
    }
}

/// Totals reported when the server shuts down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ServerStats {
    pub channels: usize,
    pub requests: u64,
    pub failed_channels: usize,
}

/// Turns requests into response payloads. Shared by every serving thread.
struct RequestHandler {
    source: Arc<dyn SampleSource>,
    files: FileStore,
    max_message_size: usize,
}

impl RequestHandler {
    /// Failures are answered with an empty payload.
    fn respond(&self, channel: &str, request: &Request) -> Bytes {
        match request {
            Request::Data(req) => {
                match self
                    .source
                    .sample(req.entity_id, req.timestamp, req.sub_stream)
                {
                    Ok(value) => encode_sample(value),
                    Err(e) => {
                        tracing::warn!(channel, entity = req.entity_id, error = %e, "Data request failed");
                        Bytes::new()
                    }
                }
            }
            Request::FileChunk(req) => self.file_chunk(channel, req),
            Request::NewChannel | Request::Quit => {
                tracing::warn!(channel, kind = ?request.kind(), "Request not valid on this channel");
                Bytes::new()
            }
        }
    }

    fn file_chunk(&self, channel: &str, req: &FileChunkRequest) -> Bytes {
        if req.is_size_query() {
            return match self.files.size(&req.filename) {
                Ok(size) => encode_file_size(size as i64),
                Err(e) => {
                    tracing::warn!(channel, filename = %req.filename, error = %e, "Size query failed");
                    Bytes::new()
                }
            };
        }
        if usize::try_from(req.length).is_ok_and(|len| len > self.max_message_size) {
            tracing::warn!(
                channel,
                length = req.length,
                max = self.max_message_size,
                "Chunk larger than max message size"
            );
            return Bytes::new();
        }
        match self.files.read_chunk(&req.filename, req.offset, req.length) {
            Ok(data) => Bytes::from(data),
            Err(e) => {
                tracing::warn!(channel, filename = %req.filename, error = %e, "Chunk read failed");
                Bytes::new()
            }
        }
    }
}

pub struct DataServer {
    config: ServerConfig,
    handler: Arc<RequestHandler>,
}

impl DataServer {
    /// Server answering data requests from CSV files under `config.data_dir`.
    pub fn new(config: ServerConfig) -> Self {
        let source = Arc::new(CsvSampleSource::new(config.data_dir.clone()));
        Self::with_source(config, source)
    }

    pub fn with_source(config: ServerConfig, source: Arc<dyn SampleSource>) -> Self {
        let handler = Arc::new(RequestHandler {
            source,
            files: FileStore::new(config.file_root.clone()),
            max_message_size: config.transport.max_message_size,
        });
        Self { config, handler }
    }

    /// Serve until Quit arrives on the control channel.
    pub fn run(self) -> Result<ServerStats, ServerError> {
        let control_name = self.config.control.clone();
        let mut control = Channel::open(&control_name, Role::Responder, &self.config.transport)?;
        tracing::info!(
            control = %control_name,
            transport = %self.config.transport.kind,
            max_message_size = self.config.transport.max_message_size,
            "Data server ready"
        );

        let mut serving: Vec<(String, JoinHandle<Result<u64, ServerError>>)> = Vec::new();
        let mut requests = 0u64;
        let outcome = loop {
            let msg = match control.read() {
                Ok(msg) => msg,
                Err(e) if e.is_closed() => {
                    tracing::warn!(control = %control_name, "Client closed control channel without quit");
                    break Ok(());
                }
                Err(e) => break Err(ServerError::from(e)),
            };
            let request = match decode_request(&msg) {
                Ok(request) => request,
                Err(source) => {
                    tracing::error!(control = %control_name, error = %source, "Malformed control request");
                    break Err(ServerError::Codec {
                        channel: control_name.clone(),
                        source,
                    });
                }
            };
            match request {
                Request::NewChannel => {
                    let name = format!("{control_name}_{}", serving.len());
                    let reply = match self.spawn_serving_thread(&name) {
                        Ok(handle) => {
                            serving.push((name.clone(), handle));
                            Bytes::from(name.into_bytes())
                        }
                        Err(e) => {
                            tracing::error!(channel = %name, error = %e, "Failed to spawn serving thread");
                            Bytes::new()
                        }
                    };
                    if let Err(e) = control.write(&reply) {
                        break Err(e.into());
                    }
                }
                Request::Quit => {
                    tracing::debug!(control = %control_name, "Quit received");
                    break Ok(());
                }
                other => {
                    let reply = self.handler.respond(&control_name, &other);
                    if let Err(e) = control.write(&reply) {
                        break Err(e.into());
                    }
                    requests += 1;
                }
            }
        };

        let mut stats = ServerStats {
            channels: serving.len(),
            requests,
            failed_channels: 0,
        };
        for (channel, handle) in serving {
            let result = handle
                .join()
                .unwrap_or_else(|_| Err(ServerError::Panicked {
                    channel: channel.clone(),
                }));
            match result {
                Ok(n) => stats.requests += n,
                Err(e) => {
                    tracing::warn!(%channel, error = %e, "Serving thread failed");
                    stats.failed_channels += 1;
                }
            }
        }
        control.close();
        tracing::info!(
            channels = stats.channels,
            requests = stats.requests,
            failed_channels = stats.failed_channels,
            "Data server stopped"
        );
        outcome.map(|()| stats)
    }

    fn spawn_serving_thread(
        &self,
        name: &str,
    ) -> std::io::Result<JoinHandle<Result<u64, ServerError>>> {
        let name = name.to_string();
        let transport = self.config.transport.clone();
        let handler = Arc::clone(&self.handler);
        std::thread::Builder::new()
            .name(format!("reqchan-serve-{}", name.rsplit('_').next().unwrap_or("")))
            .spawn(move || serve_channel(&name, &transport, &handler))
    }
}

fn serve_channel(
    name: &str,
    transport: &TransportConfig,
    handler: &RequestHandler,
) -> Result<u64, ServerError> {
    let mut channel = Channel::open(name, Role::Responder, transport)?;
    let mut served = 0u64;
    loop {
        let msg = match channel.read() {
            Ok(msg) => msg,
            Err(e) if e.is_closed() => {
                tracing::debug!(channel = name, "Peer closed without quit");
                break;
            }
            Err(e) => return Err(e.into()),
        };
        let request = decode_request(&msg).map_err(|source| {
            tracing::warn!(channel = name, error = %source, "Malformed request, dropping channel");
            ServerError::Codec {
                channel: name.to_string(),
                source,
            }
        })?;
        if request == Request::Quit {
            break;
        }
        channel.write(&handler.respond(name, &request))?;
        served += 1;
    }
    tracing::trace!(channel = name, served, "Serving thread done");
    channel.close();
    Ok(served)
}
