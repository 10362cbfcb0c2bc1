//! Named-pipe transport.
//!
//! Pipe path format: `{fifo_dir}/{name}.c2s` and `{fifo_dir}/{name}.s2c`.
//! Pipes are byte streams, so every message is framed with a 4-byte length.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use nix::errno::Errno;
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::{DOWNSTREAM, Transport, TransportError, TransportKind, UPSTREAM, check_size};
use crate::bridge::codec::frame_codec;
use crate::bridge::protocol::Role;

const READ_CHUNK: usize = 4096;

pub struct FifoTransport {
    upstream_path: PathBuf,
    downstream_path: PathBuf,
    reader: File,
    writer: File,
    read_path: PathBuf,
    write_path: PathBuf,
    codec: LengthDelimitedCodec,
    read_buf: BytesMut,
    max_message_size: usize,
    role: Role,
}

impl FifoTransport {
    /// Create both pipes if missing, then open them.
    ///
    /// Opening a pipe blocks until the peer opens the other end. Both roles
    /// open the upstream pipe first, so the two opens always pair up.
    pub fn open(
        dir: &Path,
        name: &str,
        role: Role,
        max_message_size: usize,
    ) -> Result<Self, TransportError> {
        let upstream_path = dir.join(format!("{name}.{UPSTREAM}"));
        let downstream_path = dir.join(format!("{name}.{DOWNSTREAM}"));

        for path in [&upstream_path, &downstream_path] {
            make_fifo(path)?;
        }

        let (reader, writer, read_path, write_path) = match role {
            Role::Responder => {
                let reader = open_read(&upstream_path)?;
                let writer = open_write(&downstream_path)?;
                (reader, writer, upstream_path.clone(), downstream_path.clone())
            }
            Role::Initiator => {
                let writer = open_write(&upstream_path)?;
                let reader = open_read(&downstream_path)?;
                (reader, writer, downstream_path.clone(), upstream_path.clone())
            }
        };

        tracing::trace!(name, %role, "FIFO pair open");

        Ok(Self {
            upstream_path,
            downstream_path,
            reader,
            writer,
            read_path,
            write_path,
            codec: frame_codec(max_message_size),
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            max_message_size,
            role,
        })
    }

    pub fn exists(dir: &Path, name: &str) -> bool {
        [UPSTREAM, DOWNSTREAM]
            .iter()
            .any(|suffix| dir.join(format!("{name}.{suffix}")).symlink_metadata().is_ok())
    }

    /// Remove both pipes without opening them.
    pub fn unlink(dir: &Path, name: &str) {
        for suffix in [UPSTREAM, DOWNSTREAM] {
            remove_fifo(&dir.join(format!("{name}.{suffix}")));
        }
    }

    fn cleanup(&self) {
        remove_fifo(&self.upstream_path);
        remove_fifo(&self.downstream_path);
    }
}

fn remove_fifo(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::trace!(path = %path.display(), "Removed FIFO"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove FIFO"),
    }
}

fn make_fifo(path: &Path) -> Result<(), TransportError> {
    match mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR) {
        Ok(()) | Err(Errno::EEXIST) => Ok(()),
        Err(e) => Err(TransportError::create(path.display().to_string(), e)),
    }
}

fn open_read(path: &Path) -> Result<File, TransportError> {
    OpenOptions::new()
        .read(true)
        .open(path)
        .map_err(|e| TransportError::open(path.display().to_string(), e))
}

fn open_write(path: &Path) -> Result<File, TransportError> {
    OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| TransportError::open(path.display().to_string(), e))
}

impl Transport for FifoTransport {
    fn send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        check_size(payload, self.max_message_size)?;
        let mut frame = BytesMut::with_capacity(4 + payload.len());
        self.codec
            .encode(Bytes::copy_from_slice(payload), &mut frame)
            .map_err(|e| TransportError::send(self.write_path.display().to_string(), e))?;
        self.writer.write_all(&frame).map_err(|e| {
            if e.kind() == io::ErrorKind::BrokenPipe {
                TransportError::Closed {
                    resource: self.write_path.display().to_string(),
                }
            } else {
                TransportError::send(self.write_path.display().to_string(), e)
            }
        })
    }

    fn receive(&mut self) -> Result<Bytes, TransportError> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(frame) = self
                .codec
                .decode(&mut self.read_buf)
                .map_err(|e| TransportError::receive(self.read_path.display().to_string(), e))?
            {
                return Ok(frame.freeze());
            }

            let n = match self.reader.read(&mut chunk) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(TransportError::receive(
                        self.read_path.display().to_string(),
                        e,
                    ));
                }
            };
            if n == 0 {
                return Err(TransportError::Closed {
                    resource: self.read_path.display().to_string(),
                });
            }
            self.read_buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Fifo
    }
}

impl Drop for FifoTransport {
    fn drop(&mut self) {
        if self.role.owns_resources() {
            self.cleanup();
        }
    }
}
