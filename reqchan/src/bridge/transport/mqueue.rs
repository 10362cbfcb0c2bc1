//! POSIX message-queue transport.
//!
//! Queue name format: `/{name}_c2s` and `/{name}_s2c`.

use bytes::Bytes;
use nix::errno::Errno;
use nix::mqueue::{MQ_OFlag, MqAttr, MqdT, mq_close, mq_open, mq_receive, mq_send, mq_unlink};
use nix::sys::stat::Mode;

use super::{DOWNSTREAM, Transport, TransportError, TransportKind, UPSTREAM, check_size};
use crate::bridge::protocol::Role;

/// Messages a queue holds before `send` blocks.
const MAX_QUEUED: usize = 10;

pub struct MessageQueueTransport {
    read_name: String,
    write_name: String,
    read_queue: Option<MqdT>,
    write_queue: Option<MqdT>,
    max_message_size: usize,
    role: Role,
}

impl MessageQueueTransport {
    pub fn open(name: &str, role: Role, max_message_size: usize) -> Result<Self, TransportError> {
        let upstream = format!("/{name}_{UPSTREAM}");
        let downstream = format!("/{name}_{DOWNSTREAM}");

        let (read_name, write_name) = match role {
            Role::Responder => (upstream, downstream),
            Role::Initiator => (downstream, upstream),
        };

        let read_queue = open_queue(&read_name, MQ_OFlag::O_RDONLY, max_message_size)?;
        let write_queue = match open_queue(&write_name, MQ_OFlag::O_WRONLY, max_message_size) {
            Ok(q) => q,
            Err(e) => {
                let _ = mq_close(read_queue);
                if role.owns_resources() {
                    let _ = mq_unlink(read_name.as_str());
                }
                return Err(e);
            }
        };

        tracing::trace!(name, %role, "Message queue pair open");

        Ok(Self {
            read_name,
            write_name,
            read_queue: Some(read_queue),
            write_queue: Some(write_queue),
            max_message_size,
            role,
        })
    }

    pub fn exists(name: &str) -> bool {
        [UPSTREAM, DOWNSTREAM].iter().any(|suffix| {
            let queue = format!("/{name}_{suffix}");
            match mq_open(queue.as_str(), MQ_OFlag::O_RDONLY, Mode::empty(), None) {
                Ok(q) => {
                    let _ = mq_close(q);
                    true
                }
                Err(_) => false,
            }
        })
    }

    fn cleanup(&mut self) {
        for queue in [self.read_queue.take(), self.write_queue.take()]
            .into_iter()
            .flatten()
        {
            if let Err(e) = mq_close(queue) {
                tracing::warn!(error = %e, "Failed to close message queue");
            }
        }

        if self.role.owns_resources() {
            unlink_queue(&self.read_name);
            unlink_queue(&self.write_name);
        }
    }

    /// Unlink both queues without opening them.
    pub fn unlink(name: &str) {
        for suffix in [UPSTREAM, DOWNSTREAM] {
            unlink_queue(&format!("/{name}_{suffix}"));
        }
    }
}

fn unlink_queue(name: &str) {
    match mq_unlink(name) {
        Ok(()) => tracing::trace!(queue = %name, "Unlinked message queue"),
        Err(Errno::ENOENT) => {}
        Err(e) => tracing::warn!(queue = %name, error = %e, "Failed to unlink message queue"),
    }
}

fn open_queue(name: &str, access: MQ_OFlag, max_message_size: usize) -> Result<MqdT, TransportError> {
    let attr = MqAttr::new(0, MAX_QUEUED as _, max_message_size as _, 0);
    mq_open(
        name,
        access | MQ_OFlag::O_CREAT,
        Mode::S_IRUSR | Mode::S_IWUSR,
        Some(&attr),
    )
    .map_err(|e| TransportError::create(name, e))
}

impl Transport for MessageQueueTransport {
    fn send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        check_size(payload, self.max_message_size)?;
        let Some(queue) = self.write_queue.as_ref() else {
            return Err(TransportError::Closed {
                resource: self.write_name.clone(),
            });
        };
        loop {
            match mq_send(queue, payload, 0) {
                Ok(()) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(TransportError::send(self.write_name.as_str(), e)),
            }
        }
    }

    fn receive(&mut self) -> Result<Bytes, TransportError> {
        let Some(queue) = self.read_queue.as_ref() else {
            return Err(TransportError::Closed {
                resource: self.read_name.clone(),
            });
        };
        let mut buf = vec![0u8; self.max_message_size];
        let mut priority = 0u32;
        loop {
            match mq_receive(queue, &mut buf, &mut priority) {
                Ok(len) => {
                    buf.truncate(len);
                    return Ok(Bytes::from(buf));
                }
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(TransportError::receive(self.read_name.as_str(), e)),
            }
        }
    }

    fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    fn kind(&self) -> TransportKind {
        TransportKind::MessageQueue
    }
}

impl Drop for MessageQueueTransport {
    fn drop(&mut self) {
        self.cleanup();
    }
}
