//! Fixed set of worker threads draining the bounded buffer.
//!
//! Each worker owns one private channel for its whole life:
//!
//! ```text
//! SPAWNED -> (WAIT_FOR_WORK -> IN_FLIGHT -> FOLD_RESULT)* -> DRAINED -> DEAD
//! ```
//!
//! A worker stops on the empty sentinel, sends Quit on its channel so the
//! server can tear down the other end, and exits. A worker that hits an error
//! keeps popping (and discarding) until its sentinel so the shutdown handshake
//! still completes; the error surfaces from [`WorkerPool::join`].

use std::sync::Arc;
use std::thread::JoinHandle;

use bytes::Bytes;
use serde::Serialize;

use crate::aggregate::{Fold, FoldError};
use crate::bridge::channel::{Channel, ChannelError};
use crate::bridge::codec::{CodecError, decode_request};
use crate::bridge::protocol::Request;
use crate::buffer::{BoundedBuffer, is_sentinel};

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("worker {worker}: {source}")]
    Channel {
        worker: usize,
        #[source]
        source: ChannelError,
    },
    #[error("worker {worker}: malformed request in buffer: {source}")]
    Request {
        worker: usize,
        #[source]
        source: CodecError,
    },
    #[error("worker {worker}: {source}")]
    Fold {
        worker: usize,
        #[source]
        source: FoldError,
    },
    #[error("worker {worker} panicked")]
    Panicked { worker: usize },
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Requests completed by each worker, in worker order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub completed: Vec<u64>,
}

impl PoolStats {
    pub fn total(&self) -> u64 {
        self.completed.iter().sum()
    }
}

pub struct WorkerPool {
    handles: Vec<JoinHandle<Result<u64, PoolError>>>,
}

impl WorkerPool {
    /// Start one worker per channel.
    ///
    /// If a thread cannot be spawned, already running workers are stopped
    /// with sentinels and unused channels are sent Quit before returning.
    pub fn spawn<F>(
        channels: Vec<Channel>,
        buffer: Arc<BoundedBuffer>,
        fold: Arc<F>,
    ) -> Result<Self, PoolError>
    where
        F: Fold + ?Sized + 'static,
    {
        let mut handles = Vec::with_capacity(channels.len());
        let mut channels = channels.into_iter();
        while let Some(channel) = channels.next() {
            let worker = handles.len();
            let buffer_ref = Arc::clone(&buffer);
            let fold_ref = Arc::clone(&fold);
            let spawned = std::thread::Builder::new()
                .name(format!("reqchan-worker-{worker}"))
                .spawn(move || run_worker(worker, channel, &buffer_ref, &*fold_ref));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    tracing::error!(worker, error = %e, "Failed to spawn worker thread");
                    for mut unused in channels {
                        if let Err(e) = unused.notify(&Request::Quit) {
                            tracing::warn!(channel = unused.name(), error = %e, "Failed to release channel");
                        }
                    }
                    for _ in 0..handles.len() {
                        buffer.push_sentinel();
                    }
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(PoolError::Spawn(e));
                }
            }
        }
        tracing::debug!(workers = handles.len(), "Worker pool started");
        Ok(Self { handles })
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every worker. The caller must have pushed one sentinel per
    /// worker, or this blocks forever.
    pub fn join(self) -> Result<PoolStats, PoolError> {
        let mut stats = PoolStats::default();
        let mut first_error = None;
        for (worker, handle) in self.handles.into_iter().enumerate() {
            let outcome = handle
                .join()
                .unwrap_or_else(|_| Err(PoolError::Panicked { worker }));
            match outcome {
                Ok(n) => stats.completed.push(n),
                Err(e) => {
                    stats.completed.push(0);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(stats),
        }
    }
}

fn run_worker<F>(
    worker: usize,
    mut channel: Channel,
    buffer: &BoundedBuffer,
    fold: &F,
) -> Result<u64, PoolError>
where
    F: Fold + ?Sized,
{
    tracing::trace!(worker, channel = channel.name(), "Worker started");
    let mut completed = 0u64;
    let mut failure = None;
    loop {
        let payload = buffer.pop();
        if is_sentinel(&payload) {
            break;
        }
        if failure.is_some() {
            continue;
        }
        match round_trip(worker, &mut channel, payload, fold) {
            Ok(()) => completed += 1,
            Err(e) => {
                tracing::error!(worker, channel = channel.name(), error = %e, "Worker failed, draining until sentinel");
                failure = Some(e);
            }
        }
    }

    if let Err(e) = channel.notify(&Request::Quit) {
        tracing::warn!(worker, channel = channel.name(), error = %e, "Failed to send quit on private channel");
    }
    channel.close();
    tracing::trace!(worker, completed, "Worker drained");

    match failure {
        Some(e) => Err(e),
        None => Ok(completed),
    }
}

fn round_trip<F>(
    worker: usize,
    channel: &mut Channel,
    payload: Bytes,
    fold: &F,
) -> Result<(), PoolError>
where
    F: Fold + ?Sized,
{
    let request =
        decode_request(&payload).map_err(|source| PoolError::Request { worker, source })?;
    channel
        .write(&payload)
        .map_err(|source| PoolError::Channel { worker, source })?;
    let response = channel
        .read()
        .map_err(|source| PoolError::Channel { worker, source })?;
    fold.fold(&request, response)
        .map_err(|source| PoolError::Fold { worker, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::bridge::codec::{encode_request, encode_sample};
    use crate::bridge::protocol::{DataRequest, Role};
    use crate::bridge::transport::tests::unique_name;
    use crate::bridge::transport::{TransportConfig, TransportKind};

    /// Records every folded (entity, value) pair; rejects negative entities.
    #[derive(Default)]
    struct Recorder(Mutex<Vec<(i32, f64)>>);

    impl Fold for Recorder {
        fn fold(&self, request: &Request, response: Bytes) -> Result<(), FoldError> {
            let Request::Data(req) = request else {
                return Err(FoldError::UnexpectedRequest(request.kind()));
            };
            if req.entity_id < 0 {
                return Err(FoldError::UnknownEntity(req.entity_id));
            }
            let value = crate::bridge::codec::decode_sample(&response)?;
            self.0.lock().unwrap().push((req.entity_id, value));
            Ok(())
        }
    }

    /// Responder answering data requests with `entity * 10`, until Quit.
    fn serve(name: String, config: TransportConfig) -> std::thread::JoinHandle<usize> {
        std::thread::spawn(move || {
            let mut ch = Channel::open(&name, Role::Responder, &config).unwrap();
            let mut served = 0;
            loop {
                match decode_request(&ch.read().unwrap()).unwrap() {
                    Request::Data(req) => {
                        ch.write(&encode_sample(f64::from(req.entity_id) * 10.0))
                            .unwrap();
                        served += 1;
                    }
                    Request::Quit => return served,
                    other => panic!("unexpected {other:?}"),
                }
            }
        })
    }

    fn channels(
        count: usize,
        config: &TransportConfig,
    ) -> (Vec<Channel>, Vec<std::thread::JoinHandle<usize>>) {
        (0..count)
            .map(|_| {
                let name = unique_name("pool");
                let server = serve(name.clone(), config.clone());
                let client = Channel::open(&name, Role::Initiator, config).unwrap();
                (client, server)
            })
            .unzip()
    }

    #[test]
    fn every_request_is_folded_once() {
        let config = TransportConfig::new(TransportKind::MessageQueue);
        let (chans, servers) = channels(3, &config);
        let buffer = Arc::new(BoundedBuffer::new(2));
        let fold = Arc::new(Recorder::default());
        let pool = WorkerPool::spawn(chans, Arc::clone(&buffer), Arc::clone(&fold)).unwrap();
        assert_eq!(pool.len(), 3);

        for entity in 1..=20 {
            buffer.push(encode_request(&DataRequest::new(entity, 0.0, 1).into()));
        }
        for _ in 0..pool.len() {
            buffer.push_sentinel();
        }
        let stats = pool.join().unwrap();
        assert_eq!(stats.total(), 20);

        let served: usize = servers.into_iter().map(|s| s.join().unwrap()).sum();
        assert_eq!(served, 20);

        let mut seen = fold.0.lock().unwrap().clone();
        seen.sort_by_key(|(e, _)| *e);
        let expected: Vec<_> = (1..=20).map(|e| (e, f64::from(e) * 10.0)).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn fold_error_drains_and_reports() {
        let config = TransportConfig::new(TransportKind::SharedMemory);
        let (chans, servers) = channels(1, &config);
        let buffer = Arc::new(BoundedBuffer::new(1));
        let fold = Arc::new(Recorder::default());
        let pool = WorkerPool::spawn(chans, Arc::clone(&buffer), Arc::clone(&fold)).unwrap();

        // The fold rejects the first response; later items are drained.
        buffer.push(encode_request(&DataRequest::new(-1, 0.0, 1).into()));
        buffer.push(encode_request(&DataRequest::new(1, 0.0, 1).into()));
        buffer.push_sentinel();

        let err = pool.join().unwrap_err();
        assert!(matches!(err, PoolError::Fold { worker: 0, .. }));
        assert!(fold.0.lock().unwrap().is_empty());
        // The server answered once and still got its Quit.
        let served: Vec<_> = servers.into_iter().map(|s| s.join().unwrap()).collect();
        assert_eq!(served, [1]);
    }
}
