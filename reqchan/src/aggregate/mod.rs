//! Shared aggregate state and the folds that merge responses into it.
//!
//! Workers decode and validate a response outside any lock, then hold the
//! state's mutex only for the in-memory update (or positional write).

mod file;
mod histogram;

use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;

pub use file::{FileFold, FileSink, TransferProgress};
pub use histogram::{Histogram, HistogramCollection, HistogramShape, ShapeError};

use crate::bridge::codec::{CodecError, decode_sample};
use crate::bridge::protocol::{Request, RequestKind};

#[derive(Debug, thiserror::Error)]
pub enum FoldError {
    #[error("cannot fold a response to a {0:?} request")]
    UnexpectedRequest(RequestKind),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("no histogram for entity {0}")]
    UnknownEntity(i32),
    #[error("chunk at offset {offset}: expected {expected} bytes, got {got}")]
    ShortChunk {
        offset: i64,
        expected: usize,
        got: usize,
    },
    #[error("failed to write output: {0}")]
    Io(#[from] std::io::Error),
}

/// Merges one response into aggregate state.
///
/// Called concurrently from every worker thread; implementations lock
/// internally and keep the critical section to the state update.
pub trait Fold: Send + Sync {
    fn fold(&self, request: &Request, response: Bytes) -> Result<(), FoldError>;
}

/// Lock `mutex`, recovering the guard if another worker panicked mid-fold.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("Aggregate state mutex poisoned, continuing");
        poisoned.into_inner()
    })
}

/// Folds data responses into a per-entity histogram collection.
#[derive(Debug, Clone)]
pub struct HistogramFold {
    state: Arc<Mutex<HistogramCollection>>,
}

impl HistogramFold {
    pub fn new(state: Arc<Mutex<HistogramCollection>>) -> Self {
        Self { state }
    }
}

impl Fold for HistogramFold {
    fn fold(&self, request: &Request, response: Bytes) -> Result<(), FoldError> {
        let Request::Data(req) = request else {
            return Err(FoldError::UnexpectedRequest(request.kind()));
        };
        let value = decode_sample(&response)?;
        if lock(&self.state).update(req.entity_id, value) {
            Ok(())
        } else {
            Err(FoldError::UnknownEntity(req.entity_id))
        }
    }
}
