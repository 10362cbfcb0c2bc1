//! Output file assembled from out-of-order chunks.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use serde::Serialize;

use super::{Fold, FoldError, lock};
use crate::bridge::protocol::Request;

/// Bytes received so far out of the expected total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransferProgress {
    pub transferred: u64,
    pub total: u64,
    pub chunks: u64,
}

impl TransferProgress {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            100.0
        } else {
            self.transferred as f64 * 100.0 / self.total as f64
        }
    }

    pub fn is_complete(&self) -> bool {
        self.transferred >= self.total
    }
}

#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    // Guards both the positional write and the counter.
    inner: Mutex<SinkState>,
}

#[derive(Debug)]
struct SinkState {
    file: File,
    progress: TransferProgress,
}

impl FileSink {
    /// Create (truncating) `path`, pre-sized to `total` bytes.
    pub fn create(path: impl AsRef<Path>, total: u64) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        file.set_len(total)?;
        tracing::debug!(path = %path.display(), total, "Output file created");
        Ok(Self {
            path,
            inner: Mutex::new(SinkState {
                file,
                progress: TransferProgress {
                    total,
                    ..TransferProgress::default()
                },
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_chunk(&self, offset: u64, data: &[u8]) -> std::io::Result<()> {
        let mut state = lock(&self.inner);
        state.file.write_all_at(data, offset)?;
        state.progress.transferred += data.len() as u64;
        state.progress.chunks += 1;
        Ok(())
    }

    pub fn progress(&self) -> TransferProgress {
        lock(&self.inner).progress
    }

    /// Flush file contents to disk.
    pub fn sync(&self) -> std::io::Result<()> {
        lock(&self.inner).file.sync_all()
    }
}

/// Folds chunk responses into a [`FileSink`].
#[derive(Debug, Clone)]
pub struct FileFold {
    sink: Arc<FileSink>,
}

impl FileFold {
    pub fn new(sink: Arc<FileSink>) -> Self {
        Self { sink }
    }
}

impl Fold for FileFold {
    fn fold(&self, request: &Request, response: Bytes) -> Result<(), FoldError> {
        let Request::FileChunk(req) = request else {
            return Err(FoldError::UnexpectedRequest(request.kind()));
        };
        let expected = usize::try_from(req.length).unwrap_or(0);
        let offset = u64::try_from(req.offset).ok();
        match offset {
            Some(offset) if response.len() == expected => {
                self.sink.write_chunk(offset, &response)?;
                Ok(())
            }
            _ => Err(FoldError::ShortChunk {
                offset: req.offset,
                expected,
                got: response.len(),
            }),
        }
    }
}
