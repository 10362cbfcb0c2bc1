//! Where the data server gets its answers from.

use std::collections::HashMap;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::bridge::protocol::SAMPLE_INTERVAL;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}:{line}: expected `time,ecg1,ecg2`")]
    Parse { path: PathBuf, line: usize },
    #[error("entity {entity} has no sample {row}")]
    OutOfRange { entity: i32, row: u64 },
    #[error("unknown sub-stream {0} (expected 1 or 2)")]
    SubStream(i32),
}

/// Answers data requests.
pub trait SampleSource: Send + Sync {
    fn sample(&self, entity: i32, timestamp: f64, sub_stream: i32) -> Result<f64, SourceError>;
}

impl<F> SampleSource for F
where
    F: Fn(i32, f64, i32) -> f64 + Send + Sync,
{
    fn sample(&self, entity: i32, timestamp: f64, sub_stream: i32) -> Result<f64, SourceError> {
        Ok(self(entity, timestamp, sub_stream))
    }
}

/// Reads `<dir>/<entity>.csv`, one `time,ecg1,ecg2` row per sample.
///
/// Files are parsed on first use and cached for the server's lifetime.
#[derive(Debug)]
pub struct CsvSampleSource {
    dir: PathBuf,
    cache: Mutex<HashMap<i32, Arc<Vec<[f64; 2]>>>>,
}

impl CsvSampleSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn rows(&self, entity: i32) -> Result<Arc<Vec<[f64; 2]>>, SourceError> {
        if let Some(rows) = self.cached(entity) {
            return Ok(rows);
        }
        // Parse without the lock so other entities keep being served. Two
        // threads may both load the same file; the first insert wins.
        let path = self.dir.join(format!("{entity}.csv"));
        let rows = Arc::new(parse_csv(&path)?);
        tracing::debug!(entity, rows = rows.len(), path = %path.display(), "Loaded sample file");
        let mut cache = self.lock_cache();
        Ok(Arc::clone(cache.entry(entity).or_insert(rows)))
    }

    fn cached(&self, entity: i32) -> Option<Arc<Vec<[f64; 2]>>> {
        self.lock_cache().get(&entity).map(Arc::clone)
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<i32, Arc<Vec<[f64; 2]>>>> {
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SampleSource for CsvSampleSource {
    fn sample(&self, entity: i32, timestamp: f64, sub_stream: i32) -> Result<f64, SourceError> {
        let column = match sub_stream {
            1 => 0,
            2 => 1,
            other => return Err(SourceError::SubStream(other)),
        };
        let rows = self.rows(entity)?;
        let row = (timestamp / SAMPLE_INTERVAL).round().max(0.0) as u64;
        usize::try_from(row)
            .ok()
            .and_then(|i| rows.get(i))
            .map(|r| r[column])
            .ok_or(SourceError::OutOfRange { entity, row })
    }
}

fn parse_csv(path: &Path) -> Result<Vec<[f64; 2]>, SourceError> {
    let text = std::fs::read_to_string(path).map_err(|source| SourceError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut rows = Vec::new();
    for (i, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<f64> = line
            .split(',')
            .map(|f| f.trim().parse::<f64>())
            .collect::<Result<_, _>>()
            .unwrap_or_default();
        match fields.as_slice() {
            [_, ecg1, ecg2] => rows.push([*ecg1, *ecg2]),
            // Tolerate a header line.
            _ if i == 0 => continue,
            _ => {
                return Err(SourceError::Parse {
                    path: path.to_path_buf(),
                    line: i + 1,
                });
            }
        }
    }
    Ok(rows)
}

#[derive(Debug, thiserror::Error)]
pub enum FileStoreError {
    #[error("refusing to serve {0:?}")]
    InvalidName(String),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("range {offset}+{length} is outside {size}-byte file {path}")]
    Range {
        path: PathBuf,
        offset: i64,
        length: i32,
        size: u64,
    },
}

/// Read-only view of the files under one root directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Only plain names directly under the root are served.
    pub fn resolve(&self, filename: &str) -> Result<PathBuf, FileStoreError> {
        if filename.is_empty()
            || filename.contains('/')
            || filename.contains('\\')
            || filename.contains("..")
            || filename.contains('\0')
        {
            return Err(FileStoreError::InvalidName(filename.to_string()));
        }
        Ok(self.root.join(filename))
    }

    pub fn size(&self, filename: &str) -> Result<u64, FileStoreError> {
        let path = self.resolve(filename)?;
        let meta = std::fs::metadata(&path).map_err(|source| FileStoreError::Io {
            path: path.clone(),
            source,
        })?;
        if !meta.is_file() {
            return Err(FileStoreError::Io {
                path,
                source: std::io::Error::other("not a regular file"),
            });
        }
        Ok(meta.len())
    }

    /// Read exactly `length` bytes at `offset`.
    pub fn read_chunk(
        &self,
        filename: &str,
        offset: i64,
        length: i32,
    ) -> Result<Vec<u8>, FileStoreError> {
        let path = self.resolve(filename)?;
        let io_err = |source: std::io::Error| FileStoreError::Io {
            path: path.clone(),
            source,
        };
        let file = File::open(&path).map_err(io_err)?;
        let size = file.metadata().map_err(io_err)?.len();
        let (Ok(start), Ok(len)) = (u64::try_from(offset), usize::try_from(length)) else {
            return Err(FileStoreError::Range {
                path: path.clone(),
                offset,
                length,
                size,
            });
        };
        if start.saturating_add(len as u64) > size {
            return Err(FileStoreError::Range {
                path: path.clone(),
                offset,
                length,
                size,
            });
        }
        let mut buf = vec![0u8; len];
        file.read_exact_at(&mut buf, start).map_err(io_err)?;
        Ok(buf)
    }
}
