//! Request stream generators feeding the bounded buffer.

use std::sync::Arc;
use std::thread::JoinHandle;

use crate::bridge::codec::encode_request;
use crate::bridge::protocol::{DataRequest, FileChunkRequest, Request};
use crate::buffer::BoundedBuffer;

/// Byte ranges `[k*chunk, min((k+1)*chunk, size))` covering `0..size`.
pub fn chunk_ranges(size: u64, chunk: u32) -> impl Iterator<Item = (u64, u32)> {
    let step = u64::from(chunk.max(1));
    (0..size.div_ceil(step)).map(move |k| {
        let offset = k * step;
        // Bounded by `step`, which came from a u32.
        let len = (size - offset).min(step) as u32;
        (offset, len)
    })
}

/// Chunk requests for all of `filename`, in increasing offset order.
pub fn file_requests(filename: &str, size: u64, chunk: u32) -> impl Iterator<Item = Request> + '_ {
    chunk_ranges(size, chunk).map(move |(offset, len)| {
        FileChunkRequest::chunk(filename, offset as i64, len as i32).into()
    })
}

/// Start one producer thread per entity in `entities`, each pushing sample
/// indices `0..samples` for `sub_stream`.
pub fn spawn_data_producers(
    buffer: &Arc<BoundedBuffer>,
    entities: impl IntoIterator<Item = i32>,
    samples: u32,
    sub_stream: i32,
) -> std::io::Result<Vec<JoinHandle<()>>> {
    entities
        .into_iter()
        .map(|entity| {
            let buffer = Arc::clone(buffer);
            std::thread::Builder::new()
                .name(format!("reqchan-producer-{entity}"))
                .spawn(move || {
                    for index in 0..samples {
                        let req = DataRequest::at_index(entity, index, sub_stream);
                        buffer.push(encode_request(&req.into()));
                    }
                    tracing::trace!(entity, samples, "Producer finished");
                })
        })
        .collect()
}

/// Start a single producer thread pushing every chunk of `filename`.
pub fn spawn_file_producer(
    buffer: &Arc<BoundedBuffer>,
    filename: String,
    size: u64,
    chunk: u32,
) -> std::io::Result<JoinHandle<()>> {
    let buffer = Arc::clone(buffer);
    std::thread::Builder::new()
        .name("reqchan-producer-file".to_string())
        .spawn(move || {
            let mut chunks = 0u64;
            for req in file_requests(&filename, size, chunk) {
                buffer.push(encode_request(&req));
                chunks += 1;
            }
            tracing::trace!(filename, chunks, "File producer finished");
        })
}
