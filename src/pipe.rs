//! Bounded in-memory byte pipe and the layer streaming built on it.
//!
//! A save or load session is single-threaded except for layer payloads:
//! the (de)compressor runs on a worker thread joined to the calling thread
//! by the pipe, so compression overlaps with digesting and archive I/O.
//! The pipe window bounds memory; a full pipe blocks the writer, an empty
//! one blocks the reader. Dropping either end wakes the peer — reads then
//! drain and return EOF, writes fail with `BrokenPipe` — so both ends are
//! closed exactly once on every exit path.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::cancel::CancelToken;
use crate::digest::{Digest, DigestReader, DigestWriter};
use crate::error::{ArchiveError, Result};

/// Pipe window size. Large enough to keep the compressor busy, small
/// enough to bound per-layer memory.
pub const PIPE_CAPACITY: usize = 64 * 1024;

const COPY_BUF_SIZE: usize = 32 * 1024;

struct PipeState {
    buf: VecDeque<u8>,
    capacity: usize,
    write_closed: bool,
    read_closed: bool,
}

struct Shared {
    state: Mutex<PipeState>,
    readable: Condvar,
    writable: Condvar,
}

/// Writing end of a bounded in-memory pipe.
pub struct PipeWriter {
    shared: Arc<Shared>,
}

/// Reading end of a bounded in-memory pipe.
pub struct PipeReader {
    shared: Arc<Shared>,
}

/// Create a connected pipe with the given window size.
pub fn pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let shared = Arc::new(Shared {
        state: Mutex::new(PipeState {
            buf: VecDeque::with_capacity(capacity),
            capacity,
            write_closed: false,
            read_closed: false,
        }),
        readable: Condvar::new(),
        writable: Condvar::new(),
    });
    (
        PipeWriter {
            shared: shared.clone(),
        },
        PipeReader { shared },
    )
}

impl Write for PipeWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let mut state = self.shared.state.lock().unwrap();
        loop {
            if state.read_closed {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "pipe reader closed",
                ));
            }
            let space = state.capacity - state.buf.len();
            if space > 0 {
                let n = space.min(data.len());
                state.buf.extend(&data[..n]);
                self.shared.readable.notify_one();
                return Ok(n);
            }
            state = self.shared.writable.wait(state).unwrap();
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock().unwrap();
        state.write_closed = true;
        self.shared.readable.notify_all();
    }
}

impl Read for PipeReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        let mut state = self.shared.state.lock().unwrap();
        loop {
            if !state.buf.is_empty() {
                let n = out.len().min(state.buf.len());
                for slot in out[..n].iter_mut() {
                    *slot = state.buf.pop_front().unwrap();
                }
                self.shared.writable.notify_one();
                return Ok(n);
            }
            if state.write_closed {
                return Ok(0);
            }
            state = self.shared.readable.wait(state).unwrap();
        }
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock().unwrap();
        state.read_closed = true;
        self.shared.writable.notify_all();
    }
}

/// How a layer's bytes appear in the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerArchiveMode {
    /// Raw tar bytes (legacy `layer.tar`).
    Uncompressed,
    /// Gzip-compressed tar (OCI layer blob). The compression level is
    /// fixed so identical inputs yield identical blob digests.
    Gzip,
}

/// Copy `reader` to `writer`, checking the cancel token per chunk.
pub fn copy_cancellable<R, W>(reader: &mut R, writer: &mut W, cancel: &CancelToken) -> Result<u64>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut buf = [0u8; COPY_BUF_SIZE];
    let mut total = 0u64;
    loop {
        cancel.check()?;
        let n = reader.read(&mut buf)?;
        if n == 0 {
            return Ok(total);
        }
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }
}

/// Stream a layer's uncompressed tar into `sink`, compressing per `mode`,
/// and return the digest and size of the bytes as written to `sink`.
///
/// The source read (and compression) runs on a worker thread; the calling
/// thread drains the pipe into the digesting sink. A sink error drops the
/// reading end, which stops the worker at its next write; a source error
/// from the worker takes precedence over the truncated result observed on
/// the calling side.
pub fn stream_layer<R, W>(
    source: R,
    mode: LayerArchiveMode,
    sink: W,
    cancel: &CancelToken,
) -> Result<(Digest, u64)>
where
    R: Read + Send,
    W: Write,
{
    let (writer, mut reader) = pipe(PIPE_CAPACITY);
    let worker_cancel = cancel.clone();

    thread::scope(|scope| {
        let worker = scope.spawn(move || -> Result<()> {
            let mut source = source;
            match mode {
                LayerArchiveMode::Uncompressed => {
                    let mut writer = writer;
                    copy_cancellable(&mut source, &mut writer, &worker_cancel)?;
                }
                LayerArchiveMode::Gzip => {
                    let mut encoder = GzEncoder::new(writer, Compression::default());
                    copy_cancellable(&mut source, &mut encoder, &worker_cancel)?;
                    encoder.finish()?;
                }
            }
            Ok(())
        });

        let mut digest_sink = DigestWriter::new(sink);
        let drained = copy_cancellable(&mut reader, &mut digest_sink, cancel);
        drop(reader);

        let worker_result = worker.join().expect("layer stream worker panicked");
        match (worker_result, drained) {
            (Ok(()), Ok(_)) => {
                let (_, digest, size) = digest_sink.finish();
                Ok((digest, size))
            }
            // A worker error explains the truncation or broken pipe the
            // caller saw, unless it is itself the broken-pipe echo of a
            // caller-side failure.
            (Err(worker_err), Err(caller_err)) => {
                if is_broken_pipe(&worker_err) {
                    Err(caller_err)
                } else {
                    Err(worker_err)
                }
            }
            (Err(worker_err), Ok(_)) => Err(worker_err),
            (Ok(()), Err(caller_err)) => Err(caller_err),
        }
    })
}

/// Feed a layer blob from the archive to `consume` as an uncompressed tar
/// stream, decompressing per `mode` on a worker thread.
///
/// Returns the value produced by `consume` together with the digest and
/// size of the blob bytes exactly as stored (compressed form for gzip).
pub fn hydrate_layer<R, F, T>(
    source: R,
    mode: LayerArchiveMode,
    cancel: &CancelToken,
    consume: F,
) -> Result<(T, Digest, u64)>
where
    R: Read + Send,
    F: FnOnce(&mut dyn Read) -> Result<T>,
{
    let (mut writer, mut reader) = pipe(PIPE_CAPACITY);
    let worker_cancel = cancel.clone();

    thread::scope(|scope| {
        let worker = scope.spawn(move || -> Result<(Digest, u64)> {
            let mut source = DigestReader::new(source);
            match mode {
                LayerArchiveMode::Uncompressed => {
                    copy_cancellable(&mut source, &mut writer, &worker_cancel)?;
                }
                LayerArchiveMode::Gzip => {
                    let mut decoder = GzDecoder::new(source);
                    copy_cancellable(&mut decoder, &mut writer, &worker_cancel)?;
                    source = decoder.into_inner();
                    // Account for any bytes past the gzip trailer so the
                    // blob digest covers the stored bytes in full.
                    copy_cancellable(&mut source, &mut io::sink(), &worker_cancel)?;
                }
            }
            drop(writer);
            Ok(source.finish())
        });

        let consumed = consume(&mut reader);
        drop(reader);

        let worker_result = worker.join().expect("layer hydrate worker panicked");
        match (worker_result, consumed) {
            (Ok((digest, size)), Ok(value)) => Ok((value, digest, size)),
            (Err(worker_err), Err(caller_err)) => {
                if is_broken_pipe(&worker_err) {
                    Err(caller_err)
                } else {
                    Err(worker_err)
                }
            }
            (Err(worker_err), Ok(_)) => Err(worker_err),
            (Ok(_), Err(caller_err)) => Err(caller_err),
        }
    })
}

fn is_broken_pipe(err: &ArchiveError) -> bool {
    matches!(err, ArchiveError::Io(io) if io.kind() == io::ErrorKind::BrokenPipe)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Digest;

    #[test]
    fn test_pipe_transfers_bytes() {
        let (mut writer, mut reader) = pipe(8);
        let payload: Vec<u8> = (0..100u8).collect();

        thread::scope(|scope| {
            let expected = payload.clone();
            scope.spawn(move || {
                writer.write_all(&payload).unwrap();
            });
            let mut out = Vec::new();
            reader.read_to_end(&mut out).unwrap();
            assert_eq!(out, expected);
        });
    }

    #[test]
    fn test_pipe_write_after_reader_drop_fails() {
        let (mut writer, reader) = pipe(4);
        drop(reader);
        let err = writer.write(b"data").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn test_pipe_read_after_writer_drop_drains_then_eof() {
        let (mut writer, mut reader) = pipe(16);
        writer.write_all(b"tail").unwrap();
        drop(writer);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"tail");
    }

    #[test]
    fn test_stream_layer_uncompressed_digest() {
        let data = b"some layer tar bytes".to_vec();
        let mut sink = Vec::new();
        let (digest, size) = stream_layer(
            data.as_slice(),
            LayerArchiveMode::Uncompressed,
            &mut sink,
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(sink, data);
        assert_eq!(size, data.len() as u64);
        assert_eq!(digest, Digest::sha256_of(&data));
    }

    #[test]
    fn test_stream_layer_gzip_roundtrip() {
        let data = vec![7u8; 100_000];
        let mut sink = Vec::new();
        let (digest, size) = stream_layer(
            data.as_slice(),
            LayerArchiveMode::Gzip,
            &mut sink,
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(size, sink.len() as u64);
        assert_eq!(digest, Digest::sha256_of(&sink));
        assert!(sink.len() < data.len());

        let mut decoder = GzDecoder::new(sink.as_slice());
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_stream_layer_deterministic() {
        let data = vec![42u8; 50_000];
        let run = || {
            let mut sink = Vec::new();
            let (digest, _) = stream_layer(
                data.as_slice(),
                LayerArchiveMode::Gzip,
                &mut sink,
                &CancelToken::new(),
            )
            .unwrap();
            digest
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_stream_layer_cancelled() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let data = vec![0u8; 1024];
        let mut sink = Vec::new();
        let result = stream_layer(
            data.as_slice(),
            LayerArchiveMode::Gzip,
            &mut sink,
            &cancel,
        );
        assert!(matches!(result, Err(ArchiveError::Cancelled)));
    }

    #[test]
    fn test_hydrate_layer_gzip() {
        let data = b"uncompressed layer tar".to_vec();
        let mut blob = Vec::new();
        let (blob_digest, _) = stream_layer(
            data.as_slice(),
            LayerArchiveMode::Gzip,
            &mut blob,
            &CancelToken::new(),
        )
        .unwrap();

        let (seen, digest, size) = hydrate_layer(
            blob.as_slice(),
            LayerArchiveMode::Gzip,
            &CancelToken::new(),
            |tar| {
                let mut out = Vec::new();
                tar.read_to_end(&mut out)?;
                Ok(out)
            },
        )
        .unwrap();

        assert_eq!(seen, data);
        assert_eq!(digest, blob_digest, "digest is over the stored bytes");
        assert_eq!(size, blob.len() as u64);
    }

    #[test]
    fn test_hydrate_layer_consumer_error_wins() {
        let blob = {
            let mut blob = Vec::new();
            stream_layer(
                &[1u8; 200_000][..],
                LayerArchiveMode::Gzip,
                &mut blob,
                &CancelToken::new(),
            )
            .unwrap();
            blob
        };
        let result = hydrate_layer(
            blob.as_slice(),
            LayerArchiveMode::Gzip,
            &CancelToken::new(),
            |_tar| -> Result<()> {
                Err(ArchiveError::LayoutMalformed("consumer rejected".into()))
            },
        );
        match result {
            Err(ArchiveError::LayoutMalformed(msg)) => assert!(msg.contains("consumer rejected")),
            other => panic!("expected consumer error, got {other:?}"),
        }
    }
}
