use std::io::{ErrorKind, Write};
use std::sync::{Arc, Mutex, MutexGuard};

/// An in-memory byte sink that the test can inspect while the receiver owns a [SinkWriter]
///  for it.
#[derive(Clone, Default)]
pub struct SharedSink {
    inner: Arc<Mutex<SinkInner>>,
}

#[derive(Default)]
struct SinkInner {
    data: Vec<u8>,
    num_writes: usize,
    num_flushes: usize,
    num_closed: usize,
    fail_writes: bool,
}

impl SharedSink {
    pub fn new() -> SharedSink {
        SharedSink::default()
    }

    fn lock(&self) -> MutexGuard<SinkInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The writer counts as closed when it is dropped
    pub fn writer(&self) -> SinkWriter {
        SinkWriter { inner: self.inner.clone() }
    }

    pub fn data(&self) -> Vec<u8> {
        self.lock().data.clone()
    }

    pub fn num_writes(&self) -> usize {
        self.lock().num_writes
    }

    pub fn num_flushes(&self) -> usize {
        self.lock().num_flushes
    }

    pub fn is_closed(&self) -> bool {
        self.lock().num_closed > 0
    }

    pub fn num_closed(&self) -> usize {
        self.lock().num_closed
    }

    /// all subsequent writes fail with an I/O error
    pub fn fail_writes(&self) {
        self.lock().fail_writes = true;
    }
}

pub struct SinkWriter {
    inner: Arc<Mutex<SinkInner>>,
}

impl Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.fail_writes {
            return Err(std::io::Error::new(ErrorKind::Other, "simulated write failure"));
        }
        inner.data.extend_from_slice(buf);
        inner.num_writes += 1;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.num_flushes += 1;
        Ok(())
    }
}

impl Drop for SinkWriter {
    fn drop(&mut self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.num_closed += 1;
    }
}
