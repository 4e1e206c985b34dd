//! Shared inbound buffer between the reader task and the dispatcher scan

use std::sync::{Arc, Mutex, MutexGuard};

/// Append-only byte buffer drained one complete line at a time.
///
/// Clones share the same storage. Lines end at `\n`; a preceding `\r` is
/// dropped. Incomplete trailing data stays buffered until its terminator
/// arrives.
#[derive(Debug, Clone, Default)]
pub struct LineBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append raw bytes as received from the transport
    pub fn append(&self, bytes: &[u8]) {
        self.lock().extend_from_slice(bytes);
    }

    /// Remove and return the oldest complete line
    pub fn next_line(&self) -> Option<String> {
        let mut buf = self.lock();
        take_line(&mut buf)
    }

    /// Remove and return every complete line, oldest first
    pub fn drain_lines(&self) -> Vec<String> {
        let mut buf = self.lock();
        let mut lines = Vec::new();
        while let Some(line) = take_line(&mut buf) {
            lines.push(line);
        }
        lines
    }

    /// Bytes waiting for a terminator
    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

fn take_line(buf: &mut Vec<u8>) -> Option<String> {
    let end = buf.iter().position(|&b| b == b'\n')?;
    let mut line: Vec<u8> = buf.drain(..=end).collect();
    line.pop();
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Some(String::from_utf8_lossy(&line).into_owned())
}
