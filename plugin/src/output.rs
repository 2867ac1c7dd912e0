//! Plugin output stream

use std::ffi::c_void;
use std::io;

/// Engine-provided sink behind `PluginInterface::output`.
///
/// `write` must be called with whole lines; the engine serializes calls so a
/// line is never split by a write from another thread.
#[repr(C)]
pub struct OutputSink {
    pub ctx: *const c_void,
    /// Returns the number of bytes written, or a negative value on error
    pub write: extern "C" fn(ctx: *const c_void, buf: *const u8, len: usize) -> isize,
    pub flush: extern "C" fn(ctx: *const c_void) -> bool,
}

// SAFETY: the engine implements the sink on top of a locked writer.
unsafe impl Send for OutputSink {}
unsafe impl Sync for OutputSink {}

impl OutputSink {
    fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        let mut rest = buf;
        while !rest.is_empty() {
            let written = (self.write)(self.ctx, rest.as_ptr(), rest.len());
            if written <= 0 {
                return Err(io::Error::other("plugin output rejected write"));
            }
            rest = &rest[(written as usize).min(rest.len())..];
        }
        Ok(())
    }
}

/// Line-assembling writer over an [`OutputSink`].
///
/// Bytes are kept until a newline completes a line; the remainder is
/// forwarded on flush or drop. Without a sink, output is discarded.
pub struct OutputWriter<'a> {
    sink: Option<&'a OutputSink>,
    pending: Vec<u8>,
}

impl<'a> OutputWriter<'a> {
    pub(crate) fn new(sink: Option<&'a OutputSink>) -> Self {
        Self {
            sink,
            pending: Vec::new(),
        }
    }

    fn forward_lines(&mut self) -> io::Result<()> {
        let Some(sink) = self.sink else {
            self.pending.clear();
            return Ok(());
        };
        if let Some(last_newline) = self.pending.iter().rposition(|&b| b == b'\n') {
            let lines: Vec<u8> = self.pending.drain(..=last_newline).collect();
            for line in lines.split_inclusive(|&b| b == b'\n') {
                sink.write_all(line)?;
            }
        }
        Ok(())
    }
}

impl io::Write for OutputWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        if buf.contains(&b'\n') {
            self.forward_lines()?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.forward_lines()?;
        if let Some(sink) = self.sink {
            if !self.pending.is_empty() {
                let rest = std::mem::take(&mut self.pending);
                sink.write_all(&rest)?;
            }
            if !(sink.flush)(sink.ctx) {
                return Err(io::Error::other("plugin output flush failed"));
            }
        }
        Ok(())
    }
}

impl Drop for OutputWriter<'_> {
    fn drop(&mut self) {
        if let Some(sink) = self.sink {
            if !self.pending.is_empty() {
                let _ = sink.write_all(&self.pending);
            }
        }
    }
}
