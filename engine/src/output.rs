//! Plugin output stream
//!
//! One process-wide, line-buffered stream shared by the engine's plugin-facing
//! diagnostics and by the plugin itself (through the [`OutputSink`] vtable in
//! its descriptor). Defaults to stderr; `TPI_OUTPUT=<path>` redirects it to
//! `<path>.<pid>`. The stream is opened once per load and never reopened.

use parking_lot::Mutex;
use std::ffi::c_void;
use std::fmt;
use std::fs::File;
use std::io::{self, LineWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tpi_plugin::OutputSink;

type SharedWriter = Mutex<LineWriter<Box<dyn Write + Send>>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Stderr,
    File(PathBuf),
    Memory,
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Stderr => write!(f, "stderr"),
            Destination::File(path) => write!(f, "{}", path.display()),
            Destination::Memory => write!(f, "memory"),
        }
    }
}

pub struct PluginOutput {
    // Both boxes keep a stable address: the sink is referenced from the
    // plugin descriptor and points at the writer.
    writer: Box<SharedWriter>,
    sink: Box<OutputSink>,
    destination: Destination,
}

impl PluginOutput {
    /// Open the output configured by `TPI_OUTPUT`, falling back to stderr.
    pub fn open(base: Option<&Path>) -> Self {
        let Some(base) = base else {
            return Self::stderr();
        };

        let path = output_file_name(base, std::process::id());
        match File::create(&path) {
            Ok(file) => {
                log::debug!("plugin output redirected to {}", path.display());
                Self::from_writer(Box::new(file), Destination::File(path))
            }
            Err(e) => {
                log::warn!("can't open {}: {}", path.display(), e);
                let output = Self::stderr();
                output.warning(format_args!("can't open TPI_OUTPUT (falling back to stderr)"));
                output
            }
        }
    }

    pub fn stderr() -> Self {
        Self::from_writer(Box::new(io::stderr()), Destination::Stderr)
    }

    /// In-memory output, mostly for tests and tooling that inspects what a
    /// plugin printed.
    pub fn memory() -> (Self, MemoryOutput) {
        let buffer = MemoryOutput::default();
        let output = Self::from_writer(Box::new(buffer.clone()), Destination::Memory);
        (output, buffer)
    }

    fn from_writer(writer: Box<dyn Write + Send>, destination: Destination) -> Self {
        let writer: Box<SharedWriter> = Box::new(Mutex::new(LineWriter::new(writer)));
        let sink = Box::new(OutputSink {
            ctx: &*writer as *const SharedWriter as *const c_void,
            write: sink_write,
            flush: sink_flush,
        });
        Self {
            writer,
            sink,
            destination,
        }
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Pointer stored in the plugin descriptor. Valid while `self` lives.
    pub fn sink(&self) -> *const OutputSink {
        &*self.sink
    }

    /// Write one complete line.
    pub fn line(&self, args: fmt::Arguments<'_>) {
        let mut writer = self.writer.lock();
        if let Err(e) = writeln!(writer, "{}", args) {
            log::warn!("plugin output write failed: {}", e);
        }
    }

    /// `plugin: warning: <message>`
    pub fn warning(&self, args: fmt::Arguments<'_>) {
        self.line(format_args!("plugin: warning: {}", args));
    }

    /// `plugin: error: <message>`
    pub fn error(&self, args: fmt::Arguments<'_>) {
        self.line(format_args!("plugin: error: {}", args));
    }

    pub fn flush(&self) {
        if let Err(e) = self.writer.lock().flush() {
            log::warn!("plugin output flush failed: {}", e);
        }
    }
}

impl Drop for PluginOutput {
    fn drop(&mut self) {
        self.flush();
    }
}

impl fmt::Debug for PluginOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginOutput")
            .field("destination", &self.destination)
            .finish()
    }
}

/// `<base>.<pid>`
pub fn output_file_name(base: &Path, pid: u32) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{}", pid));
    PathBuf::from(name)
}

extern "C" fn sink_write(ctx: *const c_void, buf: *const u8, len: usize) -> isize {
    if ctx.is_null() || buf.is_null() {
        return -1;
    }
    // SAFETY: `ctx` is the boxed writer owned by the `PluginOutput` that
    // handed out this sink, and the plugin guarantees `buf[..len]` is valid.
    let writer = unsafe { &*(ctx as *const SharedWriter) };
    let bytes = unsafe { std::slice::from_raw_parts(buf, len) };
    match writer.lock().write_all(bytes) {
        Ok(()) => len as isize,
        Err(_) => -1,
    }
}

extern "C" fn sink_flush(ctx: *const c_void) -> bool {
    if ctx.is_null() {
        return false;
    }
    // SAFETY: see `sink_write`.
    let writer = unsafe { &*(ctx as *const SharedWriter) };
    writer.lock().flush().is_ok()
}

/// Shared handle on an in-memory plugin output.
#[derive(Clone, Default)]
pub struct MemoryOutput {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl MemoryOutput {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock()).into_owned()
    }

    pub fn lines(&self) -> Vec<String> {
        self.contents().lines().map(str::to_owned).collect()
    }
}

impl Write for MemoryOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
