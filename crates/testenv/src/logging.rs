//! Logger setup with a destination that can move after startup
//!
//! The config file may name a log file, but the logger has to be up before
//! the config is read so that loading errors are reported. [`LogSink`] starts
//! on stderr and is pointed at the file once it is known.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Shared, swappable log destination
#[derive(Clone)]
pub struct LogSink {
    target: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl LogSink {
    /// Sink writing to stderr
    pub fn stderr() -> Self {
        Self::to_writer(Box::new(io::stderr()))
    }

    fn to_writer(writer: Box<dyn Write + Send>) -> Self {
        Self {
            target: Arc::new(Mutex::new(writer)),
        }
    }

    /// Append every later record to `path`
    pub fn redirect_to_file(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file: File = OpenOptions::new().create(true).append(true).open(path)?;
        let mut target = self
            .target
            .lock()
            .map_err(|_| io::Error::other("log sink poisoned"))?;
        target.flush()?;
        *target = Box::new(file);
        Ok(())
    }
}

impl Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.target.lock() {
            Ok(mut target) => target.write(buf),
            Err(_) => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.target.lock() {
            Ok(mut target) => target.flush(),
            Err(_) => Ok(()),
        }
    }
}

/// Initialize env_logger at `level`, writing through `sink`
///
/// `RUST_LOG` still takes precedence over `level`.
pub fn init(level: &str, sink: &LogSink) {
    let env = env_logger::Env::default().default_filter_or(level);
    env_logger::Builder::from_env(env)
        .target(env_logger::Target::Pipe(Box::new(sink.clone())))
        .init();
}
