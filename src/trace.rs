//! Shared trace sink for human-readable exchange logs.
//!
//! Every record is emitted as a `tracing` event. When a trace file is
//! configured, the record is also appended to it as one whole line:
//!
//! ```text
//! 2026-10-18 12:00:00,123 - Sent - TEST with data size 4711
//! ```
//!
//! The sink is shared by the listener and every connection task, so writes
//! are serialized behind a mutex and lines from different connections never
//! interleave.

use std::fmt;
use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;
use tracing::{info, warn};

/// Kind of trace record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Info,
    Sent,
    Received,
    Result,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::Info => "Info",
            Action::Sent => "Sent",
            Action::Received => "Received",
            Action::Result => "Result",
        };
        f.write_str(name)
    }
}

/// Append-only, thread-safe trace sink
pub struct TraceSink {
    writer: Option<Mutex<Box<dyn Write + Send>>>,
}

impl TraceSink {
    /// Sink that only emits `tracing` events.
    pub fn disabled() -> Self {
        Self { writer: None }
    }

    /// Sink that appends to `path`, creating it if needed.
    pub fn file(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::from_writer(BufWriter::new(file)))
    }

    /// Sink that writes lines to an arbitrary writer.
    pub fn from_writer(writer: impl Write + Send + 'static) -> Self {
        Self {
            writer: Some(Mutex::new(Box::new(writer))),
        }
    }

    /// Record one line.
    pub fn record(&self, action: Action, message: impl AsRef<str>) {
        let message = message.as_ref();
        info!(%action, "{}", message);

        let Some(writer) = &self.writer else {
            return;
        };

        let line = format!(
            "{} - {} - {}\n",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S,%3f"),
            action,
            message
        );

        // A poisoned lock only means another task panicked mid-write
        let mut writer = writer.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = writer.write_all(line.as_bytes()) {
            warn!(error = %e, "Failed to write trace line");
        }
    }

    /// Flush buffered lines. Called once at shutdown.
    pub fn close(&self) {
        if let Some(writer) = &self.writer {
            let mut writer = writer.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(e) = writer.flush() {
                warn!(error = %e, "Failed to flush trace sink");
            }
        }
    }
}

impl Drop for TraceSink {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    /// In-memory writer whose contents tests can inspect.
    #[derive(Clone, Default)]
    pub(crate) struct SharedBuf(pub Arc<Mutex<Vec<u8>>>);

    impl SharedBuf {
        pub fn lines(&self) -> Vec<String> {
            let data = self.0.lock().unwrap();
            String::from_utf8_lossy(&data)
                .lines()
                .map(str::to_string)
                .collect()
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_line_format() {
        let buf = SharedBuf::default();
        let sink = TraceSink::from_writer(buf.clone());

        sink.record(Action::Sent, "TEST with data size 42");
        sink.record(Action::Received, "hello");

        let lines = buf.lines();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(" - Sent - TEST with data size 42"));
        assert!(lines[1].ends_with(" - Received - hello"));
    }

    #[test]
    fn test_disabled_sink() {
        let sink = TraceSink::disabled();
        sink.record(Action::Info, "nothing to see");
        sink.close();
    }

    #[test]
    fn test_concurrent_lines_not_interleaved() {
        let buf = SharedBuf::default();
        let sink = Arc::new(TraceSink::from_writer(buf.clone()));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let sink = Arc::clone(&sink);
                thread::spawn(move || {
                    for i in 0..100 {
                        sink.record(Action::Info, format!("thread {t} line {i}"));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let lines = buf.lines();
        assert_eq!(lines.len(), 800);
        for line in lines {
            assert!(line.contains(" - Info - thread "), "mangled line: {line}");
        }
    }

    #[test]
    fn test_file_sink_appends() {
        let path = std::env::temp_dir().join(format!(
            "frame-bench-trace-{}.log",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);

        {
            let sink = TraceSink::file(&path).unwrap();
            sink.record(Action::Info, "first");
        }
        {
            let sink = TraceSink::file(&path).unwrap();
            sink.record(Action::Info, "second");
            sink.close();
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("Info - first"));
        assert!(lines[1].ends_with("Info - second"));

        let _ = std::fs::remove_file(&path);
    }
}
