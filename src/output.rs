//! Write-only text output: the sampler's trace stream and the diagnostic
//! logger both sit on the same file abstraction.

use std::env;
use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

use flate2::write::GzEncoder;
use flate2::Compression;

use crate::ERR_POISONED_LOCK;

/// A write-only stream of text chunks.  Paths ending in `.gz` are run
/// through a streaming gzip compressor; the trailer is written when the
/// writer is dropped.
pub(crate) struct TraceWriter {
    sink: TraceSink,
}

enum TraceSink {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<File>),
}

impl TraceWriter {
    pub(crate) fn create(path: &Path) -> io::Result<TraceWriter> {
        let file = File::create(path)?;
        let sink = if path.extension().is_some_and(|ext| ext == "gz") {
            TraceSink::Gzip(GzEncoder::new(file, Compression::default()))
        } else {
            TraceSink::Plain(BufWriter::new(file))
        };
        Ok(TraceWriter { sink })
    }

    pub(crate) fn write_text(&mut self, text: &str) -> io::Result<()> {
        match &mut self.sink {
            TraceSink::Plain(out) => out.write_all(text.as_bytes()),
            TraceSink::Gzip(out) => out.write_all(text.as_bytes()),
        }
    }

    pub(crate) fn flush(&mut self) -> io::Result<()> {
        match &mut self.sink {
            TraceSink::Plain(out) => out.flush(),
            TraceSink::Gzip(out) => out.flush(),
        }
    }
}

impl Drop for TraceWriter {
    fn drop(&mut self) {
        match &mut self.sink {
            TraceSink::Plain(out) => {
                let _ = out.flush();
            }
            TraceSink::Gzip(out) => {
                let _ = out.try_finish();
            }
        }
    }
}

/// Diagnostic logger.  The destination comes from `MEMSCOPETRACK_LOGFILE`:
/// unset discards everything, `stdout`/`stderr` write to those streams, any
/// other value is a file path (`.gz` honored).  Messages after `shutdown`
/// are dropped.
pub(crate) struct Logger {
    sink: Mutex<Option<LogSink>>,
}

enum LogSink {
    Stdout,
    Stderr,
    File(TraceWriter),
}

impl Logger {
    pub(crate) fn from_env() -> Logger {
        let sink = match env::var("MEMSCOPETRACK_LOGFILE") {
            Err(_) => None,
            Ok(dest) if dest == "stdout" => Some(LogSink::Stdout),
            Ok(dest) if dest == "stderr" => Some(LogSink::Stderr),
            // An unopenable log file silences the logger rather than
            // failing the process: tracking stays best-effort.
            Ok(path) => TraceWriter::create(Path::new(&path))
                .ok()
                .map(LogSink::File),
        };
        Logger {
            sink: Mutex::new(sink),
        }
    }

    pub(crate) fn log(&self, message: fmt::Arguments<'_>) {
        let mut sink = self.sink.lock().expect(ERR_POISONED_LOCK);
        let Some(sink) = sink.as_mut() else { return };
        let line = format!("{message}\n");
        match sink {
            LogSink::Stdout => {
                let _ = io::stdout().write_all(line.as_bytes());
            }
            LogSink::Stderr => {
                let _ = io::stderr().write_all(line.as_bytes());
            }
            LogSink::File(writer) => {
                let _ = writer.write_text(&line);
            }
        }
    }

    /// Drop the sink (flushing any file), silencing all later messages.
    pub(crate) fn shutdown(&self) {
        if let Ok(mut sink) = self.sink.lock() {
            sink.take();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::fs;
    use std::io::Read;

    use crate::testutil::global_state_lock;

    fn read_gz(path: &Path) -> String {
        let mut decoder = GzDecoder::new(File::open(path).unwrap());
        let mut text = String::new();
        decoder.read_to_string(&mut text).unwrap();
        text
    }

    #[test]
    fn plain_writer_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.txt");
        let mut writer = TraceWriter::create(&path).unwrap();
        writer.write_text("---0\n").unwrap();
        writer.write_text("main|4\n").unwrap();
        drop(writer);
        assert_eq!(fs::read_to_string(&path).unwrap(), "---0\nmain|4\n");
    }

    #[test]
    fn gzip_writer_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.gz");
        let mut writer = TraceWriter::create(&path).unwrap();
        writer.write_text("---17\n").unwrap();
        writer.write_text("two|40\n").unwrap();
        drop(writer);
        assert_eq!(read_gz(&path), "---17\ntwo|40\n");
    }

    #[test]
    fn logger_unset_discards() {
        let _env = global_state_lock();
        env::remove_var("MEMSCOPETRACK_LOGFILE");
        let logger = Logger::from_env();
        // Nothing observable; just must not panic or write anywhere.
        logger.log(format_args!("dropped"));
    }

    #[test]
    fn logger_writes_lines_to_file_until_shutdown() {
        let _env = global_state_lock();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("track.log");
        env::set_var("MEMSCOPETRACK_LOGFILE", &path);
        let logger = Logger::from_env();
        env::remove_var("MEMSCOPETRACK_LOGFILE");

        logger.log(format_args!("duplicate memory address {:#x}", 0xbeef));
        logger.shutdown();
        logger.log(format_args!("after shutdown"));

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text, "duplicate memory address 0xbeef\n");
    }

    #[test]
    fn logger_honors_gz_destination() {
        let _env = global_state_lock();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("track.log.gz");
        env::set_var("MEMSCOPETRACK_LOGFILE", &path);
        let logger = Logger::from_env();
        env::remove_var("MEMSCOPETRACK_LOGFILE");

        logger.log(format_args!("Unfreed memory:"));
        logger.log(format_args!("  A - 100"));
        logger.shutdown();

        assert_eq!(read_gz(&path), "Unfreed memory:\n  A - 100\n");
    }
}
