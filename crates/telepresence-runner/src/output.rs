use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

use crate::error::RunnerError;

enum Sink {
    Stdout,
    File(File),
}

/// The session log. Subprocess output, tracing events, and user-visible
/// messages all end up here, each line tagged with the elapsed time and a
/// short source prefix.
pub struct Output {
    sink: Mutex<Sink>,
    path: Option<PathBuf>,
    start: Instant,
}

impl Output {
    /// Open the log destination. `"-"` means stdout; anything else is a file
    /// path which is wiped, then reopened in append mode so concurrent
    /// writers don't clobber each other's lines.
    pub fn open(destination: &str) -> Result<Output, RunnerError> {
        let (sink, path) = if destination == "-" {
            (Sink::Stdout, None)
        } else {
            // Other processes may run in different directories, so the
            // recorded path must be absolute.
            let path = std::path::absolute(destination)?;
            File::create(&path).map_err(|exc| {
                RunnerError::Fatal(format!(
                    "Failed to open logfile ({}): {}",
                    path.display(),
                    exc
                ))
            })?;
            let file = OpenOptions::new().append(true).open(&path)?;
            (Sink::File(file), Some(path))
        };
        Ok(Output {
            sink: Mutex::new(sink),
            path,
            start: Instant::now(),
        })
    }

    pub fn logfile_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Write a message to the log, splitting it into individual lines.
    pub fn write(&self, prefix: &str, message: &str) {
        let elapsed = self.start.elapsed().as_secs_f64();
        let mut sink = self.sink.lock().unwrap();
        for sub_message in message.lines() {
            let line = format!("{:6.1} {} | {}\n", elapsed, prefix, sub_message.trim_end());
            let _ = match &mut *sink {
                Sink::Stdout => std::io::stdout().write_all(line.as_bytes()),
                Sink::File(file) => file.write_all(line.as_bytes()),
            };
        }
        if let Sink::File(file) = &mut *sink {
            let _ = file.flush();
        }
    }
}
