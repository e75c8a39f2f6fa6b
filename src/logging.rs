//! Tracing setup: a stderr layer filtered by output mode, plus an optional
//! log file layer that can be attached once the config has been read.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::progress::OutputMode;

/// Filter used by the log file layer.
const FILE_DIRECTIVES: &str = "vms=debug";

type SharedFile = Arc<Mutex<Option<File>>>;

fn lock(file: &SharedFile) -> MutexGuard<'_, Option<File>> {
    file.lock().unwrap_or_else(PoisonError::into_inner)
}

/// `MakeWriter` for the file layer. Discards everything until a file is
/// attached through the matching [`LogFileHandle`].
#[derive(Clone)]
pub struct LogFileWriter {
    file: SharedFile,
}

#[derive(Clone)]
pub struct LogFileHandle {
    file: SharedFile,
}

impl LogFileWriter {
    pub fn new() -> (Self, LogFileHandle) {
        let file = SharedFile::default();
        (Self { file: file.clone() }, LogFileHandle { file })
    }
}

impl LogFileHandle {
    /// Start appending log records to `path`, creating parent directories.
    pub fn attach(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        *lock(&self.file) = Some(file);
        Ok(())
    }
}

pub struct LogFileGuard {
    file: SharedFile,
}

impl Write for LogFileGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match lock(&self.file).as_mut() {
            Some(f) => f.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match lock(&self.file).as_mut() {
            Some(f) => f.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for LogFileWriter {
    type Writer = LogFileGuard;

    fn make_writer(&'a self) -> LogFileGuard {
        LogFileGuard {
            file: self.file.clone(),
        }
    }
}

/// Directives for the stderr layer.
///
/// The interactive spinner redraws stderr, so log lines there would tear it;
/// it only shows logs when `RUST_LOG` asks for them explicitly.
pub fn terminal_directives(mode: OutputMode, rust_log: Option<&str>) -> String {
    let rust_log = rust_log.map(str::trim).filter(|s| !s.is_empty());
    match (mode, rust_log) {
        (OutputMode::Verbose, _) => "debug".into(),
        (OutputMode::Quiet, _) => "off".into(),
        (_, Some(directives)) => directives.into(),
        (OutputMode::Interactive, None) => "off".into(),
        (OutputMode::Plain, None) => "vms=warn".into(),
    }
}

/// Install the global subscriber. Returns the handle used to attach a log
/// file later.
pub fn init(mode: OutputMode) -> LogFileHandle {
    let rust_log = std::env::var("RUST_LOG").ok();
    let directives = terminal_directives(mode, rust_log.as_deref());
    let terminal_filter = EnvFilter::try_new(&directives).unwrap_or_else(|e| {
        eprintln!("warning: ignoring invalid RUST_LOG ({e})");
        EnvFilter::new("vms=warn")
    });

    let terminal_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(terminal_filter);

    let (file_writer, handle) = LogFileWriter::new();
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer)
        .with_filter(EnvFilter::new(FILE_DIRECTIVES));

    tracing_subscriber::registry()
        .with(terminal_layer)
        .with(file_layer)
        .init();

    handle
}
