//! Structured async logger
//!
//! A process-wide queue of bounded depth holds pooled [`Entry`] values; a
//! dedicated consumer thread drains it into the configured sink so request
//! tasks never block on I/O. Fatal entries bypass the queue, are written
//! synchronously and terminate the process (suppressed under the test flag).
//!
//! The logger installs itself behind the standard `log` facade, so the rest
//! of the crate (and the host application) just uses `log::info!` and
//! friends. [`Logger::fatal`] and [`Logger::panic`] cover the two severities
//! the facade does not model.

pub mod entry;
pub mod formatter;
pub mod writer;

pub use entry::Entry;
pub use formatter::{Formatter, JsonFormatter, NilFormatter, TextFormatter};
pub use writer::{FileWriter, LogWriter, NilWriter, StdoutWriter};

use anyhow::{bail, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex, Once};

/// Queue depth; producers block once this many entries are in flight.
const QUEUE_DEPTH: usize = 1024;

/// Severity of a log entry, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    /// Logs and then panics with the message.
    Panic = 1,
    /// Logs synchronously and exits the process with code 1.
    Fatal = 2,
    /// Errors that should definitely be noted.
    Error = 3,
    /// Non-critical entries that deserve eyes.
    Warn = 4,
    /// General operational entries.
    Info = 5,
    /// Very verbose logging, annotated with caller information.
    Debug = 6,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Panic => "PANIC",
            Level::Fatal => "FATAL",
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
        }
    }

    fn parse(value: &str) -> Option<Level> {
        match value.to_ascii_lowercase().as_str() {
            "panic" => Some(Level::Panic),
            "fatal" => Some(Level::Fatal),
            "error" => Some(Level::Error),
            "warning" | "warn" => Some(Level::Warn),
            "info" => Some(Level::Info),
            "debug" => Some(Level::Debug),
            _ => None,
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logger configuration (`log.*` settings keys).
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// "stdout", "none", or a file path
    pub writer: String,
    /// "text", "json" or "none"
    pub format: String,
    /// Minimum severity that gets logged
    pub level: String,
    /// Rotate file sinks at this size; 0 disables rotation
    pub max_file_size: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            writer: "stdout".to_string(),
            format: "text".to_string(),
            level: "warning".to_string(),
            max_file_size: 10_000_000,
        }
    }
}

impl LogConfig {
    pub fn from_settings(settings: &crate::Settings) -> Self {
        let defaults = Self::default();
        Self {
            writer: settings.str_or("log.writer", &defaults.writer),
            format: settings.str_or("log.format", &defaults.format),
            level: settings.str_or("log.level", &defaults.level),
            max_file_size: settings.int_or("log.maxFileSize", defaults.max_file_size as i64)
                .max(0) as u64,
        }
    }
}

struct Shared {
    /// Numeric severity ceiling; 0 disables logging entirely.
    level: u8,
    formatter: Box<dyn Formatter + Send + Sync>,
    writer: Mutex<Box<dyn LogWriter>>,
    pool: Mutex<Vec<Entry>>,
    sender: Mutex<Option<SyncSender<Entry>>>,
    test_mode: AtomicBool,
    closing: AtomicBool,
}

impl Shared {
    fn print(&self, entry: Entry) {
        let data = self.formatter.format(&entry);
        if !data.is_empty() {
            let mut writer = self.writer.lock().expect("log writer lock poisoned");
            if let Err(err) = writer.write(&data) {
                eprintln!("log write failed: {}", err);
            }
        }
        if entry.level == Level::Fatal && !self.test_mode.load(Ordering::Relaxed) {
            let _ = self.writer.lock().expect("log writer lock poisoned").close();
            std::process::exit(1);
        }
        let mut pool = self.pool.lock().expect("entry pool lock poisoned");
        if pool.len() < QUEUE_DEPTH {
            pool.push(entry);
        }
    }

    fn take_entry(&self, level: Level) -> Entry {
        let mut entry =
            self.pool.lock().expect("entry pool lock poisoned").pop().unwrap_or_default();
        entry.reset(level);
        entry
    }
}

/// Handle to the logger. Cheap to clone; all clones share one queue.
#[derive(Clone)]
pub struct Logger {
    shared: Arc<Shared>,
}

impl Logger {
    /// Build a logger from configuration and start its consumer thread.
    pub fn new(config: &LogConfig) -> Result<Self> {
        let level = match config.level.to_ascii_lowercase().as_str() {
            "off" | "disabled" | "none" => 0,
            other => match Level::parse(other) {
                Some(level) => level as u8,
                None => bail!("invalid log level: {}", config.level),
            },
        };

        let writer: Box<dyn LogWriter> = match config.writer.to_ascii_lowercase().as_str() {
            "none" | "disabled" => Box::new(NilWriter),
            "stdout" => Box::new(StdoutWriter),
            _ => Box::new(FileWriter::open(&config.writer, config.max_file_size)?),
        };

        let formatter: Box<dyn Formatter + Send + Sync> =
            match config.format.to_ascii_lowercase().as_str() {
                "none" | "disabled" => Box::new(NilFormatter),
                "text" => Box::new(TextFormatter::new()),
                "json" => Box::new(JsonFormatter::new()),
                other => bail!("invalid log formatter: {}", other),
            };

        let (sender, receiver): (SyncSender<Entry>, Receiver<Entry>) = sync_channel(QUEUE_DEPTH);
        let shared = Arc::new(Shared {
            level,
            formatter,
            writer: Mutex::new(writer),
            pool: Mutex::new(Vec::new()),
            sender: Mutex::new(Some(sender)),
            test_mode: AtomicBool::new(false),
            closing: AtomicBool::new(false),
        });

        let consumer = shared.clone();
        std::thread::Builder::new().name("armature-log".to_string()).spawn(move || {
            while let Ok(entry) = receiver.recv() {
                consumer.print(entry);
            }
            let _ = consumer.writer.lock().expect("log writer lock poisoned").close();
        })?;

        Ok(Self { shared })
    }

    /// Suppress the process exit on Fatal; used by tests.
    pub fn set_test_mode(&self, on: bool) {
        self.shared.test_mode.store(on, Ordering::Relaxed);
    }

    fn enabled(&self, level: Level) -> bool {
        self.shared.level >= level as u8 && !self.shared.closing.load(Ordering::Relaxed)
    }

    /// Queue an entry. Tags are key=value pairs attached before the message.
    pub fn log(&self, level: Level, tags: &[(&str, &str)], message: &str) {
        if !self.enabled(level) {
            return;
        }
        let mut entry = self.shared.take_entry(level);
        for (key, value) in tags {
            entry.tag(key, value);
        }
        entry.message.push_str(message);
        self.enqueue(entry);
    }

    pub fn error(&self, message: &str) {
        self.log(Level::Error, &[], message);
    }

    pub fn warn(&self, message: &str) {
        self.log(Level::Warn, &[], message);
    }

    pub fn info(&self, message: &str) {
        self.log(Level::Info, &[], message);
    }

    /// Debug entries carry the caller location and thread as a `source` tag.
    #[track_caller]
    pub fn debug(&self, message: &str) {
        if !self.enabled(Level::Debug) {
            return;
        }
        let mut entry = self.shared.take_entry(Level::Debug);
        let caller = std::panic::Location::caller();
        entry.tag("source", &source_tag(caller.file(), caller.line()));
        entry.message.push_str(message);
        self.enqueue(entry);
    }

    /// Written synchronously, then the process exits with code 1 (unless the
    /// test flag is set).
    pub fn fatal(&self, message: &str) {
        if !self.enabled(Level::Fatal) {
            return;
        }
        let mut entry = self.shared.take_entry(Level::Fatal);
        entry.message.push_str(message);
        self.shared.print(entry);
    }

    /// Logs at the highest severity and panics with the message.
    pub fn panic(&self, message: &str) -> ! {
        if self.enabled(Level::Panic) {
            let mut entry = self.shared.take_entry(Level::Panic);
            entry.message.push_str(message);
            self.shared.print(entry);
        }
        panic!("{}", message);
    }

    /// Stop accepting entries and let the consumer drain the queue.
    pub fn close(&self) {
        self.shared.closing.store(true, Ordering::Relaxed);
        self.shared.sender.lock().expect("log sender lock poisoned").take();
    }

    fn enqueue(&self, entry: Entry) {
        let sender = self.shared.sender.lock().expect("log sender lock poisoned").clone();
        if let Some(sender) = sender {
            let _ = sender.send(entry);
        }
    }
}

static INSTALL: Once = Once::new();

/// Install a logger behind the standard `log` facade. Safe to call more than
/// once; only the first install wins.
pub fn install(logger: Logger) {
    INSTALL.call_once(|| {
        let max = match logger.shared.level {
            0 => log::LevelFilter::Off,
            1..=3 => log::LevelFilter::Error,
            4 => log::LevelFilter::Warn,
            5 => log::LevelFilter::Info,
            _ => log::LevelFilter::Trace,
        };
        if log::set_boxed_logger(Box::new(Facade { logger })).is_ok() {
            log::set_max_level(max);
        }
    });
}

/// Adapter routing `log` records into the queue.
struct Facade {
    logger: Logger,
}

impl log::Log for Facade {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        self.logger.enabled(facade_level(metadata.level()))
    }

    fn log(&self, record: &log::Record) {
        let level = facade_level(record.level());
        if !self.logger.enabled(level) {
            return;
        }
        let mut entry = self.logger.shared.take_entry(level);
        if level == Level::Debug {
            let file = record.file().unwrap_or("?");
            let line = record.line().unwrap_or(0);
            entry.tag("source", &source_tag(file, line));
        }
        entry.message.push_str(&record.args().to_string());
        self.logger.enqueue(entry);
    }

    fn flush(&self) {}
}

fn facade_level(level: log::Level) -> Level {
    match level {
        log::Level::Error => Level::Error,
        log::Level::Warn => Level::Warn,
        log::Level::Info => Level::Info,
        log::Level::Debug | log::Level::Trace => Level::Debug,
    }
}

fn source_tag(file: &str, line: u32) -> String {
    let short = file.rsplit('/').next().unwrap_or(file);
    let thread = std::thread::current();
    format!("{}:{}:{}[{:?}]", short, line, thread.name().unwrap_or("?"), thread.id())
}
