//! Process-wide logging and error reporting.
//!
//! [`Telemetry::init`] installs the console and rotating-file log sinks and,
//! when a DSN is configured, a Sentry client. The returned handle is shared
//! with the components that report failures and with the panic hook.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::Cell;
use std::fmt::{self, Write as _};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{Event, Subscriber, error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;

pub const LOG_FILE: &str = "whimsy.log";
pub const MAX_LOG_BYTES: u64 = 5 * 1024 * 1024;
pub const LOG_BACKUPS: usize = 3;

const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("failed to open log file: {0}")]
    Io(#[from] io::Error),
    #[error("logger already initialized: {0}")]
    Subscriber(#[from] tracing_subscriber::util::TryInitError),
    #[error("invalid error-reporting DSN: {0}")]
    Dsn(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("error reporter is not enabled")]
    Disabled,
    #[error("error reporter rejected the event: {0}")]
    Rejected(String),
}

/// Destination for errors that should leave the machine.
pub trait ErrorReporter: Send + Sync {
    fn capture_error(&self, error: &(dyn std::error::Error + 'static)) -> Result<(), ReportError>;

    fn capture_panic(&self, message: &str) -> Result<(), ReportError>;

    /// Block until queued events are sent or a short timeout passes.
    fn flush(&self) {}
}

pub struct SentryReporter {
    _guard: sentry::ClientInitGuard,
}

impl SentryReporter {
    pub fn init(dsn: &str) -> Result<Self, TelemetryError> {
        let dsn: sentry::types::Dsn = dsn
            .parse()
            .map_err(|e| TelemetryError::Dsn(format!("{e}")))?;
        let guard = sentry::init(sentry::ClientOptions {
            dsn: Some(dsn),
            release: sentry::release_name!(),
            ..Default::default()
        });
        if !guard.is_enabled() {
            return Err(TelemetryError::Dsn("client is disabled".to_string()));
        }
        Ok(Self { _guard: guard })
    }

    fn ensure_enabled() -> Result<(), ReportError> {
        match sentry::Hub::current().client() {
            Some(client) if client.is_enabled() => Ok(()),
            _ => Err(ReportError::Disabled),
        }
    }
}

impl ErrorReporter for SentryReporter {
    fn capture_error(&self, error: &(dyn std::error::Error + 'static)) -> Result<(), ReportError> {
        Self::ensure_enabled()?;
        sentry::capture_error(error);
        Ok(())
    }

    fn capture_panic(&self, message: &str) -> Result<(), ReportError> {
        Self::ensure_enabled()?;
        sentry::capture_message(message, sentry::Level::Fatal);
        Ok(())
    }

    fn flush(&self) {
        if let Some(client) = sentry::Hub::current().client() {
            client.flush(Some(FLUSH_TIMEOUT));
        }
    }
}

thread_local! {
    // Set while a reporter call is on the stack, so the panic hook does not
    // re-enter a reporter that is itself panicking.
    static IN_REPORTER: Cell<bool> = const { Cell::new(false) };
    // Nesting depth of `catch_panic` on this thread.
    static CATCHING: Cell<usize> = const { Cell::new(0) };
}

pub struct Telemetry {
    reporter: Option<Box<dyn ErrorReporter>>,
}

impl Telemetry {
    /// Install the log sinks and, if `sentry_dsn` is set, the error reporter.
    ///
    /// A reporter that fails to start is logged and left out; only log sink
    /// failures are returned.
    pub fn init(log_dir: &Path, sentry_dsn: Option<&str>) -> Result<Arc<Self>, TelemetryError> {
        fs::create_dir_all(log_dir)?;
        let file = RotatingFile::open(log_dir.join(LOG_FILE), MAX_LOG_BYTES, LOG_BACKUPS)?;

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .event_format(LineFormat)
                    .with_writer(io::stderr),
            )
            .with(
                tracing_subscriber::fmt::layer()
                    .event_format(LineFormat)
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
            .try_init()?;

        let reporter = sentry_dsn.and_then(|dsn| match SentryReporter::init(dsn) {
            Ok(reporter) => {
                info!("Sentry initialized");
                Some(Box::new(reporter) as Box<dyn ErrorReporter>)
            }
            Err(e) => {
                error!(error = %e, "Failed to initialize Sentry; continuing without it");
                None
            }
        });

        Ok(Arc::new(Self::new(reporter)))
    }

    pub fn new(reporter: Option<Box<dyn ErrorReporter>>) -> Self {
        Self { reporter }
    }

    /// Telemetry that only logs.
    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub fn reporting_enabled(&self) -> bool {
        self.reporter.is_some()
    }

    /// Forward an error to the reporter. Never fails and never panics.
    pub fn report(&self, error: &(dyn std::error::Error + 'static)) {
        let Some(reporter) = &self.reporter else {
            return;
        };
        match guarded(|| reporter.capture_error(error)) {
            Ok(Ok(())) => reporter.flush(),
            Ok(Err(e)) => error!(error = %e, "Failed to send exception to error reporter"),
            Err(payload) => error!(
                panic = %panic_message(payload.as_ref()),
                "Error reporter panicked while sending exception"
            ),
        }
    }

    fn report_panic(&self, message: &str) {
        let Some(reporter) = &self.reporter else {
            return;
        };
        if IN_REPORTER.with(Cell::get) {
            return;
        }
        match guarded(|| reporter.capture_panic(message)) {
            Ok(Ok(())) => reporter.flush(),
            Ok(Err(e)) => error!(error = %e, "Failed to notify error reporter about uncaught panic"),
            Err(_) => {}
        }
    }

    /// Log every uncaught panic with a backtrace and report it, then hand
    /// over to the previously installed hook.
    ///
    /// Panics raised inside [`catch_panic`] are recovered by their caller, so
    /// they only get a warning here.
    pub fn install_panic_hook(self: &Arc<Self>) {
        let telemetry = Arc::clone(self);
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let message = panic_message(info.payload());
            let location = info
                .location()
                .map(|l| l.to_string())
                .unwrap_or_else(|| "<unknown>".to_string());
            if telemetry.handle_panic(&message, &location) {
                previous(info);
            }
        }));
    }

    /// Returns whether the panic is uncaught.
    fn handle_panic(&self, message: &str, location: &str) -> bool {
        if CATCHING.with(Cell::get) > 0 {
            warn!(%location, "Recovered from panic: {message}");
            return false;
        }
        let backtrace = Backtrace::force_capture();
        error!(%location, "Uncaught panic: {message}\n{backtrace}");
        self.report_panic(&format!("{message} at {location}"));
        true
    }
}

/// `catch_unwind` that tells the panic hook the panic is handled.
pub fn catch_panic<T>(f: impl FnOnce() -> T) -> std::thread::Result<T> {
    CATCHING.with(|depth| depth.set(depth.get() + 1));
    let result = panic::catch_unwind(AssertUnwindSafe(f));
    CATCHING.with(|depth| depth.set(depth.get() - 1));
    result
}

fn guarded<T>(f: impl FnOnce() -> T) -> std::thread::Result<T> {
    IN_REPORTER.with(|flag| flag.set(true));
    let result = catch_panic(f);
    IN_REPORTER.with(|flag| flag.set(false));
    result
}

pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Box<dyn Any>".to_string()
    }
}

/// `timestamp LEVEL [target] message`
pub struct LineFormat;

impl<S, N> FormatEvent<S, N> for LineFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let meta = event.metadata();
        write!(
            writer,
            "{} {} [{}] ",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S,%3f"),
            meta.level(),
            meta.target()
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Append-only log file that rolls over before a write would reach `max_bytes`.
///
/// Backups are `<path>.1` (newest) through `<path>.<backups>` (oldest).
pub struct RotatingFile {
    path: PathBuf,
    max_bytes: u64,
    backups: usize,
    file: File,
    len: u64,
}

impl RotatingFile {
    pub fn open(path: PathBuf, max_bytes: u64, backups: usize) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            path,
            max_bytes,
            backups,
            file,
            len,
        })
    }

    fn backup_path(&self, n: usize) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(format!(".{n}"));
        PathBuf::from(name)
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        if self.backups == 0 {
            fs::remove_file(&self.path)?;
        } else {
            let oldest = self.backup_path(self.backups);
            if oldest.exists() {
                fs::remove_file(&oldest)?;
            }
            for n in (1..self.backups).rev() {
                let src = self.backup_path(n);
                if src.exists() {
                    fs::rename(&src, self.backup_path(n + 1))?;
                }
            }
            fs::rename(&self.path, self.backup_path(1))?;
        }
        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.len = 0;
        Ok(())
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.len > 0 && self.len + buf.len() as u64 >= self.max_bytes {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.len += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}
