//! Structured log emission.
//!
//! Log records are tab-delimited lines stamped with the current request id.
//! They are written either straight to stdout, or as length-prefixed binary
//! frames to a file descriptor handed to the process at startup. The target
//! is selected exactly once per process lifetime.
//!
//! Frame layout, big-endian:
//!
//! ```text
//! +----------------------+------------------------+-----------------------+
//! | frame type - 4 bytes | length (len) - 4 bytes | message - len bytes   |
//! +----------------------+------------------------+-----------------------+
//! ```

use std::fmt::Write as _;
use std::fs::File;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields, MakeWriter};
use tracing_subscriber::registry::LookupSpan;

pub const TELEMETRY_LOG_FD_ENV: &str = "_LAMBDA_TELEMETRY_LOG_FD";
pub const FRAME_TYPE_LOG: u32 = 0xa55a_0001;

const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

// Single process-wide slot. Safe without further coordination because exactly
// one invocation is in flight at a time; each new invocation overwrites it.
static CURRENT_REQUEST_ID: Mutex<Option<String>> = Mutex::new(None);

/// Publish the request id stamped onto every subsequent log line.
pub fn set_current_request_id(id: impl Into<String>) {
    if let Ok(mut slot) = CURRENT_REQUEST_ID.lock() {
        *slot = Some(id.into());
    }
}

fn current_request_id() -> String {
    CURRENT_REQUEST_ID
        .lock()
        .ok()
        .and_then(|slot| slot.clone())
        .unwrap_or_default()
}

/// Where log records go for the life of the process.
#[derive(Clone)]
pub enum LogTarget {
    Stdout,
    Fd(Arc<File>),
}

impl LogTarget {
    /// Select the target from the environment. The file-descriptor variable
    /// is consumed here and cleared so nothing downstream re-reads it.
    pub fn from_env() -> Self {
        match std::env::var(TELEMETRY_LOG_FD_ENV) {
            Ok(raw) => {
                std::env::remove_var(TELEMETRY_LOG_FD_ENV);
                match raw.parse::<i32>() {
                    // The platform hands us exclusive ownership of this
                    // descriptor for the life of the process.
                    Ok(fd) => {
                        use std::os::unix::io::FromRawFd;
                        LogTarget::Fd(Arc::new(unsafe { File::from_raw_fd(fd) }))
                    }
                    Err(_) => LogTarget::Stdout,
                }
            }
            Err(_) => LogTarget::Stdout,
        }
    }

    pub fn framed(&self) -> bool {
        matches!(self, LogTarget::Fd(_))
    }
}

/// Wraps each write in a type + length header.
pub struct FrameWriter<W: Write> {
    out: W,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn write_frame(&mut self, payload: &[u8]) -> io::Result<()> {
        let mut header = [0u8; 8];
        header[..4].copy_from_slice(&FRAME_TYPE_LOG.to_be_bytes());
        header[4..].copy_from_slice(&(payload.len() as u32).to_be_bytes());
        self.out.write_all(&header)?;
        self.out.write_all(payload)
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> Write for FrameWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_frame(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

/// `io::Write` over a shared descriptor.
pub struct SharedFd(Arc<File>);

impl Write for SharedFd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&*self.0).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        (&*self.0).flush()
    }
}

pub enum TelemetryWriter {
    Plain(io::Stdout),
    Framed(FrameWriter<SharedFd>),
}

impl Write for TelemetryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            TelemetryWriter::Plain(out) => out.write(buf),
            TelemetryWriter::Framed(out) => out.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            TelemetryWriter::Plain(out) => out.flush(),
            TelemetryWriter::Framed(out) => out.flush(),
        }
    }
}

#[derive(Clone)]
pub struct TelemetrySink {
    target: LogTarget,
}

impl TelemetrySink {
    pub fn new(target: LogTarget) -> Self {
        Self { target }
    }
}

impl<'a> MakeWriter<'a> for TelemetrySink {
    type Writer = TelemetryWriter;

    fn make_writer(&'a self) -> Self::Writer {
        match &self.target {
            LogTarget::Stdout => TelemetryWriter::Plain(io::stdout()),
            LogTarget::Fd(file) => {
                TelemetryWriter::Framed(FrameWriter::new(SharedFd(file.clone())))
            }
        }
    }
}

/// `<ISO8601 time>\t<requestId-or-empty>\t<LEVEL>\t<message>` formatting.
pub struct LineFormat {
    collapse_newlines: bool,
}

impl LineFormat {
    /// Plain-text lines collapse embedded newlines so one record stays one
    /// line; framed records are length-delimited and keep them.
    pub fn for_target(target: &LogTarget) -> Self {
        Self {
            collapse_newlines: !target.framed(),
        }
    }
}

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
    ) -> std::fmt::Result {
        let mut message = String::new();
        ctx.format_fields(Writer::new(&mut message), event)?;

        let line = render_line(
            &Utc::now().format(TIME_FORMAT).to_string(),
            &current_request_id(),
            level_name(*event.metadata().level()),
            &message,
            self.collapse_newlines,
        );
        writeln!(writer, "{line}")
    }
}

fn render_line(
    time: &str,
    request_id: &str,
    level: &str,
    message: &str,
    collapse_newlines: bool,
) -> String {
    let line = format!("{time}\t{request_id}\t{level}\t{message}");
    if collapse_newlines {
        line.replace('\n', "\r")
    } else {
        line
    }
}

fn level_name(level: Level) -> &'static str {
    match level {
        Level::ERROR => "ERROR",
        Level::WARN => "WARN",
        Level::INFO => "INFO",
        Level::DEBUG => "DEBUG",
        Level::TRACE => "TRACE",
    }
}

/// Install the process-wide subscriber writing to the selected target.
pub fn init() {
    let target = LogTarget::from_env();
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .event_format(LineFormat::for_target(&target))
        .with_writer(TelemetrySink::new(target))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_length_matches_payload_and_reads_back() {
        let line = "2024-01-01T00:00:00.000Z\tid-1\tINFO\thello\n";
        let mut writer = FrameWriter::new(Vec::new());
        writer.write_frame(line.as_bytes()).unwrap();
        let buf = writer.into_inner();

        let magic = u32::from_be_bytes(buf[..4].try_into().unwrap());
        assert_eq!(magic, 0xa55a_0001);

        let length = u32::from_be_bytes(buf[4..8].try_into().unwrap()) as usize;
        assert_eq!(length, line.len());
        assert_eq!(buf.len(), 8 + length);
        assert_eq!(&buf[8..], line.as_bytes());
        assert!(buf.ends_with(b"\n"));
    }

    #[test]
    fn each_write_is_its_own_frame() {
        let mut writer = FrameWriter::new(Vec::new());
        writer.write_all(b"one\n").unwrap();
        writer.write_all(b"two\n").unwrap();
        let buf = writer.into_inner();

        let first_len = u32::from_be_bytes(buf[4..8].try_into().unwrap()) as usize;
        assert_eq!(first_len, 4);
        let second_start = 8 + first_len;
        let magic = u32::from_be_bytes(buf[second_start..second_start + 4].try_into().unwrap());
        assert_eq!(magic, FRAME_TYPE_LOG);
    }

    #[test]
    fn plain_lines_collapse_embedded_newlines() {
        let line = render_line("t", "req", "INFO", "line one\nline two", true);
        assert_eq!(line, "t\treq\tINFO\tline one\rline two");
    }

    #[test]
    fn framed_lines_keep_embedded_newlines() {
        let line = render_line("t", "req", "INFO", "line one\nline two", false);
        assert_eq!(line, "t\treq\tINFO\tline one\nline two");
    }

    #[test]
    fn line_has_four_tab_separated_fields() {
        let line = render_line("2024-01-01T00:00:00.000Z", "", "WARN", "content", true);
        assert_eq!(line.split('\t').count(), 4);
        assert_eq!(line.split('\t').nth(2), Some("WARN"));
    }

    #[test]
    fn request_id_is_the_second_field() {
        set_current_request_id("some fake request id");
        let line = render_line("t", &current_request_id(), "INFO", "something", true);
        assert_eq!(line.split('\t').nth(1), Some("some fake request id"));
    }
}
