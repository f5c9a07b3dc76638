//! Worker output capture and log file helpers.
use std::{
    collections::VecDeque,
    fs::{self, File, OpenOptions},
    io::{self, BufRead, BufReader, BufWriter, Read, Write},
    path::Path,
    process::{Child, Command, Stdio},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use chrono::Local;
use strum::{AsRefStr, Display, EnumString};
use tracing::{debug, warn};

use crate::{
    constants::{LOG_FLUSH_EVERY_LINES, LOG_TIMESTAMP_FORMAT},
    signal,
};

/// Which worker stream a log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// Appends prefixed lines to a service log, flushing every
/// `flush_every` lines and when dropped.
///
/// Batching bounds what an abrupt kill can lose without paying a flush per line.
pub struct LogWriter<W: Write> {
    inner: BufWriter<W>,
    stream: LogStream,
    flush_every: usize,
    pending: usize,
}

impl LogWriter<File> {
    /// Opens `path` for appending, creating parent directories as needed.
    pub fn open(path: &Path, stream: LogStream) -> io::Result<Self> {
        Ok(Self::new(open_log(path)?, stream, LOG_FLUSH_EVERY_LINES))
    }
}

/// Opens a service log for appending, creating parent directories as needed.
pub fn open_log(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

impl<W: Write> LogWriter<W> {
    pub fn new(writer: W, stream: LogStream, flush_every: usize) -> Self {
        Self {
            inner: BufWriter::new(writer),
            stream,
            flush_every: flush_every.max(1),
            pending: 0,
        }
    }

    /// Writes `[<timestamp>] [<stream>] <text>`.
    pub fn write_line(&mut self, text: &str) -> io::Result<()> {
        let timestamp = Local::now().format(LOG_TIMESTAMP_FORMAT);
        writeln!(self.inner, "[{timestamp}] [{}] {text}", self.stream)?;
        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.pending = 0;
        self.inner.flush()
    }

    /// Pumps `reader` line by line until EOF, then flushes.
    ///
    /// Invalid UTF-8 is replaced rather than dropped.
    pub fn pump<R: Read>(&mut self, reader: R) -> io::Result<()> {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf)? == 0 {
                break;
            }
            let line = String::from_utf8_lossy(&buf);
            self.write_line(line.trim_end_matches(['\r', '\n']))?;
        }
        self.flush()
    }
}

impl<W: Write> Drop for LogWriter<W> {
    fn drop(&mut self) {
        let _ = self.inner.flush();
    }
}

/// Spawns a thread copying one worker stream into an opened service log.
pub fn spawn_log_writer<R, W>(
    service: &str,
    reader: R,
    mut writer: LogWriter<W>,
) -> io::Result<JoinHandle<()>>
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    let service_name = service.to_string();
    let stream = writer.stream;

    thread::Builder::new()
        .name(format!("{service}-{stream}"))
        .spawn(move || {
            if let Err(err) = writer.pump(reader) {
                warn!("Log capture for '{service_name}' ({stream}) stopped: {err}");
            }
            debug!("Log capture for '{service_name}' ({stream}) reached end of stream");
        })
}

/// Waits for reader threads to finish, giving up after `timeout`.
///
/// A worker's own children can keep a pipe open after the worker exits, so
/// draining is bounded. Returns `true` when every reader finished.
pub fn join_readers(readers: Vec<JoinHandle<()>>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    let mut pending = readers;

    while !pending.is_empty() {
        let (done, still_running): (Vec<_>, Vec<_>) =
            pending.into_iter().partition(|handle| handle.is_finished());
        for handle in done {
            let _ = handle.join();
        }
        pending = still_running;

        if pending.is_empty() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(20));
    }

    true
}

/// Copies `reader` into the log at `path` until end of stream.
///
/// This is the body of a relay process: it owns one worker pipe and keeps
/// writing after the invocation that launched the worker has exited.
pub fn relay_stream<R: Read>(reader: R, stream: LogStream, path: &Path) -> io::Result<()> {
    LogWriter::open(path, stream)?.pump(reader)
}

/// Spawns `<program> relay` reading one worker stream from `input`.
///
/// The relay runs in its own session with no terminal output, so neither a
/// Ctrl-C aimed at the controller nor the controller's exit closes the pipe.
pub fn spawn_relay(
    program: &Path,
    service: &str,
    stream: LogStream,
    log_path: &Path,
    input: Stdio,
) -> io::Result<Child> {
    let mut command = Command::new(program);
    command
        .arg("relay")
        .arg("--service")
        .arg(service)
        .arg("--stream")
        .arg(stream.as_ref())
        .arg("--log")
        .arg(log_path)
        .stdin(input)
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    signal::configure(&mut command);

    let relay = command.spawn()?;
    debug!("Relaying {stream} of '{service}' through PID {}", relay.id());
    Ok(relay)
}

/// Waits for relay processes to exit, giving up after `timeout`.
///
/// Relays still running at the deadline are left alone. Returns `true` when
/// every relay exited.
pub fn wait_relays(relays: Vec<Child>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    let mut pending = relays;

    loop {
        pending.retain_mut(|relay| match relay.try_wait() {
            Ok(Some(status)) => {
                if !status.success() {
                    warn!("Log relay (PID {}) exited with {status}", relay.id());
                }
                false
            }
            Ok(None) => true,
            Err(err) => {
                warn!("Failed to poll log relay (PID {}): {err}", relay.id());
                false
            }
        });

        if pending.is_empty() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(20));
    }
}

/// Returns up to the last `lines` lines of the file at `path`.
pub fn tail_lines(path: &Path, lines: usize) -> io::Result<Vec<String>> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut buffer: VecDeque<String> = VecDeque::with_capacity(lines);

    if lines == 0 {
        return Ok(Vec::new());
    }

    for line in reader.lines().map_while(Result::ok) {
        if buffer.len() == lines {
            buffer.pop_front();
        }
        buffer.push_back(line);
    }

    Ok(buffer.into())
}

/// Prints the last `lines` lines of a service log to stdout.
pub fn show_logs(service_name: &str, log_path: &Path, lines: usize) -> io::Result<()> {
    if !log_path.exists() {
        eprintln!("Error: Log file for service '{service_name}' not found.");
        return Ok(());
    }

    for line in tail_lines(log_path, lines)? {
        println!("{line}");
    }

    Ok(())
}
