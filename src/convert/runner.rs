use std::ffi::OsString;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};

use crate::convert::cancel::CancellationController;
use crate::convert::error::ConvertError;

/// How long a stopped tool gets to exit on its own before it is killed.
pub const TERMINATE_TIMEOUT: Duration = Duration::from_secs(5);

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Result of waiting for the next diagnostic line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineRead {
    Line(String),
    /// Nothing arrived within the timeout.
    Pending,
    /// The stream reached end of file.
    Closed,
}

/// Exit status of a finished subprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// `None` when the process was ended by a signal.
    pub code: Option<i32>,
}

/// A running encode.
pub trait EncodeProcess {
    /// Wait up to `timeout` for the next line of diagnostic output.
    fn next_line(&mut self, timeout: Duration) -> LineRead;

    /// Block until the process exits.
    fn wait(&mut self) -> io::Result<ProcessExit>;

    /// Ask the process to stop, killing it if it is still running after `grace`
    /// or as soon as the stop is forced through `cancel`.
    fn terminate(&mut self, grace: Duration, cancel: &CancellationController) -> io::Result<ProcessExit>;
}

/// Starts encode subprocesses.
pub trait Launcher {
    type Process: EncodeProcess;

    /// Start the tool with the given arguments.
    ///
    /// # Errors
    /// Returns [`ConvertError::Launch`] if the binary is missing or cannot be started.
    fn launch(&self, args: &[OsString]) -> Result<Self::Process, ConvertError>;
}

/// Runs the external transcoder as a subprocess.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    program: PathBuf,
}

/// A transcoder subprocess with its diagnostic stream read on a background thread.
#[derive(Debug)]
pub struct RunningProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    lines: Receiver<String>,
    reader: Option<JoinHandle<()>>,
    exit: Option<ProcessExit>,
}

impl ProcessExit {
    #[must_use]
    pub const fn success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

impl From<ExitStatus> for ProcessExit {
    fn from(status: ExitStatus) -> Self {
        Self { code: status.code() }
    }
}

impl ProcessRunner {
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    #[must_use]
    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl Launcher for ProcessRunner {
    type Process = RunningProcess;

    fn launch(&self, args: &[OsString]) -> Result<RunningProcess, ConvertError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        isolate_command(&mut cmd);

        let mut child = cmd.spawn().map_err(|source| ConvertError::Launch {
            tool: self.program.display().to_string(),
            source,
        })?;

        let stdin = child.stdin.take();
        let stderr = child.stderr.take().ok_or_else(|| ConvertError::Launch {
            tool: self.program.display().to_string(),
            source: io::Error::other("stderr was not captured"),
        })?;

        let (sender, lines) = crossbeam_channel::unbounded();
        let reader = std::thread::spawn(move || {
            for line in DiagnosticLines::new(stderr) {
                if sender.send(line).is_err() {
                    break;
                }
            }
        });

        Ok(RunningProcess {
            child,
            stdin,
            lines,
            reader: Some(reader),
            exit: None,
        })
    }
}

impl RunningProcess {
    fn join_reader(&mut self) {
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }

    /// Poll for exit until the deadline or a forced stop.
    fn wait_until(&mut self, deadline: Instant, cancel: &CancellationController) -> io::Result<Option<ProcessExit>> {
        loop {
            if let Some(status) = self.child.try_wait()? {
                return Ok(Some(status.into()));
            }
            if cancel.is_forced() || Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(EXIT_POLL_INTERVAL);
        }
    }
}

impl EncodeProcess for RunningProcess {
    fn next_line(&mut self, timeout: Duration) -> LineRead {
        match self.lines.recv_timeout(timeout) {
            Ok(line) => LineRead::Line(line),
            Err(RecvTimeoutError::Timeout) => LineRead::Pending,
            Err(RecvTimeoutError::Disconnected) => LineRead::Closed,
        }
    }

    fn wait(&mut self) -> io::Result<ProcessExit> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }
        // Closing stdin lets a tool waiting for input exit
        drop(self.stdin.take());
        let exit = ProcessExit::from(self.child.wait()?);
        self.exit = Some(exit);
        self.join_reader();
        Ok(exit)
    }

    fn terminate(&mut self, grace: Duration, cancel: &CancellationController) -> io::Result<ProcessExit> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }
        // ffmpeg finishes cleanly when it reads 'q' from stdin
        if let Some(mut stdin) = self.stdin.take() {
            let _ = stdin.write_all(b"q\n");
            let _ = stdin.flush();
        }

        let exit = if let Some(exit) = self.wait_until(Instant::now() + grace, cancel)? {
            exit
        } else {
            self.child.kill()?;
            ProcessExit::from(self.child.wait()?)
        };

        self.exit = Some(exit);
        self.join_reader();
        Ok(exit)
    }
}

impl Drop for RunningProcess {
    fn drop(&mut self) {
        if self.exit.is_none() && matches!(self.child.try_wait(), Ok(None)) {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Splits a diagnostic stream into lines on both `\n` and `\r`.
///
/// ffmpeg rewrites its status line in place with carriage returns,
/// so splitting only on newlines would deliver progress only when the encode ends.
pub(crate) struct DiagnosticLines<R> {
    reader: BufReader<R>,
    buffer: Vec<u8>,
    done: bool,
}

impl<R: Read> DiagnosticLines<R> {
    pub(crate) fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            buffer: Vec::new(),
            done: false,
        }
    }

    fn take_line(&mut self) -> String {
        let line = String::from_utf8_lossy(&self.buffer).trim_end().to_string();
        self.buffer.clear();
        line
    }
}

impl<R: Read> Iterator for DiagnosticLines<R> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        while !self.done {
            let (consumed, found) = match self.reader.fill_buf() {
                Ok([]) => {
                    self.done = true;
                    break;
                }
                Ok(available) => {
                    if let Some(pos) = available.iter().position(|&b| b == b'\n' || b == b'\r') {
                        self.buffer.extend_from_slice(&available[..pos]);
                        (pos + 1, true)
                    } else {
                        self.buffer.extend_from_slice(available);
                        (available.len(), false)
                    }
                }
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => {
                    self.done = true;
                    break;
                }
            };
            self.reader.consume(consumed);
            if found {
                if self.buffer.is_empty() {
                    // "\r\n" pairs and blank lines
                    continue;
                }
                return Some(self.take_line());
            }
        }
        if self.buffer.is_empty() {
            None
        } else {
            Some(self.take_line())
        }
    }
}

/// Run a command in its own process group so a terminal Ctrl+C only reaches this program,
/// which then stops the tool itself. On Windows the tool also gets no console window.
pub(crate) fn isolate_command(cmd: &mut Command) {
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        cmd.creation_flags(CREATE_NEW_PROCESS_GROUP | CREATE_NO_WINDOW);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
}
