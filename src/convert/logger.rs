use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use colored::{ColoredString, Colorize};

use crate::convert::batch::{ConversionJob, JobOutcome};
use crate::convert::config::Config;
use crate::convert::stats::RunStats;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Severity of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Info,
    Warning,
    Error,
}

/// Timestamped, severity-tagged diagnostic message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub timestamp: DateTime<Local>,
    pub level: Level,
    pub message: String,
}

/// Buffered run log written to `~/logs/vbatch-tools/vbatch_<timestamp>.log`
#[derive(Debug)]
pub struct FileLogger {
    writer: BufWriter<File>,
    path: PathBuf,
}

impl Level {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
        }
    }
}

impl LogLine {
    #[must_use]
    pub fn new(level: Level, message: impl Into<String>) -> Self {
        Self {
            timestamp: Local::now(),
            level,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn info(message: impl Into<String>) -> Self {
        Self::new(Level::Info, message)
    }

    #[must_use]
    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(Level::Warning, message)
    }

    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Level::Error, message)
    }

    /// Line coloured by severity for terminal output.
    #[must_use]
    pub fn colored(&self) -> ColoredString {
        let text = self.to_string();
        match self.level {
            Level::Info => text.normal(),
            Level::Warning => text.yellow(),
            Level::Error => text.red(),
        }
    }
}

impl FileLogger {
    /// Create a new log file in the default log directory.
    ///
    /// # Errors
    /// Returns an error if the home directory is unknown or the file cannot be created.
    pub fn new() -> Result<Self> {
        let log_dir = crate::config::LOG_DIR
            .as_deref()
            .context("Failed to get home directory")?;
        Self::in_dir(log_dir)
    }

    /// Create a new log file in the given directory.
    ///
    /// # Errors
    /// Returns an error if the directory or file cannot be created.
    pub fn in_dir(log_dir: &Path) -> Result<Self> {
        if !log_dir.exists() {
            fs::create_dir_all(log_dir).context("Failed to create log directory")?;
        }

        let path = log_dir.join(format!("vbatch_{}.log", Local::now().format("%Y-%m-%d_%H-%M-%S")));

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to create log file: {}", path.display()))?;

        Ok(Self {
            writer: BufWriter::new(file),
            path,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn timestamp() -> String {
        Local::now().format(TIMESTAMP_FORMAT).to_string()
    }

    /// Log the effective configuration at the start of a run.
    pub fn log_init(&mut self, config: &Config) {
        let _ = writeln!(self.writer, "[{}] INIT \"{}\"", Self::timestamp(), config.path.display());
        let _ = writeln!(self.writer, "  ffmpeg: {}", config.ffmpeg_path.display());
        let _ = writeln!(self.writer, "  ffprobe: {}", config.ffprobe_path.display());
        if let Some(output_dir) = &config.output_dir {
            let _ = writeln!(self.writer, "  output: {}", output_dir.display());
        }
        let _ = writeln!(self.writer, "  codec: {}", config.codec);
        let _ = writeln!(self.writer, "  hwaccel: {}", config.hwaccel.as_deref().unwrap_or("none"));
        let _ = writeln!(self.writer, "  preset: {}", config.preset);
        let _ = writeln!(self.writer, "  quality: {} {}", config.quality_mode, config.quality);
        let _ = writeln!(self.writer, "  scale: {}", config.scale_envelope);
        if let Some(threshold) = config.bitrate_threshold {
            let _ = writeln!(self.writer, "  bitrate_threshold: {threshold} kbps");
        }
        if !config.include.is_empty() {
            let _ = writeln!(self.writer, "  include: {:?}", config.include);
        }
        if !config.exclude.is_empty() {
            let _ = writeln!(self.writer, "  exclude: {:?}", config.exclude);
        }
        let _ = writeln!(self.writer, "  extensions: {:?}", config.extensions);
        let _ = writeln!(self.writer, "  recurse: {}", config.recurse);
        let _ = writeln!(self.writer, "  save_report: {}", config.save_report);
        let _ = writeln!(self.writer, "  delete_if_larger: {}", config.delete_if_larger);
        let _ = writeln!(self.writer, "  replace_original: {}", config.replace_original);
        let _ = writeln!(self.writer, "  overwrite: {}", config.overwrite);
        let _ = writeln!(self.writer, "  dryrun: {}", config.dryrun);
        if let Some(count) = config.count {
            let _ = writeln!(self.writer, "  count: {count}");
        }
        let _ = self.writer.flush();
    }

    /// Log a diagnostic line as is.
    pub fn log_line(&mut self, line: &LogLine) {
        let _ = writeln!(self.writer, "{line}");
        let _ = self.writer.flush();
    }

    /// Log when a job starts encoding.
    pub fn log_start(&mut self, job: &ConversionJob, details: &str) {
        let _ = writeln!(
            self.writer,
            "[{}] START   {} - \"{}\" | {}",
            Self::timestamp(),
            job.progress_label(),
            job.input_path.display(),
            details
        );
        let _ = self.writer.flush();
    }

    /// Log the final outcome of a job.
    pub fn log_outcome(&mut self, job: &ConversionJob, outcome: &JobOutcome, duration: Duration) {
        let tag = match outcome {
            JobOutcome::Completed(_) => "SUCCESS",
            JobOutcome::Skipped(_) => "SKIP   ",
            JobOutcome::Failed(_) => "ERROR  ",
            JobOutcome::Aborted => "ABORT  ",
        };
        let _ = writeln!(
            self.writer,
            "[{}] {tag} {} - \"{}\" | {} | Time: {}",
            Self::timestamp(),
            job.progress_label(),
            job.input_path.display(),
            outcome,
            crate::format_duration(duration)
        );
        let _ = self.writer.flush();
    }

    /// Log final statistics.
    pub fn log_stats(&mut self, stats: &RunStats) {
        let _ = writeln!(self.writer, "[{}] STATISTICS", Self::timestamp());
        let _ = writeln!(self.writer, "  Files converted: {}", stats.files_converted);
        let _ = writeln!(self.writer, "  Files failed:    {}", stats.files_failed);
        let _ = writeln!(self.writer, "  Files aborted:   {}", stats.files_aborted);
        let _ = writeln!(self.writer, "  Files skipped:   {}", stats.total_skipped());
        if stats.total_skipped() > 0 {
            let _ = writeln!(self.writer, "    - No video info:       {}", stats.files_skipped_no_info);
            let _ = writeln!(self.writer, "    - Below bitrate limit: {}", stats.files_skipped_bitrate);
            let _ = writeln!(self.writer, "    - Output exists:       {}", stats.files_skipped_existing);
            let _ = writeln!(self.writer, "    - Dry run:             {}", stats.files_skipped_dryrun);
        }

        if stats.files_converted > 0 {
            let _ = writeln!(
                self.writer,
                "  Total original size:  {}",
                crate::format_size(stats.total_original_size)
            );
            let _ = writeln!(
                self.writer,
                "  Total converted size: {}",
                crate::format_size(stats.total_converted_size)
            );

            let saved = stats.space_saved();
            if saved >= 0 {
                let _ = writeln!(self.writer, "  Space saved: {}", crate::format_size(saved.unsigned_abs()));
            } else {
                let _ = writeln!(self.writer, "  Space increased: {}", crate::format_size(saved.unsigned_abs()));
            }
        }

        let _ = writeln!(self.writer, "  Total time: {}", crate::format_duration(stats.total_duration));
        let _ = writeln!(self.writer, "[{}] END", Self::timestamp());
        let _ = self.writer.flush();
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {}",
            self.timestamp.format(TIMESTAMP_FORMAT),
            self.level,
            self.message
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::TimeZone;

    #[test]
    fn log_line_display() {
        let line = LogLine {
            timestamp: Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap(),
            level: Level::Warning,
            message: "Skipping clip.mp4".to_string(),
        };
        assert_eq!(line.to_string(), "[2024-03-09 14:05:07] WARNING Skipping clip.mp4");
    }

    #[test]
    fn level_ordering() {
        assert!(Level::Info < Level::Warning);
        assert!(Level::Warning < Level::Error);
        assert_eq!(LogLine::error("x").level, Level::Error);
    }

    #[test]
    fn file_logger_writes_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = FileLogger::in_dir(&dir.path().join("logs")).unwrap();
        logger.log_init(&Config::default());
        logger.log_line(&LogLine::info("Found 2 files"));
        logger.log_stats(&RunStats::default());

        let content = fs::read_to_string(logger.path()).unwrap();
        assert!(content.contains("INIT"));
        assert!(content.contains("  codec: h264_nvenc"));
        assert!(content.contains("INFO Found 2 files"));
        assert!(content.contains("STATISTICS"));
        assert!(content.trim_end().ends_with("END"));
    }
}
