use std::collections::VecDeque;
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Result;
use crossbeam_channel::Sender;
use itertools::Itertools;
use walkdir::WalkDir;

use crate::convert::cancel::CancellationController;
use crate::convert::config::{Config, QualitySetting, Resolution};
use crate::convert::error::ConvertError;
use crate::convert::events::BatchEvent;
use crate::convert::logger::{FileLogger, Level, LogLine};
use crate::convert::probe::{FfprobeProber, MediaInfo, ProbedProperties, Prober, VideoProperties};
use crate::convert::progress::ProgressTracker;
use crate::convert::quality::dynamic_quality;
use crate::convert::report::SidecarReport;
use crate::convert::runner::{EncodeProcess, LineRead, Launcher, ProcessRunner, TERMINATE_TIMEOUT};
use crate::convert::stats::{BatchStatistics, RunStats};

const OUTPUT_EXTENSION: &str = "mp4";
const OUTPUT_SUFFIX: &str = "_nw";

/// How long to wait for a diagnostic line before checking for cancellation again.
const READ_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Number of diagnostic lines kept for the failure message.
const TAIL_LINES: usize = 5;

/// One file to convert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionJob {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    /// Position in the batch, starting from 1.
    pub index: usize,
    pub total_count: usize,
}

/// What happened to the converted output after post-processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputDisposition {
    Kept,
    /// Removed because it was not smaller than the input.
    DiscardedNotSmaller,
    /// Moved over the original, which went to the trash.
    ReplacedOriginal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedJob {
    /// Final location of the converted file.
    pub output: PathBuf,
    pub input_size: u64,
    pub output_size: u64,
    pub disposition: OutputDisposition,
}

/// Reasons why a file was not encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Width, height or duration could not be determined.
    NoVideoInfo,
    InvalidDimensions,
    BelowThreshold { bitrate: u64, threshold: u64 },
    OutputExists { path: PathBuf },
    DryRun,
}

/// Final state of one job.
#[derive(Debug)]
pub enum JobOutcome {
    Completed(CompletedJob),
    Skipped(SkipReason),
    Failed(ConvertError),
    Aborted,
}

/// Result of a batch run.
#[derive(Debug, Default)]
pub struct BatchSummary {
    /// Outcome per started file, in processing order.
    pub outcomes: Vec<(PathBuf, JobOutcome)>,
    pub statistics: BatchStatistics,
    pub run_stats: RunStats,
    /// True if the user stopped the batch before all files were handled.
    pub interrupted: bool,
}

/// Converts all matching files one at a time.
///
/// Owns the cancellation handle for the run;
/// the presentation layer gets a clone and only ever uses it to request a stop.
pub struct BatchConverter<P: Prober = FfprobeProber, L: Launcher = ProcessRunner> {
    config: Config,
    prober: P,
    launcher: L,
    cancel: CancellationController,
    events: Option<Sender<BatchEvent>>,
    logger: Option<FileLogger>,
    statistics: BatchStatistics,
}

impl ConversionJob {
    /// Position label like `[ 3/12]`.
    #[must_use]
    pub fn progress_label(&self) -> String {
        let width = self.total_count.to_string().len();
        format!("[{:>width$}/{}]", self.index, self.total_count)
    }

    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.total_count.saturating_sub(self.index)
    }
}

impl CompletedJob {
    /// Size of the file kept on disk in place of the input.
    #[must_use]
    pub const fn final_size(&self) -> u64 {
        match self.disposition {
            OutputDisposition::DiscardedNotSmaller => self.input_size,
            OutputDisposition::Kept | OutputDisposition::ReplacedOriginal => self.output_size,
        }
    }
}

impl JobOutcome {
    /// Short label for progress displays.
    #[must_use]
    pub fn status_label(&self) -> String {
        match self {
            Self::Completed(_) => "completed".to_string(),
            Self::Skipped(reason) => format!("skipped ({})", reason.label()),
            Self::Failed(_) => "failed".to_string(),
            Self::Aborted => "aborted".to_string(),
        }
    }

    const fn level(&self) -> Level {
        match self {
            Self::Completed(_) => Level::Info,
            Self::Skipped(_) | Self::Aborted => Level::Warning,
            Self::Failed(_) => Level::Error,
        }
    }
}

impl SkipReason {
    const fn label(&self) -> &'static str {
        match self {
            Self::NoVideoInfo => "no video info",
            Self::InvalidDimensions => "invalid dimensions",
            Self::BelowThreshold { .. } => "below bitrate threshold",
            Self::OutputExists { .. } => "output exists",
            Self::DryRun => "dry run",
        }
    }
}

impl BatchConverter {
    /// Create a converter that runs the configured ffmpeg and ffprobe binaries.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let prober = FfprobeProber::new(&config.ffprobe_path, &config.ffmpeg_path, config.probe_strategy);
        let launcher = ProcessRunner::new(&config.ffmpeg_path);
        Self::with_tools(config, prober, launcher)
    }
}

impl<P: Prober, L: Launcher> BatchConverter<P, L> {
    /// Create a converter with custom probe and launch implementations.
    pub fn with_tools(config: Config, prober: P, launcher: L) -> Self {
        Self {
            config,
            prober,
            launcher,
            cancel: CancellationController::new(),
            events: None,
            logger: None,
            statistics: BatchStatistics::new(),
        }
    }

    /// Send status updates to the given channel.
    #[must_use]
    pub fn with_events(mut self, sender: Sender<BatchEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    /// Also write log lines and statistics to a run log file.
    #[must_use]
    pub fn with_logger(mut self, logger: FileLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Handle for requesting a stop from another thread.
    #[must_use]
    pub fn cancellation(&self) -> CancellationController {
        self.cancel.clone()
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Normalized metadata report for a single file.
    ///
    /// # Errors
    /// Returns the probe error if the file could not be probed.
    pub fn media_info(&self, path: &Path) -> Result<MediaInfo, ConvertError> {
        self.prober.media_info(path)
    }

    /// Run the whole batch sequentially.
    ///
    /// Per-file problems are recorded in the returned outcomes.
    ///
    /// # Errors
    /// Returns an error only if the input path cannot be enumerated.
    pub fn run(&mut self) -> Result<BatchSummary> {
        self.statistics.reset();
        let files = self.gather_files()?;
        let total = files.len();

        if let Some(logger) = &mut self.logger {
            logger.log_init(&self.config);
        }
        self.emit(BatchEvent::Started { total });

        if files.is_empty() {
            self.log(LogLine::warning(format!(
                "No video files found in {}",
                self.config.path.display()
            )));
        } else {
            self.log(LogLine::info(format!("Found {total} video file(s)")));
        }

        let mut summary = BatchSummary::default();

        for (position, input) in files.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                summary.interrupted = true;
                break;
            }

            let job = ConversionJob {
                output_path: self.output_path(&input),
                input_path: input,
                index: position + 1,
                total_count: total,
            };
            self.emit(BatchEvent::JobStarted {
                index: job.index,
                total,
                input: job.input_path.clone(),
            });

            let start = Instant::now();
            let outcome = self.process_job(&job);
            let elapsed = start.elapsed();

            if matches!(outcome, JobOutcome::Completed(_)) {
                self.statistics.record(elapsed);
                if let (Some(average), Some(eta)) = (self.statistics.average(), self.statistics.eta(job.remaining())) {
                    self.emit(BatchEvent::BatchEta { average, eta });
                }
            }

            self.log(LogLine::new(
                outcome.level(),
                format!(
                    "{} {}: {outcome}",
                    job.progress_label(),
                    crate::path_to_filename_string(&job.input_path)
                ),
            ));
            if let Some(logger) = &mut self.logger {
                logger.log_outcome(&job, &outcome, elapsed);
            }
            summary.run_stats.add_outcome(&outcome, elapsed);
            self.emit(BatchEvent::JobFinished {
                index: job.index,
                total,
                status: outcome.status_label(),
            });

            let aborted = matches!(outcome, JobOutcome::Aborted);
            summary.outcomes.push((job.input_path, outcome));
            if aborted {
                summary.interrupted = true;
                break;
            }
        }

        if summary.interrupted {
            let not_started = total.saturating_sub(summary.outcomes.len());
            self.log(LogLine::warning(format!(
                "Batch interrupted, {not_started} file(s) not started"
            )));
        }
        if let Some(logger) = &mut self.logger {
            logger.log_stats(&summary.run_stats);
        }
        self.emit(BatchEvent::Finished {
            interrupted: summary.interrupted,
        });

        summary.statistics = self.statistics.clone();
        Ok(summary)
    }

    /// Gather video files based on the config settings, sorted by path.
    ///
    /// # Errors
    /// Returns an error if the input path does not exist.
    pub fn gather_files(&self) -> Result<Vec<PathBuf>> {
        let path = &self.config.path;

        if path.is_file() {
            return Ok(if self.should_include_file(path) {
                vec![path.clone()]
            } else {
                Vec::new()
            });
        }

        if !path.is_dir() {
            anyhow::bail!("Input path '{}' does not exist or is not accessible", path.display());
        }

        let max_depth = if self.config.recurse { usize::MAX } else { 1 };

        let mut files: Vec<PathBuf> = WalkDir::new(path)
            .max_depth(max_depth)
            .into_iter()
            .filter_entry(|entry| entry.depth() == 0 || !crate::is_hidden(entry))
            .filter_map(std::result::Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .map(walkdir::DirEntry::into_path)
            .filter(|file| self.should_include_file(file))
            .collect();

        files.sort();
        if let Some(count) = self.config.count {
            files.truncate(count);
        }
        Ok(files)
    }

    /// Output location for the given input.
    ///
    /// With an output directory the relative sub-directory of the input is kept,
    /// otherwise the output goes next to the input with a `_nw` suffix.
    #[must_use]
    pub fn output_path(&self, input: &Path) -> PathBuf {
        let stem = crate::path_to_file_stem_string(input);
        let suffixed = || input.with_file_name(format!("{stem}{OUTPUT_SUFFIX}.{OUTPUT_EXTENSION}"));

        let Some(output_dir) = &self.config.output_dir else {
            return suffixed();
        };

        let relative_dir = input
            .parent()
            .and_then(|parent| parent.strip_prefix(&self.config.path).ok())
            .unwrap_or_else(|| Path::new(""));

        let output = output_dir.join(relative_dir).join(format!("{stem}.{OUTPUT_EXTENSION}"));
        if output == input { suffixed() } else { output }
    }

    /// Video filter that downscales sources larger than the envelope
    /// and otherwise only normalizes the pixel format.
    #[must_use]
    pub fn scale_filter(&self, source: Resolution) -> String {
        let envelope = self.config.scale_envelope;
        if source.exceeds(&envelope) {
            format!(
                "scale={}:{}:force_original_aspect_ratio=decrease:force_divisible_by=2,format=yuv420p",
                envelope.width, envelope.height
            )
        } else {
            "scale=-1:-1,format=yuv420p".to_string()
        }
    }

    /// Full ffmpeg argument vector for a job.
    #[must_use]
    pub fn build_arguments(&self, job: &ConversionJob, properties: &VideoProperties, quality: u32) -> Vec<OsString> {
        let config = &self.config;
        let mut args = vec![OsString::from("-y")];
        if let Some(hwaccel) = &config.hwaccel {
            args.push("-hwaccel".into());
            args.push(hwaccel.into());
        }
        args.push("-i".into());
        args.push(job.input_path.clone().into_os_string());
        args.push("-vf".into());
        args.push(self.scale_filter(properties.resolution()).into());
        args.push("-c:v".into());
        args.push(config.codec.as_str().into());
        args.push(config.quality_mode.option().into());
        args.push(quality.to_string().into());
        args.push("-preset".into());
        args.push(config.preset.as_str().into());
        args.push("-movflags".into());
        args.push("faststart".into());
        args.push("-c:a".into());
        args.push(config.audio_codec.as_str().into());
        args.push("-b:a".into());
        args.push(config.audio_bitrate.as_str().into());
        args.push(job.output_path.clone().into_os_string());
        args
    }

    /// Check if a file should be converted based on extension, suffix and include/exclude patterns.
    fn should_include_file(&self, path: &Path) -> bool {
        let extension = crate::path_to_file_extension_string(path);
        if !self.config.matches_extension(&extension) {
            return false;
        }

        // Outputs of a previous run
        let stem = crate::path_to_file_stem_string(path);
        if stem.ends_with(OUTPUT_SUFFIX) {
            return false;
        }
        if let Some(output_dir) = &self.config.output_dir
            && path.starts_with(output_dir)
        {
            return false;
        }

        let name = crate::path_to_filename_string(path);
        if !self.config.include.is_empty() && !self.config.include.iter().any(|pattern| name.contains(pattern)) {
            return false;
        }

        !self.config.exclude.iter().any(|pattern| name.contains(pattern))
    }

    /// Probe, encode and post-process one file.
    fn process_job(&mut self, job: &ConversionJob) -> JobOutcome {
        let probed = match self.prober.video_properties(&job.input_path) {
            Ok(probed) => probed,
            Err(error) => {
                self.log(LogLine::warning(error.to_string()));
                ProbedProperties::default()
            }
        };
        if self.cancel.is_cancelled() {
            return JobOutcome::Aborted;
        }

        let properties = match probed.complete(&job.input_path) {
            Ok(properties) => properties,
            Err(error @ ConvertError::InvalidDimensions { .. }) => {
                self.log(LogLine::warning(error.to_string()));
                return JobOutcome::Skipped(SkipReason::InvalidDimensions);
            }
            Err(error) => {
                self.log(LogLine::warning(error.to_string()));
                return JobOutcome::Skipped(SkipReason::NoVideoInfo);
            }
        };

        if let Some(threshold) = self.config.bitrate_threshold {
            match properties.bitrate_kbps {
                Some(bitrate) if bitrate < threshold => {
                    return JobOutcome::Skipped(SkipReason::BelowThreshold { bitrate, threshold });
                }
                Some(_) => {}
                None => self.log(LogLine::warning(format!(
                    "Bitrate unknown for {}, converting anyway",
                    crate::path_to_filename_string(&job.input_path)
                ))),
            }
        }

        if job.output_path.exists() && !self.config.overwrite {
            return JobOutcome::Skipped(SkipReason::OutputExists {
                path: job.output_path.clone(),
            });
        }

        let quality = match self.config.quality {
            QualitySetting::Fixed(value) => value,
            QualitySetting::Dynamic(range) => {
                let Some(value) = dynamic_quality(properties.width, properties.height, &range) else {
                    return JobOutcome::Skipped(SkipReason::InvalidDimensions);
                };
                value
            }
        };

        let args = self.build_arguments(job, &properties, quality);

        if self.config.dryrun {
            let command = std::iter::once(self.config.ffmpeg_path.as_os_str())
                .chain(args.iter().map(OsString::as_os_str))
                .map(|arg| arg.to_string_lossy())
                .join(" ");
            self.log(LogLine::info(command));
            return JobOutcome::Skipped(SkipReason::DryRun);
        }

        if let Some(parent) = job.output_path.parent()
            && !parent.as_os_str().is_empty()
            && let Err(error) = fs::create_dir_all(parent)
        {
            return JobOutcome::Failed(ConvertError::post_process("Create output directory", parent, error));
        }

        let details = format!(
            "{} {:.1}s | {} {quality}",
            properties.resolution(),
            properties.duration_seconds,
            self.config.quality_mode
        );
        self.log(LogLine::info(format!(
            "{} Converting {} | {details}",
            job.progress_label(),
            crate::path_to_filename_string(&job.input_path)
        )));
        if let Some(logger) = &mut self.logger {
            logger.log_start(job, &details);
        }

        match self.encode(job, &properties, &args) {
            Ok(()) => JobOutcome::Completed(self.post_process(job)),
            Err(ConvertError::AbortRequested) => JobOutcome::Aborted,
            Err(error) => JobOutcome::Failed(error),
        }
    }

    /// Run ffmpeg and follow its progress until it exits or the batch is cancelled.
    fn encode(&mut self, job: &ConversionJob, properties: &VideoProperties, args: &[OsString]) -> Result<(), ConvertError> {
        if self.cancel.is_cancelled() {
            return Err(ConvertError::AbortRequested);
        }
        let mut process = self.launcher.launch(args)?;
        let mut tracker = ProgressTracker::new(Some(properties.duration_seconds));
        let mut tail: VecDeque<String> = VecDeque::with_capacity(TAIL_LINES);

        loop {
            if self.cancel.is_cancelled() {
                self.log(LogLine::warning(format!(
                    "Stopping conversion of {}",
                    crate::path_to_filename_string(&job.input_path)
                )));
                if let Err(error) = process.terminate(TERMINATE_TIMEOUT, &self.cancel) {
                    self.log(LogLine::error(format!("Failed to stop ffmpeg: {error}")));
                }
                self.remove_partial_output(&job.output_path);
                return Err(ConvertError::AbortRequested);
            }

            match process.next_line(READ_POLL_INTERVAL) {
                LineRead::Line(line) => {
                    if tracker.update(&line).is_some() {
                        self.emit(BatchEvent::Progress {
                            index: job.index,
                            total: job.total_count,
                            percent: tracker.percentage(),
                            eta: tracker.eta(),
                        });
                    } else {
                        if tail.len() == TAIL_LINES {
                            tail.pop_front();
                        }
                        tail.push_back(line);
                    }
                }
                LineRead::Pending => {}
                LineRead::Closed => break,
            }
        }

        let exit = match process.wait() {
            Ok(exit) => exit,
            Err(error) => {
                self.remove_partial_output(&job.output_path);
                return Err(ConvertError::EncodeFailure {
                    code: None,
                    tail: vec![error.to_string()],
                });
            }
        };

        if exit.success() {
            return Ok(());
        }

        self.remove_partial_output(&job.output_path);
        if self.cancel.is_cancelled() {
            return Err(ConvertError::AbortRequested);
        }
        Err(ConvertError::EncodeFailure {
            code: exit.code,
            tail: tail.into(),
        })
    }

    /// Apply the optional report, size check and replace steps to a finished output.
    /// Each step logs its own failure and never fails the job.
    fn post_process(&mut self, job: &ConversionJob) -> CompletedJob {
        let input_size = file_size(&job.input_path);
        let output_size = file_size(&job.output_path);
        let mut completed = CompletedJob {
            output: job.output_path.clone(),
            input_size,
            output_size,
            disposition: OutputDisposition::Kept,
        };

        if self.config.save_report {
            self.write_report(job);
        }

        if self.config.delete_if_larger && output_size >= input_size {
            match fs::remove_file(&job.output_path) {
                Ok(()) => {
                    self.log(LogLine::warning(format!(
                        "Output is not smaller than the original ({} >= {}), removed {}",
                        crate::format_size(output_size),
                        crate::format_size(input_size),
                        crate::path_to_filename_string(&job.output_path)
                    )));
                    completed.disposition = OutputDisposition::DiscardedNotSmaller;
                }
                Err(error) => {
                    let error = ConvertError::post_process("Delete output", &job.output_path, error);
                    self.log(LogLine::warning(error.to_string()));
                }
            }
        } else if self.config.replace_original && self.replace_original(job) {
            completed.output = job.input_path.clone();
            completed.disposition = OutputDisposition::ReplacedOriginal;
        }

        completed
    }

    fn write_report(&mut self, job: &ConversionJob) {
        let before = self.report_media_info(&job.input_path);
        let after = self.report_media_info(&job.output_path);
        let report = SidecarReport::new(&job.input_path, &job.output_path, before, after);
        match report.write(&job.output_path) {
            Ok(path) => self.log(LogLine::info(format!("Saved report {}", path.display()))),
            Err(error) => self.log(LogLine::warning(error.to_string())),
        }
    }

    /// Media info for the sidecar report. Empty if probing failed.
    fn report_media_info(&mut self, path: &Path) -> MediaInfo {
        match self.prober.media_info(path) {
            Ok(info) => info,
            Err(error) => {
                self.log(LogLine::warning(error.to_string()));
                MediaInfo::default()
            }
        }
    }

    /// Move the original to the trash and put the output in its place.
    /// Returns true if the output now lives at the original path.
    fn replace_original(&mut self, job: &ConversionJob) -> bool {
        let original = &job.input_path;
        if !job.output_path.is_file() {
            self.log(LogLine::warning(format!(
                "Output {} is missing, keeping original",
                job.output_path.display()
            )));
            return false;
        }
        // The trash is not available on network drives
        let removed = if crate::is_network_path(original) {
            fs::remove_file(original).map_err(|error| ConvertError::post_process("Delete original", original, error))
        } else {
            trash::delete(original).map_err(|error| {
                ConvertError::post_process("Move to trash", original, io::Error::other(error.to_string()))
            })
        };
        if let Err(error) = removed {
            self.log(LogLine::warning(error.to_string()));
        }

        if original.exists() {
            self.log(LogLine::warning(format!(
                "Original still exists, keeping output at {}",
                job.output_path.display()
            )));
            return false;
        }

        match fs::rename(&job.output_path, original) {
            Ok(()) => {
                self.log(LogLine::info(format!("Replaced original {}", original.display())));
                true
            }
            Err(error) => {
                let error = ConvertError::post_process("Rename output", &job.output_path, error);
                self.log(LogLine::warning(error.to_string()));
                false
            }
        }
    }

    fn remove_partial_output(&mut self, output: &Path) {
        if !output.exists() {
            return;
        }
        if let Err(error) = fs::remove_file(output) {
            let error = ConvertError::post_process("Remove partial output", output, error);
            self.log(LogLine::warning(error.to_string()));
        }
    }

    fn log(&mut self, line: LogLine) {
        if let Some(logger) = &mut self.logger {
            logger.log_line(&line);
        }
        self.emit(BatchEvent::Log(line));
    }

    fn emit(&self, event: BatchEvent) {
        if let Some(sender) = &self.events {
            // The receiver going away must not stop the batch
            let _ = sender.send(event);
        }
    }
}

fn file_size(path: &Path) -> u64 {
    fs::metadata(path).map(|metadata| metadata.len()).unwrap_or_default()
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoVideoInfo => write!(f, "No video info"),
            Self::InvalidDimensions => write!(f, "Invalid video dimensions"),
            Self::BelowThreshold { bitrate, threshold } => {
                write!(f, "Bitrate {bitrate} kbps is below threshold {threshold} kbps")
            }
            Self::OutputExists { path } => write!(f, "Output file already exists: {}", path.display()),
            Self::DryRun => write!(f, "Dry run"),
        }
    }
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed(job) => {
                let change = if job.input_size > 0 {
                    (job.output_size as f64 - job.input_size as f64) / job.input_size as f64 * 100.0
                } else {
                    0.0
                };
                write!(
                    f,
                    "Converted {} -> {} ({change:+.1}%)",
                    crate::format_size(job.input_size),
                    crate::format_size(job.output_size)
                )
            }
            Self::Skipped(reason) => write!(f, "Skipped: {reason}"),
            Self::Failed(error) => write!(f, "Failed: {error}"),
            Self::Aborted => write!(f, "Aborted"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;

    use crate::convert::runner::ProcessExit;

    /// Prober returning fixed properties per file name.
    #[derive(Default)]
    struct FakeProber {
        properties: HashMap<String, ProbedProperties>,
        /// Cancel the batch while probing.
        cancel_on_probe: Option<CancellationController>,
        /// Diagnostics of a failed report probe for converted outputs.
        output_probe_error: Option<String>,
    }

    impl FakeProber {
        fn with(mut self, name: &str, width: u32, height: u32, duration: Option<f64>) -> Self {
            self.properties.insert(
                name.to_string(),
                ProbedProperties {
                    width: Some(width),
                    height: Some(height),
                    duration_seconds: duration,
                    bitrate_kbps: Some(2000),
                },
            );
            self
        }
    }

    impl Prober for FakeProber {
        fn video_properties(&self, path: &Path) -> Result<ProbedProperties, ConvertError> {
            if let Some(controller) = &self.cancel_on_probe {
                controller.cancel();
            }
            Ok(self
                .properties
                .get(&crate::path_to_filename_string(path))
                .copied()
                .unwrap_or_default())
        }

        fn media_info(&self, path: &Path) -> Result<MediaInfo, ConvertError> {
            match &self.output_probe_error {
                Some(message) if crate::path_to_file_stem_string(path).ends_with(OUTPUT_SUFFIX) => {
                    Err(ConvertError::Probe {
                        path: path.to_path_buf(),
                        message: message.clone(),
                    })
                }
                _ => Ok(MediaInfo::default()),
            }
        }
    }

    /// Launcher that writes a small output file and replays progress lines.
    #[derive(Default)]
    struct FakeLauncher {
        /// Cancel the batch while this input is encoding.
        cancel_during: Option<(String, CancellationController)>,
        exit_code: i32,
        /// Exit successfully without writing an output file.
        skip_output: bool,
        launched: Rc<RefCell<Vec<Vec<OsString>>>>,
    }

    struct FakeProcess {
        lines: VecDeque<String>,
        cancel: Option<CancellationController>,
        exit_code: i32,
        terminated: bool,
    }

    impl Launcher for FakeLauncher {
        type Process = FakeProcess;

        fn launch(&self, args: &[OsString]) -> Result<FakeProcess, ConvertError> {
            self.launched.borrow_mut().push(args.to_vec());
            let input_index = args.iter().position(|arg| arg == "-i").unwrap() + 1;
            let input = PathBuf::from(&args[input_index]);
            let output = PathBuf::from(args.last().unwrap());
            if !self.skip_output {
                fs::write(&output, b"out").unwrap();
            }

            let cancel = self
                .cancel_during
                .as_ref()
                .filter(|(name, _)| *name == crate::path_to_filename_string(&input))
                .map(|(_, controller)| controller.clone());

            Ok(FakeProcess {
                lines: VecDeque::from([
                    "Input #0, mov,mp4".to_string(),
                    "frame=10 time=00:00:05.00 speed=2.0x".to_string(),
                    "frame=20 time=00:00:10.00 speed=2.0x".to_string(),
                ]),
                cancel,
                exit_code: self.exit_code,
                terminated: false,
            })
        }
    }

    impl EncodeProcess for FakeProcess {
        fn next_line(&mut self, _timeout: Duration) -> LineRead {
            if let Some(controller) = self.cancel.take() {
                controller.cancel();
                return LineRead::Pending;
            }
            self.lines.pop_front().map_or(LineRead::Closed, LineRead::Line)
        }

        fn wait(&mut self) -> io::Result<ProcessExit> {
            Ok(ProcessExit {
                code: Some(self.exit_code),
            })
        }

        fn terminate(&mut self, _grace: Duration, _cancel: &CancellationController) -> io::Result<ProcessExit> {
            self.terminated = true;
            Ok(ProcessExit { code: None })
        }
    }

    fn write_inputs(dir: &Path, names: &[&str]) {
        for name in names {
            fs::write(dir.join(name), vec![0_u8; 100]).unwrap();
        }
    }

    fn test_config(dir: &Path) -> Config {
        Config {
            path: dir.to_path_buf(),
            ..Config::default()
        }
    }

    fn three_file_prober() -> FakeProber {
        FakeProber::default()
            .with("a.mp4", 1920, 1080, Some(10.0))
            .with("b.mp4", 1280, 720, Some(10.0))
            .with("c.mp4", 640, 360, Some(10.0))
    }

    #[test]
    fn enumeration_is_case_sensitive() {
        let dir = tempfile::tempdir().unwrap();
        write_inputs(dir.path(), &["a.mp4", "b.txt", "c.MKV"]);

        let converter = BatchConverter::with_tools(test_config(dir.path()), FakeProber::default(), FakeLauncher::default());
        let files = converter.gather_files().unwrap();
        assert_eq!(files, vec![dir.path().join("a.mp4")]);

        let mut config = test_config(dir.path());
        config.case_insensitive_extensions = true;
        let converter = BatchConverter::with_tools(config, FakeProber::default(), FakeLauncher::default());
        assert_eq!(converter.gather_files().unwrap().len(), 2);
    }

    #[test]
    fn enumeration_recurses_and_skips_previous_outputs() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("sub")).unwrap();
        fs::create_dir_all(dir.path().join(".hidden")).unwrap();
        write_inputs(dir.path(), &["a.mp4", "a_nw.mp4", "sub/b.mkv", ".hidden/c.mp4"]);

        let converter = BatchConverter::with_tools(test_config(dir.path()), FakeProber::default(), FakeLauncher::default());
        assert_eq!(
            converter.gather_files().unwrap(),
            vec![dir.path().join("a.mp4"), dir.path().join("sub").join("b.mkv")]
        );

        let mut config = test_config(dir.path());
        config.recurse = false;
        let converter = BatchConverter::with_tools(config, FakeProber::default(), FakeLauncher::default());
        assert_eq!(converter.gather_files().unwrap(), vec![dir.path().join("a.mp4")]);
    }

    #[test]
    fn enumeration_applies_filters_and_count() {
        let dir = tempfile::tempdir().unwrap();
        write_inputs(dir.path(), &["holiday 1.mp4", "holiday 2.mp4", "holiday sample.mp4", "work.mp4"]);

        let mut config = test_config(dir.path());
        config.include = vec!["holiday".to_string()];
        config.exclude = vec!["sample".to_string()];
        config.count = Some(1);
        let converter = BatchConverter::with_tools(config, FakeProber::default(), FakeLauncher::default());
        assert_eq!(converter.gather_files().unwrap(), vec![dir.path().join("holiday 1.mp4")]);
    }

    #[test]
    fn missing_input_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut converter = BatchConverter::with_tools(
            test_config(&dir.path().join("missing")),
            FakeProber::default(),
            FakeLauncher::default(),
        );
        assert!(converter.run().is_err());
    }

    #[test]
    fn output_naming() {
        let dir = Path::new("/videos");
        let mut config = test_config(dir);
        let converter = BatchConverter::with_tools(config.clone(), FakeProber::default(), FakeLauncher::default());
        assert_eq!(
            converter.output_path(Path::new("/videos/trip/clip.avi")),
            PathBuf::from("/videos/trip/clip_nw.mp4")
        );

        config.output_dir = Some(PathBuf::from("/converted"));
        let converter = BatchConverter::with_tools(config.clone(), FakeProber::default(), FakeLauncher::default());
        assert_eq!(
            converter.output_path(Path::new("/videos/trip/clip.avi")),
            PathBuf::from("/converted/trip/clip.mp4")
        );

        config.output_dir = Some(PathBuf::from("/videos"));
        let converter = BatchConverter::with_tools(config, FakeProber::default(), FakeLauncher::default());
        assert_eq!(
            converter.output_path(Path::new("/videos/clip.mp4")),
            PathBuf::from("/videos/clip_nw.mp4")
        );
    }

    #[test]
    fn argument_vector() {
        let converter = BatchConverter::with_tools(
            test_config(Path::new("/videos")),
            FakeProber::default(),
            FakeLauncher::default(),
        );
        let job = ConversionJob {
            input_path: PathBuf::from("/videos/in.mkv"),
            output_path: PathBuf::from("/videos/in_nw.mp4"),
            index: 1,
            total_count: 1,
        };
        let properties = VideoProperties {
            width: 1920,
            height: 1080,
            duration_seconds: 60.0,
            bitrate_kbps: None,
        };
        let args: Vec<String> = converter
            .build_arguments(&job, &properties, 23)
            .iter()
            .map(|arg| arg.to_string_lossy().to_string())
            .collect();
        assert_eq!(
            args,
            vec![
                "-y",
                "-hwaccel",
                "auto",
                "-i",
                "/videos/in.mkv",
                "-vf",
                "scale=1280:720:force_original_aspect_ratio=decrease:force_divisible_by=2,format=yuv420p",
                "-c:v",
                "h264_nvenc",
                "-crf",
                "23",
                "-preset",
                "fast",
                "-movflags",
                "faststart",
                "-c:a",
                "aac",
                "-b:a",
                "128k",
                "/videos/in_nw.mp4",
            ]
        );
    }

    #[test]
    fn scale_filter_passes_through_small_sources() {
        let mut config = test_config(Path::new("."));
        config.hwaccel = None;
        let converter = BatchConverter::with_tools(config, FakeProber::default(), FakeLauncher::default());
        assert_eq!(
            converter.scale_filter(Resolution::new(1280, 720)),
            "scale=-1:-1,format=yuv420p"
        );
        assert!(converter.scale_filter(Resolution::new(720, 1280)).starts_with("scale=1280:720"));
    }

    #[test]
    fn missing_duration_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_inputs(dir.path(), &["a.mp4", "b.mp4", "c.mp4"]);
        let prober = three_file_prober().with("b.mp4", 1280, 720, None);

        let (sender, receiver) = crossbeam_channel::unbounded();
        let mut converter =
            BatchConverter::with_tools(test_config(dir.path()), prober, FakeLauncher::default()).with_events(sender);
        let summary = converter.run().unwrap();

        assert!(!summary.interrupted);
        assert_eq!(summary.outcomes.len(), 3);
        assert!(matches!(summary.outcomes[0].1, JobOutcome::Completed(_)));
        assert!(matches!(
            summary.outcomes[1].1,
            JobOutcome::Skipped(SkipReason::NoVideoInfo)
        ));
        assert!(matches!(summary.outcomes[2].1, JobOutcome::Completed(_)));
        assert_eq!(summary.statistics.len(), 2);
        assert_eq!(summary.run_stats.files_converted, 2);

        let events: Vec<BatchEvent> = receiver.try_iter().collect();
        assert!(matches!(events.first(), Some(BatchEvent::Started { total: 3 })));
        assert!(matches!(events.last(), Some(BatchEvent::Finished { interrupted: false })));
        let progress: Vec<f64> = events
            .iter()
            .filter_map(|event| match event {
                BatchEvent::Progress { percent, .. } => *percent,
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![50.0, 100.0, 50.0, 100.0]);

        let etas: Vec<(Duration, Duration)> = events
            .iter()
            .filter_map(|event| match event {
                BatchEvent::BatchEta { average, eta } => Some((*average, *eta)),
                _ => None,
            })
            .collect();
        assert_eq!(etas.len(), 2);
        // Two files remain after the first one, none after the last
        assert_eq!(etas[0].1, etas[0].0.mul_f64(2.0));
        assert_eq!(etas[1].1, Duration::ZERO);
        assert_eq!(Some(etas[1].0), summary.statistics.average());
    }

    #[test]
    fn cancellation_during_second_file() {
        let dir = tempfile::tempdir().unwrap();
        write_inputs(dir.path(), &["a.mp4", "b.mp4", "c.mp4"]);

        let launched = Rc::new(RefCell::new(Vec::new()));
        let mut converter = BatchConverter::with_tools(test_config(dir.path()), three_file_prober(), FakeLauncher::default());
        let launcher = FakeLauncher {
            cancel_during: Some(("b.mp4".to_string(), converter.cancellation())),
            launched: Rc::clone(&launched),
            ..FakeLauncher::default()
        };
        converter.launcher = launcher;

        let summary = converter.run().unwrap();

        assert!(summary.interrupted);
        assert_eq!(summary.outcomes.len(), 2);
        assert!(matches!(summary.outcomes[0].1, JobOutcome::Completed(_)));
        assert!(matches!(summary.outcomes[1].1, JobOutcome::Aborted));
        assert!(!dir.path().join("b_nw.mp4").exists());
        assert!(dir.path().join("a_nw.mp4").exists());
        assert!(!dir.path().join("c_nw.mp4").exists());
        assert_eq!(launched.borrow().len(), 2);
        assert_eq!(summary.statistics.len(), 1);
        assert_eq!(summary.run_stats.files_aborted, 1);
    }

    #[test]
    fn cancelled_before_start_runs_nothing() {
        let dir = tempfile::tempdir().unwrap();
        write_inputs(dir.path(), &["a.mp4"]);
        let mut converter = BatchConverter::with_tools(test_config(dir.path()), three_file_prober(), FakeLauncher::default());
        converter.cancellation().cancel();

        let summary = converter.run().unwrap();
        assert!(summary.interrupted);
        assert!(summary.outcomes.is_empty());
    }

    #[test]
    fn cancellation_before_launch_starts_nothing() {
        let dir = tempfile::tempdir().unwrap();
        write_inputs(dir.path(), &["a.mp4", "b.mp4"]);
        let launched = Rc::new(RefCell::new(Vec::new()));
        let launcher = FakeLauncher {
            launched: Rc::clone(&launched),
            ..FakeLauncher::default()
        };
        let mut converter = BatchConverter::with_tools(test_config(dir.path()), three_file_prober(), launcher);
        converter.prober.cancel_on_probe = Some(converter.cancellation());

        let summary = converter.run().unwrap();
        assert!(summary.interrupted);
        assert_eq!(summary.outcomes.len(), 1);
        assert!(matches!(summary.outcomes[0].1, JobOutcome::Aborted));
        assert!(launched.borrow().is_empty());
        assert!(!dir.path().join("a_nw.mp4").exists());
        assert_eq!(summary.run_stats.files_aborted, 1);
    }

    #[test]
    fn encode_failure_removes_output() {
        let dir = tempfile::tempdir().unwrap();
        write_inputs(dir.path(), &["a.mp4"]);
        let launcher = FakeLauncher {
            exit_code: 1,
            ..FakeLauncher::default()
        };
        let mut converter = BatchConverter::with_tools(test_config(dir.path()), three_file_prober(), launcher);

        let summary = converter.run().unwrap();
        match &summary.outcomes[0].1 {
            JobOutcome::Failed(ConvertError::EncodeFailure { code, tail }) => {
                assert_eq!(*code, Some(1));
                assert_eq!(tail, &vec!["Input #0, mov,mp4".to_string()]);
            }
            other => panic!("Unexpected outcome: {other:?}"),
        }
        assert!(!dir.path().join("a_nw.mp4").exists());
        assert!(summary.statistics.is_empty());
    }

    #[test]
    fn bitrate_threshold_and_existing_output_skip() {
        let dir = tempfile::tempdir().unwrap();
        write_inputs(dir.path(), &["a.mp4", "b.mp4", "b_nw.mp4"]);

        let mut config = test_config(dir.path());
        config.bitrate_threshold = Some(5000);
        let mut converter = BatchConverter::with_tools(config, three_file_prober(), FakeLauncher::default());
        let summary = converter.run().unwrap();
        assert!(matches!(
            summary.outcomes[0].1,
            JobOutcome::Skipped(SkipReason::BelowThreshold {
                bitrate: 2000,
                threshold: 5000
            })
        ));

        let mut converter = BatchConverter::with_tools(test_config(dir.path()), three_file_prober(), FakeLauncher::default());
        let summary = converter.run().unwrap();
        assert!(matches!(summary.outcomes[0].1, JobOutcome::Completed(_)));
        assert!(matches!(
            summary.outcomes[1].1,
            JobOutcome::Skipped(SkipReason::OutputExists { .. })
        ));
    }

    #[test]
    fn dry_run_launches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        write_inputs(dir.path(), &["a.mp4"]);
        let launched = Rc::new(RefCell::new(Vec::new()));
        let launcher = FakeLauncher {
            launched: Rc::clone(&launched),
            ..FakeLauncher::default()
        };
        let mut config = test_config(dir.path());
        config.dryrun = true;
        let mut converter = BatchConverter::with_tools(config, three_file_prober(), launcher);

        let summary = converter.run().unwrap();
        assert!(matches!(summary.outcomes[0].1, JobOutcome::Skipped(SkipReason::DryRun)));
        assert!(launched.borrow().is_empty());
    }

    #[test]
    fn delete_if_larger_discards_output() {
        let dir = tempfile::tempdir().unwrap();
        // Input is smaller than the three byte fake output
        fs::write(dir.path().join("a.mp4"), b"ab").unwrap();

        let mut config = test_config(dir.path());
        config.delete_if_larger = true;
        config.save_report = true;
        let mut converter = BatchConverter::with_tools(config, three_file_prober(), FakeLauncher::default());

        let summary = converter.run().unwrap();
        match &summary.outcomes[0].1 {
            JobOutcome::Completed(job) => assert_eq!(job.disposition, OutputDisposition::DiscardedNotSmaller),
            other => panic!("Unexpected outcome: {other:?}"),
        }
        assert!(!dir.path().join("a_nw.mp4").exists());
        assert!(dir.path().join("a_nw_mediainfo.json").exists());
        assert!(dir.path().join("a.mp4").exists());
    }

    #[test]
    fn report_media_info_failure_is_logged() {
        let dir = tempfile::tempdir().unwrap();
        write_inputs(dir.path(), &["a.mp4"]);
        let prober = FakeProber {
            output_probe_error: Some("moov atom not found".to_string()),
            ..three_file_prober()
        };

        let mut config = test_config(dir.path());
        config.save_report = true;
        let (sender, receiver) = crossbeam_channel::unbounded();
        let mut converter = BatchConverter::with_tools(config, prober, FakeLauncher::default()).with_events(sender);

        let summary = converter.run().unwrap();
        assert!(matches!(summary.outcomes[0].1, JobOutcome::Completed(_)));
        assert!(dir.path().join("a_nw_mediainfo.json").exists());

        let warnings: Vec<String> = receiver
            .try_iter()
            .filter_map(|event| match event {
                BatchEvent::Log(line) if line.level == Level::Warning => Some(line.message),
                _ => None,
            })
            .collect();
        assert!(
            warnings.iter().any(|message| message.contains("moov atom not found")),
            "{warnings:?}"
        );
    }

    #[test]
    fn replace_original_moves_output_into_place() {
        let dir = tempfile::tempdir().unwrap();
        write_inputs(dir.path(), &["a.mp4"]);

        let mut config = test_config(dir.path());
        config.replace_original = true;
        let mut converter = BatchConverter::with_tools(config, three_file_prober(), FakeLauncher::default());

        let summary = converter.run().unwrap();
        match &summary.outcomes[0].1 {
            JobOutcome::Completed(job) => {
                assert_eq!(job.disposition, OutputDisposition::ReplacedOriginal);
                assert_eq!(job.output, dir.path().join("a.mp4"));
            }
            other => panic!("Unexpected outcome: {other:?}"),
        }
        assert_eq!(fs::read(dir.path().join("a.mp4")).unwrap(), b"out");
        assert!(!dir.path().join("a_nw.mp4").exists());
        assert_eq!(summary.run_stats.files_replaced, 1);
    }

    #[test]
    fn replace_original_keeps_original_without_output() {
        let dir = tempfile::tempdir().unwrap();
        write_inputs(dir.path(), &["a.mp4"]);
        let launcher = FakeLauncher {
            skip_output: true,
            ..FakeLauncher::default()
        };

        let mut config = test_config(dir.path());
        config.replace_original = true;
        let (sender, receiver) = crossbeam_channel::unbounded();
        let mut converter = BatchConverter::with_tools(config, three_file_prober(), launcher).with_events(sender);

        let summary = converter.run().unwrap();
        match &summary.outcomes[0].1 {
            JobOutcome::Completed(job) => assert_eq!(job.disposition, OutputDisposition::Kept),
            other => panic!("Unexpected outcome: {other:?}"),
        }
        assert_eq!(fs::read(dir.path().join("a.mp4")).unwrap(), vec![0_u8; 100]);

        let warned = receiver.try_iter().any(|event| {
            matches!(event, BatchEvent::Log(line) if line.level == Level::Warning && line.message.contains("keeping original"))
        });
        assert!(warned);
    }

    #[test]
    fn fixed_quality_is_used() {
        let dir = tempfile::tempdir().unwrap();
        write_inputs(dir.path(), &["a.mp4"]);
        let launched = Rc::new(RefCell::new(Vec::new()));
        let launcher = FakeLauncher {
            launched: Rc::clone(&launched),
            ..FakeLauncher::default()
        };
        let mut config = test_config(dir.path());
        config.quality = QualitySetting::Fixed(31);
        let mut converter = BatchConverter::with_tools(config, three_file_prober(), launcher);
        converter.run().unwrap();

        let args = &launched.borrow()[0];
        let position = args.iter().position(|arg| arg == "-crf").unwrap();
        assert_eq!(args[position + 1], "31");
    }

    #[test]
    fn progress_label_is_padded() {
        let job = ConversionJob {
            input_path: PathBuf::from("a.mp4"),
            output_path: PathBuf::from("a_nw.mp4"),
            index: 3,
            total_count: 12,
        };
        assert_eq!(job.progress_label(), "[ 3/12]");
        assert_eq!(job.remaining(), 9);
    }
}
