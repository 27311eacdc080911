//! Batch video conversion.
//!
//! Enumerates video files, probes them with `ffprobe`, converts them one at a time with `ffmpeg`
//! and applies the configured post-processing to each finished output.
//! All heavy lifting happens in the external tools; this module only orchestrates them.

mod batch;
mod cancel;
mod config;
mod error;
mod events;
mod logger;
mod probe;
mod progress;
mod quality;
mod report;
mod runner;
mod stats;

pub use batch::{BatchConverter, BatchSummary, CompletedJob, ConversionJob, JobOutcome, OutputDisposition, SkipReason};
pub use cancel::CancellationController;
pub use config::{
    BatchConvertConfig, Config, DEFAULT_EXTENSIONS, ProbeStrategy, QualityMode, QualitySetting, Resolution,
};
pub use error::ConvertError;
pub use events::BatchEvent;
pub use logger::{FileLogger, Level, LogLine};
pub use probe::{
    FfprobeProber, GeneralTrack, Media, MediaInfo, ProbedProperties, Prober, StreamTrack, Track, VideoProperties,
    parse_stream_info,
};
pub use progress::{ProgressSample, ProgressTracker, parse_time_to_seconds};
pub use quality::{QualityRange, dynamic_quality};
pub use report::{SidecarReport, sidecar_report_path};
pub use runner::{EncodeProcess, Launcher, LineRead, ProcessExit, ProcessRunner, RunningProcess, TERMINATE_TIMEOUT};
pub use stats::{BatchStatistics, RunStats};
