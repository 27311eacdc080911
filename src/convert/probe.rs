//! Media metadata from the external probe tool.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::LazyLock;

use chrono::{DateTime, Datelike, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::convert::config::{ProbeStrategy, Resolution};
use crate::convert::error::ConvertError;
use crate::convert::runner::isolate_command;

static RE_RESOLUTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(\d{2,5})x(\d{2,5})\b").expect("Failed to create regex pattern for resolution")
});

static RE_DURATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Duration:\s*(\d+):(\d+):(\d+(?:\.\d+)?)").expect("Failed to create regex pattern for duration")
});

static RE_BITRATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Duration:.*bitrate:\s*(\d+)\s*kb/s").expect("Failed to create regex pattern for bitrate")
});

const FORMAT_ENTRIES: &str = "format=format_name,format_long_name,duration,bit_rate";
const STREAM_ENTRIES: &str = "stream=index,codec_name,codec_type,width,height,bit_rate,channels,sample_rate,duration,r_frame_rate,nb_frames,bits_per_raw_sample";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f UTC";

/// Source properties as reported by the probe, any of which may be missing.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProbedProperties {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub duration_seconds: Option<f64>,
    /// Overall bitrate in kbps.
    pub bitrate_kbps: Option<u64>,
}

/// Complete source properties required before encoding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoProperties {
    pub width: u32,
    pub height: u32,
    pub duration_seconds: f64,
    /// Overall bitrate in kbps, if the probe reported one.
    pub bitrate_kbps: Option<u64>,
}

/// Discovers properties and metadata of media files.
pub trait Prober {
    /// Width, height, duration and bitrate of the first video stream.
    ///
    /// # Errors
    /// Returns an error if the probe tool could not be run or failed.
    fn video_properties(&self, path: &Path) -> Result<ProbedProperties, ConvertError>;

    /// Normalized metadata report.
    ///
    /// # Errors
    /// Returns an error with the probe tool's diagnostics if it could not be run or failed.
    fn media_info(&self, path: &Path) -> Result<MediaInfo, ConvertError>;
}

/// Probes files with `ffprobe`, or with `ffmpeg -i` for the text strategy.
#[derive(Debug, Clone)]
pub struct FfprobeProber {
    ffprobe: PathBuf,
    ffmpeg: PathBuf,
    strategy: ProbeStrategy,
}

/// Normalized metadata report for one media file.
///
/// This is the program's own report layout:
/// a `General` track with container level values followed by one track per stream.
/// Serializes to `{}` when probing failed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<Media>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Media {
    #[serde(rename = "@ref")]
    pub reference: String,
    #[serde(rename = "track")]
    pub tracks: Vec<Track>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "@type")]
pub enum Track {
    General(GeneralTrack),
    Video(StreamTrack),
    Audio(StreamTrack),
    Subtitle(StreamTrack),
    Data(StreamTrack),
    Attachment(StreamTrack),
    Other(StreamTrack),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GeneralTrack {
    pub video_count: usize,
    pub audio_count: usize,
    pub file_extension: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overall_bit_rate: Option<String>,
    #[serde(rename = "Recorded_Date", skip_serializing_if = "Option::is_none")]
    pub recorded_date: Option<i32>,
    #[serde(rename = "File_Created_Date", skip_serializing_if = "Option::is_none")]
    pub file_created_date: Option<String>,
    #[serde(rename = "File_Modified_Date", skip_serializing_if = "Option::is_none")]
    pub file_modified_date: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StreamTrack {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_order: Option<String>,
    #[serde(rename = "ID", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bit_rate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_rate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_count: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bit_depth: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampling_rate: Option<String>,
}

/// Raw `ffprobe -of json` output.
#[derive(Debug, Default, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    format: Option<FfprobeFormat>,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Default, Deserialize)]
struct FfprobeFormat {
    format_name: Option<String>,
    duration: Option<String>,
    bit_rate: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FfprobeStream {
    index: Option<u32>,
    codec_name: Option<String>,
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    bit_rate: Option<String>,
    channels: Option<u32>,
    sample_rate: Option<String>,
    duration: Option<String>,
    r_frame_rate: Option<String>,
    nb_frames: Option<String>,
    bits_per_raw_sample: Option<String>,
}

impl ProbedProperties {
    /// Convert into complete properties.
    ///
    /// # Errors
    /// Returns [`ConvertError::InvalidDimensions`] for a missing or zero width or height,
    /// and [`ConvertError::Probe`] for a missing or non-positive duration.
    pub fn complete(self, path: &Path) -> Result<VideoProperties, ConvertError> {
        let (Some(width), Some(height)) = (self.width.filter(|w| *w > 0), self.height.filter(|h| *h > 0)) else {
            return Err(ConvertError::InvalidDimensions {
                width: self.width,
                height: self.height,
            });
        };
        let Some(duration_seconds) = self.duration_seconds.filter(|d| d.is_finite() && *d > 0.0) else {
            return Err(ConvertError::Probe {
                path: path.to_path_buf(),
                message: "No duration found".to_string(),
            });
        };
        Ok(VideoProperties {
            width,
            height,
            duration_seconds,
            bitrate_kbps: self.bitrate_kbps,
        })
    }
}

impl VideoProperties {
    #[must_use]
    pub const fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }
}

impl FfprobeProber {
    #[must_use]
    pub fn new(ffprobe: impl Into<PathBuf>, ffmpeg: impl Into<PathBuf>, strategy: ProbeStrategy) -> Self {
        Self {
            ffprobe: ffprobe.into(),
            ffmpeg: ffmpeg.into(),
            strategy,
        }
    }

    /// Run ffprobe with JSON output and parse it.
    fn run_ffprobe_json(&self, path: &Path) -> Result<FfprobeOutput, ConvertError> {
        let mut cmd = Command::new(&self.ffprobe);
        cmd.args(["-v", "error", "-show_entries", FORMAT_ENTRIES, "-show_entries", STREAM_ENTRIES])
            .args(["-of", "json"])
            .arg(path)
            .stdin(Stdio::null());
        isolate_command(&mut cmd);

        let output = cmd.output().map_err(|source| ConvertError::Launch {
            tool: self.ffprobe.display().to_string(),
            source,
        })?;

        if !output.status.success() {
            return Err(ConvertError::Probe {
                path: path.to_path_buf(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        serde_json::from_slice(&output.stdout).map_err(|error| ConvertError::Probe {
            path: path.to_path_buf(),
            message: format!("Invalid JSON: {error}"),
        })
    }

    /// Run `ffmpeg -i` and parse its diagnostic output.
    /// ffmpeg exits with an error since no output is given, so only the text matters.
    fn run_ffmpeg_text(&self, path: &Path) -> Result<ProbedProperties, ConvertError> {
        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(["-hide_banner", "-nostdin", "-i"]).arg(path).stdin(Stdio::null());
        isolate_command(&mut cmd);

        let output = cmd.output().map_err(|source| ConvertError::Launch {
            tool: self.ffmpeg.display().to_string(),
            source,
        })?;

        Ok(parse_stream_info(&String::from_utf8_lossy(&output.stderr)))
    }
}

impl Prober for FfprobeProber {
    fn video_properties(&self, path: &Path) -> Result<ProbedProperties, ConvertError> {
        match self.strategy {
            ProbeStrategy::Json => self.run_ffprobe_json(path).map(|output| output.properties()),
            ProbeStrategy::Text => self.run_ffmpeg_text(path),
        }
    }

    fn media_info(&self, path: &Path) -> Result<MediaInfo, ConvertError> {
        self.run_ffprobe_json(path)
            .map(|output| MediaInfo::from_ffprobe(path, &output))
    }
}

impl FfprobeOutput {
    fn first_video_stream(&self) -> Option<&FfprobeStream> {
        self.streams
            .iter()
            .find(|stream| stream.codec_type.as_deref() == Some("video"))
    }

    fn properties(&self) -> ProbedProperties {
        let video = self.first_video_stream();
        let format = self.format.as_ref();

        let duration_seconds = format
            .and_then(|f| parse_number::<f64>(f.duration.as_deref()))
            .or_else(|| video.and_then(|v| parse_number::<f64>(v.duration.as_deref())));

        let bitrate_kbps = format
            .and_then(|f| parse_number::<u64>(f.bit_rate.as_deref()))
            .or_else(|| video.and_then(|v| parse_number::<u64>(v.bit_rate.as_deref())))
            .map(|bps| bps / 1000);

        ProbedProperties {
            width: video.and_then(|v| v.width),
            height: video.and_then(|v| v.height),
            duration_seconds,
            bitrate_kbps,
        }
    }

    fn count_streams(&self, codec_type: &str) -> usize {
        self.streams
            .iter()
            .filter(|stream| stream.codec_type.as_deref() == Some(codec_type))
            .count()
    }
}

impl MediaInfo {
    /// Build the normalized report from parsed probe output.
    fn from_ffprobe(path: &Path, output: &FfprobeOutput) -> Self {
        let format = output.format.as_ref();
        let metadata = fs::metadata(path).ok();
        let modified = metadata
            .as_ref()
            .and_then(|m| m.modified().ok())
            .map(DateTime::<Utc>::from);
        let created = metadata
            .as_ref()
            .and_then(|m| m.created().ok())
            .map(DateTime::<Utc>::from);

        let general = GeneralTrack {
            video_count: output.count_streams("video"),
            audio_count: output.count_streams("audio"),
            file_extension: crate::path_to_file_extension_string(path),
            format: format.and_then(|f| f.format_name.clone()),
            duration: format.and_then(|f| f.duration.clone()),
            file_size: metadata.as_ref().map(fs::Metadata::len),
            overall_bit_rate: format.and_then(|f| f.bit_rate.clone()),
            recorded_date: modified.map(|date| date.year()),
            file_created_date: created.map(|date| date.format(TIMESTAMP_FORMAT).to_string()),
            file_modified_date: modified.map(|date| date.format(TIMESTAMP_FORMAT).to_string()),
        };

        let mut tracks = vec![Track::General(general)];
        tracks.extend(output.streams.iter().map(Track::from_stream));

        Self {
            media: Some(Media {
                reference: crate::path_to_string(path),
                tracks,
            }),
        }
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.media.is_none()
    }
}

impl Track {
    fn from_stream(stream: &FfprobeStream) -> Self {
        let index = stream.index.map(|i| i.to_string());
        let mut track = StreamTrack {
            stream_order: index.clone(),
            id: index,
            format: stream.codec_name.clone(),
            duration: stream.duration.clone(),
            bit_rate: stream.bit_rate.clone(),
            ..StreamTrack::default()
        };

        match stream.codec_type.as_deref() {
            Some("video") => {
                track.width = stream.width;
                track.height = stream.height;
                track.frame_rate = stream.r_frame_rate.clone();
                track.frame_count = stream.nb_frames.clone();
                track.bit_depth = stream.bits_per_raw_sample.clone();
                Self::Video(track)
            }
            Some("audio") => {
                track.channels = stream.channels;
                track.sampling_rate = stream.sample_rate.clone();
                Self::Audio(track)
            }
            Some("subtitle") => Self::Subtitle(track),
            Some("data") => Self::Data(track),
            Some("attachment") => Self::Attachment(track),
            _ => Self::Other(track),
        }
    }
}

/// Parse `ffmpeg -i` diagnostic output for resolution, duration and bitrate.
///
/// Resolution is taken from the first video stream line,
/// so codec tags like `0x31637661` elsewhere in the text are not mistaken for it.
#[must_use]
pub fn parse_stream_info(text: &str) -> ProbedProperties {
    let (width, height) = text
        .lines()
        .filter(|line| line.contains("Video:"))
        .find_map(|line| RE_RESOLUTION.captures(line))
        .map_or((None, None), |caps| (caps[1].parse().ok(), caps[2].parse().ok()));

    let duration_seconds = RE_DURATION.captures(text).and_then(|caps| {
        let hours = caps[1].parse::<f64>().ok()?;
        let minutes = caps[2].parse::<f64>().ok()?;
        let seconds = caps[3].parse::<f64>().ok()?;
        Some(hours * 3600.0 + minutes * 60.0 + seconds)
    });

    let bitrate_kbps = RE_BITRATE.captures(text).and_then(|caps| caps[1].parse().ok());

    ProbedProperties {
        width,
        height,
        duration_seconds,
        bitrate_kbps,
    }
}

fn parse_number<T: std::str::FromStr>(value: Option<&str>) -> Option<T> {
    value.and_then(|v| v.trim().parse::<T>().ok())
}
