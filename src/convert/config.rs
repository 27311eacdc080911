//! Configuration for batch conversion.

use std::fmt;
use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use clap::ValueEnum;
use serde::Deserialize;

use crate::convert::quality::QualityRange;

/// Video extensions converted by default.
pub const DEFAULT_EXTENSIONS: &[&str] = &[
    "3gp", "amv", "avi", "divx", "f4v", "flv", "h264", "hevc", "m2v", "m4v", "mkv", "mov", "mp4", "mpeg", "mpg",
    "mts", "mxf", "ogv", "rm", "rmvb", "ts", "vob", "webm", "wmv",
];

/// Largest quality value accepted by the encoders.
const MAX_QUALITY_VALUE: u32 = 51;

const DEFAULT_CODEC: &str = "h264_nvenc";
const DEFAULT_HWACCEL: &str = "auto";
const DEFAULT_PRESET: &str = "fast";
const DEFAULT_AUDIO_CODEC: &str = "aac";
const DEFAULT_AUDIO_BITRATE: &str = "128k";

/// Quality knob passed to the encoder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityMode {
    /// Constant rate factor (`-crf`)
    #[default]
    Crf,
    /// Constant quantizer (`-cq`)
    Cq,
}

/// How source properties are discovered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStrategy {
    /// Structured JSON output from ffprobe
    #[default]
    Json,
    /// Diagnostic text printed by `ffmpeg -i`
    Text,
}

/// Width and height in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// Either a fixed quality value or one picked per file from its resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualitySetting {
    Fixed(u32),
    Dynamic(QualityRange),
}

/// User configuration from the config file.
#[derive(Debug, Default, Deserialize)]
pub struct BatchConvertConfig {
    #[serde(default)]
    pub audio_bitrate: Option<String>,
    #[serde(default)]
    pub audio_codec: Option<String>,
    #[serde(default)]
    pub bitrate_threshold: Option<u64>,
    #[serde(default)]
    pub case_insensitive_extensions: bool,
    #[serde(default)]
    pub codec: Option<String>,
    #[serde(default)]
    pub count: Option<usize>,
    #[serde(default)]
    pub delete_if_larger: bool,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub ffmpeg_path: Option<PathBuf>,
    #[serde(default)]
    pub ffprobe_path: Option<PathBuf>,
    #[serde(default)]
    pub hwaccel: Option<String>,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub log_file: bool,
    #[serde(default)]
    pub max_quality: Option<u32>,
    #[serde(default)]
    pub min_quality: Option<u32>,
    #[serde(default)]
    pub no_recurse: bool,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    #[serde(default)]
    pub overwrite: bool,
    #[serde(default)]
    pub preset: Option<String>,
    #[serde(default)]
    pub probe_strategy: Option<ProbeStrategy>,
    #[serde(default)]
    pub quality: Option<u32>,
    #[serde(default)]
    pub quality_mode: Option<QualityMode>,
    #[serde(default)]
    pub reference_resolution: Option<(u32, u32)>,
    #[serde(default)]
    pub replace_original: bool,
    #[serde(default)]
    pub save_report: bool,
    #[serde(default)]
    pub scale_resolution: Option<(u32, u32)>,
    #[serde(default)]
    pub verbose: bool,
}

/// Wrapper needed for parsing the config file section.
#[derive(Debug, Default, Deserialize)]
struct UserConfig {
    #[serde(default)]
    vbatch: BatchConvertConfig,
}

/// Final config combined from CLI arguments and the user config file.
///
/// Built and validated once before the batch starts.
#[derive(Debug, Clone)]
pub struct Config {
    pub audio_bitrate: String,
    pub audio_codec: String,
    /// Skip files with a lower overall bitrate, in kbps.
    pub bitrate_threshold: Option<u64>,
    pub case_insensitive_extensions: bool,
    pub codec: String,
    pub count: Option<usize>,
    pub delete_if_larger: bool,
    pub dryrun: bool,
    pub exclude: Vec<String>,
    pub extensions: Vec<String>,
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
    /// `None` omits the `-hwaccel` option.
    pub hwaccel: Option<String>,
    pub include: Vec<String>,
    pub log_file: bool,
    pub output_dir: Option<PathBuf>,
    pub overwrite: bool,
    pub path: PathBuf,
    pub preset: String,
    pub probe_strategy: ProbeStrategy,
    pub quality: QualitySetting,
    pub quality_mode: QualityMode,
    pub recurse: bool,
    pub replace_original: bool,
    pub save_report: bool,
    /// Sources larger than this in either direction are scaled down.
    pub scale_envelope: Resolution,
    pub verbose: bool,
}

impl Resolution {
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    #[must_use]
    pub const fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// True if either side is larger than the envelope.
    #[must_use]
    pub const fn exceeds(&self, envelope: &Self) -> bool {
        self.width > envelope.width || self.height > envelope.height
    }
}

impl QualityMode {
    /// Encoder option for this mode.
    #[must_use]
    pub const fn option(self) -> &'static str {
        match self {
            Self::Crf => "-crf",
            Self::Cq => "-cq",
        }
    }

    /// Default `(min, max)` bounds for the dynamic quality value.
    #[must_use]
    pub const fn default_bounds(self) -> (u32, u32) {
        match self {
            Self::Crf => (18, 28),
            Self::Cq => (16, 30),
        }
    }
}

impl BatchConvertConfig {
    /// Try to read user config from the file if it exists.
    /// Otherwise, fall back to default config.
    ///
    /// # Errors
    /// Returns an error if config file exists but cannot be read or parsed.
    pub fn get_user_config() -> anyhow::Result<Self> {
        let Some(path) = crate::config::CONFIG_PATH.as_deref() else {
            return Ok(Self::default());
        };

        match fs::read_to_string(path) {
            Ok(content) => Self::from_toml_str(&content)
                .with_context(|| format!("Failed to parse config file {}", path.display())),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(error) => Err(anyhow::anyhow!(
                "Failed to read config file {}: {error}",
                path.display()
            )),
        }
    }

    /// Parse config from a TOML string.
    ///
    /// # Errors
    /// Returns an error if the TOML string is invalid.
    pub fn from_toml_str(toml_str: &str) -> anyhow::Result<Self> {
        toml::from_str::<UserConfig>(toml_str)
            .map(|config| config.vbatch)
            .context("Failed to parse config TOML")
    }
}

impl Config {
    /// Create config for the given input path with all other values from the user config.
    ///
    /// # Errors
    /// Returns an error if the resulting config is invalid.
    pub fn from_user_config(path: PathBuf, user_config: BatchConvertConfig) -> anyhow::Result<Self> {
        let quality_mode = user_config.quality_mode.unwrap_or_default();
        let (default_min, default_max) = quality_mode.default_bounds();
        let (reference_width, reference_height) = user_config.reference_resolution.unwrap_or((1280, 720));
        let (scale_width, scale_height) = user_config.scale_resolution.unwrap_or((1280, 720));

        let quality = user_config.quality.map_or_else(
            || {
                QualitySetting::Dynamic(QualityRange::new(
                    user_config.min_quality.unwrap_or(default_min),
                    user_config.max_quality.unwrap_or(default_max),
                    Resolution::new(reference_width, reference_height),
                ))
            },
            QualitySetting::Fixed,
        );

        let extensions = if user_config.extensions.is_empty() {
            DEFAULT_EXTENSIONS.iter().map(ToString::to_string).collect()
        } else {
            normalize_extensions(&user_config.extensions)
        };

        let config = Self {
            audio_bitrate: user_config
                .audio_bitrate
                .unwrap_or_else(|| DEFAULT_AUDIO_BITRATE.to_string()),
            audio_codec: user_config.audio_codec.unwrap_or_else(|| DEFAULT_AUDIO_CODEC.to_string()),
            bitrate_threshold: user_config.bitrate_threshold.filter(|threshold| *threshold > 0),
            case_insensitive_extensions: user_config.case_insensitive_extensions,
            codec: user_config.codec.unwrap_or_else(|| DEFAULT_CODEC.to_string()),
            count: user_config.count,
            delete_if_larger: user_config.delete_if_larger,
            dryrun: false,
            exclude: user_config.exclude,
            extensions,
            ffmpeg_path: user_config.ffmpeg_path.unwrap_or_else(|| PathBuf::from("ffmpeg")),
            ffprobe_path: user_config.ffprobe_path.unwrap_or_else(|| PathBuf::from("ffprobe")),
            hwaccel: parse_hwaccel(user_config.hwaccel.as_deref().unwrap_or(DEFAULT_HWACCEL)),
            include: user_config.include,
            log_file: user_config.log_file,
            output_dir: user_config.output_dir,
            overwrite: user_config.overwrite,
            path,
            preset: user_config.preset.unwrap_or_else(|| DEFAULT_PRESET.to_string()),
            probe_strategy: user_config.probe_strategy.unwrap_or_default(),
            quality,
            quality_mode,
            recurse: !user_config.no_recurse,
            replace_original: user_config.replace_original,
            save_report: user_config.save_report,
            scale_envelope: Resolution::new(scale_width, scale_height),
            verbose: user_config.verbose,
        };

        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    ///
    /// # Errors
    /// Returns an error describing the first invalid value.
    pub fn validate(&self) -> anyhow::Result<()> {
        match self.quality {
            QualitySetting::Fixed(value) => {
                if value > MAX_QUALITY_VALUE {
                    anyhow::bail!("Quality {value} is out of range 0-{MAX_QUALITY_VALUE}");
                }
            }
            QualitySetting::Dynamic(range) => {
                if range.min > range.max {
                    anyhow::bail!("Minimum quality {} is larger than maximum {}", range.min, range.max);
                }
                if range.max > MAX_QUALITY_VALUE {
                    anyhow::bail!("Maximum quality {} is out of range 0-{MAX_QUALITY_VALUE}", range.max);
                }
                if range.reference.area() == 0 {
                    anyhow::bail!(
                        "Reference resolution {} must not have a zero side",
                        range.reference
                    );
                }
            }
        }
        if self.scale_envelope.area() == 0 {
            anyhow::bail!("Scale resolution {} must not have a zero side", self.scale_envelope);
        }
        if self.extensions.is_empty() {
            anyhow::bail!("No video extensions configured");
        }
        if self.codec.trim().is_empty() {
            anyhow::bail!("Video codec must not be empty");
        }
        Ok(())
    }

    /// Check if the file extension is on the allow-list.
    #[must_use]
    pub fn matches_extension(&self, extension: &str) -> bool {
        if self.case_insensitive_extensions {
            self.extensions.iter().any(|ext| ext.eq_ignore_ascii_case(extension))
        } else {
            self.extensions.iter().any(|ext| ext == extension)
        }
    }
}

/// Strip leading dots and surrounding whitespace, keeping the case.
fn normalize_extensions(extensions: &[impl AsRef<str>]) -> Vec<String> {
    extensions
        .iter()
        .map(|ext| ext.as_ref().trim().trim_start_matches('.').to_string())
        .filter(|ext| !ext.is_empty())
        .collect()
}

/// Map the `none` hardware acceleration value to an omitted option.
pub(crate) fn parse_hwaccel(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() || value.eq_ignore_ascii_case("none") {
        None
    } else {
        Some(value.to_string())
    }
}

impl Default for Config {
    fn default() -> Self {
        let (min, max) = QualityMode::Crf.default_bounds();
        Self {
            audio_bitrate: DEFAULT_AUDIO_BITRATE.to_string(),
            audio_codec: DEFAULT_AUDIO_CODEC.to_string(),
            bitrate_threshold: None,
            case_insensitive_extensions: false,
            codec: DEFAULT_CODEC.to_string(),
            count: None,
            delete_if_larger: false,
            dryrun: false,
            exclude: Vec::new(),
            extensions: DEFAULT_EXTENSIONS.iter().map(ToString::to_string).collect(),
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
            hwaccel: parse_hwaccel(DEFAULT_HWACCEL),
            include: Vec::new(),
            log_file: false,
            output_dir: None,
            overwrite: false,
            path: PathBuf::from("."),
            preset: DEFAULT_PRESET.to_string(),
            probe_strategy: ProbeStrategy::default(),
            quality: QualitySetting::Dynamic(QualityRange::new(min, max, Resolution::new(1280, 720))),
            quality_mode: QualityMode::Crf,
            recurse: true,
            replace_original: false,
            save_report: false,
            scale_envelope: Resolution::new(1280, 720),
            verbose: false,
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl fmt::Display for QualityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Crf => write!(f, "CRF"),
            Self::Cq => write!(f, "CQ"),
        }
    }
}

impl fmt::Display for QualitySetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(value) => write!(f, "{value}"),
            Self::Dynamic(range) => write!(f, "auto {}-{} @ {}", range.min, range.max, range.reference),
        }
    }
}
