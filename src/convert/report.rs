use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::convert::error::ConvertError;
use crate::convert::probe::MediaInfo;

/// Before and after metadata for one converted file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SidecarReport {
    pub input_file: String,
    pub output_file: String,
    pub mediainfo_before: MediaInfo,
    pub mediainfo_after: MediaInfo,
}

impl SidecarReport {
    #[must_use]
    pub fn new(input: &Path, output: &Path, before: MediaInfo, after: MediaInfo) -> Self {
        Self {
            input_file: crate::path_to_string(input),
            output_file: crate::path_to_string(output),
            mediainfo_before: before,
            mediainfo_after: after,
        }
    }

    /// Write the report next to the output file.
    /// Returns the path of the written report.
    ///
    /// # Errors
    /// Returns [`ConvertError::PostProcess`] if the file cannot be written.
    pub fn write(&self, output: &Path) -> Result<PathBuf, ConvertError> {
        let path = sidecar_report_path(output);
        let json = serde_json::to_string_pretty(self)
            .map_err(|error| ConvertError::post_process("Report", &path, error.into()))?;
        fs::write(&path, json).map_err(|error| ConvertError::post_process("Report", &path, error))?;
        Ok(path)
    }
}

/// Report path for the given output: `<output without extension>_mediainfo.json`
///
/// ```rust
/// use std::path::Path;
/// use vbatch_tools::convert::sidecar_report_path;
///
/// let path = sidecar_report_path(Path::new("/videos/out/clip.mp4"));
/// assert_eq!(path, Path::new("/videos/out/clip_mediainfo.json"));
/// ```
#[must_use]
pub fn sidecar_report_path(output: &Path) -> PathBuf {
    let stem = crate::path_to_file_stem_string(output);
    output.with_file_name(format!("{stem}_mediainfo.json"))
}
